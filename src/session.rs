// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Session table: algorithm/key/IV contexts and key residency.
//!
//! The chip keeps per-session cipher and MAC keys in its context RAM. A key is
//! uploaded inline with the first command of a session ([`SessionState::Used`])
//! and the session then becomes [`SessionState::KeyResident`], after which
//! commands omit it. A hardware reset wipes context RAM, so recovery demotes
//! every resident session back to `Used`. Sessions without key material
//! (plain hashes, LZS) stay `Used`.
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Free` | Slot available to `open` |
//! | `Used` | Open, key must be sent with the next command |
//! | `KeyResident` | Open, key already in chip context RAM |

use crate::command::Direction;
use crate::error::{HifnError, HifnResult};
use bitflags::bitflags;

/// Algorithms the engine can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// DES in CBC mode.
    DesCbc,
    /// Triple DES (EDE) in CBC mode.
    TripleDesCbc,
    /// AES in CBC mode, 128/192/256-bit keys.
    AesCbc,
    /// RC4 stream cipher.
    Rc4,
    /// Plain MD5 hash.
    Md5,
    /// Plain SHA-1 hash.
    Sha1,
    /// HMAC-MD5 truncated to 96 bits.
    HmacMd5,
    /// HMAC-SHA1 truncated to 96 bits.
    HmacSha1,
    /// LZS compression.
    Lzs,
}

/// Engine unit an algorithm runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmClass {
    Cipher,
    Mac,
    Compression,
}

/// Largest HMAC key the chip accepts (one hash block).
pub const MAC_KEY_LEN: usize = 64;

/// IV length for DES and 3DES.
pub const DES_IV_LEN: usize = 8;

/// IV length for AES.
pub const AES_IV_LEN: usize = 16;

impl Algorithm {
    /// Every supported algorithm.
    pub const ALL: [Algorithm; 9] = [
        Algorithm::DesCbc,
        Algorithm::TripleDesCbc,
        Algorithm::AesCbc,
        Algorithm::Rc4,
        Algorithm::Md5,
        Algorithm::Sha1,
        Algorithm::HmacMd5,
        Algorithm::HmacSha1,
        Algorithm::Lzs,
    ];

    /// Engine unit this algorithm runs on.
    pub const fn class(self) -> AlgorithmClass {
        match self {
            Self::DesCbc | Self::TripleDesCbc | Self::AesCbc | Self::Rc4 => AlgorithmClass::Cipher,
            Self::Md5 | Self::Sha1 | Self::HmacMd5 | Self::HmacSha1 => AlgorithmClass::Mac,
            Self::Lzs => AlgorithmClass::Compression,
        }
    }

    /// Capability bit a platform must advertise for this algorithm.
    pub const fn capability(self) -> Capabilities {
        match self {
            Self::DesCbc => Capabilities::DES,
            Self::TripleDesCbc => Capabilities::TRIPLE_DES,
            Self::AesCbc => Capabilities::AES,
            Self::Rc4 => Capabilities::RC4,
            Self::Md5 => Capabilities::MD5,
            Self::Sha1 => Capabilities::SHA1,
            Self::HmacMd5 => Capabilities::HMAC_MD5,
            Self::HmacSha1 => Capabilities::HMAC_SHA1,
            Self::Lzs => Capabilities::LZS,
        }
    }

    /// Cipher block size; 1 for the stream cipher, 0 for non-ciphers.
    pub const fn block_size(self) -> usize {
        match self {
            Self::DesCbc | Self::TripleDesCbc => 8,
            Self::AesCbc => 16,
            Self::Rc4 => 1,
            _ => 0,
        }
    }

    /// IV length, 0 if the algorithm takes none.
    pub const fn iv_len(self) -> usize {
        match self {
            Self::DesCbc | Self::TripleDesCbc => DES_IV_LEN,
            Self::AesCbc => AES_IV_LEN,
            _ => 0,
        }
    }

    /// Digest length delivered in the result buffer, 0 for non-MACs.
    pub const fn digest_len(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::HmacMd5 | Self::HmacSha1 => 12,
            _ => 0,
        }
    }

    /// True for the keyed MACs.
    pub const fn is_hmac(self) -> bool {
        matches!(self, Self::HmacMd5 | Self::HmacSha1)
    }

    /// Check a key length against what the chip accepts.
    pub fn validate_key(self, len: usize) -> HifnResult<()> {
        let ok = match self {
            Self::DesCbc => len == 8,
            Self::TripleDesCbc => len == 24,
            Self::AesCbc => matches!(len, 16 | 24 | 32),
            Self::Rc4 => (1..=256).contains(&len),
            Self::HmacMd5 | Self::HmacSha1 => len <= MAC_KEY_LEN,
            Self::Md5 | Self::Sha1 | Self::Lzs => len == 0,
        };
        if ok {
            Ok(())
        } else {
            Err(HifnError::InvalidKeyLength { algorithm: self, len })
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::DesCbc => "des-cbc",
            Self::TripleDesCbc => "3des-cbc",
            Self::AesCbc => "aes-cbc",
            Self::Rc4 => "rc4",
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::HmacMd5 => "hmac-md5-96",
            Self::HmacSha1 => "hmac-sha1-96",
            Self::Lzs => "lzs",
        })
    }
}

bitflags! {
    /// Algorithms a chip instance registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const DES = 1 << 0;
        const TRIPLE_DES = 1 << 1;
        const AES = 1 << 2;
        const RC4 = 1 << 3;
        const MD5 = 1 << 4;
        const SHA1 = 1 << 5;
        const HMAC_MD5 = 1 << 6;
        const HMAC_SHA1 = 1 << 7;
        const LZS = 1 << 8;
    }
}

impl Capabilities {
    /// Authentication-only parts (processing unit enable level 1).
    pub const AUTH_ONLY: Self = Self::DES
        .union(Self::MD5)
        .union(Self::SHA1)
        .union(Self::HMAC_MD5)
        .union(Self::HMAC_SHA1);

    /// Full crypto parts without AES (7751/7811).
    pub const FULL_CRYPTO: Self = Self::AUTH_ONLY.union(Self::TRIPLE_DES).union(Self::RC4);

    /// True if `algorithm` is registered.
    #[inline]
    pub fn supports(self, algorithm: Algorithm) -> bool {
        self.contains(algorithm.capability())
    }
}

/// Opaque session handle.
///
/// The generation distinguishes a live session from an earlier occupant of
/// the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl SessionId {
    /// Hardware context index.
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Generation of the slot when this handle was issued.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

/// Key residency state of a session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Free,
    Used,
    KeyResident,
}

/// One algorithm of a session plus its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmInit {
    pub algorithm: Algorithm,
    pub key: Vec<u8>,
}

impl AlgorithmInit {
    /// Keyless algorithm (plain hash, compression).
    pub fn new(algorithm: Algorithm) -> Self {
        Self { algorithm, key: Vec::new() }
    }

    /// Keyed algorithm.
    pub fn with_key(algorithm: Algorithm, key: &[u8]) -> Self {
        Self { algorithm, key: key.to_vec() }
    }
}

/// Key bytes that are wiped when dropped.
#[derive(Default)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    fn new(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Raw key bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Overwrite every byte with zero.
    pub fn wipe(&mut self) {
        for byte in self.0.iter_mut() {
            // SAFETY: `byte` is a valid, exclusively borrowed u8.
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

/// Context of one open session.
#[derive(Debug, Default)]
pub struct Session {
    cipher: Option<Algorithm>,
    cipher_key: KeyMaterial,
    mac: Option<Algorithm>,
    mac_key: KeyMaterial,
    compression: Option<Algorithm>,
    iv: Vec<u8>,
    state: SessionState,
    generation: u32,
    /// Direction of the last submitted RC4 operation.
    prev_direction: Option<Direction>,
}

impl Session {
    /// Cipher algorithm, if any.
    #[inline]
    pub fn cipher(&self) -> Option<Algorithm> {
        self.cipher
    }

    /// Cipher key bytes (empty without a cipher).
    #[inline]
    pub fn cipher_key(&self) -> &[u8] {
        self.cipher_key.as_bytes()
    }

    /// MAC algorithm, if any.
    #[inline]
    pub fn mac(&self) -> Option<Algorithm> {
        self.mac
    }

    /// HMAC key bytes (empty for plain hashes).
    #[inline]
    pub fn mac_key(&self) -> &[u8] {
        self.mac_key.as_bytes()
    }

    /// Compression algorithm, if any.
    #[inline]
    pub fn compression(&self) -> Option<Algorithm> {
        self.compression
    }

    /// Current chaining IV.
    #[inline]
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Key residency state.
    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True if a command running in `direction` must carry the key inline.
    ///
    /// An RC4 key that ran in the other direction last time is treated as
    /// absent: the chip's keystream state belongs to the old direction.
    pub fn needs_key_upload(&self, direction: Direction) -> bool {
        self.state == SessionState::Used
            || (self.cipher == Some(Algorithm::Rc4) && self.prev_direction.is_some_and(|prev| prev != direction))
    }

    /// Replace the chaining IV. Ignored if the length does not match.
    pub fn set_iv(&mut self, iv: &[u8]) {
        if iv.len() == self.iv.len() {
            self.iv.copy_from_slice(iv);
        }
    }

    fn clear(&mut self) {
        self.cipher_key.wipe();
        self.mac_key.wipe();
        for byte in self.iv.iter_mut() {
            // SAFETY: `byte` is a valid, exclusively borrowed u8.
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
        let generation = self.generation;
        *self = Session {
            generation,
            ..Session::default()
        };
    }
}

/// Fixed-size table of session contexts, one per chip context slot.
#[derive(Debug)]
pub struct SessionTable {
    slots: Vec<Session>,
    capabilities: Capabilities,
}

impl SessionTable {
    /// Create a table with `capacity` slots accepting `capabilities`.
    pub fn new(capacity: usize, capabilities: Capabilities) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Session::default);
        Self { slots, capabilities }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of open sessions.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state != SessionState::Free).count()
    }

    /// Algorithms this table accepts.
    #[inline]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Open a session.
    ///
    /// At most one cipher and one MAC may be combined; compression must stand
    /// alone. `iv` seeds the CBC chain and defaults to zero.
    pub fn open(&mut self, algorithms: &[AlgorithmInit], iv: Option<&[u8]>) -> HifnResult<SessionId> {
        let mut cipher: Option<&AlgorithmInit> = None;
        let mut mac: Option<&AlgorithmInit> = None;
        let mut compression: Option<&AlgorithmInit> = None;

        for init in algorithms {
            let slot = match init.algorithm.class() {
                AlgorithmClass::Cipher => &mut cipher,
                AlgorithmClass::Mac => &mut mac,
                AlgorithmClass::Compression => &mut compression,
            };
            if slot.is_some() {
                return Err(HifnError::InvalidCombination(format!(
                    "more than one {:?} algorithm",
                    init.algorithm.class()
                )));
            }
            *slot = Some(init);
        }
        if cipher.is_none() && mac.is_none() && compression.is_none() {
            return Err(HifnError::InvalidCombination("no algorithm requested".into()));
        }
        if compression.is_some() && (cipher.is_some() || mac.is_some()) {
            return Err(HifnError::InvalidCombination(
                "compression cannot be chained with cipher or MAC".into(),
            ));
        }

        for init in algorithms {
            if !self.capabilities.supports(init.algorithm) {
                return Err(HifnError::UnsupportedAlgorithm(init.algorithm));
            }
            init.algorithm.validate_key(init.key.len())?;
        }

        let iv_len = cipher.map_or(0, |c| c.algorithm.iv_len());
        let iv = match iv {
            Some(iv) if iv.len() != iv_len => {
                return Err(HifnError::InvalidArgument(format!(
                    "IV must be {iv_len} bytes, got {}",
                    iv.len()
                )));
            }
            Some(iv) => iv.to_vec(),
            None => vec![0u8; iv_len],
        };

        let index = self
            .slots
            .iter()
            .position(|s| s.state == SessionState::Free)
            .ok_or(HifnError::NoFreeSession)?;
        let session = &mut self.slots[index];
        session.generation = session.generation.wrapping_add(1);
        session.cipher = cipher.map(|c| c.algorithm);
        session.cipher_key = KeyMaterial::new(cipher.map_or(&[][..], |c| &c.key[..]));
        session.mac = mac.map(|m| m.algorithm);
        session.mac_key = KeyMaterial::new(mac.map_or(&[][..], |m| &m.key[..]));
        session.compression = compression.map(|c| c.algorithm);
        session.iv = iv;
        session.prev_direction = None;
        session.state = SessionState::Used;

        let id = SessionId {
            index: index as u32,
            generation: session.generation,
        };
        log::debug!(
            "session {id} opened: cipher={:?} mac={:?} comp={:?}",
            session.cipher,
            session.mac,
            session.compression
        );
        Ok(id)
    }

    /// Close a session, wiping its key material.
    pub fn close(&mut self, id: SessionId) -> HifnResult<()> {
        self.get_mut(id)?.clear();
        log::debug!("session {id} closed");
        Ok(())
    }

    /// Look up an open session.
    pub fn get(&self, id: SessionId) -> HifnResult<&Session> {
        match self.slots.get(id.index()) {
            Some(s) if s.state != SessionState::Free && s.generation == id.generation => Ok(s),
            _ => Err(HifnError::UnknownSession(id)),
        }
    }

    /// Look up an open session mutably.
    pub fn get_mut(&mut self, id: SessionId) -> HifnResult<&mut Session> {
        match self.slots.get_mut(id.index()) {
            Some(s) if s.state != SessionState::Free && s.generation == id.generation => Ok(s),
            _ => Err(HifnError::UnknownSession(id)),
        }
    }

    /// Residency state of a session.
    pub fn state(&self, id: SessionId) -> HifnResult<SessionState> {
        Ok(self.get(id)?.state)
    }

    /// Record a successful submission: remember the direction and promote
    /// the session if the command carried its key.
    pub fn commit(&mut self, id: SessionId, direction: Direction, key_uploaded: bool) -> HifnResult<()> {
        self.get_mut(id)?.prev_direction = Some(direction);
        if key_uploaded {
            self.mark_key_resident(id)?;
        }
        Ok(())
    }

    /// `Used -> KeyResident` after a key upload.
    pub fn mark_key_resident(&mut self, id: SessionId) -> HifnResult<()> {
        let session = self.get_mut(id)?;
        if session.state == SessionState::Used {
            session.state = SessionState::KeyResident;
        }
        Ok(())
    }

    /// `KeyResident -> Used`: the chip no longer holds the key. Returns
    /// whether the session was demoted.
    pub fn invalidate(&mut self, id: SessionId) -> HifnResult<bool> {
        let session = self.get_mut(id)?;
        if session.state != SessionState::KeyResident {
            return Ok(false);
        }
        session.state = SessionState::Used;
        log::trace!("session {id}: key no longer resident");
        Ok(true)
    }

    /// Demote every resident session. Returns how many were demoted.
    pub fn invalidate_all(&mut self) -> usize {
        let resident: Vec<SessionId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SessionState::KeyResident)
            .map(|(index, s)| SessionId {
                index: index as u32,
                generation: s.generation,
            })
            .collect();
        resident
            .into_iter()
            .filter(|&id| self.invalidate(id).unwrap_or(false))
            .count()
    }
}
