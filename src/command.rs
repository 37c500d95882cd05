// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Command buffer serialization and result buffer parsing.
//!
//! A command is read by the chip's parser from the command ring. All fields are
//! 16-bit little-endian words:
//!
//! | Part | Size | Present when |
//! |------|------|--------------|
//! | base header | 8 | always |
//! | compression sub-header | 8 | `COMP` |
//! | MAC sub-header | 8 | `MAC` |
//! | cipher sub-header | 8 | `CRYPT` |
//! | MAC key | 64 | MAC `NEW_KEY` |
//! | cipher key | 8/24/16-32/260 | cipher `NEW_KEY` |
//! | IV | 8 or 16 | cipher `NEW_IV` |
//! | padding | 8 | no unit active |
//!
//! The result buffer written back per request is the inverse: an 8-byte base
//! result, a 4-byte compression result if `COMP`, then a 4-byte MAC result
//! followed by the digest if `MAC`.

use crate::error::{HifnError, HifnResult};
use crate::session::{Algorithm, Session, AES_IV_LEN, DES_IV_LEN, MAC_KEY_LEN};
use bitflags::bitflags;

/// Largest command buffer the builder can produce, rounded to 16 bytes.
pub const MAX_COMMAND: usize = 384;

/// Size of every result buffer.
pub const MAX_RESULT: usize = 36;

/// Base header / sub-header size.
pub const HEADER_LEN: usize = 8;

/// Base result size.
pub const BASE_RESULT_LEN: usize = 8;

/// Compression and MAC result size (before the digest).
pub const UNIT_RESULT_LEN: usize = 4;

/// RC4 key schedule upload: 256 key bytes then 4 zero bytes.
pub const RC4_KEY_UPLOAD_LEN: usize = 260;

/// Session bits of the base header.
pub const BASE_SESSION_MASK: u16 = 0x0fff;
/// Source length bits 17:16 in the base header session word.
pub const BASE_SRCLEN_SHIFT: u32 = 14;
/// Destination length bits 17:16 in the base header session word.
pub const BASE_DSTLEN_SHIFT: u32 = 12;
/// Sub-header length bits 17:16 in the masks word.
pub const SUB_SRCLEN_SHIFT: u32 = 14;
/// Residual destination length bits in the base result session word.
pub const RESULT_DSTLEN_MASK: u16 = 0x3000;
pub const RESULT_DSTLEN_SHIFT: u32 = 12;

/// Cipher algorithm field of the cipher sub-header.
pub const CIPHER_ALG_MASK: u16 = 0x0003;
pub const CIPHER_ALG_DES: u16 = 0x0000;
pub const CIPHER_ALG_3DES: u16 = 0x0001;
pub const CIPHER_ALG_RC4: u16 = 0x0002;
pub const CIPHER_ALG_AES: u16 = 0x0003;

/// MAC algorithm field of the MAC sub-header.
pub const MAC_ALG_MASK: u16 = 0x0001;
pub const MAC_ALG_SHA1: u16 = 0x0000;
pub const MAC_ALG_MD5: u16 = 0x0001;

/// Compression algorithm field.
pub const COMP_ALG_LZS: u16 = 0x0000;

const _: () = assert!(MAX_RESULT == BASE_RESULT_LEN + UNIT_RESULT_LEN + UNIT_RESULT_LEN + 20);
const _: () = assert!(
    MAX_COMMAND >= 4 * HEADER_LEN + MAC_KEY_LEN + RC4_KEY_UPLOAD_LEN + AES_IV_LEN
);

bitflags! {
    /// Base header masks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BaseMasks: u16 {
        const COMP = 0x0100;
        const MAC = 0x0400;
        const CRYPT = 0x0800;
        const DECODE = 0x2000;
    }
}

bitflags! {
    /// Cipher sub-header control bits (algorithm field excluded).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CipherMasks: u16 {
        const MODE_CBC = 0x0008;
        const KSZ_192 = 0x0200;
        const KSZ_256 = 0x0400;
        const NEW_KEY = 0x0800;
        const NEW_IV = 0x1000;
    }
}

bitflags! {
    /// MAC sub-header control bits (algorithm field excluded).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MacMasks: u16 {
        const MODE_HASH = 0x0008;
        const TRUNC = 0x0010;
        const RESULT = 0x0020;
        const POS_IPSEC = 0x0200;
        const NEW_KEY = 0x0800;
    }
}

bitflags! {
    /// Compression sub-header control bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CompMasks: u16 {
        const CLEARHIST = 0x0010;
    }
}

bitflags! {
    /// Base result flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResultFlags: u16 {
        const DST_OVERRUN = 0x0200;
    }
}

/// Direction of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Encrypt, compress or compute a MAC.
    Encode,
    /// Decrypt or decompress.
    Decode,
}

/// Byte range of the source an algorithm covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub skip: usize,
    pub len: usize,
}

/// What to do with a request's input.
///
/// The units involved come from the session; the operation only picks the
/// direction, the covered region and an optional per-request IV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub direction: Direction,
    pub region: Option<Region>,
    pub iv: Option<Vec<u8>>,
}

impl Operation {
    fn new(direction: Direction) -> Self {
        Self { direction, region: None, iv: None }
    }

    pub fn encrypt() -> Self {
        Self::new(Direction::Encode)
    }

    pub fn decrypt() -> Self {
        Self::new(Direction::Decode)
    }

    pub fn compress() -> Self {
        Self::new(Direction::Encode)
    }

    pub fn decompress() -> Self {
        Self::new(Direction::Decode)
    }

    /// MAC-only operation.
    pub fn authenticate() -> Self {
        Self::new(Direction::Encode)
    }

    /// Restrict the cipher/MAC to `len` bytes starting at `skip`.
    pub fn with_region(mut self, skip: usize, len: usize) -> Self {
        self.region = Some(Region { skip, len });
        self
    }

    /// Use `iv` instead of the session's chaining IV.
    pub fn with_iv(mut self, iv: &[u8]) -> Self {
        self.iv = Some(iv.to_vec());
        self
    }

    /// Region covered, defaulting to the whole source.
    pub fn region_or_all(&self, source_len: usize) -> Region {
        self.region.unwrap_or(Region { skip: 0, len: source_len })
    }
}

/// Byte counts the base header announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLengths {
    pub source: usize,
    /// Destination bytes the chip writes, with slop rounded up to a word.
    pub destination: usize,
}

/// A serialized command plus what it implies for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuffer {
    bytes: Vec<u8>,
    base_masks: BaseMasks,
    key_uploaded: bool,
}

impl CommandBuffer {
    /// Serialized command.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length written into the command descriptor.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Units the command activates.
    #[inline]
    pub fn base_masks(&self) -> BaseMasks {
        self.base_masks
    }

    /// True if a cipher or MAC key travels inline.
    #[inline]
    pub fn key_uploaded(&self) -> bool {
        self.key_uploaded
    }
}

struct Writer(Vec<u8>);

impl Writer {
    fn u16(&mut self, value: u16) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
    }

    fn zeros(&mut self, n: usize) {
        self.0.resize(self.0.len() + n, 0);
    }

    fn sub_header(&mut self, masks: u16, region: Region) {
        let hi = ((region.len >> 16) as u16) & 0x3;
        self.u16(masks | (hi << SUB_SRCLEN_SHIFT));
        self.u16(region.skip as u16);
        self.u16(region.len as u16);
        self.u16(0);
    }
}

fn lengths_fit(lengths: TransferLengths) -> HifnResult<()> {
    for len in [lengths.source, lengths.destination] {
        if len > crate::scatter::MAX_DMA_LEN {
            return Err(HifnError::InvalidArgument(format!("transfer length {len} too large")));
        }
    }
    Ok(())
}

/// Check the parts of a request that do not depend on ring space or buffer
/// layout: the covered region, the cipher block size and the IV length.
pub fn validate(session: &Session, op: &Operation, source_len: usize) -> HifnResult<()> {
    let region = op.region_or_all(source_len);
    if region.len == 0 || region.skip + region.len > source_len {
        return Err(HifnError::InvalidArgument(format!(
            "region {}+{} outside source of {source_len} bytes",
            region.skip, region.len
        )));
    }
    if let Some(cipher) = session.cipher() {
        let block = cipher.block_size();
        if region.len % block != 0 {
            return Err(HifnError::InvalidArgument(format!(
                "{cipher} region of {} bytes is not a multiple of the {block}-byte block",
                region.len
            )));
        }
        let iv_len = cipher.iv_len();
        if iv_len > 0 {
            let chosen = op.iv.as_deref().unwrap_or(session.iv());
            if chosen.len() != iv_len {
                return Err(HifnError::InvalidArgument(format!(
                    "IV must be {iv_len} bytes, got {}",
                    chosen.len()
                )));
            }
        }
    }
    Ok(())
}

/// Serialize the command for one operation on `session` (context `index`).
pub fn build(
    session: &Session,
    index: usize,
    op: &Operation,
    lengths: TransferLengths,
) -> HifnResult<CommandBuffer> {
    lengths_fit(lengths)?;
    validate(session, op, lengths.source)?;
    let region = op.region_or_all(lengths.source);

    let mut base = BaseMasks::empty();
    if op.direction == Direction::Decode
        && (session.cipher().is_some() || session.compression().is_some())
    {
        base |= BaseMasks::DECODE;
    }
    if session.compression().is_some() {
        base |= BaseMasks::COMP;
    }
    if session.mac().is_some() {
        base |= BaseMasks::MAC;
    }
    if session.cipher().is_some() {
        base |= BaseMasks::CRYPT;
    }
    let upload = session.needs_key_upload(op.direction);

    let mut w = Writer(Vec::with_capacity(MAX_COMMAND));

    // Compression contexts are stateless and always use context 0.
    let session_num = if session.compression().is_some() {
        0
    } else {
        (index as u16) & BASE_SESSION_MASK
    };
    let src_hi = ((lengths.source >> 16) as u16) & 0x3;
    let dst_hi = ((lengths.destination >> 16) as u16) & 0x3;
    w.u16(base.bits());
    w.u16(session_num | (src_hi << BASE_SRCLEN_SHIFT) | (dst_hi << BASE_DSTLEN_SHIFT));
    w.u16(lengths.source as u16);
    w.u16(lengths.destination as u16);

    if session.compression().is_some() {
        let masks = COMP_ALG_LZS | CompMasks::CLEARHIST.bits();
        w.sub_header(masks, Region { skip: 0, len: lengths.source });
    }

    let mut mac_new_key = false;
    if let Some(mac) = session.mac() {
        let (alg, mut masks) = match mac {
            Algorithm::Md5 => (MAC_ALG_MD5, MacMasks::MODE_HASH),
            Algorithm::Sha1 => (MAC_ALG_SHA1, MacMasks::MODE_HASH),
            Algorithm::HmacMd5 => (MAC_ALG_MD5, MacMasks::TRUNC),
            Algorithm::HmacSha1 => (MAC_ALG_SHA1, MacMasks::TRUNC),
            other => return Err(HifnError::UnsupportedAlgorithm(other)),
        };
        masks |= MacMasks::RESULT | MacMasks::POS_IPSEC;
        if mac.is_hmac() && upload {
            masks |= MacMasks::NEW_KEY;
            mac_new_key = true;
        }
        w.sub_header(alg | masks.bits(), region);
    }

    let mut cipher_new_key = false;
    let mut iv: Option<Vec<u8>> = None;
    if let Some(cipher) = session.cipher() {
        let (alg, mut masks) = match cipher {
            Algorithm::DesCbc => (CIPHER_ALG_DES, CipherMasks::MODE_CBC | CipherMasks::NEW_IV),
            Algorithm::TripleDesCbc => (CIPHER_ALG_3DES, CipherMasks::MODE_CBC | CipherMasks::NEW_IV),
            Algorithm::AesCbc => (CIPHER_ALG_AES, CipherMasks::MODE_CBC | CipherMasks::NEW_IV),
            Algorithm::Rc4 => (CIPHER_ALG_RC4, CipherMasks::empty()),
            other => return Err(HifnError::UnsupportedAlgorithm(other)),
        };
        if cipher == Algorithm::AesCbc {
            match session.cipher_key().len() {
                16 => {}
                24 => masks |= CipherMasks::KSZ_192,
                32 => masks |= CipherMasks::KSZ_256,
                len => return Err(HifnError::InvalidKeyLength { algorithm: cipher, len }),
            }
        }
        if upload {
            masks |= CipherMasks::NEW_KEY;
            cipher_new_key = true;
        }
        if masks.contains(CipherMasks::NEW_IV) {
            iv = Some(op.iv.as_deref().unwrap_or(session.iv()).to_vec());
        }
        w.sub_header(alg | masks.bits(), region);
    }

    if mac_new_key {
        let key = session.mac_key();
        w.bytes(key);
        w.zeros(MAC_KEY_LEN - key.len());
    }

    if cipher_new_key {
        let key = session.cipher_key();
        match session.cipher() {
            Some(Algorithm::Rc4) => {
                let mut left = RC4_KEY_UPLOAD_LEN - 4;
                while left > 0 {
                    let take = key.len().min(left);
                    w.bytes(&key[..take]);
                    left -= take;
                }
                w.zeros(4);
            }
            _ => w.bytes(key),
        }
    }

    if let Some(iv) = &iv {
        debug_assert!(iv.len() == DES_IV_LEN || iv.len() == AES_IV_LEN);
        w.bytes(iv);
    }

    if !base.intersects(BaseMasks::COMP | BaseMasks::MAC | BaseMasks::CRYPT) {
        w.zeros(8);
    }

    debug_assert!(w.0.len() <= MAX_COMMAND);
    Ok(CommandBuffer {
        bytes: w.0,
        base_masks: base,
        key_uploaded: mac_new_key || cipher_new_key,
    })
}

/// Parsed result buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub flags: ResultFlags,
    pub session: u16,
    pub src_cnt: u16,
    pub dst_cnt: u16,
    /// Digest if the command ran the MAC unit.
    pub mac: Option<Vec<u8>>,
}

fn le16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

impl ResultRecord {
    /// Parse a [`MAX_RESULT`]-byte result buffer for a command with
    /// `base_masks`, extracting `digest_len` digest bytes if the MAC ran.
    pub fn parse(raw: &[u8; MAX_RESULT], base_masks: BaseMasks, digest_len: usize) -> Self {
        let mac = base_masks.contains(BaseMasks::MAC).then(|| {
            let mut at = BASE_RESULT_LEN + UNIT_RESULT_LEN;
            if base_masks.contains(BaseMasks::COMP) {
                at += UNIT_RESULT_LEN;
            }
            let end = (at + digest_len).min(MAX_RESULT);
            raw[at..end].to_vec()
        });
        Self {
            flags: ResultFlags::from_bits_truncate(le16(raw, 0)),
            session: le16(raw, 2),
            src_cnt: le16(raw, 4),
            dst_cnt: le16(raw, 6),
            mac,
        }
    }

    /// Serialize into a result buffer (the chip's side of the contract).
    pub fn to_bytes(&self, base_masks: BaseMasks) -> [u8; MAX_RESULT] {
        let mut raw = [0u8; MAX_RESULT];
        raw[0..2].copy_from_slice(&self.flags.bits().to_le_bytes());
        raw[2..4].copy_from_slice(&self.session.to_le_bytes());
        raw[4..6].copy_from_slice(&self.src_cnt.to_le_bytes());
        raw[6..8].copy_from_slice(&self.dst_cnt.to_le_bytes());
        if let Some(digest) = &self.mac {
            let mut at = BASE_RESULT_LEN + UNIT_RESULT_LEN;
            if base_masks.contains(BaseMasks::COMP) {
                at += UNIT_RESULT_LEN;
            }
            let n = digest.len().min(MAX_RESULT - at);
            raw[at..at + n].copy_from_slice(&digest[..n]);
        }
        raw
    }

    /// True if the destination was too small.
    #[inline]
    pub fn overrun(&self) -> bool {
        self.flags.contains(ResultFlags::DST_OVERRUN)
    }

    /// Destination bytes left unwritten.
    pub fn dst_residual(&self) -> usize {
        let hi = ((self.session & RESULT_DSTLEN_MASK) >> RESULT_DSTLEN_SHIFT) as usize;
        self.dst_cnt as usize | (hi << 16)
    }
}
