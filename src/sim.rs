// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software model of the chip.
//!
//! [`SimulatedChip`] implements [`Platform`] on top of a flat memory arena. It
//! walks the four descriptor rings the way the DMA engine does, parses command
//! buffers, keeps a per-session key RAM and writes result records. Data is
//! passed through unchanged; MAC digests come from [`reference_digest`] so
//! callers can check them.
//!
//! The model only moves when asked to: call [`SimulatedChip::process`] or
//! [`SimulatedChip::run`], then service the interrupt on the engine.

use crate::command::{
    BaseMasks, CipherMasks, CompMasks, MacMasks, ResultFlags, ResultRecord, BASE_DSTLEN_SHIFT, BASE_SESSION_MASK,
    BASE_SRCLEN_SHIFT, CIPHER_ALG_3DES, CIPHER_ALG_AES, CIPHER_ALG_DES, CIPHER_ALG_MASK, CIPHER_ALG_RC4,
    HEADER_LEN, MAC_ALG_MASK, MAC_ALG_MD5, MAX_RESULT, RC4_KEY_UPLOAD_LEN, RESULT_DSTLEN_SHIFT,
    SUB_SRCLEN_SHIFT,
};
use crate::descriptor::{Descriptor, DescriptorFlags, DESCRIPTOR_SIZE};
use crate::dma::{DmaMemory, DmaRegion, Platform, RegisterIo, SyncOp, DMA_ALIGN, WORD_SIZE};
use crate::error::{HifnError, HifnResult};
use crate::regs::{self, Bar, DmaConfig, DmaStatus};
use crate::ring::RingKind;
use crate::session::{Algorithm, Capabilities, AES_IV_LEN, DES_IV_LEN, MAC_KEY_LEN};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Device address of the first byte of simulated memory.
pub const SIM_BASE_ADDRESS: u64 = 0x1000_0000;

/// Default size of simulated DMA memory.
pub const DEFAULT_SIM_MEMORY: usize = 8 << 20;

/// Upper bound on descriptors followed for one request.
const MAX_CHAIN: usize = 4096;

/// Stand-in digest for the MAC unit.
///
/// Built from CRC32 lanes over the algorithm name, the key (zero padded to
/// the 64-byte HMAC block for keyed MACs, ignored otherwise) and the data,
/// truncated to the algorithm's digest length.
pub fn reference_digest(algorithm: Algorithm, key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut padded = [0u8; MAC_KEY_LEN];
    let key: &[u8] = if algorithm.is_hmac() {
        let n = key.len().min(MAC_KEY_LEN);
        padded[..n].copy_from_slice(&key[..n]);
        &padded
    } else {
        &[]
    };
    let name = algorithm.to_string();
    let len = algorithm.digest_len();
    let mut digest = Vec::with_capacity(len.next_multiple_of(4));
    for lane in 0..len.div_ceil(4) {
        let mut hasher = crc32fast::Hasher::new_with_initial(lane as u32);
        hasher.update(name.as_bytes());
        hasher.update(key);
        hasher.update(data);
        digest.extend_from_slice(&hasher.finalize().to_le_bytes());
    }
    digest.truncate(len);
    digest
}

/// First-fit allocator over arena offsets.
#[derive(Debug)]
struct Allocator {
    /// Free blocks, offset to length.
    free: BTreeMap<usize, usize>,
    /// Live allocations, offset to rounded length.
    used: HashMap<usize, usize>,
}

impl Allocator {
    fn new(size: usize) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }
        Self { free, used: HashMap::new() }
    }

    fn alloc(&mut self, size: usize) -> Option<usize> {
        let size = size.max(1).next_multiple_of(DMA_ALIGN);
        let (&offset, &len) = self.free.iter().find(|&(_, &len)| len >= size)?;
        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        self.used.insert(offset, size);
        Some(offset)
    }

    fn free(&mut self, offset: usize) -> bool {
        let Some(mut len) = self.used.remove(&offset) else {
            return false;
        };
        let mut start = offset;
        if let Some(next_len) = self.free.remove(&(offset + len)) {
            len += next_len;
        }
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        self.free.insert(start, len);
        true
    }

    fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }
}

/// Keys the chip holds for one session context.
#[derive(Debug, Default)]
struct KeySlot {
    mac: Option<Vec<u8>>,
    cipher: Option<Vec<u8>>,
}

#[derive(Debug)]
struct MacUnit {
    algorithm: Algorithm,
    skip: usize,
    len: usize,
    new_key: Option<Vec<u8>>,
}

#[derive(Debug)]
struct CipherUnit {
    new_key: Option<Vec<u8>>,
    iv: Option<Vec<u8>>,
}

/// A command buffer as the chip's parser sees it.
#[derive(Debug)]
struct ParsedCommand {
    masks: BaseMasks,
    session: u16,
    src_len: usize,
    dst_len: usize,
    compress: bool,
    mac: Option<MacUnit>,
    cipher: Option<CipherUnit>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.bytes.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(out)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    /// Returns (masks, skip, len) of a sub-header.
    fn sub_header(&mut self) -> Option<(u16, usize, usize)> {
        let masks = self.u16()?;
        let skip = self.u16()? as usize;
        let len = self.u16()? as usize;
        self.u16()?;
        let hi = ((masks >> SUB_SRCLEN_SHIFT) & 0x3) as usize;
        Some((masks & !(0x3 << SUB_SRCLEN_SHIFT), skip, len | (hi << 16)))
    }
}

fn parse_command(bytes: &[u8]) -> Option<ParsedCommand> {
    let mut r = Reader { bytes, pos: 0 };
    let masks = BaseMasks::from_bits_truncate(r.u16()?);
    let word = r.u16()?;
    let src_lo = r.u16()? as usize;
    let dst_lo = r.u16()? as usize;
    let src_len = src_lo | ((((word >> BASE_SRCLEN_SHIFT) & 0x3) as usize) << 16);
    let dst_len = dst_lo | ((((word >> BASE_DSTLEN_SHIFT) & 0x3) as usize) << 16);

    let compress = masks.contains(BaseMasks::COMP);
    if compress {
        let (comp, _, _) = r.sub_header()?;
        if !CompMasks::from_bits_truncate(comp).contains(CompMasks::CLEARHIST) {
            log::trace!("sim: compression without history reset");
        }
    }

    let mut mac_header = None;
    if masks.contains(BaseMasks::MAC) {
        mac_header = Some(r.sub_header()?);
    }
    let mut cipher_header = None;
    if masks.contains(BaseMasks::CRYPT) {
        cipher_header = Some(r.sub_header()?);
    }

    let mac = match mac_header {
        Some((bits, skip, len)) => {
            let flags = MacMasks::from_bits_truncate(bits);
            let md5 = bits & MAC_ALG_MASK == MAC_ALG_MD5;
            let algorithm = match (md5, flags.contains(MacMasks::TRUNC)) {
                (true, true) => Algorithm::HmacMd5,
                (false, true) => Algorithm::HmacSha1,
                (true, false) => Algorithm::Md5,
                (false, false) => Algorithm::Sha1,
            };
            let new_key = if flags.contains(MacMasks::NEW_KEY) {
                Some(r.take(MAC_KEY_LEN)?.to_vec())
            } else {
                None
            };
            Some(MacUnit { algorithm, skip, len, new_key })
        }
        None => None,
    };

    let cipher = match cipher_header {
        Some((bits, _, _)) => {
            let flags = CipherMasks::from_bits_truncate(bits);
            let alg = bits & CIPHER_ALG_MASK;
            let (key_len, iv_len) = match alg {
                CIPHER_ALG_DES => (8, DES_IV_LEN),
                CIPHER_ALG_3DES => (24, DES_IV_LEN),
                CIPHER_ALG_RC4 => (RC4_KEY_UPLOAD_LEN, 0),
                CIPHER_ALG_AES if flags.contains(CipherMasks::KSZ_256) => (32, AES_IV_LEN),
                CIPHER_ALG_AES if flags.contains(CipherMasks::KSZ_192) => (24, AES_IV_LEN),
                _ => (16, AES_IV_LEN),
            };
            let new_key = if flags.contains(CipherMasks::NEW_KEY) {
                Some(r.take(key_len)?.to_vec())
            } else {
                None
            };
            let iv = if flags.contains(CipherMasks::NEW_IV) {
                Some(r.take(iv_len)?.to_vec())
            } else {
                None
            };
            Some(CipherUnit { new_key, iv })
        }
        None => None,
    };

    if !masks.intersects(BaseMasks::COMP | BaseMasks::MAC | BaseMasks::CRYPT) {
        r.take(HEADER_LEN)?;
    }
    if r.pos != bytes.len() {
        return None;
    }
    Some(ParsedCommand {
        masks,
        session: word & BASE_SESSION_MASK,
        src_len,
        dst_len,
        compress,
        mac,
        cipher,
    })
}

/// Descriptors of one transfer, as found on a ring.
struct Chain {
    /// Every slot visited, jump markers included.
    slots: Vec<u64>,
    /// Data descriptors only.
    data: Vec<Descriptor>,
    /// Where the ring continues.
    next: u64,
}

#[derive(Debug)]
struct SimInner {
    memory: Vec<u8>,
    alloc: Allocator,
    last_sync: Option<(DmaRegion, SyncOp)>,
    /// PRE syncs without a matching POST, by region start.
    open_syncs: HashMap<u64, usize>,
    /// Status bits of the DMA CSR (control bits excluded).
    status: DmaStatus,
    enabled: [bool; 4],
    ier: DmaStatus,
    cnfg: u32,
    pu_isr: u32,
    pu_ier: u32,
    base: [u64; 4],
    cursor: [u64; 4],
    halted: bool,
    key_ram: HashMap<u16, KeySlot>,
    key_uploads: usize,
    stale_key_uses: usize,
    last_iv: Option<Vec<u8>>,
    expansion: usize,
}

impl SimInner {
    fn range(&self, address: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(address.checked_sub(SIM_BASE_ADDRESS)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.memory.len()).then_some(start..end)
    }

    fn read(&self, address: u64, buf: &mut [u8]) {
        match self.range(address, buf.len()) {
            Some(range) => buf.copy_from_slice(&self.memory[range]),
            None => {
                log::error!("sim: read of {} bytes at {address:#x} outside memory", buf.len());
                buf.fill(0);
            }
        }
    }

    fn write(&mut self, address: u64, data: &[u8]) {
        match self.range(address, data.len()) {
            Some(range) => self.memory[range].copy_from_slice(data),
            None => log::error!("sim: write of {} bytes at {address:#x} outside memory", data.len()),
        }
    }

    fn descriptor(&self, address: u64) -> Descriptor {
        let mut raw = [0u8; DESCRIPTOR_SIZE];
        self.read(address, &mut raw);
        Descriptor::from_bytes(&raw)
    }

    fn release(&mut self, address: u64) {
        let mut word = [0u8; 4];
        self.read(address, &mut word);
        let control = u32::from_le_bytes(word) & !DescriptorFlags::VALID.bits();
        self.write(address, &control.to_le_bytes());
    }

    fn reset(&mut self) {
        self.status = DmaStatus::empty();
        self.enabled = [false; 4];
        self.cursor = self.base;
        self.halted = false;
        self.pu_isr = 0;
        self.key_ram.clear();
    }

    fn write_csr(&mut self, value: u32) {
        let value = DmaStatus::from_bits_truncate(value);
        for kind in RingKind::ALL {
            if value.contains(DmaStatus::ctrl_enable(kind)) {
                self.enabled[kind.index()] = true;
            }
            if value.contains(DmaStatus::ctrl_disable(kind)) {
                self.enabled[kind.index()] = false;
            }
        }
        self.status.remove(value);
    }

    fn read_csr(&self) -> u32 {
        let mut csr = self.status;
        for kind in RingKind::ALL {
            if self.enabled[kind.index()] {
                csr |= DmaStatus::ctrl_enable(kind);
            }
        }
        csr.bits()
    }

    fn fault(&mut self, bits: DmaStatus) {
        log::warn!("sim: dma fault {:#010x}", bits.bits());
        self.status |= bits;
        self.halted = true;
    }

    /// Follow `kind`'s ring from its cursor to the end of one transfer.
    /// `None` while any descriptor of the transfer is not yet valid.
    fn peek(&self, kind: RingKind) -> Option<Chain> {
        let mut chain = Chain { slots: Vec::new(), data: Vec::new(), next: self.cursor[kind.index()] };
        for _ in 0..MAX_CHAIN {
            let desc = self.descriptor(chain.next);
            if !desc.valid() {
                return None;
            }
            chain.slots.push(chain.next);
            if desc.is_jump() {
                chain.next = desc.device_address;
                continue;
            }
            chain.next += DESCRIPTOR_SIZE as u64;
            chain.data.push(desc);
            if desc.last() {
                return Some(chain);
            }
        }
        None
    }

    fn gather(&self, chain: &Chain) -> Vec<u8> {
        let total = chain.data.iter().map(|d| d.length as usize).sum();
        let mut data = vec![0u8; total];
        let mut at = 0;
        for desc in &chain.data {
            let len = desc.length as usize;
            self.read(desc.device_address, &mut data[at..at + len]);
            at += len;
        }
        data
    }

    fn scatter(&mut self, chain: &Chain, data: &[u8]) {
        let mut at = 0;
        for desc in &chain.data {
            if at >= data.len() {
                break;
            }
            let take = (desc.length as usize).min(data.len() - at);
            self.write(desc.device_address, &data[at..at + take]);
            at += take;
        }
    }

    /// Execute one request. Returns false if there was nothing (complete) to do.
    fn step(&mut self) -> bool {
        if self.halted || !self.enabled[RingKind::Command.index()] {
            return false;
        }
        let Some(cmd) = self.peek(RingKind::Command) else {
            self.status |= DmaStatus::C_WAIT;
            return false;
        };
        let data_rings = [RingKind::Source, RingKind::Result, RingKind::Destination];
        if data_rings.iter().any(|kind| !self.enabled[kind.index()]) {
            return false;
        }
        let (Some(src), Some(res), Some(dst)) = (
            self.peek(RingKind::Source),
            self.peek(RingKind::Result),
            self.peek(RingKind::Destination),
        ) else {
            return false;
        };

        let Some(cmd_desc) = cmd.data.first().copied() else {
            return false;
        };
        let mut cmd_bytes = vec![0u8; cmd_desc.length as usize];
        self.read(cmd_desc.device_address, &mut cmd_bytes);
        let Some(command) = parse_command(&cmd_bytes) else {
            self.fault(DmaStatus::C_ABORT);
            return false;
        };
        let src_total: usize = src.data.iter().map(|d| d.length as usize).sum();
        let dst_total: usize = dst.data.iter().map(|d| d.length as usize).sum();
        if src_total != command.src_len || dst_total != command.dst_len {
            log::warn!(
                "sim: length mismatch src {src_total}/{} dst {dst_total}/{}",
                command.src_len,
                command.dst_len
            );
            self.fault(DmaStatus::C_ABORT);
            return false;
        }
        if dst.data.iter().any(|d| d.length as usize % WORD_SIZE != 0) {
            self.fault(DmaStatus::ILLW | DmaStatus::D_ABORT);
            return false;
        }

        for chain in [&cmd, &src, &res, &dst] {
            for &slot in &chain.slots {
                self.release(slot);
            }
        }
        for (kind, chain) in [
            (RingKind::Command, &cmd),
            (RingKind::Source, &src),
            (RingKind::Result, &res),
            (RingKind::Destination, &dst),
        ] {
            self.cursor[kind.index()] = chain.next;
        }

        self.load_keys(&command);
        let input = self.gather(&src);
        let mut output = input.clone();
        if command.compress {
            output.resize(output.len() + self.expansion, 0);
        }
        let written = output.len().min(dst_total);
        self.scatter(&dst, &output[..written]);
        let residual = dst_total - written;

        let mac = command.mac.as_ref().map(|unit| {
            let key = self.key_ram.get(&command.session).and_then(|k| k.mac.clone()).unwrap_or_default();
            let end = (unit.skip + unit.len).min(input.len());
            let start = unit.skip.min(end);
            reference_digest(unit.algorithm, &key, &input[start..end])
        });
        let mut flags = ResultFlags::empty();
        if output.len() > dst_total {
            flags |= ResultFlags::DST_OVERRUN;
        }
        let record = ResultRecord {
            flags,
            session: command.session | ((((residual >> 16) & 0x3) as u16) << RESULT_DSTLEN_SHIFT),
            src_cnt: 0,
            dst_cnt: residual as u16,
            mac,
        };
        if let Some(res_desc) = res.data.first() {
            let raw = record.to_bytes(command.masks);
            let len = (res_desc.length as usize).min(MAX_RESULT);
            self.write(res_desc.device_address, &raw[..len]);
        }
        self.status |= DmaStatus::R_DONE;
        true
    }

    fn load_keys(&mut self, command: &ParsedCommand) {
        let slot = self.key_ram.entry(command.session).or_default();
        let mut uploaded = false;
        let mut stale = false;
        if let Some(mac) = &command.mac {
            match &mac.new_key {
                Some(key) => {
                    slot.mac = Some(key.clone());
                    uploaded = true;
                }
                None if mac.algorithm.is_hmac() && slot.mac.is_none() => stale = true,
                None => {}
            }
        }
        if let Some(cipher) = &command.cipher {
            match &cipher.new_key {
                Some(key) => {
                    slot.cipher = Some(key.clone());
                    uploaded = true;
                }
                None if slot.cipher.is_none() => stale = true,
                None => {}
            }
            if let Some(iv) = &cipher.iv {
                self.last_iv = Some(iv.clone());
            }
        }
        if uploaded {
            self.key_uploads += 1;
        }
        if stale {
            log::warn!("sim: session {} used without a resident key", command.session);
            self.stale_key_uses += 1;
        }
    }
}

/// A chip model backed by host memory.
#[derive(Debug)]
pub struct SimulatedChip {
    inner: Mutex<SimInner>,
    capabilities: Capabilities,
}

impl Default for SimulatedChip {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChip {
    /// Chip with [`DEFAULT_SIM_MEMORY`] bytes of DMA memory and every algorithm.
    pub fn new() -> Self {
        Self::build(DEFAULT_SIM_MEMORY, Capabilities::all())
    }

    /// Chip with `size` bytes of DMA memory.
    pub fn with_memory(size: usize) -> Self {
        Self::build(size, Capabilities::all())
    }

    /// Chip registering only `capabilities`.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self::build(DEFAULT_SIM_MEMORY, capabilities)
    }

    fn build(size: usize, capabilities: Capabilities) -> Self {
        Self {
            inner: Mutex::new(SimInner {
                memory: vec![0u8; size],
                alloc: Allocator::new(size),
                last_sync: None,
                status: DmaStatus::empty(),
                enabled: [false; 4],
                ier: DmaStatus::empty(),
                cnfg: (DmaConfig::MSTRESET | DmaConfig::DMARESET | DmaConfig::MODE).bits(),
                pu_isr: 0,
                pu_ier: 0,
                base: [SIM_BASE_ADDRESS; 4],
                cursor: [SIM_BASE_ADDRESS; 4],
                halted: false,
                key_ram: HashMap::new(),
                open_syncs: HashMap::new(),
                key_uploads: 0,
                stale_key_uses: 0,
                last_iv: None,
                expansion: 0,
            }),
            capabilities,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute up to `n` queued requests. Returns how many ran.
    pub fn process(&self, n: usize) -> usize {
        let mut inner = self.lock();
        let mut done = 0;
        while done < n && inner.step() {
            done += 1;
        }
        done
    }

    /// Execute every complete request on the rings.
    pub fn run(&self) -> usize {
        self.process(usize::MAX)
    }

    /// Raise status bits as if the DMA engine had failed, and halt it.
    pub fn inject_fault(&self, bits: DmaStatus) {
        self.lock().fault(bits);
    }

    /// Make every compression result `extra` bytes longer than its input.
    pub fn set_compression_expansion(&self, extra: usize) {
        self.lock().expansion = extra;
    }

    /// True if an enabled interrupt source is asserted.
    pub fn interrupt_asserted(&self) -> bool {
        let inner = self.lock();
        inner.status.intersects(inner.ier) || inner.pu_isr & inner.pu_ier != 0
    }

    /// Current DMA interrupt enable mask.
    pub fn interrupt_enable(&self) -> DmaStatus {
        self.lock().ier
    }

    /// True if `kind`'s DMA channel is running.
    pub fn ring_enabled(&self, kind: RingKind) -> bool {
        self.lock().enabled[kind.index()]
    }

    /// True after a fault until the next reset.
    pub fn is_halted(&self) -> bool {
        self.lock().halted
    }

    /// Commands that carried a key.
    pub fn key_uploads(&self) -> usize {
        self.lock().key_uploads
    }

    /// Commands that relied on a key the chip did not hold.
    pub fn stale_key_uses(&self) -> usize {
        self.lock().stale_key_uses
    }

    /// IV carried by the most recent command that had one.
    pub fn last_iv(&self) -> Option<Vec<u8>> {
        self.lock().last_iv.clone()
    }

    /// Unallocated DMA memory in bytes.
    pub fn free_bytes(&self) -> usize {
        self.lock().alloc.free_bytes()
    }

    /// Most recent cache maintenance request.
    pub fn last_sync(&self) -> Option<(DmaRegion, SyncOp)> {
        self.lock().last_sync
    }

    /// PRE syncs on `region` still waiting for their POST.
    pub fn open_sync_scopes(&self, region: DmaRegion) -> usize {
        self.lock().open_syncs.get(&region.device_address).copied().unwrap_or(0)
    }
}

impl RegisterIo for SimulatedChip {
    fn reg_read(&self, bar: Bar, offset: u32) -> u32 {
        let inner = self.lock();
        match (bar, offset) {
            (Bar::Zero, regs::PU_ISR) => inner.pu_isr,
            (Bar::Zero, regs::PU_IER) => inner.pu_ier,
            (Bar::One, regs::DMA_CSR) => inner.read_csr(),
            (Bar::One, regs::DMA_IER) => inner.ier.bits(),
            (Bar::One, regs::DMA_CNFG) => inner.cnfg,
            (Bar::One, offset) => RingKind::ALL
                .into_iter()
                .find(|&kind| regs::ring_base_register(kind) == offset)
                .map_or(0, |kind| inner.base[kind.index()] as u32),
            _ => 0,
        }
    }

    fn reg_write(&self, bar: Bar, offset: u32, value: u32) {
        let mut inner = self.lock();
        match (bar, offset) {
            (Bar::Zero, regs::PU_ISR) => inner.pu_isr &= !value,
            (Bar::Zero, regs::PU_IER) => inner.pu_ier = value,
            (Bar::One, regs::DMA_CSR) => inner.write_csr(value),
            (Bar::One, regs::DMA_IER) => inner.ier = DmaStatus::from_bits_truncate(value),
            (Bar::One, regs::DMA_CNFG) => {
                inner.cnfg = value;
                if !DmaConfig::from_bits_truncate(value).contains(DmaConfig::MSTRESET) {
                    log::trace!("sim: master reset");
                    inner.reset();
                }
            }
            (Bar::One, offset) => {
                if let Some(kind) = RingKind::ALL
                    .into_iter()
                    .find(|&kind| regs::ring_base_register(kind) == offset)
                {
                    inner.base[kind.index()] = u64::from(value);
                    inner.cursor[kind.index()] = u64::from(value);
                }
            }
            _ => {}
        }
    }
}

impl DmaMemory for SimulatedChip {
    fn dma_alloc(&self, size: usize) -> HifnResult<DmaRegion> {
        let offset = self
            .lock()
            .alloc
            .alloc(size)
            .ok_or(HifnError::OutOfDmaMemory { requested: size })?;
        Ok(DmaRegion {
            device_address: SIM_BASE_ADDRESS + offset as u64,
            len: size,
        })
    }

    fn dma_free(&self, region: DmaRegion) {
        let Some(offset) = region.device_address.checked_sub(SIM_BASE_ADDRESS) else {
            log::error!("sim: free of foreign address {:#x}", region.device_address);
            return;
        };
        if !self.lock().alloc.free(offset as usize) {
            log::error!("sim: double free at {:#x}", region.device_address);
        }
    }

    fn dma_read(&self, device_address: u64, buf: &mut [u8]) {
        self.lock().read(device_address, buf);
    }

    fn dma_write(&self, device_address: u64, data: &[u8]) {
        self.lock().write(device_address, data);
    }

    fn dma_sync(&self, region: DmaRegion, ops: SyncOp) {
        let mut inner = self.lock();
        inner.last_sync = Some((region, ops));
        let address = region.device_address;
        if ops.intersects(SyncOp::PREREAD | SyncOp::PREWRITE) {
            *inner.open_syncs.entry(address).or_default() += 1;
        }
        if ops.intersects(SyncOp::POSTREAD | SyncOp::POSTWRITE) {
            if let Some(open) = inner.open_syncs.get_mut(&address) {
                *open -= 1;
                if *open == 0 {
                    inner.open_syncs.remove(&address);
                }
            }
        }
    }
}

impl Platform for SimulatedChip {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}
