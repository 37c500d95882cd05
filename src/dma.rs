// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Platform interface: register access, DMA memory and buffer chains.
//!
//! The engine never touches host memory the chip can see except through
//! [`DmaMemory`]. Everything is addressed by device address; how the platform
//! maps that to a CPU-visible pointer is its own business.
//!
//! # Buffers
//!
//! A [`DmaBuffer`] is a chain of DMA regions (think mbuf clusters or an iovec)
//! plus a logical length. Callers hand buffers to the engine with a request and
//! get the output buffer back in the completion callback.

use crate::error::{HifnError, HifnResult};
use crate::regs::Bar;
use crate::session::Capabilities;
use bitflags::bitflags;
use scopeguard::ScopeGuard;

/// Natural transfer unit of the chip.
pub const WORD_SIZE: usize = 4;

/// Required alignment of every DMA allocation.
pub const DMA_ALIGN: usize = 16;

/// A contiguous device-visible allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaRegion {
    /// Address as seen by the chip.
    pub device_address: u64,
    /// Size in bytes.
    pub len: usize,
}

impl DmaRegion {
    /// Sub-region starting `offset` bytes in.
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= self.len, "slice out of bounds");
        Self {
            device_address: self.device_address + offset as u64,
            len,
        }
    }

    /// Address one past the end.
    #[inline]
    pub fn end(&self) -> u64 {
        self.device_address + self.len as u64
    }
}

bitflags! {
    /// Cache maintenance operations around a DMA transfer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncOp: u32 {
        /// Before the device reads memory the CPU wrote.
        const PREWRITE = 1 << 0;
        /// Before the device writes memory the CPU will read.
        const PREREAD = 1 << 1;
        /// After the device read memory.
        const POSTWRITE = 1 << 2;
        /// After the device wrote memory.
        const POSTREAD = 1 << 3;
    }
}

/// Direction of a scoped DMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// CPU writes, device reads.
    ToDevice,
    /// Device writes, CPU reads.
    FromDevice,
    /// Both (descriptor rings, in-place buffers).
    Bidirectional,
}

impl SyncDirection {
    /// Operations issued when the scope opens.
    pub const fn pre(self) -> SyncOp {
        match self {
            Self::ToDevice => SyncOp::PREWRITE,
            Self::FromDevice => SyncOp::PREREAD,
            Self::Bidirectional => SyncOp::PREWRITE.union(SyncOp::PREREAD),
        }
    }

    /// Operations issued when the scope closes.
    pub const fn post(self) -> SyncOp {
        match self {
            Self::ToDevice => SyncOp::POSTWRITE,
            Self::FromDevice => SyncOp::POSTREAD,
            Self::Bidirectional => SyncOp::POSTWRITE.union(SyncOp::POSTREAD),
        }
    }
}

/// Register access to the two BARs.
pub trait RegisterIo {
    /// Read a 32-bit register.
    fn reg_read(&self, bar: Bar, offset: u32) -> u32;

    /// Write a 32-bit register.
    fn reg_write(&self, bar: Bar, offset: u32, value: u32);
}

/// DMA-capable memory shared with the chip.
pub trait DmaMemory {
    /// Allocate `size` bytes, aligned to [`DMA_ALIGN`].
    fn dma_alloc(&self, size: usize) -> HifnResult<DmaRegion>;

    /// Return an allocation to the platform.
    fn dma_free(&self, region: DmaRegion);

    /// Copy out of DMA memory.
    fn dma_read(&self, device_address: u64, buf: &mut [u8]);

    /// Copy into DMA memory.
    fn dma_write(&self, device_address: u64, data: &[u8]);

    /// Cache maintenance. Coherent platforms keep the default no-op.
    fn dma_sync(&self, _region: DmaRegion, _ops: SyncOp) {}
}

/// Everything the engine needs from its host.
pub trait Platform: RegisterIo + DmaMemory + Send + Sync {
    /// Algorithms this chip instance registers with the framework.
    fn capabilities(&self) -> Capabilities;
}

/// Sync scopes held for the lifetime of a transfer.
///
/// PRE operations are issued as regions are added. [`SyncSet::release`]
/// issues the matching POST operations, most recent first.
#[derive(Debug, Default)]
pub struct SyncSet {
    scopes: Vec<(DmaRegion, SyncDirection)>,
}

impl SyncSet {
    /// Open a scope over `region`.
    pub fn acquire<M: DmaMemory + ?Sized>(&mut self, mem: &M, region: DmaRegion, direction: SyncDirection) {
        mem.dma_sync(region, direction.pre());
        self.scopes.push((region, direction));
    }

    /// Open a scope over every region of `buffer`.
    pub fn acquire_buffer<M: DmaMemory + ?Sized>(&mut self, mem: &M, buffer: &DmaBuffer, direction: SyncDirection) {
        for region in buffer.regions() {
            self.acquire(mem, *region, direction);
        }
    }

    /// Close every open scope.
    pub fn release<M: DmaMemory + ?Sized>(&mut self, mem: &M) {
        for (region, direction) in self.scopes.drain(..).rev() {
            mem.dma_sync(region, direction.post());
        }
    }

    /// Number of open scopes.
    #[inline]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

/// A chain of DMA regions with a logical length.
#[derive(Debug, PartialEq, Eq)]
pub struct DmaBuffer {
    chunks: Vec<DmaRegion>,
    len: usize,
}

impl DmaBuffer {
    /// Wrap existing regions; the logical length covers all of them.
    pub fn from_regions(chunks: Vec<DmaRegion>) -> Self {
        let len = chunks.iter().map(|c| c.len).sum();
        Self { chunks, len }
    }

    /// Logical length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the buffer holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total allocated bytes across all chunks.
    pub fn capacity(&self) -> usize {
        self.chunks.iter().map(|c| c.len).sum()
    }

    /// Underlying allocations (including any tail beyond the logical length).
    pub fn regions(&self) -> &[DmaRegion] {
        &self.chunks
    }

    /// Chunks restricted to the logical length, in order.
    pub fn chunks(&self) -> impl Iterator<Item = DmaRegion> + '_ {
        let mut remaining = self.len;
        self.chunks.iter().filter_map(move |chunk| {
            if remaining == 0 {
                return None;
            }
            let take = chunk.len.min(remaining);
            remaining -= take;
            Some(chunk.slice(0, take))
        })
    }

    /// Shrink the logical length. Allocations are kept for later release.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Restore the logical length to the full allocation.
    pub fn reset_len(&mut self) {
        self.len = self.capacity();
    }

    /// Give the regions back so they can be freed.
    pub fn into_regions(self) -> Vec<DmaRegion> {
        self.chunks
    }
}

/// Allocate a chain of `cluster`-sized regions holding at least `len` bytes.
///
/// Partially allocated chains are released on failure.
pub fn alloc_chain<M: DmaMemory + ?Sized>(
    mem: &M,
    len: usize,
    cluster: usize,
) -> HifnResult<DmaBuffer> {
    if cluster == 0 {
        return Err(HifnError::InvalidArgument("cluster size must be non-zero".into()));
    }
    let mut chunks = scopeguard::guard(Vec::new(), |chunks: Vec<DmaRegion>| {
        for region in chunks {
            mem.dma_free(region);
        }
    });
    let mut remaining = len.max(1);
    while remaining > 0 {
        let take = remaining.min(cluster);
        chunks.push(mem.dma_alloc(take)?);
        remaining -= take;
    }
    let chunks = ScopeGuard::into_inner(chunks);
    let mut buffer = DmaBuffer::from_regions(chunks);
    buffer.truncate(len);
    Ok(buffer)
}

/// Release every region of `buffer`.
pub fn free_buffer<M: DmaMemory + ?Sized>(mem: &M, buffer: DmaBuffer) {
    for region in buffer.into_regions() {
        mem.dma_free(region);
    }
}

/// Copy `data` into `buffer` starting at logical `offset`.
pub fn write_at<M: DmaMemory + ?Sized>(
    mem: &M,
    buffer: &DmaBuffer,
    offset: usize,
    data: &[u8],
) -> HifnResult<()> {
    if offset + data.len() > buffer.len() {
        return Err(HifnError::BufferSizeMismatch {
            expected: offset + data.len(),
            actual: buffer.len(),
        });
    }
    let mut pos = 0usize;
    let mut written = 0usize;
    for chunk in buffer.chunks() {
        let chunk_end = pos + chunk.len;
        let want = offset + written;
        if written < data.len() && want < chunk_end {
            let within = want - pos;
            let take = (chunk.len - within).min(data.len() - written);
            mem.dma_write(chunk.device_address + within as u64, &data[written..written + take]);
            written += take;
        }
        pos = chunk_end;
        if written == data.len() {
            break;
        }
    }
    Ok(())
}

/// Copy `out.len()` bytes out of `buffer` starting at logical `offset`.
pub fn read_at<M: DmaMemory + ?Sized>(
    mem: &M,
    buffer: &DmaBuffer,
    offset: usize,
    out: &mut [u8],
) -> HifnResult<()> {
    if offset + out.len() > buffer.len() {
        return Err(HifnError::BufferSizeMismatch {
            expected: offset + out.len(),
            actual: buffer.len(),
        });
    }
    let mut pos = 0usize;
    let mut read = 0usize;
    for chunk in buffer.chunks() {
        let chunk_end = pos + chunk.len;
        let want = offset + read;
        if read < out.len() && want < chunk_end {
            let within = want - pos;
            let take = (chunk.len - within).min(out.len() - read);
            mem.dma_read(chunk.device_address + within as u64, &mut out[read..read + take]);
            read += take;
        }
        pos = chunk_end;
        if read == out.len() {
            break;
        }
    }
    Ok(())
}
