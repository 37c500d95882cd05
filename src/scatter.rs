// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Scatter/gather mapping of caller buffers onto ring segments.
//!
//! The chip moves data in 32-bit words. Sources may end on a partial word,
//! but a destination descriptor whose length is not a word multiple is an
//! illegal write. The trailing 1-3 bytes of a destination ("slop") are
//! therefore redirected into a scratch word owned by the request's result
//! slot and copied into place once the request completes.

use crate::descriptor::Descriptor;
use crate::dma::{read_at, write_at, DmaBuffer, DmaMemory, WORD_SIZE};
use crate::error::{HifnError, HifnResult};

/// Largest transfer the 18-bit command length fields can describe.
pub const MAX_DMA_LEN: usize = 0x3ffff;

/// One contiguous piece of a buffer as the chip sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub device_address: u64,
    pub length: u32,
}

/// Trailing bytes of a destination not yet tied to a scratch word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlopRemainder {
    /// Logical offset of the first slop byte in the destination buffer.
    pub offset: usize,
    /// 1 to 3.
    pub len: usize,
}

impl SlopRemainder {
    /// Tie the remainder to the scratch word of `request_slot`.
    pub fn bind(self, request_slot: usize) -> SlopState {
        SlopState {
            request_slot,
            offset: self.offset,
            len: self.len,
        }
    }
}

/// Where a request's slop bytes were parked and where they belong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlopState {
    /// Result slot whose scratch word received the bytes.
    pub request_slot: usize,
    /// Logical offset in the output buffer.
    pub offset: usize,
    /// Number of bytes, 1 to 3.
    pub len: usize,
}

impl SlopState {
    /// Copy the parked bytes from `scratch` into `output`.
    pub fn splice<M: DmaMemory + ?Sized>(&self, mem: &M, scratch: u64, output: &DmaBuffer) -> HifnResult<()> {
        let mut word = [0u8; WORD_SIZE];
        mem.dma_read(scratch, &mut word);
        write_at(mem, output, self.offset, &word[..self.len])
    }
}

/// Result of mapping one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScatterMap {
    /// Data segments in buffer order (excluding any scratch word).
    pub segments: Vec<Segment>,
    /// Slop split off a destination, if any.
    pub slop: Option<SlopRemainder>,
    /// Logical length of the mapped buffer.
    pub total_len: usize,
}

impl ScatterMap {
    /// Ring slots the map occupies, including the synthetic scratch segment.
    pub fn descriptor_count(&self) -> usize {
        self.segments.len() + usize::from(self.slop.is_some())
    }

    /// Bytes the chip will actually transfer (slop counts as a full word).
    pub fn transfer_len(&self) -> usize {
        match self.slop {
            Some(slop) => self.total_len - slop.len + WORD_SIZE,
            None => self.total_len,
        }
    }

    /// Ring descriptors for this map. `scratch` is the device address of the
    /// scratch word and must be given when the map carries slop.
    pub fn descriptors(&self, scratch: Option<u64>) -> Vec<Descriptor> {
        let count = self.descriptor_count();
        let mut out = Vec::with_capacity(count);
        for (i, seg) in self.segments.iter().enumerate() {
            out.push(Descriptor::segment(seg.device_address, seg.length, i + 1 == count));
        }
        if self.slop.is_some() {
            debug_assert!(scratch.is_some(), "slop without a scratch word");
            out.push(Descriptor::segment(scratch.unwrap_or(0), WORD_SIZE as u32, true));
        }
        out
    }
}

/// Splits buffers into segments bounded by the chip's limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScatterMapper {
    max_segment_len: usize,
    max_segments: usize,
}

impl ScatterMapper {
    /// `max_segment_len` is rounded down to a whole word so that every
    /// segment but the last stays word granular.
    pub fn new(max_segment_len: usize, max_segments: usize) -> Self {
        Self {
            max_segment_len: (max_segment_len & !(WORD_SIZE - 1)).max(WORD_SIZE),
            max_segments,
        }
    }

    /// Segment length cap actually applied.
    #[inline]
    pub fn max_segment_len(&self) -> usize {
        self.max_segment_len
    }

    /// Segment count cap.
    #[inline]
    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    /// Map a buffer the chip reads from. Partial final words are fine here.
    pub fn map_source(&self, buffer: &DmaBuffer) -> HifnResult<ScatterMap> {
        let segments = self.split(buffer)?;
        Ok(ScatterMap {
            segments,
            slop: None,
            total_len: buffer.len(),
        })
    }

    /// Map a buffer the chip writes to, splitting off any slop.
    pub fn map_destination(&self, buffer: &DmaBuffer) -> HifnResult<ScatterMap> {
        let mut segments = self.split(buffer)?;
        let total_len = buffer.len();
        let slop_len = total_len % WORD_SIZE;
        if slop_len == 0 {
            return Ok(ScatterMap { segments, slop: None, total_len });
        }

        let mut trim = slop_len;
        while trim > 0 {
            let Some(last) = segments.last_mut() else { break };
            let cut = trim.min(last.length as usize);
            last.length -= cut as u32;
            trim -= cut;
            if last.length == 0 {
                segments.pop();
            }
        }
        Ok(ScatterMap {
            segments,
            slop: Some(SlopRemainder {
                offset: total_len - slop_len,
                len: slop_len,
            }),
            total_len,
        })
    }

    fn split(&self, buffer: &DmaBuffer) -> HifnResult<Vec<Segment>> {
        if buffer.is_empty() {
            return Err(HifnError::InvalidArgument("empty buffer".into()));
        }
        if buffer.len() > MAX_DMA_LEN {
            return Err(HifnError::InvalidArgument(format!(
                "buffer of {} bytes exceeds maximum DMA length {MAX_DMA_LEN}",
                buffer.len()
            )));
        }
        let needed: usize = buffer
            .chunks()
            .map(|c| c.len.div_ceil(self.max_segment_len))
            .sum();
        if needed > self.max_segments {
            return Err(HifnError::TooManySegments {
                needed,
                max: self.max_segments,
            });
        }

        let mut segments = Vec::with_capacity(needed);
        for chunk in buffer.chunks() {
            let mut offset = 0usize;
            while offset < chunk.len {
                let take = (chunk.len - offset).min(self.max_segment_len);
                segments.push(Segment {
                    device_address: chunk.device_address + offset as u64,
                    length: take as u32,
                });
                offset += take;
            }
        }
        Ok(segments)
    }
}

/// True if the chip can write `buffer` in place: every chunk starts on a word
/// boundary and every chunk but the last is a whole number of words.
pub fn is_word_aligned(buffer: &DmaBuffer) -> bool {
    let chunks: Vec<_> = buffer.chunks().collect();
    chunks.iter().enumerate().all(|(i, c)| {
        c.device_address % WORD_SIZE as u64 == 0 && (i + 1 == chunks.len() || c.len % WORD_SIZE == 0)
    })
}

/// Read a whole buffer into a vector. Test and demo helper.
pub fn read_all<M: DmaMemory + ?Sized>(mem: &M, buffer: &DmaBuffer) -> HifnResult<Vec<u8>> {
    let mut out = vec![0u8; buffer.len()];
    read_at(mem, buffer, 0, &mut out)?;
    Ok(out)
}
