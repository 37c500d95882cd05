// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Engine configuration.
//!
//! Defaults match the 7751/7811 family; every value can be overridden with a
//! `with_*` setter before the engine is created.

use crate::command::BASE_SESSION_MASK;
use crate::descriptor::LENGTH_MASK;
use crate::dma::WORD_SIZE;
use crate::error::{HifnError, HifnResult};
use crate::scatter::MAX_DMA_LEN;

/// Command ring slots.
pub const DEFAULT_CMD_RING_SIZE: usize = 96;
/// Source ring slots.
pub const DEFAULT_SRC_RING_SIZE: usize = 320;
/// Destination ring slots.
pub const DEFAULT_DST_RING_SIZE: usize = 320;
/// Result ring slots.
pub const DEFAULT_RES_RING_SIZE: usize = 96;
/// Maximum scatter segments per buffer.
pub const DEFAULT_MAX_SEGMENTS: usize = 64;
/// Maximum bytes per segment (descriptor length field).
pub const DEFAULT_MAX_SEGMENT_LEN: usize = 0xffff;
/// Allocation unit for bounce and compression buffers.
pub const DEFAULT_CLUSTER_SIZE: usize = 2048;
/// Session contexts.
pub const DEFAULT_MAX_SESSIONS: usize = 2048;
/// Ticks without a submission before idle rings are switched off.
pub const DEFAULT_ACTIVE_TICKS: u32 = 5;

/// Engine sizing and timing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub cmd_ring_size: usize,
    pub src_ring_size: usize,
    pub dst_ring_size: usize,
    pub res_ring_size: usize,
    pub max_segments: usize,
    pub max_segment_len: usize,
    pub cluster_size: usize,
    pub max_sessions: usize,
    pub active_ticks: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cmd_ring_size: DEFAULT_CMD_RING_SIZE,
            src_ring_size: DEFAULT_SRC_RING_SIZE,
            dst_ring_size: DEFAULT_DST_RING_SIZE,
            res_ring_size: DEFAULT_RES_RING_SIZE,
            max_segments: DEFAULT_MAX_SEGMENTS,
            max_segment_len: DEFAULT_MAX_SEGMENT_LEN,
            cluster_size: DEFAULT_CLUSTER_SIZE,
            max_sessions: DEFAULT_MAX_SESSIONS,
            active_ticks: DEFAULT_ACTIVE_TICKS,
        }
    }
}

impl EngineConfig {
    /// Set the command and result ring sizes (one slot each per request).
    pub fn with_request_slots(mut self, slots: usize) -> Self {
        self.cmd_ring_size = slots;
        self.res_ring_size = slots;
        self
    }

    /// Set the source and destination ring sizes.
    pub fn with_segment_slots(mut self, slots: usize) -> Self {
        self.src_ring_size = slots;
        self.dst_ring_size = slots;
        self
    }

    /// Set the per-buffer segment limit.
    pub fn with_max_segments(mut self, max: usize) -> Self {
        self.max_segments = max;
        self
    }

    /// Set the per-segment byte limit.
    pub fn with_max_segment_len(mut self, len: usize) -> Self {
        self.max_segment_len = len;
        self
    }

    /// Set the bounce/compression allocation unit.
    pub fn with_cluster_size(mut self, size: usize) -> Self {
        self.cluster_size = size;
        self
    }

    /// Set the number of session contexts.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the idle countdown re-armed by every submission.
    pub fn with_active_ticks(mut self, ticks: u32) -> Self {
        self.active_ticks = ticks;
        self
    }

    /// Check that the configuration describes a usable engine.
    ///
    /// A request must always fit into empty rings, otherwise it would be
    /// rejected with `Busy` forever.
    pub fn validate(&self) -> HifnResult<()> {
        let invalid = |msg: String| Err(HifnError::InvalidArgument(msg));
        if self.cmd_ring_size == 0 || self.res_ring_size == 0 {
            return invalid("command and result rings need at least one slot".into());
        }
        if self.max_segments == 0 {
            return invalid("max_segments must be non-zero".into());
        }
        if self.src_ring_size < self.max_segments {
            return invalid(format!(
                "source ring of {} slots cannot hold {} segments",
                self.src_ring_size, self.max_segments
            ));
        }
        // One extra destination slot for the slop word.
        if self.dst_ring_size < self.max_segments + 1 {
            return invalid(format!(
                "destination ring of {} slots cannot hold {} segments plus slop",
                self.dst_ring_size, self.max_segments
            ));
        }
        if self.max_segment_len < WORD_SIZE || self.max_segment_len > LENGTH_MASK as usize {
            return invalid(format!("max_segment_len {} out of range", self.max_segment_len));
        }
        if self.cluster_size == 0 || self.cluster_size % WORD_SIZE != 0 || self.cluster_size > MAX_DMA_LEN {
            return invalid(format!("cluster_size {} must be a non-zero word multiple", self.cluster_size));
        }
        if self.max_sessions == 0 || self.max_sessions > BASE_SESSION_MASK as usize + 1 {
            return invalid(format!(
                "max_sessions {} out of range 1..={}",
                self.max_sessions,
                BASE_SESSION_MASK as usize + 1
            ));
        }
        Ok(())
    }
}
