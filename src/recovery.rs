// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Abort recovery.
//!
//! After a DMA abort the rings can no longer be trusted. Requests whose
//! result descriptor the chip already released are completed normally; every
//! other outstanding request fails with [`HifnError::Aborted`]. The chip is
//! then reset, which also flushes its key RAM, so every session that had a
//! resident key must upload it again.

use crate::dma::Platform;
use crate::engine::{Delivery, EngineInner, EngineState};
use crate::error::HifnError;
use crate::regs::DmaStatus;
use crate::ring::RingKind;

impl EngineInner {
    /// Salvage, abort, reset and reinitialize. Safe to run on an idle engine.
    pub(crate) fn recover<P: Platform + ?Sized>(&mut self, hw: &P, status: DmaStatus, out: &mut Vec<Delivery>) {
        self.state = EngineState::Faulted;
        if status.is_empty() {
            log::warn!("engine reset requested");
        } else {
            log::error!("dma abort, status={:#010x}; resetting engine", status.bits());
        }

        let mut salvaged = 0usize;
        let mut aborted = 0usize;
        let outstanding: Vec<usize> = self.ring(RingKind::Result).occupied().collect();
        for slot in outstanding {
            if self.ring(RingKind::Result).is_complete(slot, hw) {
                self.finish(hw, slot, true, out);
                salvaged += 1;
            } else if let Some(pending) = self.pending[slot].take() {
                pending.abort(hw, HifnError::Aborted, out);
                aborted += 1;
            }
        }
        // Anything not tied to an occupied result slot.
        for entry in &mut self.pending {
            if let Some(pending) = entry.take() {
                pending.abort(hw, HifnError::Aborted, out);
                aborted += 1;
            }
        }

        self.state = EngineState::Resetting;
        let demoted = self.sessions.invalidate_all();
        self.reset_board(hw);
        self.init_dma(hw);
        self.init_registers(hw);
        self.state = EngineState::Running;

        log::info!("engine reset: {salvaged} salvaged, {aborted} aborted, {demoted} session key(s) dropped");
    }
}
