// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Interrupt service, ring reaping and per-request completion.

use crate::command::{BaseMasks, ResultRecord, MAX_RESULT};
use crate::dispatch::{Job, PendingRequest, MAX_OUTPUT_LEN};
use crate::dma::{self, DmaBuffer, Platform};
use crate::engine::{Completion, Delivery, EngineInner, OpReport};
use crate::error::{HifnError, HifnResult};
use crate::regs::{self, Bar, DmaStatus};
use crate::ring::RingKind;
use crate::scatter::{SlopState, MAX_DMA_LEN};
use crate::session::SessionId;

impl EngineInner {
    /// Acknowledge and handle one interrupt.
    ///
    /// Returns `Ok(false)` if none of the enabled sources is asserted.
    pub(crate) fn service_interrupt<P: Platform + ?Sized>(
        &mut self,
        hw: &P,
        out: &mut Vec<Delivery>,
    ) -> HifnResult<bool> {
        let csr = DmaStatus::from_bits_truncate(hw.reg_read(Bar::One, regs::DMA_CSR));
        let asserted = csr & self.dma_ier;
        if asserted.is_empty() {
            return Ok(false);
        }
        self.write_csr(hw, asserted);

        if asserted.contains(DmaStatus::ENGINE) {
            let isr = hw.reg_read(Bar::Zero, regs::PU_ISR);
            hw.reg_write(Bar::Zero, regs::PU_ISR, isr);
            log::trace!("processing unit interrupt, isr={isr:#010x}");
        }
        if asserted.intersects(DmaStatus::OVERRUNS) {
            log::warn!("dma overrun, csr={:#010x}", csr.bits());
        }
        if asserted.intersects(DmaStatus::ILLR | DmaStatus::ILLW) {
            log::warn!("illegal dma access, csr={:#010x}", csr.bits());
        }

        let aborts = asserted & DmaStatus::ABORTS;
        if !aborts.is_empty() {
            self.recover(hw, aborts, out);
            return Err(HifnError::EngineFault { status: aborts.bits() });
        }

        // Nothing outstanding and the command ring ran dry: stop asking.
        if asserted.contains(DmaStatus::C_WAIT) && self.ring(RingKind::Result).is_idle() {
            self.dma_ier.remove(DmaStatus::C_WAIT);
            self.write_ier(hw);
        }

        self.reap(hw, out);
        Ok(true)
    }

    /// Reclaim every ring slot the chip has released and complete the
    /// requests whose results came back.
    pub(crate) fn reap<P: Platform + ?Sized>(&mut self, hw: &P, out: &mut Vec<Delivery>) {
        let done: Vec<usize> = self.ring_mut(RingKind::Result).drain(hw).collect();
        let src = self.ring_mut(RingKind::Source).drain(hw).count();
        let dst = self.ring_mut(RingKind::Destination).drain(hw).count();
        let cmd = self.ring_mut(RingKind::Command).drain(hw).count();
        log::trace!("reaped res={} src={src} dst={dst} cmd={cmd}", done.len());
        for slot in done {
            self.finish(hw, slot, false, out);
        }
    }

    /// Complete the request in result slot `slot`.
    ///
    /// With `salvage` set the engine is recovering and a compression overrun
    /// cannot be retried.
    pub(crate) fn finish<P: Platform + ?Sized>(
        &mut self,
        hw: &P,
        slot: usize,
        salvage: bool,
        out: &mut Vec<Delivery>,
    ) {
        let Some(mut pending) = self.pending.get_mut(slot).and_then(Option::take) else {
            log::warn!("result slot {slot} completed without a request");
            return;
        };
        pending.syncs.release(hw);
        let result_region = self.result_region(slot);
        let mut raw = [0u8; MAX_RESULT];
        hw.dma_read(result_region.device_address, &mut raw);
        let record = ResultRecord::parse(&raw, pending.base_masks, pending.digest_len);

        if pending.base_masks.contains(BaseMasks::COMP) && record.overrun() {
            if salvage {
                pending.job.fail(hw, HifnError::Aborted, out);
            } else {
                self.retry_overrun(hw, pending.job, out);
            }
            return;
        }

        let PendingRequest {
            job,
            base_masks,
            chain_iv,
            slop,
            dst_transfer_len,
            ..
        } = pending;
        let Job {
            session,
            input,
            output,
            callback,
            ..
        } = job;
        let mut output = match output {
            Some(output) => {
                dma::free_buffer(hw, input);
                output
            }
            None => input,
        };

        let status = self.settle(hw, &mut output, session, slop, chain_iv, base_masks, dst_transfer_len, record);
        out.push((callback, Completion { output: Some(output), status }));
    }

    /// Put the finishing touches on a completed output: slop bytes, final
    /// compressed length and the next CBC IV.
    #[allow(clippy::too_many_arguments)]
    fn settle<P: Platform + ?Sized>(
        &mut self,
        hw: &P,
        output: &mut DmaBuffer,
        session: SessionId,
        slop: Option<SlopState>,
        chain_iv: Option<(usize, usize)>,
        base_masks: BaseMasks,
        dst_transfer_len: usize,
        record: ResultRecord,
    ) -> HifnResult<OpReport> {
        if let Some(slop) = slop {
            slop.splice(hw, self.slop_address(slop.request_slot), output)?;
        }
        if base_masks.contains(BaseMasks::COMP) {
            output.truncate(dst_transfer_len.saturating_sub(record.dst_residual()));
        }
        if let Some((offset, len)) = chain_iv {
            let mut iv = vec![0u8; len];
            dma::read_at(hw, output, offset, &mut iv)?;
            // The session may have been closed while the request ran.
            if let Ok(session) = self.sessions.get_mut(session) {
                session.set_iv(&iv);
            }
        }
        Ok(OpReport {
            output_len: output.len(),
            mac: record.mac,
        })
    }

    /// Resubmit a compression request with one more cluster of output.
    fn retry_overrun<P: Platform + ?Sized>(&mut self, hw: &P, mut job: Job, out: &mut Vec<Delivery>) {
        let current = job.output.as_ref().map_or(0, DmaBuffer::capacity);
        if !job.engine_output {
            job.fail(hw, HifnError::OutputTooLarge { max: current }, out);
            return;
        }
        if current >= MAX_OUTPUT_LEN {
            job.fail(hw, HifnError::OutputTooLarge { max: MAX_DMA_LEN }, out);
            return;
        }
        let grown = (current + self.config.cluster_size).min(MAX_OUTPUT_LEN);
        if let Some(old) = job.output.take() {
            dma::free_buffer(hw, old);
        }
        match dma::alloc_chain(hw, grown, self.mapper.max_segment_len()) {
            Ok(output) => job.output = Some(output),
            Err(error) => {
                job.fail(hw, error, out);
                return;
            }
        }
        log::debug!("session {}: output overrun, retrying with {grown} bytes", job.session);
        if let Err((error, job)) = self.dispatch(hw, job) {
            job.fail(hw, error, out);
        }
    }

    /// Switch off DMA channels that stayed idle for a full countdown.
    pub(crate) fn tick<P: Platform + ?Sized>(&mut self, hw: &P) {
        if self.countdown > 0 {
            self.countdown -= 1;
            return;
        }
        let mut disable = DmaStatus::empty();
        for kind in RingKind::ALL {
            if self.active[kind.index()] && self.ring(kind).is_idle() {
                disable |= DmaStatus::ctrl_disable(kind);
                self.active[kind.index()] = false;
            }
        }
        if !disable.is_empty() {
            log::trace!("idle rings disabled: {disable:?}");
            self.write_csr(hw, disable);
        }
    }
}
