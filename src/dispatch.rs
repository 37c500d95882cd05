// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Request submission: output selection, ring reservation and descriptor
//! writes.
//!
//! Descriptors go out in a fixed order: command, source, result,
//! destination. Each ring's DMA channel is started as soon as its first
//! descriptor is valid. Nothing is reserved until every ring is known to
//! have room, so a refused request leaves the rings and its session
//! untouched. Requests that can never succeed are refused with their own
//! error before ring space is considered.

use crate::command::{self, BaseMasks, CommandBuffer, Direction, Operation, TransferLengths, MAX_RESULT};
use crate::descriptor::Descriptor;
use crate::dma::{self, DmaBuffer, DmaRegion, Platform, SyncDirection, SyncSet, WORD_SIZE};
use crate::engine::{check_device_address, Callback, Completion, Delivery, EngineInner, Rejected, Request};
use crate::error::{HifnError, HifnResult};
use crate::regs::DmaStatus;
use crate::ring::RingKind;
use crate::scatter::{is_word_aligned, ScatterMap, SlopState, MAX_DMA_LEN};
use crate::session::SessionId;
use scopeguard::ScopeGuard;

/// Largest output the engine allocates; the destination length field is
/// 18 bits and destinations are whole words.
pub(crate) const MAX_OUTPUT_LEN: usize = MAX_DMA_LEN & !(WORD_SIZE - 1);

/// A request as the engine tracks it.
pub(crate) struct Job {
    pub(crate) session: SessionId,
    pub(crate) op: Operation,
    pub(crate) input: DmaBuffer,
    pub(crate) output: Option<DmaBuffer>,
    /// `output` was allocated by the engine (bounce or compression buffer).
    pub(crate) engine_output: bool,
    pub(crate) callback: Callback,
}

impl Job {
    fn from_request(request: Request) -> Self {
        Self {
            session: request.session,
            op: request.op,
            input: request.input,
            output: request.output,
            engine_output: false,
            callback: request.callback,
        }
    }

    /// Hand a job that was never queued back to its submitter.
    fn into_request<P: Platform + ?Sized>(mut self, hw: &P) -> Request {
        if self.engine_output {
            if let Some(output) = self.output.take() {
                dma::free_buffer(hw, output);
            }
        }
        Request {
            session: self.session,
            op: self.op,
            input: self.input,
            output: self.output,
            callback: self.callback,
        }
    }

    /// Release the job's buffers and complete it with `error`.
    pub(crate) fn fail<P: Platform + ?Sized>(self, hw: &P, error: HifnError, out: &mut Vec<Delivery>) {
        log::debug!("request on session {} failed: {error}", self.session);
        dma::free_buffer(hw, self.input);
        if let Some(output) = self.output {
            dma::free_buffer(hw, output);
        }
        out.push((self.callback, Completion { output: None, status: Err(error) }));
    }

    /// Buffer the chip writes to.
    pub(crate) fn destination(&self) -> &DmaBuffer {
        self.output.as_ref().unwrap_or(&self.input)
    }
}

/// Book-keeping for a request that owns a result slot.
pub(crate) struct PendingRequest {
    pub(crate) job: Job,
    pub(crate) base_masks: BaseMasks,
    pub(crate) digest_len: usize,
    /// Offset and length of the ciphertext block that becomes the next IV.
    pub(crate) chain_iv: Option<(usize, usize)>,
    pub(crate) slop: Option<SlopState>,
    /// Destination bytes announced in the command.
    pub(crate) dst_transfer_len: usize,
    /// Sync scopes over every region the chip touches for this request.
    pub(crate) syncs: SyncSet,
}

impl PendingRequest {
    /// Fail a request the chip did not finish.
    pub(crate) fn abort<P: Platform + ?Sized>(mut self, hw: &P, error: HifnError, out: &mut Vec<Delivery>) {
        self.syncs.release(hw);
        self.job.fail(hw, error, out);
    }
}

/// Everything validated before any ring is touched.
struct Prepared {
    source: ScatterMap,
    destination: ScatterMap,
    command: CommandBuffer,
    digest_len: usize,
    chain_iv: Option<(usize, usize)>,
}

/// Initial output size for a compression request.
pub(crate) fn compression_output_len(input_len: usize, direction: Direction, cluster: usize) -> usize {
    let clusters = input_len.div_ceil(cluster).max(1) * cluster;
    let len = match direction {
        Direction::Encode => clusters,
        Direction::Decode => clusters.saturating_mul(4),
    };
    len.min(MAX_OUTPUT_LEN)
}

impl EngineInner {
    /// Queue a caller's request or hand it back.
    pub(crate) fn submit<P: Platform + ?Sized>(&mut self, hw: &P, request: Request) -> Result<(), Rejected> {
        self.dispatch(hw, Job::from_request(request))
            .map_err(|(error, job)| Rejected { error, request: job.into_request(hw) })
    }

    /// Queue `job`, or return it untouched (apart from any engine-allocated
    /// output) with the reason it could not be queued.
    pub(crate) fn dispatch<P: Platform + ?Sized>(&mut self, hw: &P, mut job: Job) -> Result<(), (HifnError, Job)> {
        let prepared = match self.prepare(hw, &mut job) {
            Ok(prepared) => prepared,
            Err(error) => return Err((error, job)),
        };
        let direction = job.op.direction;
        let session = job.session;
        let (command_slot, result_slot, slop, syncs) = match self.enqueue(hw, &job, &prepared) {
            Ok(slots) => slots,
            Err(error) => return Err((error, job)),
        };

        self.countdown = self.config.active_ticks;
        if let Err(error) = self.sessions.commit(session, direction, prepared.command.key_uploaded()) {
            log::warn!("session {session} vanished during submit: {error}");
        }
        log::debug!(
            "queued session {session}: cmd slot {command_slot}, res slot {result_slot}, {} src / {} dst segments",
            prepared.source.descriptor_count(),
            prepared.destination.descriptor_count(),
        );
        self.pending[result_slot] = Some(PendingRequest {
            job,
            base_masks: prepared.command.base_masks(),
            digest_len: prepared.digest_len,
            chain_iv: prepared.chain_iv,
            slop,
            dst_transfer_len: prepared.destination.transfer_len(),
            syncs,
        });
        Ok(())
    }

    fn prepare<P: Platform + ?Sized>(&self, hw: &P, job: &mut Job) -> HifnResult<Prepared> {
        let session = self.sessions.get(job.session)?;
        command::validate(session, &job.op, job.input.len())?;

        if session.compression().is_some() {
            match &job.output {
                Some(output) if !is_word_aligned(output) => {
                    return Err(HifnError::InvalidArgument("compression output is not word aligned".into()));
                }
                Some(_) => {}
                None => {
                    let len = compression_output_len(job.input.len(), job.op.direction, self.config.cluster_size);
                    job.output = Some(dma::alloc_chain(hw, len, self.mapper.max_segment_len())?);
                    job.engine_output = true;
                }
            }
        } else if let Some(output) = &job.output {
            if !is_word_aligned(output) {
                return Err(HifnError::InvalidArgument("output buffer is not word aligned".into()));
            }
            if output.len() != job.input.len() {
                return Err(HifnError::BufferSizeMismatch {
                    expected: job.input.len(),
                    actual: output.len(),
                });
            }
        } else if !is_word_aligned(&job.input) {
            job.output = Some(dma::alloc_chain(hw, job.input.len(), self.config.cluster_size)?);
            job.engine_output = true;
        }

        for region in job.input.regions().iter().chain(job.destination().regions()) {
            check_device_address(*region)?;
        }
        let source = self.mapper.map_source(&job.input)?;
        let destination = self.mapper.map_destination(job.destination())?;
        let lengths = TransferLengths {
            source: source.total_len,
            destination: destination.transfer_len(),
        };
        let command = command::build(session, job.session.index(), &job.op, lengths)?;

        let fits = self.ring(RingKind::Command).can_reserve(1)
            && self.ring(RingKind::Source).can_reserve(source.descriptor_count())
            && self.ring(RingKind::Result).can_reserve(1)
            && self.ring(RingKind::Destination).can_reserve(destination.descriptor_count());
        if !fits {
            return Err(HifnError::Busy);
        }

        let digest_len = session.mac().map_or(0, |mac| mac.digest_len());
        let chain_iv = session
            .cipher()
            .filter(|cipher| cipher.iv_len() > 0 && job.op.direction == Direction::Encode)
            .map(|cipher| {
                let region = job.op.region_or_all(source.total_len);
                (region.skip + region.len - cipher.iv_len(), cipher.iv_len())
            });

        Ok(Prepared {
            source,
            destination,
            command,
            digest_len,
            chain_iv,
        })
    }

    /// Write all four rings. Every ring was checked for room, so the
    /// reservations cannot fail half way. Sync scopes opened here stay open
    /// until the request completes or is aborted.
    fn enqueue<P: Platform + ?Sized>(
        &mut self,
        hw: &P,
        job: &Job,
        prepared: &Prepared,
    ) -> HifnResult<(usize, usize, Option<SlopState>, SyncSet)> {
        let mut syncs = scopeguard::guard(SyncSet::default(), |mut syncs: SyncSet| syncs.release(hw));

        let command_slot = self.ring_mut(RingKind::Command).reserve(1, hw)?[0];
        let command_region = self.command_region(command_slot);
        hw.dma_write(command_region.device_address, prepared.command.as_bytes());
        syncs.acquire(hw, command_region, SyncDirection::ToDevice);
        let desc = Descriptor::segment(command_region.device_address, prepared.command.len() as u32, true);
        self.ring_mut(RingKind::Command).write(command_slot, desc, hw);
        self.activate(hw, RingKind::Command);
        self.dma_ier |= DmaStatus::C_WAIT;
        self.write_ier(hw);

        let input_direction = if job.output.is_some() {
            SyncDirection::ToDevice
        } else {
            SyncDirection::Bidirectional
        };
        syncs.acquire_buffer(hw, &job.input, input_direction);
        let slots = self
            .ring_mut(RingKind::Source)
            .reserve(prepared.source.descriptor_count(), hw)?;
        for (slot, desc) in slots.into_iter().zip(prepared.source.descriptors(None)) {
            self.ring_mut(RingKind::Source).write(slot, desc, hw);
        }
        self.activate(hw, RingKind::Source);

        let result_slot = self.ring_mut(RingKind::Result).reserve(1, hw)?[0];
        let result_region = self.result_region(result_slot);
        syncs.acquire(hw, result_region, SyncDirection::FromDevice);
        let desc = Descriptor::result(result_region.device_address, MAX_RESULT as u32);
        self.ring_mut(RingKind::Result).write(result_slot, desc, hw);
        self.activate(hw, RingKind::Result);

        if let Some(output) = &job.output {
            syncs.acquire_buffer(hw, output, SyncDirection::FromDevice);
        }
        let slop = prepared.destination.slop.map(|slop| slop.bind(result_slot));
        let scratch = slop.map(|s| self.slop_address(s.request_slot));
        if let Some(address) = scratch {
            let region = DmaRegion {
                device_address: address,
                len: WORD_SIZE,
            };
            syncs.acquire(hw, region, SyncDirection::FromDevice);
        }
        let slots = self
            .ring_mut(RingKind::Destination)
            .reserve(prepared.destination.descriptor_count(), hw)?;
        for (slot, desc) in slots.into_iter().zip(prepared.destination.descriptors(scratch)) {
            self.ring_mut(RingKind::Destination).write(slot, desc, hw);
        }
        self.activate(hw, RingKind::Destination);

        Ok((command_slot, result_slot, slop, ScopeGuard::into_inner(syncs)))
    }
}
