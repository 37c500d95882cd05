// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! High-level engine API.
//!
//! [`HifnEngine`] owns the four descriptor rings, the session table and the
//! table of in-flight requests. A single mutex serializes submission,
//! completion and recovery. Callbacks never run under it: completions are
//! queued while the lock is held and handed to their callbacks afterwards,
//! in completion order, by whichever thread holds the delivery lock.

use crate::command::{Operation, MAX_COMMAND, MAX_RESULT};
use crate::config::EngineConfig;
use crate::dispatch::PendingRequest;
use crate::dma::{self, DmaBuffer, DmaRegion, Platform, WORD_SIZE};
use crate::error::{HifnError, HifnResult};
use crate::regs::{self, Bar, DmaConfig, DmaStatus};
use crate::ring::{DescriptorRing, RingKind};
use crate::scatter::{read_all, ScatterMapper};
use crate::session::{AlgorithmInit, Capabilities, SessionId, SessionState, SessionTable};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use thiserror::Error;

/// Per-request completion callback.
pub type Callback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// What a completed request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpReport {
    /// Valid bytes in the output buffer.
    pub output_len: usize,
    /// Digest computed by the MAC unit.
    pub mac: Option<Vec<u8>>,
}

/// Handed to a request's callback exactly once.
#[derive(Debug)]
pub struct Completion {
    /// Output buffer; `None` if the request was aborted or failed after
    /// submission.
    pub output: Option<DmaBuffer>,
    pub status: HifnResult<OpReport>,
}

/// One unit of work for the chip.
///
/// The engine takes ownership of the buffers. Without an explicit output the
/// input is transformed in place when it is word aligned, otherwise into a
/// fresh bounce buffer. When the output is a separate buffer the input is
/// released on completion.
pub struct Request {
    pub session: SessionId,
    pub op: Operation,
    pub input: DmaBuffer,
    pub output: Option<DmaBuffer>,
    pub(crate) callback: Callback,
}

impl Request {
    /// Create a request whose result goes to `callback`.
    pub fn new<F>(session: SessionId, op: Operation, input: DmaBuffer, callback: F) -> Self
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        Self {
            session,
            op,
            input,
            output: None,
            callback: Box::new(callback),
        }
    }

    /// Write into `output` instead of in place.
    pub fn with_output(mut self, output: DmaBuffer) -> Self {
        self.output = Some(output);
        self
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("session", &self.session)
            .field("op", &self.op)
            .field("input", &self.input)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

/// A request the engine refused, handed back unchanged.
#[derive(Debug, Error)]
#[error("request rejected: {error}")]
pub struct Rejected {
    pub error: HifnError,
    pub request: Request,
}

impl Rejected {
    /// True if the same request may be submitted again later.
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

impl From<Rejected> for HifnError {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}

/// Recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Running,
    Faulted,
    Resetting,
}

/// Occupancy of one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingUsage {
    pub kind: RingKind,
    pub in_use: usize,
    pub capacity: usize,
    /// DMA channel currently enabled.
    pub active: bool,
}

pub(crate) type Delivery = (Callback, Completion);

/// Engine state guarded by the engine lock.
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) rings: [DescriptorRing; 4],
    pub(crate) active: [bool; 4],
    pub(crate) sessions: SessionTable,
    /// In-flight requests indexed by result slot.
    pub(crate) pending: Vec<Option<PendingRequest>>,
    pub(crate) command_bufs: DmaRegion,
    pub(crate) result_bufs: DmaRegion,
    pub(crate) slop_words: DmaRegion,
    pub(crate) dma_ier: DmaStatus,
    pub(crate) countdown: u32,
    pub(crate) state: EngineState,
    pub(crate) mapper: ScatterMapper,
}

/// Device addresses handed to the chip are 32 bits wide.
const DEVICE_ADDRESS_LIMIT: u64 = 1 << 32;

pub(crate) fn check_device_address(region: DmaRegion) -> HifnResult<DmaRegion> {
    if region.end() > DEVICE_ADDRESS_LIMIT {
        return Err(HifnError::InvalidArgument(format!(
            "DMA region {:#x}+{:#x} is not 32-bit addressable",
            region.device_address, region.len
        )));
    }
    Ok(region)
}

impl EngineInner {
    fn new<P: Platform + ?Sized>(hw: &P, config: EngineConfig) -> HifnResult<Self> {
        config.validate()?;

        // Roll back every allocation if any later step fails.
        let mut regions = scopeguard::guard(Vec::<DmaRegion>::new(), |regions| {
            for region in regions {
                hw.dma_free(region);
            }
        });
        let mut alloc = |size: usize| -> HifnResult<DmaRegion> {
            let region = hw.dma_alloc(size)?;
            regions.push(region);
            check_device_address(region)
        };
        let command_bufs = alloc(config.cmd_ring_size * MAX_COMMAND)?;
        let result_bufs = alloc(config.res_ring_size * MAX_RESULT)?;
        let slop_words = alloc(config.res_ring_size * WORD_SIZE)?;

        let sizes = [
            config.cmd_ring_size,
            config.src_ring_size,
            config.dst_ring_size,
            config.res_ring_size,
        ];
        let mut rings = Vec::with_capacity(4);
        for (kind, size) in RingKind::ALL.into_iter().zip(sizes) {
            let ring = DescriptorRing::new(kind, size, hw)?;
            regions.push(ring.region());
            check_device_address(ring.region())?;
            rings.push(ring);
        }
        let rings: [DescriptorRing; 4] = rings
            .try_into()
            .map_err(|_| HifnError::InvalidArgument("ring setup".into()))?;

        let mut inner = Self {
            mapper: ScatterMapper::new(config.max_segment_len, config.max_segments),
            sessions: SessionTable::new(config.max_sessions, hw.capabilities()),
            pending: std::iter::repeat_with(|| None).take(config.res_ring_size).collect(),
            config,
            rings,
            active: [false; 4],
            command_bufs,
            result_bufs,
            slop_words,
            dma_ier: DmaStatus::DEFAULT_IER,
            countdown: 0,
            state: EngineState::Running,
        };
        scopeguard::ScopeGuard::into_inner(regions);

        inner.reset_board(hw);
        inner.init_dma(hw);
        inner.init_registers(hw);
        Ok(inner)
    }

    #[inline]
    pub(crate) fn ring(&self, kind: RingKind) -> &DescriptorRing {
        &self.rings[kind.index()]
    }

    #[inline]
    pub(crate) fn ring_mut(&mut self, kind: RingKind) -> &mut DescriptorRing {
        &mut self.rings[kind.index()]
    }

    /// Command buffer backing command slot `slot`.
    pub(crate) fn command_region(&self, slot: usize) -> DmaRegion {
        self.command_bufs.slice(slot * MAX_COMMAND, MAX_COMMAND)
    }

    /// Result buffer backing result slot `slot`.
    pub(crate) fn result_region(&self, slot: usize) -> DmaRegion {
        self.result_bufs.slice(slot * MAX_RESULT, MAX_RESULT)
    }

    /// Scratch word receiving the slop of the request in result slot `slot`.
    pub(crate) fn slop_address(&self, slot: usize) -> u64 {
        self.slop_words.device_address + (slot * WORD_SIZE) as u64
    }

    pub(crate) fn write_csr<P: Platform + ?Sized>(&self, hw: &P, bits: DmaStatus) {
        hw.reg_write(Bar::One, regs::DMA_CSR, bits.bits());
    }

    pub(crate) fn write_ier<P: Platform + ?Sized>(&self, hw: &P) {
        hw.reg_write(Bar::One, regs::DMA_IER, self.dma_ier.bits());
    }

    /// Start `kind`'s DMA channel unless it is already running.
    pub(crate) fn activate<P: Platform + ?Sized>(&mut self, hw: &P, kind: RingKind) {
        if !self.active[kind.index()] {
            self.write_csr(hw, DmaStatus::ctrl_enable(kind));
            self.active[kind.index()] = true;
        }
    }

    /// Pulse the master reset.
    pub(crate) fn reset_board<P: Platform + ?Sized>(&mut self, hw: &P) {
        let run = DmaConfig::MSTRESET | DmaConfig::DMARESET | DmaConfig::MODE;
        hw.reg_write(Bar::One, regs::DMA_CNFG, (run - DmaConfig::MSTRESET).bits());
        hw.reg_write(Bar::One, regs::DMA_CNFG, run.bits());
    }

    /// Empty all rings and point the chip at them.
    pub(crate) fn init_dma<P: Platform + ?Sized>(&mut self, hw: &P) {
        for ring in &mut self.rings {
            ring.reset(hw);
            let base = ring.base_address() as u32;
            hw.reg_write(Bar::One, regs::ring_base_register(ring.kind()), base);
        }
        for entry in &mut self.pending {
            *entry = None;
        }
    }

    /// Stop every channel, clear stale status and restore interrupt enables.
    pub(crate) fn init_registers<P: Platform + ?Sized>(&mut self, hw: &P) {
        let status = DmaStatus::all()
            - DmaStatus::C_CTRL_ENA
            - DmaStatus::S_CTRL_ENA
            - DmaStatus::D_CTRL_ENA
            - DmaStatus::R_CTRL_ENA;
        self.write_csr(hw, status);
        self.active = [false; 4];
        self.dma_ier = DmaStatus::DEFAULT_IER;
        self.write_ier(hw);
        self.countdown = 0;
    }

    /// Abort everything in flight and return the engine's DMA memory.
    fn shutdown<P: Platform + ?Sized>(&mut self, hw: &P, out: &mut Vec<Delivery>) {
        self.write_csr(hw, DmaStatus::ALL_CTRL_DIS);
        self.active = [false; 4];
        for entry in &mut self.pending {
            if let Some(pending) = entry.take() {
                pending.abort(hw, HifnError::Aborted, out);
            }
        }
        for ring in &self.rings {
            hw.dma_free(ring.region());
        }
        hw.dma_free(self.command_bufs);
        hw.dma_free(self.result_bufs);
        hw.dma_free(self.slop_words);
    }

    pub(crate) fn usage(&self) -> [RingUsage; 4] {
        RingKind::ALL.map(|kind| {
            let ring = self.ring(kind);
            RingUsage {
                kind,
                in_use: ring.in_use(),
                capacity: ring.capacity(),
                active: self.active[kind.index()],
            }
        })
    }
}

/// Offload engine driving one chip through its platform.
///
/// # Example
///
/// ```rust
/// use hifn_rs::{Algorithm, AlgorithmInit, EngineConfig, HifnEngine, Operation, Request};
/// use hifn_rs::sim::SimulatedChip;
/// use std::sync::{mpsc, Arc};
///
/// let chip = Arc::new(SimulatedChip::new());
/// let engine = HifnEngine::new(chip.clone(), EngineConfig::default()).unwrap();
/// let session = engine
///     .open_session(&[AlgorithmInit::with_key(Algorithm::Rc4, b"secret")], None)
///     .unwrap();
///
/// let input = engine.buffer_from_slice(b"hello, offload").unwrap();
/// let (tx, rx) = mpsc::channel();
/// engine
///     .submit(Request::new(session, Operation::encrypt(), input, move |c| {
///         tx.send(c).unwrap();
///     }))
///     .unwrap();
///
/// chip.run();
/// engine.interrupt().unwrap();
/// let completion = rx.recv().unwrap();
/// assert_eq!(completion.status.unwrap().output_len, 14);
/// ```
pub struct HifnEngine<P: Platform> {
    platform: Arc<P>,
    inner: Mutex<EngineInner>,
    completed: Mutex<VecDeque<Delivery>>,
    delivery: Mutex<()>,
}

impl<P: Platform> HifnEngine<P> {
    /// Allocate rings and buffers, reset the chip and bring it up.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - DMA memory cannot be allocated
    /// - An allocation lies outside the 32-bit device address range
    pub fn new(platform: Arc<P>, config: EngineConfig) -> HifnResult<Self> {
        let inner = EngineInner::new(&*platform, config)?;
        log::info!(
            "hifn engine up: rings cmd={} src={} dst={} res={}, {} sessions, caps={:?}",
            inner.ring(RingKind::Command).capacity(),
            inner.ring(RingKind::Source).capacity(),
            inner.ring(RingKind::Destination).capacity(),
            inner.ring(RingKind::Result).capacity(),
            inner.sessions.capacity(),
            inner.sessions.capabilities(),
        );
        Ok(Self {
            platform,
            inner: Mutex::new(inner),
            completed: Mutex::new(VecDeque::new()),
            delivery: Mutex::new(()),
        })
    }

    /// The platform the engine drives.
    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn completed(&self) -> MutexGuard<'_, VecDeque<Delivery>> {
        self.completed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the engine lock, then deliver whatever it completed.
    fn with_engine<R>(&self, f: impl FnOnce(&mut EngineInner, &P, &mut Vec<Delivery>) -> R) -> R {
        let mut out = Vec::new();
        let result = {
            let mut inner = self.lock();
            let result = f(&mut *inner, &*self.platform, &mut out);
            // Queued before the engine lock drops so the queue order is
            // the completion order.
            if !out.is_empty() {
                self.completed().extend(out);
            }
            result
        };
        self.deliver();
        result
    }

    /// Invoke queued callbacks until the queue is empty. Only one thread
    /// delivers at a time; the others leave their completions to it.
    fn deliver(&self) {
        loop {
            let guard = match self.delivery.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            loop {
                let next = self.completed().pop_front();
                let Some((callback, completion)) = next else { break };
                callback(completion);
            }
            drop(guard);
            if self.completed().is_empty() {
                return;
            }
        }
    }

    /// Open a session for one cipher and/or one MAC, or for compression.
    pub fn open_session(&self, algorithms: &[AlgorithmInit], iv: Option<&[u8]>) -> HifnResult<SessionId> {
        self.lock().sessions.open(algorithms, iv)
    }

    /// Close a session and wipe its keys.
    pub fn close_session(&self, id: SessionId) -> HifnResult<()> {
        self.lock().sessions.close(id)
    }

    /// Key residency of a session.
    pub fn session_state(&self, id: SessionId) -> HifnResult<SessionState> {
        self.lock().sessions.state(id)
    }

    /// Current chaining IV of a session.
    pub fn session_iv(&self, id: SessionId) -> HifnResult<Vec<u8>> {
        Ok(self.lock().sessions.get(id)?.iv().to_vec())
    }

    /// Queue a request. Never blocks.
    ///
    /// # Errors
    ///
    /// The request comes back inside [`Rejected`] if:
    /// - Any ring lacks room ([`HifnError::Busy`], retry later)
    /// - The buffers need more segments than the chip supports
    /// - The session is unknown or the operation does not fit it
    pub fn submit(&self, request: Request) -> Result<(), Rejected> {
        self.with_engine(|inner, hw, _| inner.submit(hw, request))
    }

    /// Interrupt entry point.
    ///
    /// Returns `Ok(false)` if the chip did not interrupt, `Ok(true)` after
    /// reaping completions, and [`HifnError::EngineFault`] if an abort was
    /// reported; the engine has already recovered when that is returned.
    pub fn interrupt(&self) -> HifnResult<bool> {
        self.with_engine(|inner, hw, out| inner.service_interrupt(hw, out))
    }

    /// Periodic housekeeping: switch off idle DMA channels.
    pub fn tick(&self) {
        let platform = &*self.platform;
        self.lock().tick(platform);
    }

    /// Force a recovery cycle as if the chip had reported an abort.
    pub fn fault(&self) {
        self.with_engine(|inner, hw, out| inner.recover(hw, DmaStatus::empty(), out));
    }

    /// Recovery state.
    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    /// Algorithms registered by the platform.
    pub fn capabilities(&self) -> Capabilities {
        self.lock().sessions.capabilities()
    }

    /// Occupancy of the command, source, destination and result rings.
    pub fn ring_usage(&self) -> [RingUsage; 4] {
        self.lock().usage()
    }

    /// Requests submitted and not yet completed.
    pub fn pending(&self) -> usize {
        self.lock().pending.iter().filter(|p| p.is_some()).count()
    }

    /// Allocate a buffer of `len` bytes in cluster-sized chunks.
    pub fn alloc_buffer(&self, len: usize) -> HifnResult<DmaBuffer> {
        let cluster = self.lock().config.cluster_size;
        dma::alloc_chain(&*self.platform, len, cluster)
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn buffer_from_slice(&self, data: &[u8]) -> HifnResult<DmaBuffer> {
        let buffer = self.alloc_buffer(data.len())?;
        let platform = &*self.platform;
        let buffer = scopeguard::guard(buffer, |b| dma::free_buffer(platform, b));
        dma::write_at(platform, &buffer, 0, data)?;
        Ok(scopeguard::ScopeGuard::into_inner(buffer))
    }

    /// Allocate one region per slice, keeping the caller's chunk boundaries.
    pub fn buffer_from_chunks(&self, chunks: &[&[u8]]) -> HifnResult<DmaBuffer> {
        let platform = &*self.platform;
        let mut regions = scopeguard::guard(Vec::with_capacity(chunks.len()), |regions: Vec<DmaRegion>| {
            for region in regions {
                platform.dma_free(region);
            }
        });
        for chunk in chunks {
            let region = platform.dma_alloc(chunk.len().max(1))?.slice(0, chunk.len());
            platform.dma_write(region.device_address, chunk);
            regions.push(region);
        }
        Ok(DmaBuffer::from_regions(scopeguard::ScopeGuard::into_inner(regions)))
    }

    /// Copy a buffer's logical contents out.
    pub fn read_buffer(&self, buffer: &DmaBuffer) -> HifnResult<Vec<u8>> {
        read_all(&*self.platform, buffer)
    }

    /// Return a buffer to DMA memory.
    pub fn free_buffer(&self, buffer: DmaBuffer) {
        dma::free_buffer(&*self.platform, buffer);
    }

    /// Submit and wait for the completion.
    ///
    /// Someone else must keep servicing [`HifnEngine::interrupt`] for the
    /// future to resolve.
    #[cfg(feature = "async")]
    pub async fn process(&self, session: SessionId, op: Operation, input: DmaBuffer) -> HifnResult<Completion> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let request = Request::new(session, op, input, move |completion| {
            let _ = tx.send(completion);
        });
        if let Err(rejected) = self.submit(request) {
            let Rejected { error, request } = rejected;
            self.free_buffer(request.input);
            if let Some(output) = request.output {
                self.free_buffer(output);
            }
            return Err(error);
        }
        rx.await.map_err(|_| HifnError::Aborted)
    }
}

impl<P: Platform> Drop for HifnEngine<P> {
    fn drop(&mut self) {
        let mut out = Vec::new();
        {
            let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
            inner.shutdown(&*self.platform, &mut out);
        }
        if !out.is_empty() {
            log::warn!("engine dropped with {} request(s) in flight", out.len());
            self.completed().extend(out);
        }
        self.deliver();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Operation;
    use crate::scatter::MAX_DMA_LEN;
    use crate::session::Algorithm;
    use crate::sim::{self, SimulatedChip};
    use std::sync::mpsc;

    type Engine = HifnEngine<SimulatedChip>;

    fn engine_with(config: EngineConfig) -> (Arc<SimulatedChip>, Engine) {
        let chip = Arc::new(SimulatedChip::new());
        let engine = HifnEngine::new(chip.clone(), config).unwrap();
        (chip, engine)
    }

    fn engine() -> (Arc<SimulatedChip>, Engine) {
        engine_with(EngineConfig::default())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    /// Submit and return a receiver for the completion.
    fn submit(engine: &Engine, request_of: impl FnOnce(Callback) -> Request) -> mpsc::Receiver<Completion> {
        let (tx, rx) = mpsc::channel();
        let request = request_of(Box::new(move |c| {
            let _ = tx.send(c);
        }));
        engine.submit(request).unwrap();
        rx
    }

    fn request(session: SessionId, op: Operation, input: DmaBuffer) -> impl FnOnce(Callback) -> Request {
        move |cb| Request::new(session, op, input, cb)
    }

    fn service(chip: &SimulatedChip, engine: &Engine) {
        chip.run();
        assert_eq!(engine.interrupt(), Ok(true));
    }

    #[test]
    fn test_rc4_slop_round_trip() {
        let (chip, engine) = engine();
        let key: Vec<u8> = (0..15).collect();
        let session = engine
            .open_session(&[AlgorithmInit::with_key(Algorithm::Rc4, &key)], None)
            .unwrap();
        let data = pattern(37);
        let input = engine.buffer_from_slice(&data).unwrap();
        let rx = submit(&engine, request(session, Operation::encrypt(), input));

        service(&chip, &engine);
        let completion = rx.try_recv().unwrap();
        let report = completion.status.unwrap();
        assert_eq!(report.output_len, 37);
        let output = completion.output.unwrap();
        assert_eq!(engine.read_buffer(&output).unwrap(), data);
        assert_eq!(chip.stale_key_uses(), 0);
        engine.free_buffer(output);
    }

    #[test]
    fn test_busy_after_capacity() {
        let config = EngineConfig::default().with_request_slots(4);
        let (chip, engine) = engine_with(config);
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Sha1)], None).unwrap();

        let mut receivers = Vec::new();
        let mut busy = 0;
        for _ in 0..8 {
            let input = engine.buffer_from_slice(&pattern(64)).unwrap();
            let (tx, rx) = mpsc::channel();
            let req = Request::new(session, Operation::authenticate(), input, move |c| {
                let _ = tx.send(c);
            });
            match engine.submit(req) {
                Ok(()) => receivers.push(rx),
                Err(rejected) => {
                    assert!(rejected.is_retryable());
                    // The request comes back intact.
                    assert_eq!(engine.read_buffer(&rejected.request.input).unwrap(), pattern(64));
                    engine.free_buffer(rejected.request.input);
                    busy += 1;
                }
            }
        }
        assert_eq!(receivers.len(), 4);
        assert_eq!(busy, 4);

        service(&chip, &engine);
        for rx in receivers {
            assert!(rx.try_recv().unwrap().status.is_ok());
        }
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_invalid_request_rejected_even_when_full() {
        let config = EngineConfig::default().with_request_slots(2);
        let (_chip, engine) = engine_with(config);
        let session = engine
            .open_session(&[AlgorithmInit::with_key(Algorithm::DesCbc, &[5; 8])], None)
            .unwrap();
        let _pending: Vec<_> = (0..2)
            .map(|_| {
                let input = engine.buffer_from_slice(&pattern(16)).unwrap();
                submit(&engine, request(session, Operation::encrypt(), input))
            })
            .collect();

        let try_submit = |op: Operation, len: usize| {
            let input = engine.buffer_from_slice(&pattern(len)).unwrap();
            let rejected = engine.submit(Request::new(session, op, input, |_| {})).unwrap_err();
            engine.free_buffer(rejected.request.input);
            rejected.error
        };
        assert_eq!(try_submit(Operation::encrypt(), 16), HifnError::Busy);

        let partial_block = try_submit(Operation::encrypt(), 20);
        assert!(matches!(partial_block, HifnError::InvalidArgument(_)));
        assert!(!partial_block.is_retryable());

        let short_iv = try_submit(Operation::encrypt().with_iv(&[0; 3]), 16);
        assert!(matches!(short_iv, HifnError::InvalidArgument(_)));

        let outside = try_submit(Operation::encrypt().with_region(8, 16), 16);
        assert!(matches!(outside, HifnError::InvalidArgument(_)));
        assert_eq!(engine.pending(), 2);
    }

    #[test]
    fn test_rejected_submit_keeps_session_state() {
        let config = EngineConfig::default().with_request_slots(1);
        let (chip, engine) = engine_with(config);
        let session = engine
            .open_session(&[AlgorithmInit::with_key(Algorithm::Rc4, &[6; 16])], None)
            .unwrap();
        let input = engine.buffer_from_slice(&pattern(32)).unwrap();
        let rx = submit(&engine, request(session, Operation::encrypt(), input));
        assert_eq!(engine.session_state(session), Ok(SessionState::KeyResident));

        // Opposite direction while the rings are full.
        let input = engine.buffer_from_slice(&pattern(32)).unwrap();
        let rejected = engine
            .submit(Request::new(session, Operation::decrypt(), input, |_| {}))
            .unwrap_err();
        assert_eq!(rejected.error, HifnError::Busy);
        assert_eq!(engine.session_state(session), Ok(SessionState::KeyResident));

        service(&chip, &engine);
        engine.free_buffer(rx.try_recv().unwrap().output.unwrap());
        assert_eq!(chip.key_uploads(), 1);

        // The retry reloads the key for the new direction.
        let rx = submit(&engine, request(session, Operation::decrypt(), rejected.request.input));
        service(&chip, &engine);
        assert!(rx.try_recv().unwrap().status.is_ok());
        assert_eq!(chip.key_uploads(), 2);
        assert_eq!(chip.stale_key_uses(), 0);
    }

    #[test]
    fn test_busy_when_only_segment_rings_are_full() {
        let config = EngineConfig::default().with_max_segments(4).with_segment_slots(5);
        let (chip, engine) = engine_with(config);
        let session = engine
            .open_session(&[AlgorithmInit::with_key(Algorithm::DesCbc, &[5; 8])], None)
            .unwrap();
        let four_chunks = || {
            engine
                .buffer_from_chunks(&[&pattern(4), &pattern(4), &pattern(4), &pattern(4)])
                .unwrap()
        };
        let rx = submit(&engine, request(session, Operation::encrypt(), four_chunks()));
        let usage = engine.ring_usage();
        assert_eq!(usage[RingKind::Source.index()].in_use, 4);
        assert_eq!(usage[RingKind::Destination.index()].in_use, 4);

        // Source ring short by three slots, command and result rings empty.
        let rejected = engine
            .submit(Request::new(session, Operation::encrypt(), four_chunks(), |_| {}))
            .unwrap_err();
        assert_eq!(rejected.error, HifnError::Busy);
        assert_eq!(engine.ring_usage(), usage);
        engine.free_buffer(rejected.request.input);

        // One source slot is enough, the two-chunk output is not.
        let input = engine.buffer_from_slice(&pattern(8)).unwrap();
        let output = engine.buffer_from_chunks(&[&[0; 4], &[0; 4]]).unwrap();
        let rejected = engine
            .submit(Request::new(session, Operation::encrypt(), input, |_| {}).with_output(output))
            .unwrap_err();
        assert_eq!(rejected.error, HifnError::Busy);
        assert_eq!(engine.ring_usage(), usage);
        assert_eq!(engine.pending(), 1);

        service(&chip, &engine);
        engine.free_buffer(rx.try_recv().unwrap().output.unwrap());
        let Request { input, output, .. } = rejected.request;
        let rx = submit(&engine, move |cb| {
            Request::new(session, Operation::encrypt(), input, cb).with_output(output.unwrap())
        });
        service(&chip, &engine);
        assert!(rx.try_recv().unwrap().status.is_ok());
    }

    #[test]
    fn test_sync_scopes_closed_on_completion_and_abort() {
        let (chip, engine) = engine();
        let session = engine
            .open_session(&[AlgorithmInit::with_key(Algorithm::DesCbc, &[5; 8])], None)
            .unwrap();

        let input = engine.buffer_from_slice(&pattern(32)).unwrap();
        let region = input.regions()[0];
        let rx = submit(&engine, request(session, Operation::encrypt(), input));
        assert_eq!(chip.open_sync_scopes(region), 1);
        service(&chip, &engine);
        assert_eq!(chip.open_sync_scopes(region), 0);
        engine.free_buffer(rx.try_recv().unwrap().output.unwrap());

        let input = engine.buffer_from_slice(&pattern(32)).unwrap();
        let output = engine.alloc_buffer(32).unwrap();
        let (in_region, out_region) = (input.regions()[0], output.regions()[0]);
        let rx = submit(&engine, move |cb| Request::new(session, Operation::encrypt(), input, cb).with_output(output));
        assert_eq!(chip.open_sync_scopes(in_region), 1);
        assert_eq!(chip.open_sync_scopes(out_region), 1);
        engine.fault();
        assert_eq!(rx.try_recv().unwrap().status, Err(HifnError::Aborted));
        assert_eq!(chip.open_sync_scopes(in_region), 0);
        assert_eq!(chip.open_sync_scopes(out_region), 0);
    }

    #[test]
    fn test_keyless_session_stays_used() {
        let (chip, engine) = engine();
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Md5)], None).unwrap();
        let input = engine.buffer_from_slice(&pattern(16)).unwrap();
        let rx = submit(&engine, request(session, Operation::authenticate(), input));
        assert_eq!(engine.session_state(session), Ok(SessionState::Used));
        service(&chip, &engine);
        assert!(rx.try_recv().unwrap().status.is_ok());
        assert_eq!(engine.session_state(session), Ok(SessionState::Used));
        assert_eq!(chip.key_uploads(), 0);
    }

    #[test]
    fn test_completions_are_fifo() {
        let (chip, engine) = engine();
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Md5)], None).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10usize {
            let input = engine.buffer_from_slice(&pattern(16 + i)).unwrap();
            let order = order.clone();
            engine
                .submit(Request::new(session, Operation::authenticate(), input, move |_| {
                    order.lock().unwrap().push(i);
                }))
                .unwrap();
        }
        chip.process(3);
        engine.interrupt().unwrap();
        chip.run();
        engine.interrupt().unwrap();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_fault_salvages_completed_and_aborts_rest() {
        let (chip, engine) = engine();
        let session = engine
            .open_session(&[AlgorithmInit::with_key(Algorithm::DesCbc, &[5; 8])], None)
            .unwrap();
        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let input = engine.buffer_from_slice(&pattern(32)).unwrap();
                submit(&engine, request(session, Operation::encrypt(), input))
            })
            .collect();
        assert_eq!(engine.session_state(session), Ok(SessionState::KeyResident));

        chip.process(1);
        let free_before_fault = chip.free_bytes();
        engine.fault();

        let results: Vec<_> = receivers.iter().map(|rx| rx.try_recv().unwrap()).collect();
        assert!(results[0].status.is_ok());
        assert!(results[0].output.is_some());
        for aborted in &results[1..] {
            assert_eq!(aborted.status, Err(HifnError::Aborted));
            assert!(aborted.output.is_none());
        }
        // Aborted requests' buffers went back to DMA memory.
        assert!(chip.free_bytes() > free_before_fault);

        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.session_state(session), Ok(SessionState::Used));
        assert_eq!(engine.pending(), 0);
        assert!(engine.ring_usage().iter().all(|u| u.in_use == 0 && !u.active));
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let (chip, engine) = engine();
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Sha1)], None).unwrap();
        let input = engine.buffer_from_slice(&pattern(24)).unwrap();
        let _rx = submit(&engine, request(session, Operation::authenticate(), input));

        engine.fault();
        let once = (engine.ring_usage(), engine.state(), chip.free_bytes());
        engine.fault();
        let twice = (engine.ring_usage(), engine.state(), chip.free_bytes());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_key_reuploaded_after_reset() {
        let (chip, engine) = engine();
        let session = engine
            .open_session(&[AlgorithmInit::with_key(Algorithm::TripleDesCbc, &[9; 24])], None)
            .unwrap();
        let run = |len: usize| {
            let input = engine.buffer_from_slice(&pattern(len)).unwrap();
            let rx = submit(&engine, request(session, Operation::encrypt(), input));
            service(&chip, &engine);
            let completion = rx.try_recv().unwrap();
            assert!(completion.status.is_ok());
            engine.free_buffer(completion.output.unwrap());
        };
        run(16);
        run(24);
        assert_eq!(chip.key_uploads(), 1);

        engine.fault();
        assert_eq!(engine.session_state(session), Ok(SessionState::Used));
        run(32);
        assert_eq!(chip.key_uploads(), 2);
        assert_eq!(chip.stale_key_uses(), 0);
    }

    #[test]
    fn test_hardware_abort_triggers_recovery() {
        let (chip, engine) = engine();
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Md5)], None).unwrap();
        let input = engine.buffer_from_slice(&pattern(40)).unwrap();
        let rx = submit(&engine, request(session, Operation::authenticate(), input));

        chip.inject_fault(DmaStatus::S_ABORT);
        let status = DmaStatus::S_ABORT.bits();
        assert_eq!(engine.interrupt(), Err(HifnError::EngineFault { status }));
        assert_eq!(rx.try_recv().unwrap().status, Err(HifnError::Aborted));
        assert_eq!(engine.state(), EngineState::Running);

        // The chip works again after the reset.
        let input = engine.buffer_from_slice(&pattern(40)).unwrap();
        let rx = submit(&engine, request(session, Operation::authenticate(), input));
        service(&chip, &engine);
        assert!(rx.try_recv().unwrap().status.is_ok());
    }

    #[test]
    fn test_not_my_interrupt() {
        let (_chip, engine) = engine();
        assert_eq!(engine.interrupt(), Ok(false));
    }

    #[test]
    fn test_mac_digest_delivered() {
        let (chip, engine) = engine();
        let key = [0x42u8; 20];
        let session = engine
            .open_session(&[AlgorithmInit::with_key(Algorithm::HmacSha1, &key)], None)
            .unwrap();
        let data = pattern(100);
        let input = engine.buffer_from_slice(&data).unwrap();
        let op = Operation::authenticate().with_region(4, 90);
        let rx = submit(&engine, request(session, op, input));
        service(&chip, &engine);

        let report = rx.try_recv().unwrap().status.unwrap();
        let expected = sim::reference_digest(Algorithm::HmacSha1, &key, &data[4..94]);
        assert_eq!(report.mac, Some(expected));
        assert_eq!(report.mac.as_ref().map(Vec::len), Some(12));
    }

    #[test]
    fn test_cbc_iv_chaining() {
        let (chip, engine) = engine();
        let session = engine
            .open_session(&[AlgorithmInit::with_key(Algorithm::AesCbc, &[1; 16])], Some(&[7; 16]))
            .unwrap();
        let data = pattern(64);
        let input = engine.buffer_from_slice(&data).unwrap();
        let rx = submit(&engine, request(session, Operation::encrypt(), input));
        service(&chip, &engine);
        assert!(rx.try_recv().unwrap().status.is_ok());

        // The identity "cipher" makes the last block of ciphertext the input's.
        assert_eq!(engine.session_iv(session).unwrap(), data[48..64].to_vec());
        assert_eq!(chip.last_iv(), Some(vec![7; 16]));

        // Decryption does not chain.
        let input = engine.buffer_from_slice(&pattern(32)).unwrap();
        let rx = submit(&engine, request(session, Operation::decrypt(), input));
        service(&chip, &engine);
        assert!(rx.try_recv().unwrap().status.is_ok());
        assert_eq!(engine.session_iv(session).unwrap(), data[48..64].to_vec());
    }

    #[test]
    fn test_unaligned_input_uses_bounce_buffer() {
        let (chip, engine) = engine();
        let session = engine
            .open_session(&[AlgorithmInit::with_key(Algorithm::Rc4, &[3; 7])], None)
            .unwrap();
        let data = pattern(23);
        let input = engine.buffer_from_chunks(&[&data[..5], &data[5..]]).unwrap();
        assert!(!crate::scatter::is_word_aligned(&input));
        let free_before = chip.free_bytes();

        let rx = submit(&engine, request(session, Operation::encrypt(), input));
        service(&chip, &engine);
        let completion = rx.try_recv().unwrap();
        let output = completion.output.unwrap();
        assert_eq!(engine.read_buffer(&output).unwrap(), data);
        engine.free_buffer(output);
        // Input released by the engine, bounce buffer released above.
        assert!(chip.free_bytes() > free_before);
    }

    #[test]
    fn test_explicit_output_must_be_aligned() {
        let (_chip, engine) = engine();
        let session = engine
            .open_session(&[AlgorithmInit::with_key(Algorithm::Rc4, &[3; 7])], None)
            .unwrap();
        let input = engine.buffer_from_slice(&pattern(16)).unwrap();
        let output = engine.buffer_from_chunks(&[&[0; 3], &[0; 13]]).unwrap();
        let rejected = engine
            .submit(Request::new(session, Operation::encrypt(), input, |_| {}).with_output(output))
            .unwrap_err();
        assert!(matches!(rejected.error, HifnError::InvalidArgument(_)));
        assert!(rejected.request.output.is_some());
    }

    #[test]
    fn test_too_many_segments_rejected_before_reserving() {
        let config = EngineConfig::default().with_max_segments(2);
        let (_chip, engine) = engine_with(config);
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Md5)], None).unwrap();
        let input = engine.buffer_from_chunks(&[&[1; 4], &[2; 4], &[3; 4]]).unwrap();
        let rejected = engine
            .submit(Request::new(session, Operation::authenticate(), input, |_| {}))
            .unwrap_err();
        assert_eq!(rejected.error, HifnError::TooManySegments { needed: 3, max: 2 });
        assert!(engine.ring_usage().iter().all(|u| u.in_use == 0));
    }

    #[test]
    fn test_buffer_above_4g_rejected() {
        let (_chip, engine) = engine();
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Md5)], None).unwrap();
        let input = DmaBuffer::from_regions(vec![DmaRegion { device_address: 1 << 32, len: 16 }]);
        let rejected = engine
            .submit(Request::new(session, Operation::authenticate(), input, |_| {}))
            .unwrap_err();
        assert!(matches!(rejected.error, HifnError::InvalidArgument(_)));
        assert!(engine.ring_usage().iter().all(|u| u.in_use == 0));
    }

    #[test]
    fn test_unknown_session_rejected() {
        let (_chip, engine) = engine();
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Md5)], None).unwrap();
        engine.close_session(session).unwrap();
        let input = engine.buffer_from_slice(&[0; 8]).unwrap();
        let rejected = engine
            .submit(Request::new(session, Operation::authenticate(), input, |_| {}))
            .unwrap_err();
        assert_eq!(HifnError::from(rejected), HifnError::UnknownSession(session));
    }

    #[test]
    fn test_compression_output_sized_and_truncated() {
        let (chip, engine) = engine();
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Lzs)], None).unwrap();
        let data = pattern(3000);
        let input = engine.buffer_from_slice(&data).unwrap();
        let rx = submit(&engine, request(session, Operation::compress(), input));
        service(&chip, &engine);

        let completion = rx.try_recv().unwrap();
        let output = completion.output.unwrap();
        assert_eq!(completion.status.unwrap().output_len, 3000);
        assert_eq!(output.capacity(), 4096);
        assert_eq!(engine.read_buffer(&output).unwrap(), data);
    }

    #[test]
    fn test_compression_overrun_grows_and_retries() {
        let (chip, engine) = engine();
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Lzs)], None).unwrap();
        chip.set_compression_expansion(2100);
        let data = pattern(100);
        let input = engine.buffer_from_slice(&data).unwrap();
        let rx = submit(&engine, request(session, Operation::compress(), input));

        // First pass overruns the 2048-byte output and is resubmitted.
        service(&chip, &engine);
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.pending(), 1);

        service(&chip, &engine);
        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.status.unwrap().output_len, 2200);
        let output = completion.output.unwrap();
        assert_eq!(output.capacity(), 4096);
        assert_eq!(&engine.read_buffer(&output).unwrap()[..100], &data[..]);
    }

    #[test]
    fn test_compression_gives_up_at_max_dma_len() {
        let (chip, engine) = engine();
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Lzs)], None).unwrap();
        chip.set_compression_expansion(MAX_DMA_LEN);
        let input = engine.buffer_from_slice(&pattern(64)).unwrap();
        let rx = submit(&engine, request(session, Operation::decompress(), input));

        let mut completion = None;
        for _ in 0..200 {
            service(&chip, &engine);
            if let Ok(c) = rx.try_recv() {
                completion = Some(c);
                break;
            }
        }
        let completion = completion.unwrap();
        assert_eq!(completion.status, Err(HifnError::OutputTooLarge { max: MAX_DMA_LEN }));
        assert!(completion.output.is_none());
    }

    #[test]
    fn test_tick_disables_idle_rings() {
        let config = EngineConfig::default().with_active_ticks(2);
        let (chip, engine) = engine_with(config);
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Md5)], None).unwrap();
        let input = engine.buffer_from_slice(&pattern(8)).unwrap();
        let _rx = submit(&engine, request(session, Operation::authenticate(), input));
        assert!(engine.ring_usage().iter().all(|u| u.active));

        service(&chip, &engine);
        engine.tick();
        engine.tick();
        assert!(engine.ring_usage().iter().all(|u| u.active));
        engine.tick();
        assert!(engine.ring_usage().iter().all(|u| !u.active));
        assert!(!chip.ring_enabled(RingKind::Command));
    }

    #[test]
    fn test_command_wait_enable_cleared_when_idle() {
        let (chip, engine) = engine();
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Md5)], None).unwrap();
        let input = engine.buffer_from_slice(&pattern(8)).unwrap();
        let _rx = submit(&engine, request(session, Operation::authenticate(), input));
        assert!(chip.interrupt_enable().contains(DmaStatus::C_WAIT));

        service(&chip, &engine);
        // The chip now idles on an empty command ring.
        chip.run();
        assert_eq!(engine.interrupt(), Ok(true));
        assert!(!chip.interrupt_enable().contains(DmaStatus::C_WAIT));
    }

    #[test]
    fn test_callback_may_resubmit() {
        let (chip, engine) = engine();
        let engine = Arc::new(engine);
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Sha1)], None).unwrap();
        let (tx, rx) = mpsc::channel();

        let inner_engine = engine.clone();
        let input = engine.buffer_from_slice(&pattern(12)).unwrap();
        engine
            .submit(Request::new(session, Operation::authenticate(), input, move |c| {
                let output = c.output.unwrap();
                let tx = tx.clone();
                inner_engine
                    .submit(Request::new(session, Operation::authenticate(), output, move |c| {
                        let _ = tx.send(c);
                    }))
                    .unwrap();
            }))
            .unwrap();

        service(&chip, &engine);
        assert_eq!(engine.pending(), 1);
        service(&chip, &engine);
        assert!(rx.try_recv().unwrap().status.is_ok());
    }

    #[test]
    fn test_concurrent_submitters() {
        let (chip, engine) = engine();
        let engine = Arc::new(engine);
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Md5)], None).unwrap();
        let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let engine = engine.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    for i in 0..25usize {
                        let mut input = Some(engine.buffer_from_slice(&pattern(8 + t + i)).unwrap());
                        loop {
                            let done = done.clone();
                            let req = Request::new(
                                session,
                                Operation::authenticate(),
                                input.take().unwrap(),
                                move |c| {
                                    assert!(c.status.is_ok());
                                    done.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                                },
                            );
                            match engine.submit(req) {
                                Ok(()) => break,
                                Err(rejected) => {
                                    assert!(rejected.is_retryable());
                                    input = Some(rejected.request.input);
                                    std::thread::yield_now();
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        while done.load(std::sync::atomic::Ordering::SeqCst) < 100 {
            chip.run();
            engine.interrupt().unwrap();
            std::thread::yield_now();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(engine.pending(), 0);
    }

    #[test]
    fn test_drop_aborts_in_flight_requests() {
        let (chip, engine) = engine();
        let free_at_start = {
            let fresh = SimulatedChip::new();
            fresh.free_bytes()
        };
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Md5)], None).unwrap();
        let input = engine.buffer_from_slice(&pattern(8)).unwrap();
        let rx = submit(&engine, request(session, Operation::authenticate(), input));
        drop(engine);
        assert_eq!(rx.try_recv().unwrap().status, Err(HifnError::Aborted));
        assert_eq!(chip.free_bytes(), free_at_start);
    }

    #[test]
    fn test_unsupported_algorithm_on_auth_only_part() {
        let chip = Arc::new(SimulatedChip::with_capabilities(Capabilities::AUTH_ONLY));
        let engine = HifnEngine::new(chip, EngineConfig::default()).unwrap();
        assert_eq!(engine.capabilities(), Capabilities::AUTH_ONLY);
        assert_eq!(
            engine.open_session(&[AlgorithmInit::with_key(Algorithm::Rc4, &[1; 4])], None),
            Err(HifnError::UnsupportedAlgorithm(Algorithm::Rc4))
        );
    }

    #[cfg(feature = "async")]
    #[test]
    fn test_async_process() {
        let (chip, engine) = engine();
        let engine = Arc::new(engine);
        let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Sha1)], None).unwrap();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let irq = {
            let (chip, engine, stop) = (chip.clone(), engine.clone(), stop.clone());
            std::thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::SeqCst) {
                    chip.run();
                    let _ = engine.interrupt();
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            })
        };

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let data = pattern(48);
        let input = engine.buffer_from_slice(&data).unwrap();
        let completion = rt
            .block_on(engine.process(session, Operation::authenticate(), input))
            .unwrap();
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        irq.join().unwrap();

        let report = completion.status.unwrap();
        assert_eq!(report.mac, Some(sim::reference_digest(Algorithm::Sha1, &[], &data)));
    }
}
