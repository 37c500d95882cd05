// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for engine operations.

use crate::session::{Algorithm, SessionId};
use thiserror::Error;

/// Errors that can occur while driving the offload engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HifnError {
    /// Not enough free slots in one of the four rings. Retry later.
    #[error("descriptor rings busy")]
    Busy,

    /// The requested algorithm mix cannot run in a single session.
    #[error("invalid algorithm combination: {0}")]
    InvalidCombination(String),

    /// The buffer shape needs more scatter segments than the chip supports.
    #[error("too many segments: need {needed}, hardware limit is {max}")]
    TooManySegments { needed: usize, max: usize },

    /// The chip reported an abort or overrun condition.
    #[error("engine fault: dma status={status:#010x}")]
    EngineFault { status: u32 },

    /// The request was in flight when the engine faulted and could not be salvaged.
    #[error("request aborted by engine reset")]
    Aborted,

    /// Every session slot is in use.
    #[error("no free session slot")]
    NoFreeSession,

    /// The session handle is closed or was never issued.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// The platform does not advertise this algorithm.
    #[error("algorithm {0} not supported by this engine")]
    UnsupportedAlgorithm(Algorithm),

    /// Key length not accepted by the algorithm.
    #[error("invalid key length {len} for {algorithm}")]
    InvalidKeyLength { algorithm: Algorithm, len: usize },

    /// Compression output kept overrunning until the maximum DMA length.
    #[error("output exceeds maximum DMA length of {max} bytes")]
    OutputTooLarge { max: usize },

    /// The platform could not provide DMA memory.
    #[error("out of DMA memory: requested {requested} bytes")]
    OutOfDmaMemory { requested: usize },

    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Buffer size mismatch.
    #[error("buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },
}

impl HifnError {
    /// Returns true if the caller should simply retry the same request later.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// Result type alias for engine operations.
pub type HifnResult<T> = Result<T, HifnError>;
