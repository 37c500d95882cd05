// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # HIFN crypto/compression offload engine
//!
//! Asynchronous command-queue driver core for HIFN 7751/7811-style
//! security processors. Requests are serialized into command buffers and
//! handed to the chip through four descriptor rings (command, source,
//! destination, result); completions are reaped from the interrupt path and
//! delivered to per-request callbacks.
//!
//! ## Supported Operations
//!
//! - DES-CBC, 3DES-CBC, AES-CBC (128/192/256) and RC4
//! - MD5, SHA-1, HMAC-MD5-96 and HMAC-SHA1-96, alone or chained with a cipher
//! - LZS compression and decompression
//!
//! ## Platform
//!
//! The engine reaches the chip only through the [`Platform`] trait: 32-bit
//! register access on two BARs plus DMA-capable memory. [`sim::SimulatedChip`]
//! implements it in software and is what the tests, demo and benchmarks run
//! against.
//!
//! ## Example
//!
//! ```rust
//! use hifn_rs::sim::SimulatedChip;
//! use hifn_rs::{Algorithm, AlgorithmInit, EngineConfig, HifnEngine, HifnError, Operation, Request};
//! use std::sync::{mpsc, Arc};
//!
//! fn main() -> Result<(), HifnError> {
//!     let chip = Arc::new(SimulatedChip::new());
//!     let engine = HifnEngine::new(chip.clone(), EngineConfig::default())?;
//!
//!     let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Sha1)], None)?;
//!     let input = engine.buffer_from_slice(b"Hello, HIFN!")?;
//!
//!     let (tx, rx) = mpsc::channel();
//!     engine.submit(Request::new(session, Operation::authenticate(), input, move |done| {
//!         let _ = tx.send(done);
//!     }))?;
//!
//!     chip.run();
//!     engine.interrupt()?;
//!
//!     let done = rx.recv().unwrap();
//!     println!("digest: {:02x?}", done.status?.mac);
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency
//!
//! [`HifnEngine`] is `Send + Sync`. Submission, interrupt service, the
//! periodic [`HifnEngine::tick`] and recovery are serialized by one lock;
//! completion callbacks run after that lock is released, in completion
//! order, and may submit new requests.

// Module declarations
pub mod command;
mod completion;
pub mod config;
pub mod descriptor;
mod dispatch;
pub mod dma;
pub mod engine;
pub mod error;
mod recovery;
pub mod regs;
pub mod ring;
pub mod scatter;
pub mod session;
pub mod sim;

// Re-exports for convenient access
pub use command::{Direction, Operation, Region};
pub use config::EngineConfig;
pub use dma::{DmaBuffer, DmaMemory, DmaRegion, Platform, RegisterIo};
pub use engine::{Completion, EngineState, HifnEngine, OpReport, Rejected, Request, RingUsage};
pub use error::{HifnError, HifnResult};
pub use ring::RingKind;
pub use session::{Algorithm, AlgorithmInit, Capabilities, SessionId, SessionState};
