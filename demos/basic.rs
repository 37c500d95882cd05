// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Basic example driving the engine against the simulated chip.
//!
//! Run with: `cargo run --example basic`

use hifn_rs::sim::SimulatedChip;
use hifn_rs::{
    Algorithm, AlgorithmInit, Completion, EngineConfig, HifnEngine, Operation, Request, RingKind, SessionId,
};
use std::sync::{mpsc, Arc};

type Engine = HifnEngine<SimulatedChip>;

/// Submit one request and service the chip until it completes.
fn run_one(chip: &SimulatedChip, engine: &Engine, session: SessionId, op: Operation, data: &[u8]) -> Option<Completion> {
    let input = match engine.buffer_from_slice(data) {
        Ok(input) => input,
        Err(e) => {
            println!("  Buffer allocation failed: {}", e);
            return None;
        }
    };
    let (tx, rx) = mpsc::channel();
    let request = Request::new(session, op, input, move |done| {
        let _ = tx.send(done);
    });
    if let Err(rejected) = engine.submit(request) {
        println!("  Submit rejected: {}", rejected.error);
        engine.free_buffer(rejected.request.input);
        return None;
    }
    loop {
        chip.run();
        if let Err(e) = engine.interrupt() {
            println!("  Engine fault: {}", e);
        }
        if let Ok(done) = rx.try_recv() {
            return Some(done);
        }
    }
}

fn main() {
    println!("HIFN Offload Engine Basic Example");
    println!("=================================\n");

    let chip = Arc::new(SimulatedChip::new());
    let engine = match HifnEngine::new(chip.clone(), EngineConfig::default()) {
        Ok(engine) => engine,
        Err(e) => {
            println!("Failed to bring up engine: {}", e);
            return;
        }
    };
    println!("Engine up, capabilities: {:?}", engine.capabilities());
    for usage in engine.ring_usage() {
        println!("  {} ring: {} slots", usage.kind, usage.capacity);
    }
    println!();

    // Encrypt-then-MAC in one pass
    println!("AES-128-CBC + HMAC-SHA1-96...");
    let session = engine.open_session(
        &[
            AlgorithmInit::with_key(Algorithm::AesCbc, &[0x2b; 16]),
            AlgorithmInit::with_key(Algorithm::HmacSha1, b"demo mac key"),
        ],
        None,
    );
    match session {
        Ok(session) => {
            let data = [0x5au8; 64];
            if let Some(done) = run_one(&chip, &engine, session, Operation::encrypt(), &data) {
                match done.status {
                    Ok(report) => {
                        println!("  {} bytes, MAC {:02x?}", report.output_len, report.mac.unwrap_or_default());
                        println!("  Next IV: {:02x?}", engine.session_iv(session).unwrap_or_default());
                    }
                    Err(e) => println!("  Request failed: {}", e),
                }
                if let Some(output) = done.output {
                    engine.free_buffer(output);
                }
            }
            let _ = engine.close_session(session);
        }
        Err(e) => println!("  Open session failed: {}", e),
    }
    println!();

    // RC4 on a length that is not a whole number of words
    println!("RC4 on 37 bytes...");
    if let Ok(session) = engine.open_session(&[AlgorithmInit::with_key(Algorithm::Rc4, b"fifteen byte ke")], None) {
        let data: Vec<u8> = (0..37).collect();
        if let Some(done) = run_one(&chip, &engine, session, Operation::encrypt(), &data) {
            if let Some(output) = done.output {
                let out = engine.read_buffer(&output).unwrap_or_default();
                println!("  Output length {}, last byte {:#04x}", out.len(), out.last().copied().unwrap_or(0));
                engine.free_buffer(output);
            }
        }
        let _ = engine.close_session(session);
    }
    println!();

    // Compression grows its output on overrun
    println!("LZS with a chip that expands the data...");
    chip.set_compression_expansion(3000);
    if let Ok(session) = engine.open_session(&[AlgorithmInit::new(Algorithm::Lzs)], None) {
        if let Some(done) = run_one(&chip, &engine, session, Operation::compress(), &[0u8; 1000]) {
            match done.status {
                Ok(report) => println!("  Compressed 1000 -> {} bytes", report.output_len),
                Err(e) => println!("  Compression failed: {}", e),
            }
            if let Some(output) = done.output {
                engine.free_buffer(output);
            }
        }
        let _ = engine.close_session(session);
    }
    chip.set_compression_expansion(0);
    println!();

    // Idle rings are switched off by the periodic tick
    println!("Ticking until idle...");
    for _ in 0..=EngineConfig::default().active_ticks {
        engine.tick();
    }
    println!("  Command ring running: {}", chip.ring_enabled(RingKind::Command));
    println!();

    println!("Done!");
}
