// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Benchmarks of the submit/complete path against the simulated chip.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hifn_rs::dma::free_buffer;
use hifn_rs::sim::SimulatedChip;
use hifn_rs::{Algorithm, AlgorithmInit, EngineConfig, HifnEngine, Operation, Request};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One request per iteration: submit, run the chip, reap.
fn bench_round_trip(c: &mut Criterion) {
    let sizes: Vec<usize> = vec![
        64,        // 64 B
        1024,      // 1 KB
        16 * 1024, // 16 KB
        64 * 1024, // 64 KB
    ];

    let mut group = c.benchmark_group("round_trip");

    for (name, init) in [
        ("sha1", AlgorithmInit::new(Algorithm::Sha1)),
        ("aes_cbc", AlgorithmInit::with_key(Algorithm::AesCbc, &[7; 16])),
    ] {
        let chip = Arc::new(SimulatedChip::new());
        let engine = HifnEngine::new(chip.clone(), EngineConfig::default()).unwrap();
        let session = engine.open_session(&[init], None).unwrap();

        for &size in &sizes {
            let data: Vec<u8> = (0..size).map(|i| (i & 0xFF) as u8).collect();
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(name, size), &data, |b, data| {
                b.iter(|| {
                    let input = engine.buffer_from_slice(data).unwrap();
                    let mem = chip.clone();
                    let request = Request::new(session, Operation::encrypt(), input, move |done| {
                        if let Some(output) = done.output {
                            free_buffer(&*mem, output);
                        }
                    });
                    engine.submit(request).unwrap();
                    chip.run();
                    engine.interrupt().unwrap();
                });
            });
        }
    }

    group.finish();
}

/// Queue a batch of requests, then reap everything in one interrupt.
fn bench_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch");
    let chip = Arc::new(SimulatedChip::new());
    let engine = HifnEngine::new(chip.clone(), EngineConfig::default()).unwrap();
    let session = engine.open_session(&[AlgorithmInit::new(Algorithm::Md5)], None).unwrap();
    let completed = Arc::new(AtomicUsize::new(0));

    for batch in [8usize, 32, 64] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("md5_1k", batch), &batch, |b, &batch| {
            b.iter(|| {
                for _ in 0..batch {
                    let input = engine.buffer_from_slice(&[0xa5; 1024]).unwrap();
                    let completed = completed.clone();
                    let mem = chip.clone();
                    let request = Request::new(session, Operation::authenticate(), input, move |done| {
                        if let Some(output) = done.output {
                            free_buffer(&*mem, output);
                        }
                        completed.fetch_add(1, Ordering::Relaxed);
                    });
                    engine.submit(request).unwrap();
                }
                chip.run();
                engine.interrupt().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_batch);
criterion_main!(benches);
