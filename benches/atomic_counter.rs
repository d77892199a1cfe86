// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::Arc;
use std::thread;
use tocc::{AtomicCounter, Sequencer, ToInstant};

fn tracked_instants(c: &mut Criterion) {
    let mut group = c.benchmark_group("AtomicCounter: tracked instants");
    for num_trackers in [0_usize, 64, 4096] {
        let ac = AtomicCounter::default();
        let trackers: Vec<_> = (0..num_trackers)
            .map(|_| {
                let tracker = ac.track(Relaxed);
                ac.advance(Release);
                tracker
            })
            .collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(num_trackers),
            &num_trackers,
            |b, _| {
                b.iter(|| {
                    let tracker = ac.track(Acquire);
                    assert!(ac.min(Acquire) <= tracker.to_instant());
                    drop(tracker);
                });
            },
        );
        drop(trackers);
    }
    group.finish();
}

fn contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("AtomicCounter: contended");
    for num_threads in [1_usize, 4, 16] {
        let ac = Arc::new(AtomicCounter::default());
        let stop = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let ac = ac.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Relaxed) {
                        let tracker = ac.track(Acquire);
                        ac.advance(Release);
                        drop(tracker);
                    }
                })
            })
            .collect();
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            &num_threads,
            |b, _| {
                b.iter(|| {
                    let tracker = ac.track(Acquire);
                    assert!(ac.min(Acquire) <= tracker.to_instant());
                    drop(tracker);
                });
            },
        );
        stop.store(true, Relaxed);
        for handle in handles {
            assert!(handle.join().is_ok());
        }
    }
    group.finish();
}

criterion_group!(atomic_counter, tracked_instants, contended);
criterion_main!(atomic_counter);
