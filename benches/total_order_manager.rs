// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tocc::{Config, PrepareCommand, RemoteTransactionState, TotalOrderManager, TransactionId};

fn admit_release_check(manager: &TotalOrderManager<u64>, size: u64, iters: u64) -> Duration {
    let states: Vec<(RemoteTransactionState<u64>, Arc<PrepareCommand<u64>>)> = (0..size)
        .map(|o| {
            let id = TransactionId::new(0, o);
            let command = PrepareCommand::new(id, vec![o % 8, 8 + o], vec![o % 4], 0);
            (RemoteTransactionState::new(id), Arc::new(command))
        })
        .collect();
    let start = Instant::now();
    for _ in 0..iters {
        for (state, command) in &states {
            assert!(manager.ensure_order(state, command.clone()).is_ok());
        }
        for (state, _) in &states {
            manager.release(state);
        }
    }
    start.elapsed()
}

fn admit_release(c: &mut Criterion) {
    let manager = TotalOrderManager::new(&Config::default(), None);
    let size: u64 = 64;
    c.bench_with_input(
        BenchmarkId::new("TotalOrderManager: admit-release", size),
        &size,
        |b, &s| {
            b.iter_custom(|iters| admit_release_check(&manager, s, iters));
        },
    );
}

fn rebalance(c: &mut Criterion) {
    let manager: TotalOrderManager<u64> = TotalOrderManager::new(&Config::default(), None);
    let states: Vec<RemoteTransactionState<u64>> = (0..1024)
        .map(|o| {
            let id = TransactionId::new(1, o);
            let state = RemoteTransactionState::new(id);
            let command = Arc::new(PrepareCommand::new(id, vec![o], Vec::new(), 0));
            assert!(manager.ensure_order(&state, command).is_ok());
            state
        })
        .collect();
    c.bench_function("TotalOrderManager: rebalance", |b| {
        b.iter(|| {
            assert_eq!(manager.begin_rebalance(1).len(), states.len());
            assert_eq!(manager.end_rebalance(), Some(1));
        });
    });
    for state in &states {
        manager.release(state);
    }
}

criterion_group!(total_order_manager, admit_release, rebalance);
criterion_main!(total_order_manager);
