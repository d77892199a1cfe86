// SPDX-FileCopyrightText: 2021 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// [`Telemetry`] provides statistics data on the certification core.
///
/// Counters are monotonic and updated with relaxed ordering; a snapshot of them may not be
/// consistent with each other.
#[derive(Debug, Default)]
pub struct Telemetry {
    admitted: AtomicU64,
    committed: AtomicU64,
    prepared: AtomicU64,
    rolled_back: AtomicU64,
    conflicts: AtomicU64,
    rebalances: AtomicU64,
}

impl Telemetry {
    /// Returns the number of admitted prepare commands.
    #[inline]
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Relaxed)
    }

    /// Returns the number of committed transactions.
    #[inline]
    pub fn committed(&self) -> u64 {
        self.committed.load(Relaxed)
    }

    /// Returns the number of transactions certified for the second phase.
    #[inline]
    pub fn prepared(&self) -> u64 {
        self.prepared.load(Relaxed)
    }

    /// Returns the number of rolled back transactions, including conflicts.
    #[inline]
    pub fn rolled_back(&self) -> u64 {
        self.rolled_back.load(Relaxed)
    }

    /// Returns the number of certification conflicts.
    #[inline]
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Relaxed)
    }

    /// Returns the number of rebalances started.
    #[inline]
    pub fn rebalances(&self) -> u64 {
        self.rebalances.load(Relaxed)
    }

    pub(crate) fn record_admission(&self) {
        self.admitted.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.committed.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_prepare(&self) {
        self.prepared.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_rollback(&self, conflict: bool) {
        self.rolled_back.fetch_add(1, Relaxed);
        if conflict {
            self.conflicts.fetch_add(1, Relaxed);
        }
    }

    pub(crate) fn record_rebalance(&self) {
        self.rebalances.fetch_add(1, Relaxed);
    }
}
