// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

//! [`AtomicCounter`] implementation.

use super::{Sequencer, ToInstant};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{self, Relaxed};
use std::sync::Arc;

/// [`AtomicCounter`] implements [`Sequencer`] on top of a single atomic counter.
///
/// An atomic counter is known to be inefficient when the system is equipped with a large number of
/// processors.
#[derive(Debug)]
pub struct AtomicCounter {
    /// The current logical clock value.
    clock: AtomicU64,

    /// Tracked instants and the number of trackers pointing to each of them.
    tracked: Arc<Mutex<BTreeMap<u64, usize>>>,
}

/// [`U64Tracker`] keeps its instant visible to [`AtomicCounter::min`].
#[derive(Debug)]
pub struct U64Tracker {
    instant: u64,
    tracked: Arc<Mutex<BTreeMap<u64, usize>>>,
}

impl Sequencer for AtomicCounter {
    type Instant = u64;
    type Tracker = U64Tracker;

    #[inline]
    fn min(&self, order: Ordering) -> u64 {
        let tracked = self.tracked.lock();
        let now = self.now(order);
        tracked.keys().next().map_or(now, |oldest| now.min(*oldest))
    }

    #[inline]
    fn now(&self, order: Ordering) -> u64 {
        self.clock.load(order)
    }

    #[inline]
    fn track(&self, order: Ordering) -> U64Tracker {
        // The clock is read while the map is locked so that `min` never misses it.
        let mut tracked = self.tracked.lock();
        let instant = self.now(order);
        *tracked.entry(instant).or_insert(0) += 1;
        U64Tracker {
            instant,
            tracked: self.tracked.clone(),
        }
    }

    #[inline]
    fn update(&self, new_value: u64, order: Ordering) -> Result<u64, u64> {
        let mut current = self.clock.load(Relaxed);
        loop {
            if current >= new_value {
                return Err(current);
            }
            match self
                .clock
                .compare_exchange(current, new_value, order, Relaxed)
            {
                Ok(_) => return Ok(new_value),
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    fn advance(&self, order: Ordering) -> u64 {
        self.clock.fetch_add(1, order) + 1
    }
}

impl Default for AtomicCounter {
    #[inline]
    fn default() -> Self {
        AtomicCounter {
            // Starts from `1` in order to avoid using `0`.
            clock: AtomicU64::new(1),
            tracked: Arc::default(),
        }
    }
}

impl Clone for U64Tracker {
    #[inline]
    fn clone(&self) -> Self {
        *self.tracked.lock().entry(self.instant).or_insert(0) += 1;
        Self {
            instant: self.instant,
            tracked: self.tracked.clone(),
        }
    }
}

impl Drop for U64Tracker {
    #[inline]
    fn drop(&mut self) {
        let mut tracked = self.tracked.lock();
        if let Some(count) = tracked.get_mut(&self.instant) {
            *count -= 1;
            if *count == 0 {
                tracked.remove(&self.instant);
            }
        }
    }
}

impl ToInstant<AtomicCounter> for U64Tracker {
    #[inline]
    fn to_instant(&self) -> u64 {
        self.instant
    }
}
