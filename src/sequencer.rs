// SPDX-FileCopyrightText: 2021 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

mod atomic_counter;
pub use atomic_counter::AtomicCounter;

use std::fmt::Debug;
use std::sync::atomic::Ordering;

/// [`Sequencer`] acts as a logical clock for the storage engine.
///
/// The logical clock defines the flow of time: commit versions are issued by advancing it, and
/// readers take snapshots of it.
pub trait Sequencer: 'static + Debug + Default + Send + Sync {
    /// [`Sequencer::Instant`] is a totally ordered type that the [`Sequencer`] relies on.
    type Instant: 'static + Clone + Copy + Debug + Ord + Send + Sync;

    /// [`Sequencer::Tracker`] allows the [`Sequencer`] to track all the issued
    /// [`Sequencer::Instant`] values.
    type Tracker: 'static + Clone + Debug + ToInstant<Self> + Send + Sync;

    /// Returns the oldest tracked instant, or the current instant if nothing is tracked.
    ///
    /// No snapshot older than the returned value will ever be taken.
    fn min(&self, order: Ordering) -> Self::Instant;

    /// Returns the current instant.
    fn now(&self, order: Ordering) -> Self::Instant;

    /// Issues a [`Sequencer::Tracker`] pointing to the current instant.
    ///
    /// The instant is accounted for by [`Sequencer::min`] until every clone of the tracker is
    /// dropped.
    fn track(&self, order: Ordering) -> Self::Tracker;

    /// Moves the clock forward to the value.
    ///
    /// # Errors
    ///
    /// Returns the current instant if it is not older than the value.
    fn update(
        &self,
        new_value: Self::Instant,
        order: Ordering,
    ) -> Result<Self::Instant, Self::Instant>;

    /// Advances the clock, and returns the new instant.
    fn advance(&self, order: Ordering) -> Self::Instant;
}

/// [`ToInstant`] derives an instant from a tracker.
pub trait ToInstant<S: Sequencer + ?Sized> {
    /// Returns the instant.
    fn to_instant(&self) -> S::Instant;
}
