// SPDX-FileCopyrightText: 2021 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::command::{PrepareCommand, TransactionId, Version};
use super::{Error, Latch};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicU64, AtomicU8};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// [`RemoteTransactionState`] tracks a transaction delivered by the total-order broadcast from the
/// moment its prepare command is admitted until its claimed keys are released.
///
/// The same instance can be admitted again after it has been reset, e.g., when a prepare command
/// is retried after a rebalance aborted the previous attempt.
#[derive(Debug)]
pub struct RemoteTransactionState<K> {
    /// The transaction identifier.
    id: TransactionId,

    /// The transaction status.
    ///
    /// An integer represents a transaction status.
    ///  * 0: preparing.
    ///  * 1: prepared.
    ///  * 2: finished.
    status: AtomicU8,

    /// Incremented on every admission.
    generation: AtomicU64,

    /// Mutable data.
    inner: Mutex<Inner<K>>,

    /// Signalled when the state is reset.
    reset: Condvar,
}

/// Possible [`RemoteTransactionState`] statuses.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Status {
    /// The transaction is waiting for or running certification.
    Preparing,

    /// The transaction was certified, and waits for the second phase.
    Prepared,

    /// The transaction was committed or rolled back.
    Finished,
}

/// The keys claimed by a transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Claim<K> {
    /// Nothing is claimed.
    Nothing,

    /// The listed keys are claimed.
    Keys(Vec<K>),

    /// Every key is claimed by a whole-cache clear.
    All,
}

#[derive(Debug)]
struct Inner<K> {
    /// The latch of the current admission.
    latch: Option<Latch>,

    /// The keys claimed by the current admission.
    claim: Claim<K>,

    /// The latches to wait for before certification may start.
    dependencies: Vec<Latch>,

    /// The prepare command of the current admission.
    command: Option<Arc<PrepareCommand<K>>>,

    /// The version assigned by the storage engine.
    version: Option<Version>,

    /// `true` between admission and reset.
    in_use: bool,
}

impl<K> RemoteTransactionState<K> {
    /// Creates a new [`RemoteTransactionState`].
    #[inline]
    #[must_use]
    pub fn new(id: TransactionId) -> RemoteTransactionState<K> {
        RemoteTransactionState {
            id,
            status: AtomicU8::new(Status::Finished.into()),
            generation: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                latch: None,
                claim: Claim::Nothing,
                dependencies: Vec::new(),
                command: None,
                version: None,
                in_use: false,
            }),
            reset: Condvar::new(),
        }
    }

    /// Returns the transaction identifier.
    #[inline]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current status.
    #[inline]
    pub fn status(&self) -> Status {
        Status::from(self.status.load(Acquire))
    }

    /// Returns the admission generation.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Acquire)
    }

    /// Returns the latch of the current admission.
    #[inline]
    pub fn latch(&self) -> Option<Latch> {
        self.inner.lock().latch.clone()
    }

    /// Returns the prepare command of the current admission.
    #[inline]
    pub fn command(&self) -> Option<Arc<PrepareCommand<K>>> {
        self.inner.lock().command.clone()
    }

    /// Returns the version assigned by the storage engine.
    #[inline]
    pub fn version(&self) -> Option<Version> {
        self.inner.lock().version
    }

    /// Returns a copy of the current dependencies.
    #[inline]
    pub fn dependencies(&self) -> Vec<Latch> {
        self.inner.lock().dependencies.clone()
    }

    /// Returns `true` if the state is admitted and not reset yet.
    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.inner.lock().in_use
    }

    /// Returns `true` if no dependency is blocking.
    ///
    /// Unblocked dependencies are forgotten since a [`Latch`] is never blocked again.
    #[inline]
    pub fn is_ready(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.dependencies.retain(Latch::is_blocking);
        inner.dependencies.is_empty()
    }

    /// Waits until the state is reset by the previous admission.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the state was not reset in time.
    pub fn wait_until_reset(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.in_use {
            if self.reset.wait_until(&mut inner, deadline).timed_out() && inner.in_use {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }

    /// Admits the state for a new certification attempt.
    ///
    /// Returns the new generation.
    pub(crate) fn admit(&self, latch: Latch, command: Arc<PrepareCommand<K>>) -> u64 {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.in_use);
        inner.latch = Some(latch);
        inner.claim = Claim::Nothing;
        inner.dependencies.clear();
        inner.command = Some(command);
        inner.version = None;
        inner.in_use = true;
        self.status.store(Status::Preparing.into(), Release);
        self.generation.fetch_add(1, AcqRel) + 1
    }

    /// Adds dependencies.
    pub(crate) fn add_dependencies<I: IntoIterator<Item = Latch>>(&self, dependencies: I) {
        let mut inner = self.inner.lock();
        let own_latch = inner.latch.clone();
        for dependency in dependencies {
            if own_latch.as_ref().is_some_and(|l| l.ptr_eq(&dependency))
                || inner.dependencies.iter().any(|d| d.ptr_eq(&dependency))
            {
                continue;
            }
            inner.dependencies.push(dependency);
        }
    }

    /// Records the claimed keys.
    pub(crate) fn set_claim(&self, claim: Claim<K>) {
        self.inner.lock().claim = claim;
    }

    /// Takes the claimed keys.
    pub(crate) fn take_claim(&self) -> Claim<K> {
        std::mem::replace(&mut self.inner.lock().claim, Claim::Nothing)
    }

    /// Marks the state prepared with the assigned version.
    ///
    /// Returns `false` if the state was not preparing for the generation.
    pub(crate) fn mark_prepared(&self, generation: u64, version: Version) -> bool {
        let mut inner = self.inner.lock();
        if self.generation.load(Relaxed) != generation {
            return false;
        }
        if self
            .status
            .compare_exchange(
                Status::Preparing.into(),
                Status::Prepared.into(),
                AcqRel,
                Acquire,
            )
            .is_ok()
        {
            inner.version = Some(version);
            true
        } else {
            false
        }
    }

    /// Claims the right to finish the transaction of the generation.
    ///
    /// Exactly one caller among those racing to finish the same generation succeeds.
    pub(crate) fn try_finish(&self, generation: u64, expected: Status) -> bool {
        let _inner = self.inner.lock();
        self.generation.load(Relaxed) == generation
            && self
                .status
                .compare_exchange(expected.into(), Status::Finished.into(), AcqRel, Acquire)
                .is_ok()
    }

    /// Resets the state, allowing it to be admitted again.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.latch = None;
        inner.claim = Claim::Nothing;
        inner.dependencies.clear();
        inner.command = None;
        inner.in_use = false;
        self.status.store(Status::Finished.into(), Release);
        self.reset.notify_all();
    }
}

impl From<Status> for u8 {
    #[inline]
    fn from(v: Status) -> u8 {
        match v {
            Status::Preparing => 0,
            Status::Prepared => 1,
            Status::Finished => 2,
        }
    }
}

impl From<u8> for Status {
    #[inline]
    fn from(v: u8) -> Status {
        match v {
            0 => Status::Preparing,
            1 => Status::Prepared,
            _ => Status::Finished,
        }
    }
}
