// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::command::{Epoch, PrepareCommand};
use super::remote_transaction::{Claim, RemoteTransactionState};
use super::task_processor::ScanTrigger;
use super::lock_table::Undo;
use super::{Access, Config, Error, Latch, LockTable};
use scc::ebr::{AtomicShared, Guard, Shared, Tag};
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// [`TotalOrderManager`] turns the totally ordered stream of prepare commands into a dependency
/// graph of [`Latch`] instances.
///
/// [`TotalOrderManager::ensure_order`], [`TotalOrderManager::begin_rebalance`], and
/// [`TotalOrderManager::end_rebalance`] must only be invoked by the thread delivering commands in
/// total order, whereas [`TotalOrderManager::release`] can be invoked by any thread.
pub struct TotalOrderManager<K: Eq + Hash> {
    /// The per-key dependency table.
    lock_table: LockTable<K>,

    /// The latch of the pending whole-cache clear.
    clear: AtomicShared<Latch>,

    /// The rebalance in progress.
    rebalance: AtomicShared<Rebalance>,

    /// Asks the executor to re-evaluate pending tasks.
    trigger: Option<ScanTrigger>,

    /// How long to wait for a reused state to be reset.
    reset_wait_timeout: Duration,
}

/// A rebalance in progress.
#[derive(Debug)]
struct Rebalance {
    epoch: Epoch,
    latch: Latch,
}

impl<K: Clone + Eq + Hash> TotalOrderManager<K> {
    /// Creates a new [`TotalOrderManager`].
    ///
    /// The [`ScanTrigger`] is fired whenever a latch is unblocked.
    ///
    /// # Examples
    ///
    /// ```
    /// use tocc::{Config, TotalOrderManager};
    ///
    /// let manager: TotalOrderManager<u64> = TotalOrderManager::new(&Config::default(), None);
    /// assert!(!manager.has_any_lock());
    /// ```
    #[inline]
    #[must_use]
    pub fn new(config: &Config, trigger: Option<ScanTrigger>) -> TotalOrderManager<K> {
        TotalOrderManager {
            lock_table: LockTable::new(config.max_acquire_attempts),
            clear: AtomicShared::null(),
            rebalance: AtomicShared::null(),
            trigger,
            reset_wait_timeout: config.reset_wait_timeout(),
        }
    }

    /// Admits the transaction and computes the latches it must wait for.
    ///
    /// The dependencies are recorded in the state. Acquisition is all-or-nothing: on failure the
    /// state is left reset and no key is held. Returns the admission generation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if a previous admission of the same state was not reset in time,
    /// or [`Error::InvariantViolation`] if keys could not be acquired.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use tocc::{Config, PrepareCommand, RemoteTransactionState, TotalOrderManager, TransactionId};
    ///
    /// let manager = TotalOrderManager::new(&Config::default(), None);
    /// let id = TransactionId::new(1, 1);
    /// let state = RemoteTransactionState::new(id);
    /// let command = Arc::new(PrepareCommand::new(id, vec!["k"], Vec::new(), 0));
    /// assert!(manager.ensure_order(&state, command).is_ok());
    /// assert!(state.is_ready());
    /// assert!(manager.has_any_lock());
    ///
    /// manager.release(&state);
    /// assert!(!manager.has_any_lock());
    /// ```
    pub fn ensure_order(
        &self,
        state: &RemoteTransactionState<K>,
        command: Arc<PrepareCommand<K>>,
    ) -> Result<u64, Error> {
        state.wait_until_reset(self.reset_wait_timeout)?;

        let latch = Latch::for_transaction(command.id());
        let generation = state.admit(latch.clone(), command.clone());
        if command.is_clear() {
            self.acquire_all(state, &latch);
        } else if let Err(error) = self.acquire_keys(state, &latch, &command) {
            warn!(tx = %command.id(), %error, "failed to acquire keys");
            latch.unblock();
            state.reset();
            self.trigger_scan();
            return Err(error);
        }

        let guard = Guard::new();
        if let Some(clear) = self.clear.load(Acquire, &guard).as_ref() {
            if clear.is_blocking() && !clear.ptr_eq(&latch) {
                state.add_dependencies([clear.clone()]);
            }
        }
        if let Some(rebalance) = self.rebalance.load(Acquire, &guard).as_ref() {
            if rebalance.latch.is_blocking() {
                state.add_dependencies([rebalance.latch.clone()]);
            }
        }
        debug!(
            tx = %command.id(),
            %latch,
            generation,
            dependencies = state.dependencies().len(),
            "admitted"
        );
        Ok(generation)
    }

    /// Releases every key claimed by the transaction, and resets the state.
    ///
    /// Dependent transactions become ready, and the executor is asked to re-scan pending tasks.
    pub fn release(&self, state: &RemoteTransactionState<K>) {
        let Some(latch) = state.latch() else {
            warn!(tx = %state.id(), "released a transaction that was not admitted");
            return;
        };
        if !latch.unblock() {
            warn!(tx = %state.id(), %latch, "latch already unblocked");
        }
        match state.take_claim() {
            Claim::Nothing => (),
            Claim::Keys(keys) => {
                for key in &keys {
                    self.lock_table.release(key, &latch);
                }
            }
            Claim::All => {
                let guard = Guard::new();
                let current = self.clear.load(Acquire, &guard);
                if current.as_ref().is_some_and(|l| l.ptr_eq(&latch)) {
                    // A later clear may have replaced it.
                    let _result = self.clear.compare_exchange(
                        current,
                        (None, Tag::None),
                        AcqRel,
                        Acquire,
                        &guard,
                    );
                }
            }
        }
        state.reset();
        debug!(tx = %state.id(), %latch, "released");
        self.trigger_scan();
    }

    /// Starts a rebalance of the given epoch.
    ///
    /// Returns the latches that the state transfer must wait for. Every transaction admitted
    /// until [`TotalOrderManager::end_rebalance`] waits for the rebalance. If a rebalance is
    /// already in progress, nothing changes and an empty list is returned.
    pub fn begin_rebalance(&self, epoch: Epoch) -> Vec<Latch> {
        let guard = Guard::new();
        if let Some(current) = self.rebalance.load(Acquire, &guard).as_ref() {
            warn!(epoch, current = current.epoch, "a rebalance is already in progress");
            return Vec::new();
        }

        let mut blockers: HashSet<Latch> = self
            .lock_table
            .collect_for_state_transfer()
            .into_iter()
            .collect();
        if let Some(clear) = self.clear.load(Acquire, &guard).as_ref() {
            if clear.is_blocking() {
                blockers.insert(clear.clone());
            }
        }
        self.rebalance.swap(
            (
                Some(Shared::new(Rebalance {
                    epoch,
                    latch: Latch::for_rebalance(epoch),
                })),
                Tag::None,
            ),
            AcqRel,
        );
        info!(epoch, blockers = blockers.len(), "rebalance started");
        blockers.into_iter().collect()
    }

    /// Ends the rebalance in progress.
    ///
    /// Returns the epoch of the rebalance, or `None` if no rebalance was in progress.
    pub fn end_rebalance(&self) -> Option<Epoch> {
        let (rebalance, _) = self.rebalance.swap((None, Tag::None), AcqRel);
        let rebalance = rebalance?;
        rebalance.latch.unblock();
        info!(epoch = rebalance.epoch, "rebalance finished");
        self.trigger_scan();
        Some(rebalance.epoch)
    }

    /// Returns `true` if any key is claimed or a clear is pending.
    #[inline]
    pub fn has_any_lock(&self) -> bool {
        if !self.lock_table.is_empty() {
            return true;
        }
        let guard = Guard::new();
        self.clear
            .load(Acquire, &guard)
            .as_ref()
            .is_some_and(Latch::is_blocking)
    }

    /// Returns the epoch of the rebalance in progress.
    #[inline]
    pub fn rebalance_epoch(&self) -> Option<Epoch> {
        let guard = Guard::new();
        self.rebalance
            .load(Acquire, &guard)
            .as_ref()
            .map(|r| r.epoch)
    }

    /// Returns a reference to the per-key dependency table.
    #[inline]
    pub fn lock_table(&self) -> &LockTable<K> {
        &self.lock_table
    }

    /// Takes every key in the table.
    fn acquire_all(&self, state: &RemoteTransactionState<K>, latch: &Latch) {
        let dependencies = self.lock_table.acquire_for_clear();
        let (previous, _) = self
            .clear
            .swap((Some(Shared::new(latch.clone())), Tag::None), AcqRel);
        state.add_dependencies(dependencies);
        if let Some(previous) = previous {
            if previous.is_blocking() {
                state.add_dependencies([(*previous).clone()]);
            }
        }
        state.set_claim(Claim::All);
    }

    /// Takes the write keys, then the read keys, of the command.
    ///
    /// On failure, every key taken so far is given back to the holders it was taken from.
    fn acquire_keys(
        &self,
        state: &RemoteTransactionState<K>,
        latch: &Latch,
        command: &PrepareCommand<K>,
    ) -> Result<(), Error> {
        let mut claimed: Vec<(&K, Undo)> =
            Vec::with_capacity(command.writes().len() + command.reads().len());
        let mut seen: HashSet<&K> = HashSet::with_capacity(claimed.capacity());
        let mut dependencies = Vec::new();
        let keys = command
            .writes()
            .iter()
            .map(|k| (k, Access::Write))
            .chain(command.reads().iter().map(|k| (k, Access::Read)));
        for (key, access) in keys {
            if !seen.insert(key) {
                continue;
            }
            match self.lock_table.acquire_undoable(key, latch, access) {
                Ok((latches, undo)) => {
                    dependencies.extend(latches);
                    claimed.push((key, undo));
                }
                Err(error) => {
                    for (key, undo) in claimed.into_iter().rev() {
                        self.lock_table.undo(key, latch, undo);
                    }
                    return Err(error);
                }
            }
        }
        state.add_dependencies(dependencies);
        state.set_claim(Claim::Keys(
            claimed.into_iter().map(|(k, _)| k.clone()).collect(),
        ));
        Ok(())
    }

    pub(crate) fn trigger_scan(&self) {
        if let Some(trigger) = self.trigger.as_ref() {
            trigger.check_for_ready_tasks();
        }
    }
}

impl<K: Eq + Hash> fmt::Debug for TotalOrderManager<K> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = Guard::new();
        f.debug_struct("TotalOrderManager")
            .field("lock_table", &self.lock_table)
            .field("clear", &self.clear.load(Acquire, &guard).as_ref())
            .field("rebalance", &self.rebalance.load(Acquire, &guard).as_ref())
            .finish_non_exhaustive()
    }
}
