// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

//! Certification tasks run by the [`TaskProcessor`](crate::TaskProcessor).
//!
//! Every task releases the transaction it finishes, whether it runs to completion, panics, or is
//! dropped without being run. A panic in the storage engine is reported as [`Error::Storage`], and
//! the engine is asked to discard the transaction.

use super::Shared;
use crate::command::{PrepareCommand, Version};
use crate::remote_transaction::{RemoteTransactionState, Status};
use crate::{Error, Outcome, PendingCertification, ReadyTask, StorageEngine};
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, warn};

/// Certifies a transaction once every transaction it depends on has been released.
pub(super) struct PrepareTask<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    shared: Arc<Shared<K, E>>,
    state: Arc<RemoteTransactionState<K>>,
    generation: u64,
    command: Arc<PrepareCommand<K>>,
    pending: PendingCertification,
    done: bool,
}

/// Commits or rolls back a prepared transaction once its certification has finished.
pub(super) struct SecondPhaseTask<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    shared: Arc<Shared<K, E>>,
    state: Arc<RemoteTransactionState<K>>,
    generation: u64,
    commit: bool,
    pending: PendingCertification,

    /// `true` while the task is responsible for releasing the transaction.
    owned: bool,
    done: bool,
}

impl<K, E> PrepareTask<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    pub(super) fn new(
        shared: Arc<Shared<K, E>>,
        state: Arc<RemoteTransactionState<K>>,
        generation: u64,
        command: Arc<PrepareCommand<K>>,
        pending: PendingCertification,
    ) -> Self {
        PrepareTask {
            shared,
            state,
            generation,
            command,
            pending,
            done: false,
        }
    }

    fn certify(&mut self) {
        let shared = self.shared.clone();
        let command = self.command.clone();
        let id = command.id();
        let result = panic::catch_unwind(AssertUnwindSafe(|| -> Result<Version, Error> {
            let version = shared.engine.assign_commit_version(&command);
            if command.is_one_phase() {
                shared.engine.validate_and_apply(&command, version)?;
            } else {
                shared.engine.validate(&command, version)?;
            }
            Ok(version)
        }))
        .unwrap_or_else(|_| Err(Error::Storage(String::from("certification panicked"))));

        let version = match result {
            Ok(version) => version,
            Err(error) => {
                shared.engine.discard(&command);
                self.done = true;
                if self.state.try_finish(self.generation, Status::Preparing) {
                    shared.finish(&self.state);
                }
                let outcome = self.rolled_back(error);
                self.pending.complete(outcome);
                return;
            }
        };

        self.done = true;
        if command.is_one_phase() {
            if self.state.try_finish(self.generation, Status::Preparing) {
                shared.finish(&self.state);
            }
            shared.telemetry.record_commit();
            debug!(tx = %id, version, "committed");
            self.pending.complete(Ok(Outcome::Committed(version)));
        } else if self.state.mark_prepared(self.generation, version) {
            shared.telemetry.record_prepare();
            debug!(tx = %id, version, "prepared");
            // The second phase may be waiting for the status change.
            shared.manager.trigger_scan();
            self.pending.complete(Ok(Outcome::Prepared(version)));
        } else {
            warn!(tx = %id, generation = self.generation, "state changed during certification");
            self.pending.complete(Err(Error::UnexpectedState(
                "the transaction state changed during certification",
            )));
        }
    }

    fn rolled_back(&self, error: Error) -> Result<Outcome, Error> {
        let conflict = error.is_conflict();
        if conflict {
            debug!(tx = %self.command.id(), "rolled back due to a conflict");
        } else {
            error!(tx = %self.command.id(), %error, "storage failure");
        }
        self.shared.telemetry.record_rollback(conflict);
        Err(error)
    }
}

impl<K, E> ReadyTask for PrepareTask<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    #[inline]
    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    #[inline]
    fn run(mut self: Box<Self>) {
        self.certify();
    }
}

impl<K, E> Drop for PrepareTask<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let panicking = thread::panicking();
        if self.state.try_finish(self.generation, Status::Preparing) {
            if !panicking {
                self.shared.engine.discard(&self.command);
            }
            self.shared.finish(&self.state);
        }
        let error = if panicking {
            Error::Storage(String::from("certification panicked"))
        } else {
            Error::Shutdown
        };
        warn!(tx = %self.command.id(), %error, "certification aborted");
        self.shared.telemetry.record_rollback(false);
        self.pending.complete(Err(error));
    }
}

impl<K, E> SecondPhaseTask<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    pub(super) fn new(
        shared: Arc<Shared<K, E>>,
        state: Arc<RemoteTransactionState<K>>,
        commit: bool,
        pending: PendingCertification,
    ) -> Self {
        let generation = state.generation();
        SecondPhaseTask {
            shared,
            state,
            generation,
            commit,
            pending,
            owned: false,
            done: false,
        }
    }

    fn second_phase(&mut self) -> Result<Outcome, Error> {
        let id = self.state.id();
        if self.state.generation() != self.generation {
            warn!(tx = %id, commit = self.commit, "the transaction was admitted again");
            return Err(Error::UnexpectedState(
                "the transaction was admitted again",
            ));
        }
        if !self.state.try_finish(self.generation, Status::Prepared) {
            // Certification failed, or the transaction committed in one phase.
            if self.commit {
                warn!(tx = %id, "commit of a transaction that is not prepared");
                return Err(Error::UnexpectedState("the transaction is not prepared"));
            }
            debug!(tx = %id, "rollback of a transaction that is not prepared");
            return Ok(Outcome::RolledBack);
        }
        self.owned = true;

        let shared = self.shared.clone();
        let result = match (self.state.command(), self.state.version()) {
            (Some(command), Some(version)) if self.commit => {
                let applied = panic::catch_unwind(AssertUnwindSafe(|| {
                    shared.engine.apply(&command, version)
                }))
                .unwrap_or_else(|_| Err(Error::Storage(String::from("the second phase panicked"))));
                match applied {
                    Ok(()) => {
                        shared.telemetry.record_commit();
                        debug!(tx = %id, version, "committed");
                        Ok(Outcome::Committed(version))
                    }
                    Err(error) => {
                        error!(tx = %id, version, %error, "failed to apply");
                        shared.engine.discard(&command);
                        shared.telemetry.record_rollback(false);
                        Err(error)
                    }
                }
            }
            (Some(command), _) => {
                shared.engine.discard(&command);
                shared.telemetry.record_rollback(false);
                debug!(tx = %id, "rolled back");
                Ok(Outcome::RolledBack)
            }
            (None, _) => Err(Error::UnexpectedState(
                "the transaction has no prepare command",
            )),
        };
        self.owned = false;
        shared.finish(&self.state);
        result
    }
}

impl<K, E> ReadyTask for SecondPhaseTask<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    #[inline]
    fn is_ready(&self) -> bool {
        self.state.generation() != self.generation || self.state.status() != Status::Preparing
    }

    #[inline]
    fn run(mut self: Box<Self>) {
        let result = self.second_phase();
        self.done = true;
        self.pending.complete(result);
    }
}

impl<K, E> Drop for SecondPhaseTask<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let panicking = thread::panicking();
        if !self.owned && self.state.try_finish(self.generation, Status::Prepared) {
            self.owned = true;
            if !panicking {
                if let Some(command) = self.state.command() {
                    self.shared.engine.discard(&command);
                }
            }
        }
        if self.owned {
            self.shared.finish(&self.state);
        }
        let error = if panicking {
            Error::Storage(String::from("the second phase panicked"))
        } else {
            Error::Shutdown
        };
        warn!(tx = %self.state.id(), commit = self.commit, %error, "second phase aborted");
        self.pending.complete(Err(error));
    }
}
