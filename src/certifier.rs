// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

mod tasks;

use super::command::{Command, Epoch, PrepareCommand, TransactionId, Version};
use super::remote_transaction::{RemoteTransactionState, Status};
use super::task_processor::TaskProcessor;
use super::{Config, Error, Latch, PendingCertification, StorageEngine, Telemetry};
use super::TotalOrderManager;
use scc::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, OnceLock, Weak};
use tasks::{PrepareTask, SecondPhaseTask};
use tracing::{debug, info, warn};

/// [`Certifier`] certifies and commits transactions delivered in total order.
///
/// Commands must be delivered by a single thread in the order in which the total-order broadcast
/// delivered them. Certification and application run on worker threads, and transactions that do
/// not conflict with each other are processed in parallel.
///
/// # Examples
///
/// ```
/// use tocc::{Certifier, Config, Outcome, PrepareCommand, TransactionId, VersionedStore};
/// use std::time::Duration;
///
/// let store: VersionedStore<&str, u32> = VersionedStore::default();
/// let certifier = Certifier::new(store, Config::default()).unwrap();
///
/// let id = TransactionId::new(1, 1);
/// certifier.engine().stage(id, vec![("key", 1)]);
/// let command = PrepareCommand::new(id, vec!["key"], Vec::new(), 1).one_phase();
/// let pending = certifier.on_prepare(command).unwrap();
/// let Ok(Outcome::Committed(version)) = pending.wait_timeout(Duration::from_secs(60)) else {
///     unreachable!();
/// };
/// assert_eq!(certifier.engine().read(&"key", version), Some(1));
/// ```
pub struct Certifier<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    /// Data shared with certification tasks.
    shared: Arc<Shared<K, E>>,

    /// The executor running certification tasks.
    task_processor: TaskProcessor,
}

/// The result of delivering a [`Command`].
#[derive(Debug)]
pub enum Delivery {
    /// The command started a certification step.
    Certification(PendingCertification),

    /// A rebalance started; state transfer must wait for the latches.
    Rebalance(Vec<Latch>),

    /// The command had no effect.
    Ignored,
}

/// Data shared between the [`Certifier`] and its tasks.
struct Shared<K: Eq + Hash, E> {
    manager: TotalOrderManager<K>,
    engine: E,
    transactions: HashMap<TransactionId, Arc<RemoteTransactionState<K>>>,
    telemetry: Telemetry,
}

impl<K, E> Certifier<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    /// Creates a new [`Certifier`] on top of the storage engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongParameter`] if the configuration is invalid.
    pub fn new(engine: E, config: Config) -> Result<Certifier<K, E>, Error> {
        config.validate()?;
        let cell: Arc<OnceLock<Weak<Shared<K, E>>>> = Arc::default();
        let cell_clone = cell.clone();
        let task_processor = TaskProcessor::spawn(
            &config,
            Some(Box::new(move || {
                if let Some(shared) = cell_clone.get().and_then(Weak::upgrade) {
                    shared.collect_garbage();
                }
            })),
        )?;
        let shared = Arc::new(Shared {
            manager: TotalOrderManager::new(&config, Some(task_processor.scan_trigger())),
            engine,
            transactions: HashMap::default(),
            telemetry: Telemetry::default(),
        });
        drop(cell.set(Arc::downgrade(&shared)));
        Ok(Certifier {
            shared,
            task_processor,
        })
    }

    /// Delivers a command.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if a prepare command could not be admitted.
    pub fn deliver(&self, command: Command<K>) -> Result<Delivery, Error> {
        match command {
            Command::Prepare(prepare) => self.on_prepare(prepare).map(Delivery::Certification),
            Command::Clear(id) => self
                .on_prepare(PrepareCommand::clear(id, 0))
                .map(Delivery::Certification),
            Command::Commit(id) => Ok(self
                .on_second_phase(id, true)
                .map_or(Delivery::Ignored, Delivery::Certification)),
            Command::Rollback(id) => Ok(self
                .on_second_phase(id, false)
                .map_or(Delivery::Ignored, Delivery::Certification)),
            Command::RebalanceStart(epoch) => Ok(Delivery::Rebalance(self.begin_rebalance(epoch))),
            Command::RebalanceEnd(epoch) => {
                match self.end_rebalance() {
                    Some(current) if current != epoch => {
                        warn!(epoch, current, "ended a rebalance of a different epoch");
                    }
                    None => warn!(epoch, "no rebalance in progress"),
                    Some(_) => (),
                }
                Ok(Delivery::Ignored)
            }
        }
    }

    /// Admits a prepare command, and schedules its certification.
    ///
    /// A one-phase transaction completes with [`Outcome::Committed`](crate::Outcome::Committed),
    /// and a two-phase transaction with [`Outcome::Prepared`](crate::Outcome::Prepared), unless
    /// it conflicts with a committed transaction.
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the transaction could not be admitted.
    pub fn on_prepare(&self, command: PrepareCommand<K>) -> Result<PendingCertification, Error> {
        let id = command.id();
        let state = self
            .shared
            .transactions
            .entry(id)
            .or_insert_with(|| Arc::new(RemoteTransactionState::new(id)))
            .get()
            .clone();
        let command = Arc::new(command);
        let generation = match self.shared.manager.ensure_order(&state, command.clone()) {
            Ok(generation) => generation,
            Err(error) => {
                // A state that is not in use was created for this attempt.
                self.shared
                    .transactions
                    .remove_if(&id, |s| Arc::ptr_eq(s, &state) && !s.is_in_use());
                return Err(error);
            }
        };

        // The previous admission may have removed the state from the map.
        drop(
            self.shared
                .transactions
                .entry(id)
                .or_insert_with(|| state.clone()),
        );
        self.shared.telemetry.record_admission();

        let pending = PendingCertification::new(id);
        let task = PrepareTask::new(
            self.shared.clone(),
            state,
            generation,
            command,
            pending.clone(),
        );
        self.task_processor.submit(Box::new(task))?;
        Ok(pending)
    }

    /// Schedules the second phase of a two-phase transaction.
    ///
    /// Returns `None` if the transaction is unknown, e.g., it already finished, or if it commits
    /// in a single phase.
    pub fn on_second_phase(&self, id: TransactionId, commit: bool) -> Option<PendingCertification> {
        let Some(state) = self.shared.transactions.read(&id, |_, s| s.clone()) else {
            debug!(tx = %id, commit, "second phase of an unknown transaction");
            return None;
        };
        if state.command().map_or(true, |c| c.is_one_phase()) {
            debug!(tx = %id, commit, "second phase of a one-phase transaction");
            return None;
        }
        let pending = PendingCertification::new(id);
        let task = SecondPhaseTask::new(self.shared.clone(), state, commit, pending.clone());
        if let Err(error) = self.task_processor.submit(Box::new(task)) {
            warn!(tx = %id, %error, "failed to schedule the second phase");
        }
        Some(pending)
    }

    /// Starts a rebalance.
    ///
    /// Returns the latches that the state transfer must wait for.
    #[inline]
    pub fn begin_rebalance(&self, epoch: Epoch) -> Vec<Latch> {
        self.shared.telemetry.record_rebalance();
        self.shared.manager.begin_rebalance(epoch)
    }

    /// Ends the rebalance in progress, returning its epoch.
    #[inline]
    pub fn end_rebalance(&self) -> Option<Epoch> {
        self.shared.manager.end_rebalance()
    }

    /// Returns `true` if any key is claimed or a clear is pending.
    #[inline]
    pub fn has_any_lock(&self) -> bool {
        self.shared.manager.has_any_lock()
    }

    /// Returns `true` if nothing is claimed and no certification task is pending.
    #[inline]
    pub fn is_quiescent(&self) -> bool {
        !self.has_any_lock() && self.task_processor.pending_tasks() == 0
    }

    /// Returns the oldest snapshot among transactions that have not finished.
    pub fn oldest_certifying_snapshot(&self) -> Option<Version> {
        let mut oldest: Option<Version> = None;
        self.shared.transactions.scan(|_, state| {
            if state.status() == Status::Finished {
                return;
            }
            if let Some(command) = state.command() {
                if !command.is_clear() {
                    let snapshot = command.snapshot();
                    oldest = Some(oldest.map_or(snapshot, |o| o.min(snapshot)));
                }
            }
        });
        oldest
    }

    /// Returns the state of the transaction.
    #[inline]
    pub fn transaction(&self, id: TransactionId) -> Option<Arc<RemoteTransactionState<K>>> {
        self.shared.transactions.read(&id, |_, s| s.clone())
    }

    /// Returns a reference to the storage engine.
    #[inline]
    pub fn engine(&self) -> &E {
        &self.shared.engine
    }

    /// Returns a reference to the [`TotalOrderManager`].
    #[inline]
    pub fn manager(&self) -> &TotalOrderManager<K> {
        &self.shared.manager
    }

    /// Returns a reference to the [`Telemetry`].
    #[inline]
    pub fn telemetry(&self) -> &Telemetry {
        &self.shared.telemetry
    }
}

impl<K, E> fmt::Debug for Certifier<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certifier")
            .field("manager", &self.shared.manager)
            .field("transactions", &self.shared.transactions.len())
            .field("telemetry", &self.shared.telemetry)
            .field("task_processor", &self.task_processor)
            .finish()
    }
}

impl<K, E> Drop for Certifier<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    #[inline]
    fn drop(&mut self) {
        info!(
            pending = self.task_processor.pending_tasks(),
            transactions = self.shared.transactions.len(),
            "shutting down"
        );
    }
}

impl<K, E> Shared<K, E>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    E: StorageEngine<K>,
{
    /// Forgets the transaction, and releases its keys.
    fn finish(&self, state: &Arc<RemoteTransactionState<K>>) {
        self.transactions
            .remove_if(&state.id(), |s| Arc::ptr_eq(s, state));
        self.manager.release(state);
    }

    /// Reclaims old versions if nothing is claimed.
    fn collect_garbage(&self) {
        if !self.manager.has_any_lock() {
            self.engine.collect_garbage();
        }
    }
}
