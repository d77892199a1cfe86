// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use crate::command::{PrepareCommand, TransactionId, Version};
use crate::sequencer::{AtomicCounter, Sequencer};
use crate::{Error, StorageEngine};
use parking_lot::Mutex;
use scc::HashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::Ordering::{Acquire, Release};
use tracing::{debug, trace};

/// [`VersionedStore`] is an in-memory multiversion key-value store.
///
/// Values written by a transaction are staged by the node executing it, and become visible when
/// the transaction is applied with its commit version. Transactions are validated on a
/// first-committer-wins basis: a transaction conflicts if any key it read or wrote has a version
/// newer than its snapshot.
///
/// Commit versions are issued ahead of the logical clock, and the clock only moves past a version
/// once every version up to it has been applied or discarded. A snapshot therefore never includes
/// a version that may still become visible.
///
/// # Examples
///
/// ```
/// use tocc::{PrepareCommand, StorageEngine, ToInstant, TransactionId, VersionedStore};
///
/// let store: VersionedStore<&str, u32> = VersionedStore::default();
/// let snapshot = store.snapshot();
/// let id = TransactionId::new(0, 1);
/// store.stage(id, vec![("k", 7)]);
///
/// let command = PrepareCommand::new(id, vec!["k"], Vec::new(), snapshot.to_instant());
/// let version = store.assign_commit_version(&command);
/// assert!(store.validate_and_apply(&command, version).is_ok());
/// assert_eq!(store.read(&"k", version), Some(7));
/// assert_eq!(store.read(&"k", snapshot.to_instant()), None);
/// ```
pub struct VersionedStore<K: Eq + Hash, V, S: Sequencer<Instant = Version> = AtomicCounter> {
    /// The logical clock issuing commit versions and snapshots.
    sequencer: S,

    /// Version chains in ascending version order; `None` marks a deletion.
    versions: HashMap<K, Vec<(Version, Option<V>)>>,

    /// Values written by transactions that have not been applied or discarded.
    staged: HashMap<TransactionId, Vec<(K, V)>>,

    /// Issued commit versions.
    issued: Mutex<Issued>,
}

/// Commit versions that have been issued.
#[derive(Debug, Default)]
struct Issued {
    /// The last issued version.
    last: Version,

    /// Versions neither applied nor discarded yet.
    in_flight: BTreeMap<Version, TransactionId>,
}

impl<K, V, S> VersionedStore<K, V, S>
where
    K: Clone + Eq + Hash,
    V: Clone,
    S: Sequencer<Instant = Version>,
{
    /// Returns a reference to the logical clock.
    #[inline]
    pub fn sequencer(&self) -> &S {
        &self.sequencer
    }

    /// Takes a snapshot.
    ///
    /// The snapshot covers every applied version below the oldest version still in flight.
    /// Versions visible to the snapshot are not reclaimed until the tracker is dropped.
    #[inline]
    pub fn snapshot(&self) -> S::Tracker {
        self.sequencer.track(Acquire)
    }

    /// Stages values written by a transaction.
    ///
    /// Keys written by the transaction without a staged value are deleted when it is applied.
    #[inline]
    pub fn stage(&self, id: TransactionId, writes: Vec<(K, V)>) {
        self.staged
            .entry(id)
            .or_default()
            .get_mut()
            .extend(writes);
    }

    /// Reads the value of the key visible to the snapshot.
    #[inline]
    pub fn read(&self, key: &K, snapshot: Version) -> Option<V> {
        self.versions
            .read(key, |_, chain| {
                chain
                    .iter()
                    .rev()
                    .find(|(version, _)| *version <= snapshot)
                    .and_then(|(_, value)| value.clone())
            })
            .flatten()
    }

    /// Returns the newest version of the key.
    #[inline]
    pub fn latest_version(&self, key: &K) -> Option<Version> {
        self.versions
            .read(key, |_, chain| chain.last().map(|(version, _)| *version))
            .flatten()
    }

    /// Returns the number of versions of the key.
    #[inline]
    pub fn num_versions(&self, key: &K) -> usize {
        self.versions.read(key, |_, chain| chain.len()).unwrap_or(0)
    }

    /// Returns the number of keys that have at least one version.
    #[inline]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Returns `true` if no key has a version.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Returns the number of issued versions that are neither applied nor discarded.
    #[inline]
    pub fn num_in_flight(&self) -> usize {
        self.issued.lock().in_flight.len()
    }

    /// Forgets in-flight versions of the transaction, and moves the clock forward.
    fn settle(&self, id: TransactionId, version: Option<Version>) {
        let mut issued = self.issued.lock();
        match version {
            Some(version) => {
                issued.in_flight.remove(&version);
            }
            None => issued.in_flight.retain(|_, tx| *tx != id),
        }
        let visible = issued
            .in_flight
            .keys()
            .next()
            .map_or(issued.last, |oldest| oldest - 1);
        // The clock never moves backward; `Err` means it is already there.
        let _result = self.sequencer.update(visible, Release);
    }

    fn install(&self, key: K, version: Version, value: Option<V>) {
        let mut entry = self.versions.entry(key).or_default();
        let chain = entry.get_mut();
        let position = chain.partition_point(|(v, _)| *v <= version);
        chain.insert(position, (version, value));
    }
}

impl<K, V, S> StorageEngine<K> for VersionedStore<K, V, S>
where
    K: 'static + Clone + Eq + Hash + Send + Sync,
    V: 'static + Clone + Send + Sync,
    S: Sequencer<Instant = Version>,
{
    #[inline]
    fn assign_commit_version(&self, command: &PrepareCommand<K>) -> Version {
        let mut issued = self.issued.lock();
        let version = issued.last.max(self.sequencer.now(Acquire)) + 1;
        issued.last = version;
        issued.in_flight.insert(version, command.id());
        version
    }

    fn validate(&self, command: &PrepareCommand<K>, version: Version) -> Result<(), Error> {
        if command.is_clear() {
            return Ok(());
        }
        for key in command.writes().iter().chain(command.reads().iter()) {
            if self
                .latest_version(key)
                .is_some_and(|latest| latest > command.snapshot())
            {
                debug!(
                    tx = %command.id(),
                    snapshot = command.snapshot(),
                    version,
                    "conflict"
                );
                return Err(Error::Conflict);
            }
        }
        Ok(())
    }

    fn apply(&self, command: &PrepareCommand<K>, version: Version) -> Result<(), Error> {
        let staged = self
            .staged
            .remove(&command.id())
            .map(|(_, writes)| writes)
            .unwrap_or_default();
        if command.is_clear() {
            self.versions.retain(|_, chain| {
                chain.push((version, None));
                true
            });
            self.settle(command.id(), Some(version));
            trace!(tx = %command.id(), version, "cleared");
            return Ok(());
        }
        let mut values: std::collections::HashMap<K, V> = staged.into_iter().collect();
        for key in command.writes() {
            let value = values.remove(key);
            self.install(key.clone(), version, value);
        }
        self.settle(command.id(), Some(version));
        trace!(tx = %command.id(), version, "applied");
        Ok(())
    }

    #[inline]
    fn discard(&self, command: &PrepareCommand<K>) {
        self.staged.remove(&command.id());
        self.settle(command.id(), None);
    }

    fn collect_garbage(&self) {
        let horizon = self.sequencer.min(Acquire);
        let mut reclaimed = 0_usize;
        self.versions.retain(|_, chain| {
            let visible = chain.partition_point(|(v, _)| *v <= horizon);
            if visible > 1 {
                reclaimed += visible - 1;
                chain.drain(..visible - 1);
            }
            // A deletion that every reader can see is dropped along with the key.
            if chain.len() == 1 && chain[0].0 <= horizon && chain[0].1.is_none() {
                reclaimed += 1;
                false
            } else {
                true
            }
        });
        debug!(horizon, reclaimed, "collected garbage");
    }
}

impl<K, V, S> Default for VersionedStore<K, V, S>
where
    K: Eq + Hash,
    S: Sequencer<Instant = Version>,
{
    #[inline]
    fn default() -> Self {
        VersionedStore {
            sequencer: S::default(),
            versions: HashMap::default(),
            staged: HashMap::default(),
            issued: Mutex::default(),
        }
    }
}

impl<K, V, S> fmt::Debug for VersionedStore<K, V, S>
where
    K: Eq + Hash,
    S: Sequencer<Instant = Version>,
{
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedStore")
            .field("sequencer", &self.sequencer)
            .field("keys", &self.versions.len())
            .field("staged", &self.staged.len())
            .field("issued", &self.issued.lock())
            .finish()
    }
}
