// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

//! Commands delivered by the total-order broadcast, and the identifiers they carry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The commit version, or snapshot timestamp, of a transaction.
///
/// `0` is never assigned as a commit version.
pub type Version = u64;

/// The rebalance epoch, usually the topology identifier of the cluster.
pub type Epoch = u64;

/// [`TransactionId`] identifies a transaction across the cluster.
///
/// The same identifier is carried by the prepare, commit and rollback commands of a transaction on
/// every node.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TransactionId {
    /// The node that originated the transaction.
    origin: u32,

    /// The per-node sequence number.
    sequence: u64,
}

/// [`PrepareCommand`] asks the cluster to certify a transaction.
///
/// Only the keys are visible to the certification core; the values being written are the storage
/// engine's business.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PrepareCommand<K> {
    /// The transaction identifier.
    id: TransactionId,

    /// The keys written by the transaction.
    writes: Vec<K>,

    /// The keys read by the transaction.
    reads: Vec<K>,

    /// The version the transaction read at.
    snapshot: Version,

    /// The transaction commits without a second phase.
    one_phase: bool,

    /// The transaction invalidates the whole cache.
    clear: bool,
}

/// [`Command`] is a message delivered in total order.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Command<K> {
    /// Certify a transaction.
    Prepare(PrepareCommand<K>),

    /// Commit a prepared transaction.
    Commit(TransactionId),

    /// Roll back a prepared transaction.
    Rollback(TransactionId),

    /// Invalidate the whole cache.
    Clear(TransactionId),

    /// A rebalance is about to transfer state.
    RebalanceStart(Epoch),

    /// The rebalance has finished transferring state.
    RebalanceEnd(Epoch),
}

impl TransactionId {
    /// Creates a new [`TransactionId`].
    ///
    /// # Examples
    ///
    /// ```
    /// use tocc::TransactionId;
    ///
    /// let id = TransactionId::new(3, 7);
    /// assert_eq!(id.origin(), 3);
    /// assert_eq!(id.sequence(), 7);
    /// assert_eq!(id.to_string(), "3:7");
    /// ```
    #[inline]
    #[must_use]
    pub const fn new(origin: u32, sequence: u64) -> TransactionId {
        TransactionId { origin, sequence }
    }

    /// Returns the originating node.
    #[inline]
    #[must_use]
    pub const fn origin(&self) -> u32 {
        self.origin
    }

    /// Returns the sequence number.
    #[inline]
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for TransactionId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.sequence)
    }
}

impl<K> PrepareCommand<K> {
    /// Creates a two-phase [`PrepareCommand`].
    ///
    /// # Examples
    ///
    /// ```
    /// use tocc::{PrepareCommand, TransactionId};
    ///
    /// let prepare = PrepareCommand::new(TransactionId::new(1, 1), vec!["a"], vec!["b"], 4);
    /// assert!(!prepare.is_one_phase());
    /// assert!(!prepare.is_clear());
    /// assert_eq!(prepare.snapshot(), 4);
    /// ```
    #[inline]
    #[must_use]
    pub fn new(id: TransactionId, writes: Vec<K>, reads: Vec<K>, snapshot: Version) -> Self {
        PrepareCommand {
            id,
            writes,
            reads,
            snapshot,
            one_phase: false,
            clear: false,
        }
    }

    /// Creates a [`PrepareCommand`] that invalidates the whole cache.
    ///
    /// A clear command claims every key, and commits in a single phase.
    #[inline]
    #[must_use]
    pub fn clear(id: TransactionId, snapshot: Version) -> Self {
        PrepareCommand {
            id,
            writes: Vec::new(),
            reads: Vec::new(),
            snapshot,
            one_phase: true,
            clear: true,
        }
    }

    /// Marks the command as one committing without a second phase.
    #[inline]
    #[must_use]
    pub fn one_phase(mut self) -> Self {
        self.one_phase = true;
        self
    }

    /// Returns the transaction identifier.
    #[inline]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the keys written by the transaction.
    #[inline]
    pub fn writes(&self) -> &[K] {
        &self.writes
    }

    /// Returns the keys read by the transaction.
    #[inline]
    pub fn reads(&self) -> &[K] {
        &self.reads
    }

    /// Returns the version the transaction read at.
    #[inline]
    pub fn snapshot(&self) -> Version {
        self.snapshot
    }

    /// Returns `true` if the transaction commits without a second phase.
    #[inline]
    pub fn is_one_phase(&self) -> bool {
        self.one_phase
    }

    /// Returns `true` if the transaction invalidates the whole cache.
    #[inline]
    pub fn is_clear(&self) -> bool {
        self.clear
    }
}

impl<K> Command<K> {
    /// Returns the transaction identifier carried by the command, if any.
    #[inline]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Command::Prepare(prepare) => Some(prepare.id()),
            Command::Commit(id) | Command::Rollback(id) | Command::Clear(id) => Some(*id),
            Command::RebalanceStart(_) | Command::RebalanceEnd(_) => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transaction_id_order() {
        let first = TransactionId::new(1, 9);
        let second = TransactionId::new(2, 0);
        assert!(first < second);
        assert!(TransactionId::new(1, 1) < TransactionId::new(1, 2));
    }

    #[test]
    fn command() {
        let id = TransactionId::new(0, 1);
        let prepare = PrepareCommand::new(id, vec![1_u64], Vec::new(), 0).one_phase();
        assert!(prepare.is_one_phase());
        assert_eq!(Command::Prepare(prepare).transaction_id(), Some(id));
        assert_eq!(Command::<u64>::RebalanceStart(3).transaction_id(), None);

        let clear = PrepareCommand::<u64>::clear(id, 0);
        assert!(clear.is_clear() && clear.is_one_phase());
        assert!(clear.writes().is_empty() && clear.reads().is_empty());
    }

    #[test]
    fn wire_format() {
        let id = TransactionId::new(2, 5);
        let prepare = Command::Prepare(PrepareCommand::new(id, vec!["a"], vec!["b"], 3).one_phase());
        let encoded = serde_json::to_string(&prepare).unwrap();
        let decoded: Command<String> = serde_json::from_str(&encoded).unwrap();
        let Command::Prepare(decoded) = decoded else {
            unreachable!();
        };
        assert_eq!(decoded.id(), id);
        assert_eq!(decoded.writes(), ["a"]);
        assert_eq!(decoded.reads(), ["b"]);
        assert!(decoded.is_one_phase() && !decoded.is_clear());

        let commit: Command<String> =
            serde_json::from_str(r#"{ "Commit": { "origin": 2, "sequence": 5 } }"#).unwrap();
        assert_eq!(commit.transaction_id(), Some(id));
    }
}
