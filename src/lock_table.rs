// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::{Error, Latch};
use parking_lot::Mutex;
use scc::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use tracing::trace;

/// [`LockTable`] maps keys to the [`Latch`] instances holding them.
///
/// The table mirrors a reader-writer lock for each key, except that acquisition never blocks: it
/// returns the list of [`Latch`] instances that the acquiring transaction has to wait for. Each
/// entry is protected by its own mutex, and the table itself allows lookup and insertion of
/// distinct keys without a global lock.
pub struct LockTable<K: Eq + Hash> {
    table: HashMap<K, Arc<Entry>>,
    max_acquire_attempts: usize,
}

/// The type of access requested for a key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    /// Shared access.
    Read,

    /// Exclusive access.
    Write,
}

/// The holders of an entry before an acquisition displaced them.
///
/// `None` means the acquisition did not change the entry.
pub(crate) type Undo = Option<Holders>;

/// A copy of the holders of an entry.
#[derive(Debug)]
pub(crate) struct Holders {
    writer: Option<Latch>,
    downgraded: Option<Latch>,
    readers: Vec<Latch>,
}

/// The result of an acquisition attempt against a single entry.
#[derive(Debug)]
enum Acquisition {
    /// The entry was acquired, and the dependencies are returned.
    Acquired(Vec<Latch>, Undo),

    /// The entry was tombstoned, and the caller has to retry with a fresh entry.
    Removed,
}

#[derive(Debug)]
struct Entry {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    /// The exclusive holder.
    writer: Option<Latch>,

    /// The writer displaced by readers.
    ///
    /// It is not a holder, and new readers keep depending on it while it is blocking.
    downgraded: Option<Latch>,

    /// The shared holders.
    readers: Vec<Latch>,

    /// `true` until the first acquisition.
    new_entry: bool,

    /// Tombstone; the entry must not be acquired any longer.
    removed: bool,
}

impl<K: Clone + Eq + Hash> LockTable<K> {
    /// Creates an empty [`LockTable`].
    ///
    /// Acquisition against tombstoned entries is retried up to `max_acquire_attempts` times.
    #[inline]
    #[must_use]
    pub fn new(max_acquire_attempts: usize) -> LockTable<K> {
        LockTable {
            table: HashMap::default(),
            max_acquire_attempts: max_acquire_attempts.max(1),
        }
    }

    /// Acquires the key for exclusive access.
    ///
    /// Returns the latches to wait for: the current writer, or every current reader.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if the key kept being removed concurrently.
    ///
    /// # Examples
    ///
    /// ```
    /// use tocc::{Latch, LockTable, TransactionId};
    ///
    /// let lock_table: LockTable<&str> = LockTable::new(4);
    /// let first = Latch::for_transaction(TransactionId::new(0, 1));
    /// let second = Latch::for_transaction(TransactionId::new(0, 2));
    /// assert!(lock_table.acquire_write(&"k", &first).unwrap().is_empty());
    /// assert_eq!(lock_table.acquire_write(&"k", &second).unwrap(), vec![first]);
    /// ```
    #[inline]
    pub fn acquire_write(&self, key: &K, latch: &Latch) -> Result<Vec<Latch>, Error> {
        self.acquire(key, latch, Access::Write)
    }

    /// Acquires the key for shared access.
    ///
    /// Returns the latches to wait for: the current writer, if any, or the writer that readers
    /// have displaced if it has not finished yet. Readers never wait for readers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if the key kept being removed concurrently.
    #[inline]
    pub fn acquire_read(&self, key: &K, latch: &Latch) -> Result<Vec<Latch>, Error> {
        self.acquire(key, latch, Access::Read)
    }

    /// Acquires the key for the specified type of access.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if the key kept being removed concurrently.
    #[inline]
    pub fn acquire(&self, key: &K, latch: &Latch, access: Access) -> Result<Vec<Latch>, Error> {
        self.acquire_undoable(key, latch, access)
            .map(|(dependencies, _)| dependencies)
    }

    /// Acquires the key, and returns what is needed to revert the acquisition.
    pub(crate) fn acquire_undoable(
        &self,
        key: &K,
        latch: &Latch,
        access: Access,
    ) -> Result<(Vec<Latch>, Undo), Error> {
        for attempt in 0..self.max_acquire_attempts {
            let entry = self
                .table
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Entry::new()))
                .get()
                .clone();
            match entry.acquire(latch, access) {
                Acquisition::Acquired(dependencies, undo) => return Ok((dependencies, undo)),
                Acquisition::Removed => {
                    trace!(%latch, attempt, "retrying acquisition against a removed entry");
                    self.table.remove_if(key, |e| Arc::ptr_eq(e, &entry));
                }
            }
        }
        Err(Error::InvariantViolation(
            "key acquisition kept hitting removed entries",
        ))
    }

    /// Drains every entry in the table for a whole-table invalidation.
    ///
    /// Every entry is tombstoned and removed, and every latch still blocking is returned.
    pub fn acquire_for_clear(&self) -> Vec<Latch> {
        let mut dependencies = Vec::new();
        self.table.retain(|_, entry| {
            dependencies.extend(entry.drain());
            false
        });
        dependencies
    }

    /// Releases the key held by the latch.
    ///
    /// Returns `true` if the entry became empty and was removed from the table. Releasing a key
    /// that the latch does not hold, or whose entry has already been drained, does nothing.
    pub fn release(&self, key: &K, latch: &Latch) -> bool {
        let Some(entry) = self.table.read(key, |_, e| e.clone()) else {
            return false;
        };
        if entry.release(latch) {
            self.table.remove_if(key, |e| Arc::ptr_eq(e, &entry));
            trace!(%latch, "removed an empty entry");
            true
        } else {
            false
        }
    }

    /// Reverts an acquisition of the key by the latch.
    ///
    /// The holders that the acquisition displaced are put back unless they have been unblocked
    /// since. The entry is removed if nothing holds it afterwards.
    pub(crate) fn undo(&self, key: &K, latch: &Latch, undo: Undo) {
        let Some(holders) = undo else {
            return;
        };
        let Some(entry) = self.table.read(key, |_, e| e.clone()) else {
            return;
        };
        if entry.restore(holders) {
            self.table.remove_if(key, |e| Arc::ptr_eq(e, &entry));
        }
        trace!(%latch, "reverted an acquisition");
    }

    /// Collects every latch currently blocking any key without taking ownership of the keys.
    pub fn collect_for_state_transfer(&self) -> Vec<Latch> {
        let mut blockers = Vec::new();
        self.table.scan(|_, entry| blockers.extend(entry.blockers()));
        blockers
    }

    /// Returns the current writer and readers of the key.
    #[inline]
    pub fn holders(&self, key: &K) -> Option<(Option<Latch>, Vec<Latch>)> {
        self.table.read(key, |_, e| {
            let state = e.state.lock();
            (state.writer.clone(), state.readers.clone())
        })
    }

    /// Returns the number of keys in the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if no key is held.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl<K: Eq + Hash> fmt::Debug for LockTable<K> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("len", &self.table.len())
            .field("max_acquire_attempts", &self.max_acquire_attempts)
            .finish()
    }
}

impl Entry {
    fn new() -> Entry {
        Entry {
            state: Mutex::new(State {
                writer: None,
                downgraded: None,
                readers: Vec::new(),
                new_entry: true,
                removed: false,
            }),
        }
    }

    fn acquire(&self, latch: &Latch, access: Access) -> Acquisition {
        let mut state = self.state.lock();
        state.assert_exclusion();
        if state.removed {
            return Acquisition::Removed;
        }
        state.new_entry = false;

        if state.writer.as_ref().is_some_and(|w| w.ptr_eq(latch))
            || (access == Access::Read && state.readers.iter().any(|r| r.ptr_eq(latch)))
        {
            // The transaction already holds the key.
            return Acquisition::Acquired(Vec::new(), None);
        }

        let undo = Some(Holders {
            writer: state.writer.clone(),
            downgraded: state.downgraded.clone(),
            readers: state.readers.clone(),
        });

        let mut dependencies = Vec::new();
        match access {
            Access::Write => {
                if let Some(writer) = state.writer.take() {
                    dependencies.push(writer);
                } else {
                    dependencies.extend(state.readers.drain(..).filter(|r| !r.ptr_eq(latch)));
                    if let Some(downgraded) = state.downgraded.take() {
                        if downgraded.is_blocking() && !downgraded.ptr_eq(latch) {
                            dependencies.push(downgraded);
                        }
                    }
                }
                state.downgraded = None;
                state.writer = Some(latch.clone());
            }
            Access::Read => {
                if let Some(writer) = state.writer.take() {
                    dependencies.push(writer.clone());
                    state.downgraded = Some(writer);
                } else if let Some(downgraded) = state.downgraded.as_ref() {
                    if downgraded.is_blocking() && !downgraded.ptr_eq(latch) {
                        dependencies.push(downgraded.clone());
                    }
                }
                state.readers.push(latch.clone());
            }
        }
        state.assert_exclusion();
        trace!(%latch, ?access, dependencies = dependencies.len(), "acquired");
        Acquisition::Acquired(dependencies, undo)
    }

    /// Puts the holders back; returns `true` if the entry was left empty and tombstoned.
    fn restore(&self, holders: Holders) -> bool {
        let mut state = self.state.lock();
        if state.removed {
            return false;
        }
        state.writer = holders.writer.filter(Latch::is_blocking);
        state.downgraded = holders.downgraded.filter(Latch::is_blocking);
        state.readers = holders.readers;
        state.readers.retain(Latch::is_blocking);
        state.assert_exclusion();
        if state.is_empty() {
            state.removed = true;
            return true;
        }
        false
    }

    fn drain(&self) -> Vec<Latch> {
        let mut state = self.state.lock();
        state.assert_exclusion();
        let mut dependencies: Vec<Latch> = state.readers.drain(..).collect();
        dependencies.extend(state.writer.take());
        dependencies.extend(state.downgraded.take());
        dependencies.retain(Latch::is_blocking);
        state.new_entry = false;
        state.removed = true;
        dependencies
    }

    fn release(&self, latch: &Latch) -> bool {
        let mut state = self.state.lock();
        if state.writer.as_ref().is_some_and(|w| w.ptr_eq(latch)) {
            state.writer = None;
        }
        if state.downgraded.as_ref().is_some_and(|d| d.ptr_eq(latch)) {
            state.downgraded = None;
        }
        state.readers.retain(|r| !r.ptr_eq(latch));
        if state.new_entry || state.removed || !state.is_empty() {
            return false;
        }
        state.removed = true;
        true
    }

    fn blockers(&self) -> Vec<Latch> {
        let state = self.state.lock();
        state.assert_exclusion();
        state
            .writer
            .iter()
            .chain(state.downgraded.iter())
            .chain(state.readers.iter())
            .filter(|l| l.is_blocking())
            .cloned()
            .collect()
    }
}

impl State {
    fn is_empty(&self) -> bool {
        self.writer.is_none() && self.downgraded.is_none() && self.readers.is_empty()
    }

    fn assert_exclusion(&self) {
        assert!(
            self.writer.is_none() || self.readers.is_empty(),
            "a key is held by a writer and readers at once"
        );
    }
}

#[cfg(test)]
impl<K: Clone + Eq + Hash> LockTable<K> {
    /// Inserts a tombstoned entry as if a release removed it concurrently.
    pub(crate) fn insert_removed(&self, key: K) {
        let entry = Entry::new();
        entry.state.lock().removed = true;
        drop(self.table.insert(key, Arc::new(entry)));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::TransactionId;
    use proptest::prelude::*;
    use static_assertions::assert_impl_all;
    use std::thread;

    assert_impl_all!(LockTable<u64>: Send, Sync);

    fn latch(sequence: u64) -> Latch {
        Latch::for_transaction(TransactionId::new(0, sequence))
    }

    #[test]
    fn write_after_write() {
        let lock_table = LockTable::new(4);
        let (t1, t2) = (latch(1), latch(2));
        assert!(lock_table.acquire_write(&1_u64, &t1).unwrap().is_empty());
        assert_eq!(lock_table.acquire_write(&1, &t2).unwrap(), vec![t1.clone()]);
        assert_eq!(lock_table.holders(&1), Some((Some(t2.clone()), Vec::new())));

        // `t1` no longer holds the key.
        assert!(!lock_table.release(&1, &t1));
        assert!(lock_table.release(&1, &t2));
        assert!(lock_table.is_empty());
    }

    #[test]
    fn read_write_interleaving() {
        let lock_table = LockTable::new(4);
        let (t1, t2, t3, t4) = (latch(1), latch(2), latch(3), latch(4));
        assert!(lock_table.acquire_write(&1_u64, &t1).unwrap().is_empty());
        assert_eq!(lock_table.acquire_read(&1, &t2).unwrap(), vec![t1.clone()]);

        // Readers do not wait for readers, but keep waiting for the displaced writer.
        assert_eq!(lock_table.acquire_read(&1, &t3).unwrap(), vec![t1.clone()]);
        assert_eq!(
            lock_table.holders(&1),
            Some((None, vec![t2.clone(), t3.clone()]))
        );

        let dependencies = lock_table.acquire_write(&1, &t4).unwrap();
        assert_eq!(dependencies.len(), 3);
        assert!(dependencies.contains(&t1));
        assert!(dependencies.contains(&t2));
        assert!(dependencies.contains(&t3));
    }

    #[test]
    fn downgraded_writer_expires() {
        let lock_table = LockTable::new(4);
        let (t1, t2, t3) = (latch(1), latch(2), latch(3));
        assert!(lock_table.acquire_write(&1_u64, &t1).unwrap().is_empty());
        assert_eq!(lock_table.acquire_read(&1, &t2).unwrap(), vec![t1.clone()]);
        assert!(t1.unblock());
        assert!(lock_table.acquire_read(&1, &t3).unwrap().is_empty());
    }

    #[test]
    fn same_transaction() {
        let lock_table = LockTable::new(4);
        let t1 = latch(1);
        assert!(lock_table.acquire_write(&1_u64, &t1).unwrap().is_empty());
        assert!(lock_table.acquire_read(&1, &t1).unwrap().is_empty());
        assert!(lock_table.acquire_write(&1, &t1).unwrap().is_empty());
        assert_eq!(lock_table.holders(&1), Some((Some(t1.clone()), Vec::new())));
        assert!(lock_table.release(&1, &t1));
    }

    #[test]
    fn clear() {
        let lock_table = LockTable::new(4);
        let (t1, t2, t3) = (latch(1), latch(2), latch(3));
        assert!(lock_table.acquire_write(&1_u64, &t1).unwrap().is_empty());
        assert!(lock_table.acquire_read(&2, &t2).unwrap().is_empty());
        assert!(lock_table.acquire_read(&2, &t3).unwrap().is_empty());
        let dependencies = lock_table.acquire_for_clear();
        assert_eq!(dependencies.len(), 3);
        assert!(lock_table.is_empty());

        // Late releases are no-ops.
        assert!(!lock_table.release(&1, &t1));
        assert!(!lock_table.release(&2, &t2));
        assert!(lock_table.is_empty());
    }

    #[test]
    fn state_transfer_snapshot() {
        let lock_table = LockTable::new(4);
        let (t1, t2) = (latch(1), latch(2));
        assert!(lock_table.collect_for_state_transfer().is_empty());
        assert!(lock_table.acquire_write(&1_u64, &t1).unwrap().is_empty());
        assert!(lock_table.acquire_read(&2, &t2).unwrap().is_empty());
        assert!(t2.unblock());
        assert_eq!(lock_table.collect_for_state_transfer(), vec![t1.clone()]);

        // Ownership is untouched.
        assert_eq!(lock_table.holders(&1), Some((Some(t1), Vec::new())));
    }

    #[test]
    fn removed_entry() {
        let lock_table = LockTable::new(4);
        let t1 = latch(1);
        let entry = Arc::new(Entry::new());
        assert!(matches!(
            entry.acquire(&t1, Access::Write),
            Acquisition::Acquired(..)
        ));
        assert!(entry.release(&t1));
        assert!(matches!(
            entry.acquire(&t1, Access::Read),
            Acquisition::Removed
        ));

        // A tombstoned entry left in the table is replaced.
        assert!(lock_table.table.insert(1_u64, entry).is_ok());
        let t2 = latch(2);
        assert!(lock_table.acquire_write(&1, &t2).unwrap().is_empty());
        assert_eq!(lock_table.holders(&1), Some((Some(t2), Vec::new())));
    }

    #[test]
    fn undo() {
        let lock_table = LockTable::new(1);
        let (t1, t2, t3, t4) = (latch(1), latch(2), latch(3), latch(4));
        assert!(lock_table.acquire_write(&1_u64, &t1).unwrap().is_empty());
        assert!(lock_table.acquire_read(&2, &t2).unwrap().is_empty());
        assert!(lock_table.acquire_read(&2, &t3).unwrap().is_empty());

        let (_, undo_1) = lock_table.acquire_undoable(&1, &t4, Access::Write).unwrap();
        let (_, undo_2) = lock_table.acquire_undoable(&2, &t4, Access::Write).unwrap();
        let (_, undo_3) = lock_table.acquire_undoable(&3, &t4, Access::Read).unwrap();
        lock_table.insert_removed(4);
        assert!(lock_table.acquire_write(&4, &t4).is_err());

        // `t3` finishes in the meantime.
        assert!(t3.unblock());
        assert!(!lock_table.release(&2, &t3));
        lock_table.undo(&1, &t4, undo_1);
        lock_table.undo(&2, &t4, undo_2);
        lock_table.undo(&3, &t4, undo_3);
        assert_eq!(lock_table.holders(&1), Some((Some(t1.clone()), Vec::new())));
        assert_eq!(lock_table.holders(&2), Some((None, vec![t2.clone()])));
        assert_eq!(lock_table.holders(&3), None);
        assert_eq!(lock_table.len(), 2);

        let t5 = latch(5);
        assert_eq!(lock_table.acquire_write(&1, &t5).unwrap(), vec![t1]);
        assert_eq!(lock_table.acquire_write(&2, &t5).unwrap(), vec![t2]);
    }

    #[test]
    fn new_entry_is_not_removed() {
        let entry = Entry::new();
        assert!(!entry.release(&latch(1)));
        assert!(matches!(
            entry.acquire(&latch(2), Access::Write),
            Acquisition::Acquired(..)
        ));
    }

    #[test]
    fn concurrent_release() {
        let num_threads = 8;
        let lock_table = Arc::new(LockTable::new(4));
        let latches: Vec<Latch> = (0..num_threads).map(latch).collect();
        for (i, l) in latches.iter().enumerate() {
            for k in 0..64_u64 {
                let _ = lock_table.acquire_read(&(k + i as u64 % 2), l).unwrap();
            }
        }
        let mut thread_handles = Vec::with_capacity(num_threads as usize);
        for l in latches {
            let lock_table_clone = lock_table.clone();
            thread_handles.push(thread::spawn(move || {
                l.unblock();
                for k in 0..65_u64 {
                    lock_table_clone.release(&k, &l);
                }
            }));
        }
        for handle in thread_handles {
            assert!(handle.join().is_ok());
        }
        assert!(lock_table.is_empty());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Write(usize, u8),
        Read(usize, u8),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6_usize, 0..4_u8).prop_map(|(t, k)| Op::Write(t, k)),
            (0..6_usize, 0..4_u8).prop_map(|(t, k)| Op::Read(t, k)),
            (0..6_usize).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn exclusion_and_order(ops in prop::collection::vec(op(), 1..64)) {
            let lock_table: LockTable<u8> = LockTable::new(4);
            let latches: Vec<Latch> = (0..6).map(latch).collect();
            let mut claimed: Vec<Vec<u8>> = vec![Vec::new(); 6];
            let mut written: Vec<Vec<u8>> = vec![Vec::new(); 6];
            for op in ops {
                match op {
                    Op::Write(t, k) => {
                        let previous = lock_table.holders(&k);
                        let dependencies = lock_table.acquire_write(&k, &latches[t]).unwrap();
                        if let Some((Some(writer), _)) = previous {
                            if !writer.ptr_eq(&latches[t]) {
                                prop_assert!(dependencies.contains(&writer));
                            }
                        }
                        claimed[t].push(k);
                        written[t].push(k);
                    }
                    Op::Read(t, k) => {
                        let previous = lock_table.holders(&k);
                        let dependencies = lock_table.acquire_read(&k, &latches[t]).unwrap();
                        if let Some((_, readers)) = previous {
                            // A reader is only waited for if it also wrote the key.
                            for reader in readers {
                                let r = latches.iter().position(|l| l.ptr_eq(&reader)).unwrap();
                                prop_assert!(!dependencies.contains(&reader) || written[r].contains(&k));
                            }
                        }
                        claimed[t].push(k);
                    }
                    Op::Release(t) => {
                        for k in claimed[t].drain(..) {
                            lock_table.release(&k, &latches[t]);
                        }
                        written[t].clear();
                    }
                }
                for k in 0..4_u8 {
                    if let Some((writer, readers)) = lock_table.holders(&k) {
                        prop_assert!(writer.is_none() || readers.is_empty());
                    }
                }
            }
            for (t, keys) in claimed.iter_mut().enumerate() {
                for k in keys.drain(..) {
                    lock_table.release(&k, &latches[t]);
                }
            }
            prop_assert!(lock_table.is_empty());
        }
    }
}
