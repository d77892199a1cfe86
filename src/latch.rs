// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::command::{Epoch, TransactionId};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// [`Latch`] is a single-use signal representing an unfinished job.
///
/// A [`Latch`] is created blocked, and it is unblocked at most once. Cloning a [`Latch`] yields
/// another handle to the same signal; the signal is dropped when the last handle is dropped.
#[derive(Clone)]
pub struct Latch(Arc<Inner>);

/// The job that a [`Latch`] represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Owner {
    /// A transaction being certified.
    Transaction(TransactionId),

    /// A rebalance transferring state.
    Rebalance(Epoch),
}

/// [`LatchWait`] is a [`Future`] that resolves once the [`Latch`] is unblocked.
#[derive(Debug)]
pub struct LatchWait<'l> {
    latch: &'l Latch,
}

struct Inner {
    /// Process-unique identifier.
    id: u64,

    /// The job represented by the latch.
    owner: Owner,

    /// `true` until unblocked.
    blocked: AtomicBool,

    /// [`Waker`] instances of asynchronous waiters, one for each task.
    waiters: Mutex<Vec<Waker>>,

    /// Signalled when unblocked.
    unblocked: Condvar,
}

/// Latch identifiers start from `1`.
static NEXT_LATCH_ID: AtomicU64 = AtomicU64::new(1);

impl Latch {
    /// Creates a blocked [`Latch`] owned by a transaction.
    ///
    /// # Examples
    ///
    /// ```
    /// use tocc::{Latch, TransactionId};
    ///
    /// let latch = Latch::for_transaction(TransactionId::new(1, 1));
    /// assert!(latch.is_blocking());
    /// assert!(latch.unblock());
    /// assert!(!latch.is_blocking());
    /// assert!(!latch.unblock());
    /// ```
    #[inline]
    #[must_use]
    pub fn for_transaction(id: TransactionId) -> Latch {
        Self::new(Owner::Transaction(id))
    }

    /// Creates a blocked [`Latch`] owned by a rebalance.
    #[inline]
    #[must_use]
    pub fn for_rebalance(epoch: Epoch) -> Latch {
        Self::new(Owner::Rebalance(epoch))
    }

    /// Returns the identifier of the [`Latch`].
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Returns the owner of the [`Latch`].
    #[inline]
    pub fn owner(&self) -> Owner {
        self.0.owner
    }

    /// Returns `true` if the [`Latch`] has not been unblocked.
    #[inline]
    pub fn is_blocking(&self) -> bool {
        self.0.blocked.load(Acquire)
    }

    /// Unblocks the [`Latch`] and wakes up every waiter.
    ///
    /// Returns `false` if the [`Latch`] had already been unblocked, in which case nothing
    /// happens.
    #[inline]
    pub fn unblock(&self) -> bool {
        if self.0.blocked.swap(false, AcqRel) {
            self.wake_up();
            true
        } else {
            false
        }
    }

    /// Waits for the [`Latch`] to be unblocked.
    ///
    /// # Examples
    ///
    /// ```
    /// use tocc::{Latch, TransactionId};
    ///
    /// let latch = Latch::for_transaction(TransactionId::new(1, 1));
    /// latch.unblock();
    /// futures::executor::block_on(latch.wait());
    /// ```
    #[inline]
    pub fn wait(&self) -> LatchWait<'_> {
        LatchWait { latch: self }
    }

    /// Blocks the current thread until the [`Latch`] is unblocked or the timeout expires.
    ///
    /// Returns `true` if the [`Latch`] was unblocked.
    #[inline]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if !self.is_blocking() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut waiters = self.0.waiters.lock();
        while self.is_blocking() {
            if self.0.unblocked.wait_until(&mut waiters, deadline).timed_out() {
                return !self.is_blocking();
            }
        }
        true
    }

    /// Returns `true` if both refer to the same signal.
    #[inline]
    pub fn ptr_eq(&self, other: &Latch) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn new(owner: Owner) -> Latch {
        Latch(Arc::new(Inner {
            id: NEXT_LATCH_ID.fetch_add(1, Relaxed),
            owner,
            blocked: AtomicBool::new(true),
            waiters: Mutex::new(Vec::new()),
            unblocked: Condvar::new(),
        }))
    }

    /// Wakes up every waiter.
    fn wake_up(&self) {
        let waiters = {
            let mut waiters = self.0.waiters.lock();
            self.0.unblocked.notify_all();
            std::mem::take(&mut *waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }
}

impl fmt::Debug for Latch {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch")
            .field("id", &self.0.id)
            .field("owner", &self.0.owner)
            .field("blocked", &self.is_blocking())
            .finish()
    }
}

impl fmt::Display for Latch {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.owner {
            Owner::Transaction(id) => write!(f, "latch#{}(tx {id})", self.0.id),
            Owner::Rebalance(epoch) => write!(f, "latch#{}(rebalance {epoch})", self.0.id),
        }
    }
}

impl PartialEq for Latch {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Latch {}

impl Hash for Latch {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl<'l> Future for LatchWait<'l> {
    type Output = ();

    #[inline]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.latch.is_blocking() {
            return Poll::Ready(());
        }
        // Checked again under the lock that `unblock` takes before waking waiters up.
        let mut waiters = self.latch.0.waiters.lock();
        if !self.latch.is_blocking() {
            return Poll::Ready(());
        }
        if !waiters.iter().any(|w| w.will_wake(cx.waker())) {
            waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::collections::HashSet;
    use std::thread;
    use tokio::sync::Barrier;

    assert_impl_all!(Latch: Send, Sync, Clone);

    #[test]
    fn unblock_once() {
        let latch = Latch::for_transaction(TransactionId::new(0, 1));
        let clone = latch.clone();
        assert_eq!(latch, clone);
        assert!(clone.unblock());
        assert!(!latch.is_blocking());
        assert!(!latch.unblock());
        assert!(!clone.unblock());
    }

    #[test]
    fn identity() {
        let first = Latch::for_transaction(TransactionId::new(0, 1));
        let second = Latch::for_transaction(TransactionId::new(0, 1));
        assert_ne!(first, second);
        assert_ne!(first.id(), second.id());
        let set: HashSet<Latch> = [first.clone(), first.clone(), second].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(Latch::for_rebalance(7).owner(), Owner::Rebalance(7));
        assert!(Latch::for_rebalance(7).to_string().ends_with("(rebalance 7)"));
    }

    #[test]
    fn wait_timeout() {
        let latch = Latch::for_rebalance(1);
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        let latch_clone = latch.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            assert!(latch_clone.unblock());
        });
        assert!(latch.wait_timeout(Duration::from_secs(60)));
        assert!(handle.join().is_ok());
    }

    #[test]
    fn repeated_waits() {
        let latch = Latch::for_rebalance(1);
        for _ in 0..4 {
            assert!(!latch.wait_timeout(Duration::from_millis(1)));
        }
        assert!(latch.0.waiters.lock().is_empty());

        let mut wait = latch.wait();
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        for _ in 0..4 {
            assert!(Pin::new(&mut wait).poll(&mut cx).is_pending());
        }
        assert_eq!(latch.0.waiters.lock().len(), 1);
        assert!(latch.unblock());
        assert!(latch.0.waiters.lock().is_empty());
        assert!(Pin::new(&mut wait).poll(&mut cx).is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn wait() {
        let num_tasks = 8;
        let latch = Latch::for_transaction(TransactionId::new(1, 1));
        let barrier = Arc::new(Barrier::new(num_tasks + 1));
        let mut task_handles = Vec::with_capacity(num_tasks);
        for _ in 0..num_tasks {
            let latch_clone = latch.clone();
            let barrier_clone = barrier.clone();
            task_handles.push(tokio::spawn(async move {
                barrier_clone.wait().await;
                latch_clone.wait().await;
                assert!(!latch_clone.is_blocking());
            }));
        }
        barrier.wait().await;
        assert!(latch.unblock());
        for r in futures::future::join_all(task_handles).await {
            assert!(r.is_ok());
        }
    }
}
