// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::command::{TransactionId, Version};
use super::Error;
use parking_lot::{Condvar, Mutex};
use scc::Bag;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// The outcome of a certification step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The transaction was committed with the version.
    Committed(Version),

    /// The transaction was certified with the version, and waits for the second phase.
    Prepared(Version),

    /// The transaction was rolled back.
    RolledBack,
}

/// [`PendingCertification`] is the result of a certification step that may not have finished
/// yet.
///
/// It can be awaited, polled with [`PendingCertification::try_outcome`], or waited for
/// synchronously with [`PendingCertification::wait_timeout`]. A certification conflict is reported
/// as [`Error::Conflict`].
#[derive(Clone)]
pub struct PendingCertification(Arc<Inner>);

struct Inner {
    id: TransactionId,
    outcome: Mutex<Option<Result<Outcome, Error>>>,
    completed: Condvar,
    waiters: Bag<Waker>,
}

impl PendingCertification {
    /// Returns the identifier of the transaction.
    #[inline]
    pub fn id(&self) -> TransactionId {
        self.0.id
    }

    /// Returns the outcome if available.
    #[inline]
    pub fn try_outcome(&self) -> Option<Result<Outcome, Error>> {
        self.0.outcome.lock().clone()
    }

    /// Blocks the current thread until the outcome is available or the timeout expires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the outcome was not available in time, otherwise the
    /// certification result.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Outcome, Error> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.0.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            if self.0.completed.wait_until(&mut outcome, deadline).timed_out() {
                return outcome.clone().unwrap_or(Err(Error::Timeout));
            }
        }
    }

    pub(crate) fn new(id: TransactionId) -> PendingCertification {
        PendingCertification(Arc::new(Inner {
            id,
            outcome: Mutex::new(None),
            completed: Condvar::new(),
            waiters: Bag::new(),
        }))
    }

    /// Sets the outcome.
    ///
    /// Returns `false` if the outcome had already been set; the first outcome is kept.
    pub(crate) fn complete(&self, result: Result<Outcome, Error>) -> bool {
        {
            let mut outcome = self.0.outcome.lock();
            if outcome.is_some() {
                return false;
            }
            *outcome = Some(result);
            self.0.completed.notify_all();
        }
        while let Some(waker) = self.0.waiters.pop() {
            waker.wake();
        }
        true
    }
}

impl fmt::Debug for PendingCertification {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCertification")
            .field("id", &self.0.id)
            .field("outcome", &self.try_outcome())
            .finish()
    }
}

impl Future for PendingCertification {
    type Output = Result<Outcome, Error>;

    #[inline]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = self.0.outcome.lock();
        if let Some(result) = outcome.as_ref() {
            return Poll::Ready(result.clone());
        }
        // Pushed under the lock so that `complete` cannot miss it.
        self.0.waiters.push(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::thread;

    assert_impl_all!(PendingCertification: Send, Sync, Unpin);

    #[test]
    fn complete_once() {
        let pending = PendingCertification::new(TransactionId::new(1, 1));
        assert_eq!(pending.try_outcome(), None);
        assert!(pending.complete(Ok(Outcome::Committed(3))));
        assert!(!pending.complete(Err(Error::Conflict)));
        assert_eq!(pending.try_outcome(), Some(Ok(Outcome::Committed(3))));
        assert_eq!(
            pending.wait_timeout(Duration::ZERO),
            Ok(Outcome::Committed(3))
        );
    }

    #[test]
    fn wait_timeout() {
        let pending = PendingCertification::new(TransactionId::new(1, 2));
        assert_eq!(
            pending.wait_timeout(Duration::from_millis(1)),
            Err(Error::Timeout)
        );
        let pending_clone = pending.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            pending_clone.complete(Err(Error::Conflict));
        });
        assert_eq!(
            pending.wait_timeout(Duration::from_secs(60)),
            Err(Error::Conflict)
        );
        assert!(handle.join().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn await_outcome() {
        let pending = PendingCertification::new(TransactionId::new(1, 3));
        let mut task_handles = Vec::new();
        for _ in 0..4 {
            let pending_clone = pending.clone();
            task_handles.push(tokio::spawn(async move { pending_clone.await }));
        }
        tokio::task::yield_now().await;
        assert!(pending.complete(Ok(Outcome::RolledBack)));
        for r in futures::future::join_all(task_handles).await {
            assert_eq!(r.ok(), Some(Ok(Outcome::RolledBack)));
        }
    }
}
