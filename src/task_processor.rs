// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::{Config, Error};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// [`ReadyTask`] is a unit of work that may only run once it is ready.
pub trait ReadyTask: Send {
    /// Returns `true` if the task can run now.
    ///
    /// It must be cheap as it is evaluated on every re-scan, and once it returns `true` it should
    /// keep returning `true`.
    fn is_ready(&self) -> bool;

    /// Runs the task.
    fn run(self: Box<Self>);
}

/// The hook invoked when the [`TaskProcessor`] wakes up on its own and nothing is pending.
pub type IdleHook = Box<dyn Fn() + Send>;

/// [`TaskProcessor`] receives tasks from the delivery thread, holds them until they are ready, and
/// runs them on a bounded pool of worker threads.
///
/// Pending tasks are re-evaluated whenever [`TaskProcessor::check_for_ready_tasks`] is called, and
/// at least once per check interval.
#[derive(Debug)]
pub struct TaskProcessor {
    /// The dispatcher thread.
    dispatcher: Option<JoinHandle<()>>,

    /// The worker threads.
    workers: Vec<JoinHandle<()>>,

    /// The task sender.
    sender: SyncSender<Task>,

    /// The number of submitted tasks that have not finished.
    pending: Arc<AtomicUsize>,
}

/// [`ScanTrigger`] asks a [`TaskProcessor`] to re-scan its pending tasks.
#[derive(Clone, Debug)]
pub struct ScanTrigger {
    sender: SyncSender<Task>,
}

/// [`Task`] is sent to the dispatcher of a [`TaskProcessor`].
enum Task {
    /// The [`TaskProcessor`] is shutting down.
    Shutdown,

    /// A new task is submitted.
    Submit(Envelope),

    /// Pending tasks should be re-evaluated.
    ///
    /// This task is sent whenever a dependency of pending tasks may have been released.
    CheckForReadyTasks,
}

/// [`Envelope`] keeps the pending task counter accurate until the task is run or dropped.
struct Envelope {
    task: Box<dyn ReadyTask>,
    _guard: PendingGuard,
}

struct PendingGuard(Arc<AtomicUsize>);

impl TaskProcessor {
    /// Spawns a [`TaskProcessor`].
    ///
    /// # Errors
    ///
    /// Returns an [`Error`] if the configuration is invalid.
    ///
    /// # Examples
    ///
    /// ```
    /// use tocc::{Config, TaskProcessor};
    ///
    /// let task_processor = TaskProcessor::spawn(&Config::default(), None).unwrap();
    /// assert_eq!(task_processor.pending_tasks(), 0);
    /// ```
    pub fn spawn(config: &Config, idle_hook: Option<IdleHook>) -> Result<TaskProcessor, Error> {
        config.validate()?;
        let (sender, receiver) = mpsc::sync_channel::<Task>(config.queue_capacity);
        let (worker_sender, worker_receiver) = mpsc::channel::<Envelope>();
        let worker_receiver = Arc::new(Mutex::new(worker_receiver));
        let workers = (0..config.num_workers)
            .map(|_| {
                let worker_receiver = worker_receiver.clone();
                thread::spawn(move || Self::work(&worker_receiver))
            })
            .collect();
        let pending = Arc::new(AtomicUsize::new(0));
        let pending_clone = pending.clone();
        let check_interval = config.check_interval();
        let dispatcher = thread::spawn(move || {
            Self::dispatch(
                &receiver,
                &worker_sender,
                &pending_clone,
                check_interval,
                idle_hook.as_deref(),
            );
        });
        Ok(TaskProcessor {
            dispatcher: Some(dispatcher),
            workers,
            sender,
            pending,
        })
    }

    /// Submits a task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] if the [`TaskProcessor`] is shut down; the task is dropped.
    pub fn submit(&self, task: Box<dyn ReadyTask>) -> Result<(), Error> {
        self.pending.fetch_add(1, AcqRel);
        let envelope = Envelope {
            task,
            _guard: PendingGuard(self.pending.clone()),
        };
        self.sender
            .send(Task::Submit(envelope))
            .map_err(|_| Error::Shutdown)
    }

    /// Asks the [`TaskProcessor`] to re-scan pending tasks.
    ///
    /// Returns `false` if the request could not be sent. It is usually not a problem since it
    /// means that the send buffer is full, and therefore the dispatcher is guaranteed to re-scan
    /// afterwards.
    #[inline]
    pub fn check_for_ready_tasks(&self) -> bool {
        self.sender.try_send(Task::CheckForReadyTasks).is_ok()
    }

    /// Returns a [`ScanTrigger`] for the [`TaskProcessor`].
    #[inline]
    pub fn scan_trigger(&self) -> ScanTrigger {
        ScanTrigger {
            sender: self.sender.clone(),
        }
    }

    /// Returns the number of submitted tasks that have not finished.
    #[inline]
    pub fn pending_tasks(&self) -> usize {
        self.pending.load(Acquire)
    }

    /// Processes tasks.
    fn dispatch(
        receiver: &Receiver<Task>,
        worker_sender: &Sender<Envelope>,
        pending_counter: &AtomicUsize,
        check_interval: Duration,
        idle_hook: Option<&(dyn Fn() + Send)>,
    ) {
        let mut pending: VecDeque<Envelope> = VecDeque::new();
        'dispatcher: loop {
            let mut timed_out = false;
            match receiver.recv_timeout(check_interval) {
                Ok(Task::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(Task::Submit(envelope)) => pending.push_back(envelope),
                Ok(Task::CheckForReadyTasks) => (),
                Err(RecvTimeoutError::Timeout) => timed_out = true,
            }

            // Takes every queued task before scanning so that a burst of triggers results in a
            // single scan.
            loop {
                match receiver.try_recv() {
                    Ok(Task::Shutdown) | Err(TryRecvError::Disconnected) => break 'dispatcher,
                    Ok(Task::Submit(envelope)) => pending.push_back(envelope),
                    Ok(Task::CheckForReadyTasks) => (),
                    Err(TryRecvError::Empty) => break,
                }
            }

            Self::dispatch_ready(&mut pending, worker_sender);

            if timed_out && pending.is_empty() && pending_counter.load(Acquire) == 0 {
                if let Some(idle_hook) = idle_hook {
                    idle_hook();
                }
            }
        }
        info!(pending = pending.len(), "task processor shutting down");
    }

    /// Sends every ready task to the workers, keeping the order of the others.
    fn dispatch_ready(pending: &mut VecDeque<Envelope>, worker_sender: &Sender<Envelope>) {
        if pending.is_empty() {
            return;
        }
        let mut not_ready = VecDeque::with_capacity(pending.len());
        let mut num_dispatched = 0_usize;
        for envelope in pending.drain(..) {
            if envelope.task.is_ready() {
                num_dispatched += 1;
                if worker_sender.send(envelope).is_err() {
                    error!("no worker is available");
                }
            } else {
                not_ready.push_back(envelope);
            }
        }
        *pending = not_ready;
        if num_dispatched != 0 {
            debug!(
                dispatched = num_dispatched,
                pending = pending.len(),
                "dispatched ready tasks"
            );
        }
    }

    /// Runs tasks sent by the dispatcher until it is gone.
    fn work(receiver: &Mutex<Receiver<Envelope>>) {
        loop {
            let envelope = receiver.lock().recv();
            let Ok(Envelope { task, _guard }) = envelope else {
                break;
            };
            if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
                error!("a task panicked");
            }
        }
    }
}

impl Drop for TaskProcessor {
    #[inline]
    fn drop(&mut self) {
        drop(self.sender.send(Task::Shutdown));
        if let Some(dispatcher) = self.dispatcher.take() {
            drop(dispatcher.join());
        }
        for worker in self.workers.drain(..) {
            drop(worker.join());
        }
    }
}

impl ScanTrigger {
    /// Asks the [`TaskProcessor`] to re-scan pending tasks.
    ///
    /// Returns `false` if the request could not be sent; see
    /// [`TaskProcessor::check_for_ready_tasks`].
    #[inline]
    pub fn check_for_ready_tasks(&self) -> bool {
        self.sender.try_send(Task::CheckForReadyTasks).is_ok()
    }
}

impl Drop for PendingGuard {
    #[inline]
    fn drop(&mut self) {
        self.0.fetch_sub(1, AcqRel);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::Ordering::Release;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::mpsc::channel;
    use std::time::Instant;

    assert_impl_all!(ScanTrigger: Send, Sync, Clone);

    struct FlagTask {
        ready: Arc<AtomicBool>,
        done: Sender<usize>,
        id: usize,
    }

    impl ReadyTask for FlagTask {
        fn is_ready(&self) -> bool {
            self.ready.load(Acquire)
        }

        fn run(self: Box<Self>) {
            drop(self.done.send(self.id));
        }
    }

    struct PanickingTask;

    impl ReadyTask for PanickingTask {
        fn is_ready(&self) -> bool {
            true
        }

        fn run(self: Box<Self>) {
            panic!("intended");
        }
    }

    fn config() -> Config {
        Config::default()
            .with_num_workers(4)
            .with_check_interval(Duration::from_secs(3600))
    }

    #[test]
    fn gated_by_readiness() {
        let task_processor = TaskProcessor::spawn(&config(), None).unwrap();
        let (sender, receiver) = channel();
        let ready = Arc::new(AtomicBool::new(false));
        for id in 0..8 {
            assert!(task_processor
                .submit(Box::new(FlagTask {
                    ready: ready.clone(),
                    done: sender.clone(),
                    id,
                }))
                .is_ok());
        }
        assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(task_processor.pending_tasks(), 8);

        ready.store(true, Release);
        assert!(task_processor.scan_trigger().check_for_ready_tasks());
        let mut finished: Vec<usize> = (0..8)
            .map(|_| receiver.recv_timeout(Duration::from_secs(60)).unwrap())
            .collect();
        finished.sort_unstable();
        assert_eq!(finished, (0..8).collect::<Vec<_>>());

        let deadline = Instant::now() + Duration::from_secs(60);
        while task_processor.pending_tasks() != 0 && Instant::now() < deadline {
            thread::yield_now();
        }
        assert_eq!(task_processor.pending_tasks(), 0);
    }

    #[test]
    fn periodic_scan() {
        let config = config().with_check_interval(Duration::from_millis(5));
        let task_processor = TaskProcessor::spawn(&config, None).unwrap();
        let (sender, receiver) = channel();
        let ready = Arc::new(AtomicBool::new(false));
        assert!(task_processor
            .submit(Box::new(FlagTask {
                ready: ready.clone(),
                done: sender,
                id: 11,
            }))
            .is_ok());
        ready.store(true, Release);
        assert_eq!(receiver.recv_timeout(Duration::from_secs(60)), Ok(11));
    }

    #[test]
    fn panicking_task() {
        let task_processor = TaskProcessor::spawn(&config().with_num_workers(1), None).unwrap();
        assert!(task_processor.submit(Box::new(PanickingTask)).is_ok());
        let (sender, receiver) = channel();
        assert!(task_processor
            .submit(Box::new(FlagTask {
                ready: Arc::new(AtomicBool::new(true)),
                done: sender,
                id: 1,
            }))
            .is_ok());
        assert_eq!(receiver.recv_timeout(Duration::from_secs(60)), Ok(1));
    }

    #[test]
    fn idle_hook() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let config = config().with_check_interval(Duration::from_millis(1));
        let task_processor = TaskProcessor::spawn(
            &config,
            Some(Box::new(move || {
                counter_clone.fetch_add(1, AcqRel);
            })),
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(60);
        while counter.load(Acquire) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_ne!(counter.load(Acquire), 0);
        drop(task_processor);
    }

    #[test]
    fn shutdown_drops_pending_tasks() {
        let task_processor = TaskProcessor::spawn(&config(), None).unwrap();
        let (sender, receiver) = channel();
        assert!(task_processor
            .submit(Box::new(FlagTask {
                ready: Arc::new(AtomicBool::new(false)),
                done: sender,
                id: 0,
            }))
            .is_ok());
        let trigger = task_processor.scan_trigger();
        drop(task_processor);
        assert!(receiver.recv_timeout(Duration::from_millis(10)).is_err());
        assert!(!trigger.check_for_ready_tasks());
    }
}
