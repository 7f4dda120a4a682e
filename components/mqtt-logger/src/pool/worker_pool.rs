// Local crates
use crate::metrics::metrics::{
    QUEUE_DEPTH, TASK_DURATION_SECONDS, TASKS_COMPLETED_TOTAL, TASKS_DISCARDED_TOTAL,
    TASKS_ENQUEUED_TOTAL, TASKS_PANICKED_TOTAL, TASKS_REJECTED_TOTAL, observe_duration,
};

// External crates
use serde::Deserialize;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

/// A unit of deferred work executed by exactly one executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// What `enqueue` does once a bounded queue is full.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Refuse the task and return [`EnqueueError::QueueFull`].
    #[default]
    Reject,
    /// Wait on the caller's thread until an executor frees a slot.
    Block,
}

/// Capacity bound of the task queue. The default is unbounded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Maximum number of queued, not yet started tasks. `None` means unbounded.
    pub max_depth: Option<NonZeroUsize>,
    /// Behaviour once `max_depth` is reached.
    pub overflow: OverflowPolicy,
}

impl QueueLimits {
    /// No capacity bound, `enqueue` always succeeds while the pool runs.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Bound the queue at `max_depth` queued tasks.
    #[must_use]
    pub fn bounded(max_depth: NonZeroUsize, overflow: OverflowPolicy) -> Self {
        Self {
            max_depth: Some(max_depth),
            overflow,
        }
    }
}

/// Errors raised while building the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The OS refused to start an executor thread.
    #[error("failed to spawn executor thread {index}: {source}")]
    Spawn {
        /// Index of the executor that failed to start.
        index: usize,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a task was not accepted by [`WorkerPool::enqueue`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// `shutdown()` has been invoked, the task is dropped.
    #[error("worker pool is stopping, task dropped")]
    Stopped,
    /// The bounded queue is full and the overflow policy is `reject`.
    #[error("task queue is full ({depth} tasks pending), task rejected")]
    QueueFull {
        /// Queue depth at the time of rejection.
        depth: usize,
    },
}

struct QueueState {
    tasks: VecDeque<Job>,
    stopping: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    /// Signalled when a task is pushed or the pool stops.
    available: Condvar,
    /// Signalled when a task is popped or the pool stops. Used by the `block` policy.
    space: Condvar,
    limits: QueueLimits,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Jobs run outside the lock, so a poisoned guard still holds a consistent queue.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-size pool of executor threads draining one shared FIFO queue.
///
/// - Tasks are popped in the order they were enqueued, but with more than one
///   executor they may complete in any order.
/// - A popped task always runs to completion on its executor.
/// - On [`WorkerPool::shutdown`] queued tasks that no executor has started are
///   discarded, not drained.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("pending", &self.pending())
            .field("stopping", &self.is_stopping())
            .field("limits", &self.shared.limits)
            .finish()
    }
}

impl WorkerPool {
    /// Start `worker_count` executors on an unbounded queue.
    pub fn new(worker_count: NonZeroUsize) -> Result<Self, PoolError> {
        Self::with_limits(worker_count, QueueLimits::unbounded())
    }

    /// Start `worker_count` executors with the given queue bound.
    #[instrument(
        name = "worker_pool::start",
        target = "pool::worker_pool",
        level = "debug",
        skip(limits)
    )]
    pub fn with_limits(worker_count: NonZeroUsize, limits: QueueLimits) -> Result<Self, PoolError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                stopping: false,
            }),
            available: Condvar::new(),
            space: Condvar::new(),
            limits,
        });

        let pool = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(worker_count.get())),
            worker_count: worker_count.get(),
        };

        for index in 0..worker_count.get() {
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("mqtt-worker-{index}"))
                .spawn(move || executor_loop(index, &shared));

            match spawned {
                Ok(handle) => pool.lock_workers().push(handle),
                Err(source) => {
                    tracing::error!(executor = index, error = %source, "Failed to spawn executor");
                    // Stop the executors that did start before reporting.
                    pool.shutdown();
                    return Err(PoolError::Spawn { index, source });
                }
            }
        }

        tracing::debug!(
            workers = worker_count.get(),
            max_queue_depth = ?limits.max_depth,
            overflow_policy = ?limits.overflow,
            "Worker pool started"
        );
        Ok(pool)
    }

    /// Append `task` to the tail of the queue and wake one idle executor.
    ///
    /// Never waits for a task to finish. With the `block` overflow policy and a
    /// full queue it waits for a free slot instead of failing.
    pub fn enqueue<F>(&self, task: F) -> Result<(), EnqueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();

        if let Some(max_depth) = self.shared.limits.max_depth {
            while !state.stopping && state.tasks.len() >= max_depth.get() {
                match self.shared.limits.overflow {
                    OverflowPolicy::Reject => {
                        TASKS_REJECTED_TOTAL.inc();
                        return Err(EnqueueError::QueueFull {
                            depth: state.tasks.len(),
                        });
                    }
                    OverflowPolicy::Block => {
                        state = self
                            .shared
                            .space
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
            }
        }

        if state.stopping {
            TASKS_REJECTED_TOTAL.inc();
            return Err(EnqueueError::Stopped);
        }

        state.tasks.push_back(Box::new(task));
        QUEUE_DEPTH.set(state.tasks.len() as i64);
        drop(state);

        TASKS_ENQUEUED_TOTAL.inc();
        self.shared.available.notify_one();
        Ok(())
    }

    /// Refuse further tasks and wake everything waiting on the queue,
    /// including callers blocked in `enqueue`, without joining executors.
    ///
    /// Never blocks beyond the queue lock. [`WorkerPool::shutdown`] still has
    /// to be called to join executors and discard the queue.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            state.stopping = true;
        }
        self.shared.available.notify_all();
        self.shared.space.notify_all();
    }

    /// Stop the pool: wake every executor, wait for in-flight tasks and
    /// discard whatever is still queued.
    ///
    /// Returns the number of discarded tasks. Calling it again is a no-op
    /// returning zero.
    #[instrument(
        name = "worker_pool::shutdown",
        target = "pool::worker_pool",
        level = "debug",
        skip(self)
    )]
    pub fn shutdown(&self) -> usize {
        self.close();

        // Held until the queue is cleared: concurrent callers return only
        // once every executor is gone. Taking the handles makes later calls
        // skip the joins.
        let mut workers = self.lock_workers();
        let handles = std::mem::take(&mut *workers);
        let joined = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Executor thread terminated abnormally");
            }
        }

        let discarded = {
            let mut state = self.shared.lock();
            let discarded = state.tasks.len();
            state.tasks.clear();
            QUEUE_DEPTH.set(0);
            discarded
        };
        drop(workers);

        if joined > 0 {
            TASKS_DISCARDED_TOTAL.inc_by(discarded as u64);
            tracing::debug!(
                executors_joined = joined,
                discarded_tasks = discarded,
                "Worker pool stopped"
            );
        }
        discarded
    }

    /// Number of executors the pool was built with.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Number of queued tasks no executor has started yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Whether `shutdown()` has been invoked.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shared.lock().stopping
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn executor_loop(index: usize, shared: &Shared) {
    tracing::trace!(executor = index, "Executor started");

    loop {
        let job = {
            let mut state = shared.lock();
            while state.tasks.is_empty() && !state.stopping {
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if state.stopping {
                break;
            }
            let Some(job) = state.tasks.pop_front() else {
                continue;
            };
            QUEUE_DEPTH.set(state.tasks.len() as i64);
            job
        };
        shared.space.notify_one();

        let start = Instant::now();
        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(()) => TASKS_COMPLETED_TOTAL.inc(),
            Err(payload) => {
                TASKS_PANICKED_TOTAL.inc();
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(executor = index, reason = %reason, "Task panicked, executor continues");
            }
        }
        observe_duration(&TASK_DURATION_SECONDS, start);
    }

    tracing::trace!(executor = index, "Executor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn workers(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero worker count")
    }

    #[test]
    fn every_task_enqueued_before_shutdown_runs_once() {
        let pool = WorkerPool::new(workers(4)).expect("pool starts");
        let (tx, rx) = mpsc::channel();
        let total = 200;

        for id in 0..total {
            let tx = tx.clone();
            pool.enqueue(move || tx.send(id).expect("send id"))
                .expect("enqueue while running");
        }

        let mut seen = HashSet::new();
        for _ in 0..total {
            let id = rx
                .recv_timeout(Duration::from_secs(5))
                .expect("task executed");
            assert!(seen.insert(id), "task {id} ran twice");
        }
        assert_eq!(pool.shutdown(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn enqueue_after_shutdown_is_refused() {
        let pool = WorkerPool::new(workers(2)).expect("pool starts");
        pool.shutdown();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let result = pool.enqueue(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(result, Err(EnqueueError::Stopped));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn shutdown_twice_joins_once() {
        let pool = WorkerPool::new(workers(3)).expect("pool starts");
        assert_eq!(pool.shutdown(), 0);
        assert_eq!(pool.shutdown(), 0);
        assert!(pool.is_stopping());
    }

    #[test]
    fn concurrent_shutdown_from_two_threads() {
        let pool = Arc::new(WorkerPool::new(workers(4)).expect("pool starts"));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.shutdown())
            })
            .collect();
        for handle in handles {
            handle.join().expect("shutdown thread panicked");
        }
        assert!(pool.is_stopping());
    }

    #[test]
    fn single_executor_never_interleaves_tasks() {
        let pool = WorkerPool::new(workers(1)).expect("pool starts");
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..20 {
            let active = Arc::clone(&active);
            let overlaps = Arc::clone(&overlaps);
            let tx = tx.clone();
            pool.enqueue(move || {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(2));
                active.fetch_sub(1, Ordering::SeqCst);
                tx.send(()).expect("send done");
            })
            .expect("enqueue");
        }

        for _ in 0..20 {
            rx.recv_timeout(Duration::from_secs(5)).expect("task done");
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn single_executor_preserves_enqueue_order() {
        let pool = WorkerPool::new(workers(1)).expect("pool starts");
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        for id in 0..50 {
            let order = Arc::clone(&order);
            let tx = tx.clone();
            pool.enqueue(move || {
                order.lock().expect("order lock").push(id);
                tx.send(()).expect("send done");
            })
            .expect("enqueue");
        }
        for _ in 0..50 {
            rx.recv_timeout(Duration::from_secs(5)).expect("task done");
        }

        let order = order.lock().expect("order lock");
        assert_eq!(*order, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn enqueue_does_not_wait_for_busy_executors() {
        let pool = WorkerPool::new(workers(2)).expect("pool starts");
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Arc::new(Mutex::new(gate_rx));
        let (started_tx, started_rx) = mpsc::channel();

        for _ in 0..2 {
            let gate_rx = Arc::clone(&gate_rx);
            let started_tx = started_tx.clone();
            pool.enqueue(move || {
                started_tx.send(()).expect("started");
                let _ = gate_rx.lock().expect("gate lock").recv();
            })
            .expect("enqueue blocker");
        }
        for _ in 0..2 {
            started_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("blocker started");
        }

        let start = Instant::now();
        for _ in 0..1_000 {
            pool.enqueue(|| {}).expect("enqueue under load");
        }
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.pending(), 1_000);

        drop(gate_tx);
        pool.shutdown();
    }

    #[test]
    fn shutdown_discards_queued_tasks_and_finishes_in_flight_ones() {
        let pool = Arc::new(WorkerPool::new(workers(4)).expect("pool starts"));
        let executed = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Arc::new(Mutex::new(gate_rx));
        let (started_tx, started_rx) = mpsc::channel();

        for _ in 0..50 {
            let executed = Arc::clone(&executed);
            let gate_rx = Arc::clone(&gate_rx);
            let started_tx = started_tx.clone();
            pool.enqueue(move || {
                let _ = started_tx.send(());
                let _ = gate_rx.lock().expect("gate lock").recv();
                executed.fetch_add(1, Ordering::SeqCst);
            })
            .expect("enqueue");
        }
        for _ in 0..4 {
            started_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("executor picked up a task");
        }

        let stopper = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.shutdown())
        };
        while !pool.is_stopping() {
            thread::sleep(Duration::from_millis(1));
        }
        // Release the four in-flight tasks.
        drop(gate_tx);

        let discarded = stopper.join().expect("shutdown thread panicked");
        assert_eq!(executed.load(Ordering::SeqCst), 4);
        assert_eq!(discarded, 46);
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn panicking_task_does_not_kill_executor() {
        let pool = WorkerPool::new(workers(1)).expect("pool starts");
        let (tx, rx) = mpsc::channel();

        pool.enqueue(|| panic!("task failure")).expect("enqueue");
        pool.enqueue(move || tx.send(42).expect("send"))
            .expect("enqueue");

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(42));
    }

    #[test]
    fn bounded_queue_rejects_when_full() {
        let limits = QueueLimits::bounded(workers(2), OverflowPolicy::Reject);
        let pool = WorkerPool::with_limits(workers(1), limits).expect("pool starts");
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();

        pool.enqueue(move || {
            started_tx.send(()).expect("started");
            let _ = gate_rx.recv();
        })
        .expect("enqueue blocker");
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("blocker started");

        pool.enqueue(|| {}).expect("first slot");
        pool.enqueue(|| {}).expect("second slot");
        assert_eq!(
            pool.enqueue(|| {}),
            Err(EnqueueError::QueueFull { depth: 2 })
        );

        drop(gate_tx);
        pool.shutdown();
    }

    #[test]
    fn bounded_queue_blocks_until_space_frees() {
        let limits = QueueLimits::bounded(workers(1), OverflowPolicy::Block);
        let pool = Arc::new(WorkerPool::with_limits(workers(1), limits).expect("pool starts"));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        pool.enqueue(move || {
            started_tx.send(()).expect("started");
            let _ = gate_rx.recv();
        })
        .expect("enqueue blocker");
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("blocker started");
        pool.enqueue(|| {}).expect("fill the only slot");

        let producer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                pool.enqueue(move || done_tx.send(()).expect("done"))
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished(), "enqueue should wait for space");

        drop(gate_tx);
        assert_eq!(producer.join().expect("producer panicked"), Ok(()));
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("blocked task eventually runs");
        pool.shutdown();
    }

    #[test]
    fn blocked_enqueue_is_released_by_shutdown() {
        let limits = QueueLimits::bounded(workers(1), OverflowPolicy::Block);
        let pool = Arc::new(WorkerPool::with_limits(workers(1), limits).expect("pool starts"));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();

        pool.enqueue(move || {
            started_tx.send(()).expect("started");
            let _ = gate_rx.recv();
        })
        .expect("enqueue blocker");
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("blocker started");
        pool.enqueue(|| {}).expect("fill the only slot");

        let producer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.enqueue(|| {}))
        };
        thread::sleep(Duration::from_millis(20));

        let stopper = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.shutdown())
        };
        while !pool.is_stopping() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(
            producer.join().expect("producer panicked"),
            Err(EnqueueError::Stopped)
        );
        drop(gate_tx);
        stopper.join().expect("stopper panicked");
    }

    #[test]
    fn close_releases_blocked_enqueue_while_an_executor_is_stuck() {
        let limits = QueueLimits::bounded(workers(1), OverflowPolicy::Block);
        let pool = Arc::new(WorkerPool::with_limits(workers(1), limits).expect("pool starts"));
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();

        pool.enqueue(move || {
            started_tx.send(()).expect("started");
            let _ = gate_rx.recv();
        })
        .expect("enqueue stuck task");
        started_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("stuck task started");
        pool.enqueue(|| {}).expect("fill the only slot");

        let (result_tx, result_rx) = mpsc::channel();
        let producer = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || result_tx.send(pool.enqueue(|| {})).expect("send result"))
        };
        thread::sleep(Duration::from_millis(20));

        // The executor is still stuck, yet close returns and frees the producer.
        pool.close();
        assert_eq!(
            result_rx
                .recv_timeout(Duration::from_secs(2))
                .expect("blocked enqueue released"),
            Err(EnqueueError::Stopped)
        );
        producer.join().expect("producer panicked");

        drop(gate_tx);
        assert_eq!(pool.shutdown(), 1);
    }
}
