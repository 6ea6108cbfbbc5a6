// logtail - app/scheduler.rs
//
// Cooperative periodic-task scheduler.
//
// Every pipeline stage registers one periodic callback ("tick"). Guarantees:
//   - a task's callback never runs concurrently with itself; if its period
//     elapses while a previous run is still in progress, that run is skipped;
//   - `unregister` blocks until an in-flight run of that task completes,
//     except when called from inside the task's own callback;
//   - errors and panics from a callback are logged and swallowed; the task
//     keeps running on later periods;
//   - a task has at most one pending job on the worker pool, and dropping a
//     `ThreadScheduler` waits for jobs already handed to the pool.
//
// Two interchangeable implementations:
//   - `ThreadScheduler`: a timer thread dispatches due tasks onto a rayon
//     worker pool;
//   - `ManualScheduler`: `run_once()` runs every task once on the calling
//     thread, in registration order. Used by tests and `--once`.

use crate::util::error::{Result, SchedulerError};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::util::constants::SCHEDULER_MAX_IDLE_MS;

/// A periodic callback.
pub type TaskCallback = Box<dyn FnMut() -> Result<()> + Send>;

/// Identifies one registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

/// Common interface of both scheduler implementations.
pub trait TaskScheduler: Send + Sync {
    /// Register `callback` to run every `period`, starting as soon as
    /// possible.
    fn register(&self, name: &str, period: Duration, callback: TaskCallback) -> TaskHandle;

    /// Stop a task. Blocks until any in-flight run of it has returned.
    /// Returns false if the handle is unknown or already unregistered.
    fn unregister(&self, handle: TaskHandle) -> bool;

    /// Number of currently registered tasks.
    fn active_task_count(&self) -> usize;
}

// =============================================================================
// Task
// =============================================================================

struct Task {
    id: u64,
    name: String,
    period: Duration,
    callback: Mutex<TaskCallback>,
    removed: AtomicBool,
    /// A job for this task sits on the worker pool (ThreadScheduler only).
    queued: AtomicBool,
    /// Thread currently executing the callback, if any.
    running_on: Mutex<Option<ThreadId>>,
    next_due: Mutex<Instant>,
}

impl Task {
    fn new(id: u64, name: &str, period: Duration, callback: TaskCallback) -> Self {
        Self {
            id,
            name: name.to_string(),
            period,
            callback: Mutex::new(callback),
            removed: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            running_on: Mutex::new(None),
            next_due: Mutex::new(Instant::now()),
        }
    }

    /// Run the callback once, unless it is already running or was removed.
    fn run(&self) {
        if self.removed.load(Ordering::Acquire) {
            return;
        }
        let Some(mut callback) = self.callback.try_lock() else {
            tracing::trace!(task = %self.name, "Previous run still in progress; skipped");
            return;
        };
        if self.removed.load(Ordering::Acquire) {
            return;
        }
        *self.running_on.lock() = Some(std::thread::current().id());
        let outcome = catch_unwind(AssertUnwindSafe(|| (&mut **callback)()));
        *self.running_on.lock() = None;
        drop(callback);

        let fault = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => SchedulerError::CallbackFault {
                task: self.name.clone(),
                source: Box::new(e),
            },
            Err(payload) => SchedulerError::Panicked {
                task: self.name.clone(),
                message: panic_message(payload.as_ref()),
            },
        };
        tracing::warn!(task = %self.name, error = %fault, "Periodic task fault");
    }

    /// Mark removed and wait out an in-flight run on another thread.
    fn retire(&self) {
        self.removed.store(true, Ordering::Release);
        if *self.running_on.lock() == Some(std::thread::current().id()) {
            tracing::debug!(task = %self.name, "Task unregistered from its own callback");
            return;
        }
        drop(self.callback.lock());
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Registered tasks, in registration order.
#[derive(Default)]
struct TaskTable {
    tasks: Mutex<Vec<Arc<Task>>>,
    next_id: AtomicU64,
}

impl TaskTable {
    fn insert(&self, name: &str, period: Duration, callback: TaskCallback) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .lock()
            .push(Arc::new(Task::new(id, name, period, callback)));
        tracing::debug!(task = name, id, period_ms = period.as_millis() as u64, "Task registered");
        TaskHandle(id)
    }

    fn remove(&self, handle: TaskHandle) -> bool {
        let task = {
            let mut tasks = self.tasks.lock();
            match tasks.iter().position(|t| t.id == handle.0) {
                Some(pos) => tasks.remove(pos),
                None => return false,
            }
        };
        // Outside the table lock: the in-flight run may itself (un)register.
        task.retire();
        tracing::debug!(task = %task.name, id = task.id, "Task unregistered");
        true
    }

    fn snapshot(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().clone()
    }

    fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

// =============================================================================
// ManualScheduler
// =============================================================================

/// Deterministic scheduler driven by explicit `run_once` calls.
#[derive(Default)]
pub struct ManualScheduler {
    table: TaskTable,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every registered task once, in registration order, on the
    /// calling thread. Tasks registered during this call run next time.
    pub fn run_once(&self) {
        for task in self.table.snapshot() {
            task.run();
        }
    }

    /// Convenience: `run_once` repeated `n` times.
    pub fn run_times(&self, n: usize) {
        for _ in 0..n {
            self.run_once();
        }
    }
}

impl TaskScheduler for ManualScheduler {
    fn register(&self, name: &str, period: Duration, callback: TaskCallback) -> TaskHandle {
        self.table.insert(name, period, callback)
    }

    fn unregister(&self, handle: TaskHandle) -> bool {
        self.table.remove(handle)
    }

    fn active_task_count(&self) -> usize {
        self.table.len()
    }
}

// =============================================================================
// ThreadScheduler
// =============================================================================

struct Shared {
    table: TaskTable,
    shutdown: Mutex<bool>,
    wake: Condvar,
    pool: rayon::ThreadPool,
    jobs: Arc<PendingJobs>,
}

/// Jobs handed to the pool that have not finished yet.
#[derive(Default)]
struct PendingJobs {
    count: Mutex<usize>,
    drained: Condvar,
}

impl PendingJobs {
    fn finish(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }
}

/// Real-time scheduler: a timer thread plus a rayon worker pool.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
    timer: Option<JoinHandle<()>>,
}

impl ThreadScheduler {
    /// Start a scheduler with `worker_threads` workers (0 = one per core).
    pub fn new(worker_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads)
            .thread_name(|i| format!("logtail-worker-{i}"))
            .build()
            .map_err(|source| SchedulerError::ThreadPool { source })?;
        let shared = Arc::new(Shared {
            table: TaskTable::default(),
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
            pool,
            jobs: Arc::new(PendingJobs::default()),
        });
        let timer_shared = Arc::clone(&shared);
        let timer = std::thread::Builder::new()
            .name("logtail-timer".to_string())
            .spawn(move || timer_loop(&timer_shared))
            .map_err(|source| SchedulerError::TimerThread { source })?;
        tracing::info!(
            workers = shared.pool.current_num_threads(),
            "Scheduler started"
        );
        Ok(Self {
            shared,
            timer: Some(timer),
        })
    }
}

fn timer_loop(shared: &Shared) {
    let mut shutdown = shared.shutdown.lock();
    while !*shutdown {
        let now = Instant::now();
        let mut next_wake = now + Duration::from_millis(SCHEDULER_MAX_IDLE_MS);
        for task in shared.table.snapshot() {
            let mut due = task.next_due.lock();
            if *due <= now {
                *due = now + task.period;
                dispatch(shared, &task);
            }
            next_wake = next_wake.min(*due);
        }
        shared.wake.wait_until(&mut shutdown, next_wake);
    }
    tracing::debug!("Scheduler timer stopped");
}

/// Hand `task` to the pool unless a job for it is still pending.
fn dispatch(shared: &Shared, task: &Arc<Task>) {
    if task.queued.swap(true, Ordering::AcqRel) {
        tracing::trace!(task = %task.name, "Previous job still pending; not queued");
        return;
    }
    *shared.jobs.count.lock() += 1;
    let task = Arc::clone(task);
    let jobs = Arc::clone(&shared.jobs);
    shared.pool.spawn(move || {
        task.run();
        task.queued.store(false, Ordering::Release);
        jobs.finish();
    });
}

impl TaskScheduler for ThreadScheduler {
    fn register(&self, name: &str, period: Duration, callback: TaskCallback) -> TaskHandle {
        let handle = self.shared.table.insert(name, period, callback);
        // Wake the timer so the new task runs without waiting out the idle period.
        let _guard = self.shared.shutdown.lock();
        self.shared.wake.notify_one();
        handle
    }

    fn unregister(&self, handle: TaskHandle) -> bool {
        self.shared.table.remove(handle)
    }

    fn active_task_count(&self) -> usize {
        self.shared.table.len()
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        {
            let mut shutdown = self.shared.shutdown.lock();
            *shutdown = true;
            self.shared.wake.notify_all();
        }
        for task in self.shared.table.snapshot() {
            task.removed.store(true, Ordering::Release);
        }
        if let Some(timer) = self.timer.take() {
            if timer.join().is_err() {
                tracing::warn!("Scheduler timer thread panicked");
            }
        }
        // A worker cannot wait for its own job.
        if self.shared.pool.current_thread_index().is_none() {
            self.shared.jobs.wait_drained();
        }
    }
}

#[cfg(test)]
impl ThreadScheduler {
    fn pending_jobs(&self) -> usize {
        *self.shared.jobs.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::error::SourceError;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> TaskCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_manual_runs_in_registration_order() {
        let scheduler = ManualScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let log = Arc::clone(&log);
            scheduler.register(
                name,
                Duration::from_millis(10),
                Box::new(move || {
                    log.lock().push(name);
                    Ok(())
                }),
            );
        }
        scheduler.run_times(2);
        assert_eq!(*log.lock(), vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_errors_and_panics_do_not_stop_task() {
        let scheduler = ManualScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        scheduler.register(
            "faulty",
            Duration::from_millis(10),
            Box::new(move || {
                let n = r.fetch_add(1, Ordering::SeqCst);
                match n {
                    0 => Err(SourceError::DoesNotExist {
                        path: PathBuf::from("x.log"),
                    }
                    .into()),
                    1 => panic!("boom"),
                    _ => Ok(()),
                }
            }),
        );
        scheduler.run_times(3);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.active_task_count(), 1);
    }

    #[test]
    fn test_unregister_unknown_handle_returns_false() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.register("t", Duration::from_millis(10), counter_task(&counter));
        assert!(scheduler.unregister(handle));
        assert!(!scheduler.unregister(handle));
        scheduler.run_once();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.active_task_count(), 0);
    }

    #[test]
    fn test_self_unregister_does_not_deadlock() {
        let scheduler = Arc::new(ManualScheduler::new());
        let slot: Arc<Mutex<Option<TaskHandle>>> = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&scheduler);
        let slot_in = Arc::clone(&slot);
        let handle = scheduler.register(
            "self",
            Duration::from_millis(10),
            Box::new(move || {
                if let (Some(s), Some(h)) = (weak.upgrade(), *slot_in.lock()) {
                    assert!(s.unregister(h));
                }
                Ok(())
            }),
        );
        *slot.lock() = Some(handle);
        scheduler.run_once();
        assert_eq!(scheduler.active_task_count(), 0);
    }

    #[test]
    fn test_thread_scheduler_runs_tasks_periodically() {
        let scheduler = ThreadScheduler::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register("tick", Duration::from_millis(10), counter_task(&counter));
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(counter.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_unregister_blocks_until_in_flight_run_returns() {
        let scheduler = ThreadScheduler::new(2).unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let handle = scheduler.register(
            "slow",
            Duration::from_millis(10),
            Box::new(move || {
                if s.swap(true, Ordering::SeqCst) {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(200));
                f.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while !started.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(started.load(Ordering::SeqCst));
        assert!(scheduler.unregister(handle));
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(scheduler.active_task_count(), 0);
    }

    #[test]
    fn test_overlapping_run_is_skipped() {
        let scheduler = ThreadScheduler::new(4).unwrap();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (c, m) = (Arc::clone(&concurrent), Arc::clone(&max_seen));
        let handle = scheduler.register(
            "overlap",
            Duration::from_millis(1),
            Box::new(move || {
                let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                c.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        std::thread::sleep(Duration::from_millis(150));
        scheduler.unregister(handle);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_busy_task_keeps_at_most_one_pending_job() {
        let scheduler = ThreadScheduler::new(1).unwrap();
        let handle = scheduler.register(
            "busy",
            Duration::from_millis(1),
            Box::new(|| {
                std::thread::sleep(Duration::from_millis(30));
                Ok(())
            }),
        );
        let mut most = 0;
        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline {
            most = most.max(scheduler.pending_jobs());
            std::thread::sleep(Duration::from_millis(2));
        }
        scheduler.unregister(handle);
        assert!(most <= 1, "pending jobs grew to {most}");
    }

    #[test]
    fn test_drop_waits_for_in_flight_run() {
        let scheduler = ThreadScheduler::new(2).unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        scheduler.register(
            "slow",
            Duration::from_secs(60),
            Box::new(move || {
                s.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(150));
                f.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while !started.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(started.load(Ordering::SeqCst));
        drop(scheduler);
        assert!(finished.load(Ordering::SeqCst));
    }
}
