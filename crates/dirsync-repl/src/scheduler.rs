//! Periodic task scheduler and bounded worker pool.
//!
//! Each replication agreement registers one [`ScheduledTask`]. When a task
//! comes due the scheduler hands it to the [`WorkerPool`]; the task's
//! [`TaskOutcome`] decides when (or whether) it runs again.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a task wants after one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Run again after the delay.
    Reschedule(Duration),
    /// Run again as soon as a worker is free.
    Resubmit,
    /// Drop the task from the scheduler.
    Remove,
}

/// A re-submittable unit of periodic work.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    /// Stable name, unique within one scheduler.
    fn name(&self) -> String;

    /// Do one slice of work.
    async fn run(&self) -> TaskOutcome;
}

/// Snapshot of one scheduled task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Task name.
    pub name: String,
    /// Time until it is due (zero when overdue).
    pub due_in: Duration,
    /// Currently executing on a worker.
    pub running: bool,
    /// Completed runs.
    pub runs: u64,
}

struct SchedEntry {
    task: Arc<dyn ScheduledTask>,
    next_due: Instant,
    running: bool,
    override_due: Option<Instant>,
    runs: u64,
}

/// Registry of periodic tasks.
pub struct Scheduler {
    entries: Mutex<HashMap<String, SchedEntry>>,
    wake: Notify,
    idle_tick: Duration,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.lock().len())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            idle_tick: Duration::from_secs(1),
        }
    }
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SchedEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add a task, first due after `delay`. Replaces a task with the same name.
    pub fn insert(&self, task: Arc<dyn ScheduledTask>, delay: Duration) {
        let name = task.name();
        self.lock().insert(
            name.clone(),
            SchedEntry {
                task,
                next_due: Instant::now() + delay,
                running: false,
                override_due: None,
                runs: 0,
            },
        );
        debug!(task = %name, ?delay, "task scheduled");
        self.wake.notify_one();
    }

    /// Remove a task. A run already in flight finishes but is not rescheduled.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.lock().remove(name).is_some();
        if removed {
            debug!(task = %name, "task removed");
        }
        removed
    }

    /// Move a task's next run to `delay` from now.
    pub fn reschedule(&self, name: &str, delay: Duration) -> bool {
        let due = Instant::now() + delay;
        let found = match self.lock().get_mut(name) {
            Some(entry) => {
                if entry.running {
                    entry.override_due = Some(due);
                } else {
                    entry.next_due = due;
                }
                true
            }
            None => false,
        };
        if found {
            self.wake.notify_one();
        }
        found
    }

    /// Look up a task.
    pub fn find(&self, name: &str) -> Option<TaskInfo> {
        let now = Instant::now();
        self.lock().get(name).map(|e| TaskInfo {
            name: name.to_string(),
            due_in: e.next_due.saturating_duration_since(now),
            running: e.running,
            runs: e.runs,
        })
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_due(&self, now: Instant) -> Vec<(String, Arc<dyn ScheduledTask>)> {
        let mut entries = self.lock();
        entries
            .iter_mut()
            .filter(|(_, e)| !e.running && e.next_due <= now)
            .map(|(name, e)| {
                e.running = true;
                (name.clone(), Arc::clone(&e.task))
            })
            .collect()
    }

    fn next_wakeup(&self, now: Instant) -> Duration {
        self.lock()
            .values()
            .filter(|e| !e.running)
            .map(|e| e.next_due.saturating_duration_since(now))
            .min()
            .unwrap_or(self.idle_tick)
            .min(self.idle_tick)
    }

    fn complete(&self, name: &str, outcome: TaskOutcome) {
        let mut entries = self.lock();
        let remove = match entries.get_mut(name) {
            None => false,
            Some(entry) => {
                entry.running = false;
                entry.runs += 1;
                let now = Instant::now();
                match (outcome, entry.override_due.take()) {
                    (TaskOutcome::Remove, _) => true,
                    (_, Some(due)) => {
                        entry.next_due = due;
                        false
                    }
                    (TaskOutcome::Reschedule(delay), None) => {
                        entry.next_due = now + delay;
                        false
                    }
                    (TaskOutcome::Resubmit, None) => {
                        entry.next_due = now;
                        false
                    }
                }
            }
        };
        if remove {
            entries.remove(name);
            debug!(task = %name, "task finished for good");
        }
        drop(entries);
        self.wake.notify_one();
    }

    /// Drive due tasks onto `pool` until `cancel` fires.
    pub async fn run(self: Arc<Self>, pool: Arc<WorkerPool>, cancel: CancellationToken) {
        info!("scheduler started");
        loop {
            for (name, task) in self.take_due(Instant::now()) {
                let sched = Arc::clone(&self);
                pool.submit(async move {
                    let outcome = task.run().await;
                    sched.complete(&name, outcome);
                });
            }
            let wait = self.next_wakeup(Instant::now());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!("scheduler stopped");
    }
}

/// Pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrently running jobs.
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// Bounded-concurrency executor with a global pause switch.
#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    paused: watch::Sender<bool>,
    submitted: AtomicU64,
    resubmitted: AtomicU64,
}

impl WorkerPool {
    /// Create a pool.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let (paused, _) = watch::channel(false);
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.max_workers.max(1))),
            paused,
            submitted: AtomicU64::new(0),
            resubmitted: AtomicU64::new(0),
        })
    }

    /// Queue a job. It starts once the pool is unpaused and a worker is free.
    pub fn submit<F>(&self, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let permits = Arc::clone(&self.permits);
        let mut paused = self.paused.subscribe();
        tokio::spawn(async move {
            loop {
                let is_paused = *paused.borrow_and_update();
                if !is_paused {
                    break;
                }
                if paused.changed().await.is_err() {
                    return;
                }
            }
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        })
    }

    /// Queue a continuation of a job that yielded its worker.
    pub fn resubmit<F>(&self, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.resubmitted.fetch_add(1, Ordering::Relaxed);
        self.submit(job)
    }

    /// Stop starting new jobs. Running jobs should poll [`Self::is_paused`].
    pub fn pause(&self) {
        self.paused.send_replace(true);
        info!("worker pool paused");
    }

    /// Allow queued jobs to start again.
    pub fn resume(&self) {
        self.paused.send_replace(false);
        info!("worker pool resumed");
    }

    /// Pause check for long-running jobs.
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Jobs accepted so far (including resubmissions).
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Resubmissions accepted so far.
    pub fn resubmitted(&self) -> u64 {
        self.resubmitted.load(Ordering::Relaxed)
    }

    /// Workers currently idle.
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        name: String,
        runs: AtomicUsize,
        stop_after: usize,
    }

    #[async_trait]
    impl ScheduledTask for Counter {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn run(&self) -> TaskOutcome {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.stop_after {
                TaskOutcome::Remove
            } else {
                TaskOutcome::Resubmit
            }
        }
    }

    #[test]
    fn test_insert_find_remove() {
        let sched = Scheduler::new();
        let task = Arc::new(Counter {
            name: "rid=001".into(),
            runs: AtomicUsize::new(0),
            stop_after: 1,
        });
        sched.insert(task, Duration::from_secs(60));
        let info = sched.find("rid=001").unwrap();
        assert!(!info.running);
        assert!(info.due_in > Duration::from_secs(50));
        assert!(sched.reschedule("rid=001", Duration::ZERO));
        assert_eq!(sched.find("rid=001").unwrap().due_in, Duration::ZERO);
        assert!(sched.remove("rid=001"));
        assert!(sched.find("rid=001").is_none());
        assert!(!sched.reschedule("rid=001", Duration::ZERO));
    }

    #[tokio::test]
    async fn test_run_until_removed() {
        let sched = Scheduler::new();
        let pool = WorkerPool::new(PoolConfig::default());
        let task = Arc::new(Counter {
            name: "t".into(),
            runs: AtomicUsize::new(0),
            stop_after: 3,
        });
        sched.insert(task.clone(), Duration::ZERO);
        let cancel = CancellationToken::new();
        let driver = tokio::spawn(Arc::clone(&sched).run(Arc::clone(&pool), cancel.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            while !sched.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task removed itself");
        assert_eq!(task.runs.load(Ordering::SeqCst), 3);
        cancel.cancel();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_pause_resume() {
        let pool = WorkerPool::new(PoolConfig { max_workers: 1 });
        pool.pause();
        assert!(pool.is_paused());
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let handle = pool.submit(async move {
            r.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        pool.resume();
        handle.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pool.submitted(), 1);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(PoolConfig { max_workers: 2 });
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            handles.push(pool.resubmit(async move {
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.resubmitted(), 8);
    }
}
