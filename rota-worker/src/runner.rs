//! Fixed-time periodic jobs.
//!
//! Each task fires at a list of UTC times of day. A task's loop awaits its
//! job before computing the next fire time, so a task never overlaps
//! itself; manual runs share the same per-task guard.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use rota_core::{CoreError, CoreResult, SharedClock};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> CoreResult<()>;
}

/// Cross-process exclusion for a job run.
#[async_trait]
pub trait JobLease: Send + Sync {
    async fn acquire(&self, job: &str, ttl_seconds: u64) -> CoreResult<bool>;

    async fn release(&self, job: &str) -> CoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// Another process holds the lease.
    LeaseHeld,
}

pub struct PeriodicTask {
    job: Arc<dyn Job>,
    fire_times: Vec<NaiveTime>,
    running: Mutex<()>,
}

impl PeriodicTask {
    pub fn new(job: Arc<dyn Job>, mut fire_times: Vec<NaiveTime>) -> Self {
        fire_times.sort();
        fire_times.dedup();
        Self {
            job,
            fire_times,
            running: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.job.name()
    }
}

struct RunnerInner {
    tasks: Vec<PeriodicTask>,
    clock: SharedClock,
    lease: Option<(Arc<dyn JobLease>, u64)>,
}

impl RunnerInner {
    async fn execute(&self, task: &PeriodicTask) -> CoreResult<RunStatus> {
        let _guard = task
            .running
            .try_lock()
            .map_err(|_| CoreError::JobAlreadyRunning(task.name()))?;

        if let Some((lease, ttl)) = &self.lease {
            if !lease.acquire(task.name(), *ttl).await? {
                info!(job = task.name(), "Lease held elsewhere, skipping run");
                return Ok(RunStatus::LeaseHeld);
            }
        }

        let started = self.clock.utc();
        let result = task.job.run().await;

        if let Some((lease, _)) = &self.lease {
            if let Err(e) = lease.release(task.name()).await {
                warn!(job = task.name(), error = %e, "Failed to release job lease");
            }
        }

        let elapsed_ms = (self.clock.utc() - started).num_milliseconds();
        match &result {
            Ok(()) => info!(job = task.name(), elapsed_ms, "Job finished"),
            Err(e) => error!(job = task.name(), elapsed_ms, error = %e, "Job failed"),
        }
        result.map(|()| RunStatus::Completed)
    }

    #[instrument(skip(self, shutdown), fields(job = self.tasks[index].name()))]
    async fn run_loop(&self, index: usize, mut shutdown: watch::Receiver<bool>) {
        let task = &self.tasks[index];
        info!(fire_times = ?task.fire_times, "Starting periodic task");

        loop {
            let now = self.clock.utc();
            let Some(next) = next_fire_after(now, &task.fire_times) else {
                warn!("No fire times configured");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    // Failures are logged by execute; the loop carries on.
                    let _ = self.execute(task).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Periodic task shutting down");
                        break;
                    }
                }
            }
        }
    }
}

pub struct TaskRunner {
    inner: Arc<RunnerInner>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskRunner {
    pub fn new(clock: SharedClock) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RunnerInner {
                tasks: Vec::new(),
                clock,
                lease: None,
            }),
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Only usable before `start`.
    pub fn with_task(mut self, task: PeriodicTask) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.tasks.push(task);
        }
        self
    }

    pub fn with_lease(mut self, lease: Arc<dyn JobLease>, ttl_seconds: u64) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.lease = Some((lease, ttl_seconds));
        }
        self
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.inner.tasks.iter().map(PeriodicTask::name).collect()
    }

    pub fn start(&mut self) {
        for index in 0..self.inner.tasks.len() {
            let inner = self.inner.clone();
            let shutdown = self.shutdown.subscribe();
            self.handles.push(tokio::spawn(async move {
                inner.run_loop(index, shutdown).await;
            }));
        }
        info!(tasks = self.handles.len(), "Task runner started");
    }

    /// Runs a task immediately, outside its cadence.
    pub async fn run_now(&self, name: &str) -> CoreResult<RunStatus> {
        let task = self
            .inner
            .tasks
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| CoreError::InternalError(format!("unknown task: {}", name)))?;
        self.inner.execute(task).await
    }

    /// Signals every loop and waits for in-flight runs to finish.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Periodic task ended abnormally");
            }
        }
        info!("Task runner stopped");
    }
}

/// The first configured time of day strictly after `now`, rolling over to
/// tomorrow when today's are all past.
pub fn next_fire_after(now: DateTime<Utc>, times: &[NaiveTime]) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    let later_today = times
        .iter()
        .map(|t| today.and_time(*t).and_utc())
        .filter(|at| *at > now)
        .min();
    later_today.or_else(|| {
        let first = times.iter().min()?;
        Some((today + Duration::days(1)).and_time(*first).and_utc())
    })
}
