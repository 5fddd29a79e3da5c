//! Scheduler engine: owns task/job state and drives it with a periodic tick.
//! Uses tokio::interval for the loop; work runs on spawned tokio tasks,
//! bounded by `max_concurrent_tasks`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use taskbus_core::config::SchedulerConfig;
use taskbus_core::{RecordStore, Result, TaskbusError};

use crate::deps::{self, AlwaysSatisfied, DependencyLookup, DependencyResolver};
use crate::interval::Schedule;
use crate::jobs::{JobOptions, JobSnapshot, JobStatus, RecurringJob};
use crate::queue::ReadyQueue;
use crate::tasks::{Priority, Task, TaskOptions, TaskSnapshot, TaskStatus, Work};

/// Store collection for terminal task records.
pub const TASK_RECORDS: &str = "tasks";
/// Store collection for cancelled job records.
pub const JOB_RECORDS: &str = "jobs";

/// Callback fired after every completion, retry, or permanent failure.
pub type OutcomeHook = Arc<dyn Fn(&TaskOutcome) + Send + Sync>;

/// Result of one execution attempt, as seen by the outcome hook.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "task", rename_all = "lowercase")]
pub enum TaskOutcome {
    Completed(TaskSnapshot),
    /// Failed with retry budget left; back in `scheduled`.
    Retrying(TaskSnapshot),
    Failed(TaskSnapshot),
}

impl TaskOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Retrying(_) => "retrying",
            Self::Failed(_) => "failed",
        }
    }

    pub fn snapshot(&self) -> &TaskSnapshot {
        match self {
            Self::Completed(t) | Self::Retrying(t) | Self::Failed(t) => t,
        }
    }

    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Retrying(_))
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Scheduled tasks that became due and were queued.
    pub enqueued: usize,
    /// Task instances spawned from recurring jobs.
    pub spawned: usize,
    /// Tasks whose work was started.
    pub dispatched: usize,
    /// Dependency-blocked tasks put back in the queue.
    pub deferred: usize,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub scheduled: usize,
    pub queued: usize,
    pub executing: usize,
    /// Work futures still occupying a slot (includes cancelled ones).
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub recurring_jobs: usize,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
}

#[derive(Default)]
struct SchedulerState {
    /// One-shot tasks that are scheduled, queued, or terminal.
    tasks: HashMap<String, Task>,
    executing: HashMap<String, Task>,
    jobs: HashMap<String, RecurringJob>,
    queue: ReadyQueue,
    running: usize,
    next_run_id: u64,
    total_completed: u64,
    total_failed: u64,
    total_retried: u64,
}

impl SchedulerState {
    fn contains_task(&self, id: &str) -> bool {
        self.tasks.contains_key(id) || self.executing.contains_key(id)
    }

    fn find_task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id).or_else(|| self.executing.get(id))
    }
}

impl DependencyLookup for SchedulerState {
    fn task_status(&self, id: &str) -> Option<TaskStatus> {
        self.find_task(id).map(|t| t.status)
    }

    fn job_succeeded(&self, id: &str) -> bool {
        self.jobs.get(id).is_some_and(|j| j.last_success.is_some())
    }
}

/// The task scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    state: Arc<Mutex<SchedulerState>>,
    resolver: Arc<dyn DependencyResolver>,
    store: Option<Arc<dyn RecordStore>>,
    on_outcome: Arc<RwLock<Option<OutcomeHook>>>,
    ticker: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
    closed: Arc<AtomicBool>,
}

impl Scheduler {
    /// Create a scheduler. Nothing runs until [`Scheduler::initialize`] or a manual [`Scheduler::tick`].
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(SchedulerState::default())),
            resolver: Arc::new(AlwaysSatisfied),
            store: None,
            on_outcome: Arc::new(RwLock::new(None)),
            ticker: Arc::new(std::sync::Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the dependency policy.
    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Record terminal tasks and cancelled jobs into `store`.
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the outcome callback.
    pub fn set_on_outcome<F>(&self, f: F)
    where
        F: Fn(&TaskOutcome) + Send + Sync + 'static,
    {
        let mut hook = self.on_outcome.write().unwrap_or_else(PoisonError::into_inner);
        *hook = Some(Arc::new(f));
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Resolve a named level from the configured priority table.
    pub fn priority(&self, name: &str) -> Option<Priority> {
        self.config.priority(name).map(Priority)
    }

    /// Start the tick loop. Must be called inside a Tokio runtime; calling it twice is a no-op.
    pub fn initialize(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.is_some() {
            return;
        }
        self.closed.store(false, Ordering::SeqCst);

        let period = std::time::Duration::from_millis(self.config.tick_interval_ms.max(1));
        tracing::info!(
            "⏰ Scheduler started (tick every {}ms, max {} concurrent)",
            self.config.tick_interval_ms,
            self.config.max_concurrent_tasks
        );

        let scheduler = self.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                scheduler.tick().await;
            }
        }));
    }

    /// Stop the tick loop and refuse new work. Work already running is left to finish.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handle = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            tracing::info!("🛑 Scheduler stopped");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TaskbusError::Shutdown("scheduler".into()));
        }
        Ok(())
    }

    /// Schedule a one-shot task. A task due now is queued immediately.
    pub async fn schedule_task(
        &self,
        id: &str,
        work: Work,
        when: DateTime<Utc>,
        options: TaskOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if state.contains_task(id) {
            return Err(TaskbusError::DuplicateId(id.to_string()));
        }

        let mut task = Task::new(id, work, when, options, self.config.max_retries);
        if task.is_due(Utc::now()) {
            task.status = TaskStatus::Queued;
            state.queue.push(id, task.priority);
        }
        tracing::info!(
            "📅 Task scheduled: '{}' (priority {}, at {})",
            id,
            task.priority,
            task.scheduled_time.to_rfc3339()
        );
        state.tasks.insert(id.to_string(), task);
        Ok(())
    }

    /// Register a recurring job. Its first instance runs one interval from now.
    pub async fn schedule_recurring_job(
        &self,
        id: &str,
        work: Work,
        schedule: &str,
        options: JobOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(id) {
            return Err(TaskbusError::DuplicateId(id.to_string()));
        }

        let job = RecurringJob::new(id, work, Schedule::parse(schedule), options);
        tracing::info!(
            "🔁 Recurring job added: '{}' ({}, next {})",
            id,
            job.schedule.expression,
            job.next_execution.to_rfc3339()
        );
        state.jobs.insert(id.to_string(), job);
        Ok(())
    }

    /// Remove a task and any queue entry. Running work is not interrupted;
    /// its result is discarded.
    pub async fn cancel_task(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        state.queue.remove(id);
        let removed = match state.tasks.remove(id) {
            Some(_) => true,
            None => state.executing.remove(id).is_some(),
        };
        if removed {
            tracing::info!("🗑️ Task cancelled: '{}'", id);
        }
        removed
    }

    /// Remove a recurring job. Instances already spawned are unaffected.
    pub async fn cancel_recurring_job(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            state.jobs.remove(id)
        };
        let Some(mut job) = removed else {
            return false;
        };
        job.status = JobStatus::Cancelled;
        tracing::info!("🗑️ Recurring job cancelled: '{}'", id);
        self.record(JOB_RECORDS, &job.snapshot());
        true
    }

    pub async fn task_status(&self, id: &str) -> Result<TaskSnapshot> {
        let state = self.state.lock().await;
        state
            .find_task(id)
            .map(Task::snapshot)
            .ok_or_else(|| TaskbusError::NotFound(format!("task '{id}'")))
    }

    pub async fn recurring_job_status(&self, id: &str) -> Result<JobSnapshot> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(id)
            .map(RecurringJob::snapshot)
            .ok_or_else(|| TaskbusError::NotFound(format!("recurring job '{id}'")))
    }

    /// Every known one-shot task, ordered by scheduled time.
    pub async fn scheduled_tasks(&self) -> Vec<TaskSnapshot> {
        let state = self.state.lock().await;
        let mut tasks: Vec<TaskSnapshot> = state
            .tasks
            .values()
            .chain(state.executing.values())
            .map(Task::snapshot)
            .collect();
        tasks.sort_by(|a, b| {
            a.scheduled_time
                .cmp(&b.scheduled_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Every registered recurring job, ordered by id.
    pub async fn recurring_jobs(&self) -> Vec<JobSnapshot> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobSnapshot> = state.jobs.values().map(RecurringJob::snapshot).collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        let mut stats = SchedulerStats {
            executing: state.executing.len(),
            running: state.running,
            recurring_jobs: state.jobs.len(),
            total_completed: state.total_completed,
            total_failed: state.total_failed,
            total_retried: state.total_retried,
            ..SchedulerStats::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Scheduled => stats.scheduled += 1,
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Executing => stats.executing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// One scheduling pass: enqueue due tasks, spawn job instances, dispatch by priority.
    pub async fn tick(&self) -> TickReport {
        let now = Utc::now();
        let mut report = TickReport::default();
        let mut dispatched = Vec::new();
        let mut outcomes = Vec::new();

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let mut due: Vec<&Task> = state.tasks.values().filter(|t| t.is_due(now)).collect();
            due.sort_by(|a, b| {
                (a.scheduled_time, a.created_at, &a.id).cmp(&(b.scheduled_time, b.created_at, &b.id))
            });
            let due: Vec<(String, Priority)> = due.iter().map(|t| (t.id.clone(), t.priority)).collect();
            for (id, priority) in due {
                if let Some(task) = state.tasks.get_mut(&id) {
                    task.status = TaskStatus::Queued;
                }
                state.queue.push(id, priority);
                report.enqueued += 1;
            }

            let mut due_jobs: Vec<String> = state
                .jobs
                .values()
                .filter(|j| j.is_due(now))
                .map(|j| j.id.clone())
                .collect();
            due_jobs.sort();
            for job_id in due_jobs {
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    continue;
                };
                let task = job.spawn_instance(now, self.config.max_retries);
                if state.contains_task(&task.id) {
                    tracing::warn!("⚠️ Skipping instance of '{}': id '{}' already exists", job_id, task.id);
                    continue;
                }
                tracing::info!("🔔 Recurring job triggered: '{}' → {}", job_id, task.id);
                state.queue.push(task.id.clone(), task.priority);
                state.tasks.insert(task.id.clone(), task);
                report.spawned += 1;
            }

            let mut deferred = Vec::new();
            while state.running < self.config.max_concurrent_tasks {
                let Some(id) = state.queue.pop() else {
                    break;
                };
                let Some(task) = state.tasks.get(&id) else {
                    continue;
                };
                let blocked = !task.dependencies.is_empty()
                    && !deps::all_satisfied(self.resolver.as_ref(), &task.dependencies, &*state);

                if blocked {
                    let Some(task) = state.tasks.get_mut(&id) else {
                        continue;
                    };
                    task.deferrals += 1;
                    if task.deferrals > self.config.max_dependency_deferrals {
                        let pending: Vec<&str> = task.dependencies.iter().map(String::as_str).collect();
                        task.status = TaskStatus::Failed;
                        task.finished_at = Some(now);
                        task.last_error = Some(format!(
                            "dependencies not satisfied after {} deferrals: {}",
                            task.deferrals - 1,
                            pending.join(", ")
                        ));
                        tracing::warn!("❌ Task '{}' failed: {}", id, task.last_error.as_deref().unwrap_or_default());
                        outcomes.push(TaskOutcome::Failed(task.snapshot()));
                        state.total_failed += 1;
                    } else {
                        tracing::debug!("⏸️ Task '{}' deferred on dependencies ({})", id, task.deferrals);
                        deferred.push((id, task.priority));
                        report.deferred += 1;
                    }
                    continue;
                }

                let Some(mut task) = state.tasks.remove(&id) else {
                    continue;
                };
                state.next_run_id += 1;
                task.status = TaskStatus::Executing;
                task.attempts += 1;
                task.started_at = Some(now);
                task.run_id = state.next_run_id;
                tracing::debug!("▶️ Dispatching '{}' (attempt {})", id, task.attempts);
                dispatched.push((id.clone(), task.run_id, task.work.clone()));
                state.executing.insert(id, task);
                state.running += 1;
                report.dispatched += 1;
            }
            for (id, priority) in deferred {
                state.queue.push(id, priority);
            }
        }

        for outcome in &outcomes {
            self.record(TASK_RECORDS, outcome.snapshot());
            self.emit(outcome);
        }

        for (id, run_id, work) in dispatched {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let attempt = AssertUnwindSafe(async move { work.run().await }).catch_unwind();
                let result = match attempt.await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("task panicked")),
                };
                scheduler.finish(&id, run_id, result).await;
            });
        }

        report
    }

    /// Route the result of one attempt: complete, retry, or fail.
    async fn finish(&self, id: &str, run_id: u64, result: anyhow::Result<Value>) {
        let now = Utc::now();
        let (outcome, recurring) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            state.running = state.running.saturating_sub(1);

            if state.executing.get(id).map(|t| t.run_id) != Some(run_id) {
                tracing::debug!("Dropping result of cancelled task '{}'", id);
                return;
            }
            let Some(mut task) = state.executing.remove(id) else {
                return;
            };
            let recurring = task.is_recurring();

            let outcome = match result {
                Ok(value) => {
                    task.status = TaskStatus::Completed;
                    task.finished_at = Some(now);
                    task.result = Some(value);
                    state.total_completed += 1;
                    tracing::info!("✅ Task completed: '{}'", id);

                    let outcome = TaskOutcome::Completed(task.snapshot());
                    if recurring {
                        if let Some(job) = task.job_id().and_then(|job_id| state.jobs.get_mut(job_id)) {
                            job.last_success = Some(now);
                        }
                    } else {
                        state.tasks.insert(id.to_string(), task);
                    }
                    outcome
                }
                Err(e) => {
                    let error = e.to_string();
                    task.last_error = Some(error.clone());
                    if task.retries < task.max_retries {
                        task.retries += 1;
                        task.status = TaskStatus::Scheduled;
                        task.scheduled_time = now
                            .checked_add_signed(retry_delay(self.config.retry_delay_ms))
                            .unwrap_or(DateTime::<Utc>::MAX_UTC);
                        state.total_retried += 1;
                        tracing::warn!(
                            "🔁 Task '{}' failed (retry {}/{} in {}ms): {}",
                            id,
                            task.retries,
                            task.max_retries,
                            self.config.retry_delay_ms,
                            error
                        );
                        let outcome = TaskOutcome::Retrying(task.snapshot());
                        state.tasks.insert(id.to_string(), task);
                        outcome
                    } else {
                        task.status = TaskStatus::Failed;
                        task.finished_at = Some(now);
                        state.total_failed += 1;
                        tracing::warn!(
                            "❌ Task '{}' failed after {} attempts: {}",
                            id,
                            task.attempts,
                            error
                        );
                        let outcome = TaskOutcome::Failed(task.snapshot());
                        state.tasks.insert(id.to_string(), task);
                        outcome
                    }
                }
            };
            (outcome, recurring)
        };

        let recurring_success = recurring && matches!(outcome, TaskOutcome::Completed(_));
        if outcome.is_terminal() && !recurring_success {
            self.record(TASK_RECORDS, outcome.snapshot());
        }
        self.emit(&outcome);
    }

    fn emit(&self, outcome: &TaskOutcome) {
        let hook = self
            .on_outcome
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(outcome))).is_err() {
                tracing::error!("Outcome hook panicked for task '{}'", outcome.snapshot().id);
            }
        }
    }

    fn record<T: Serialize>(&self, kind: &str, record: &T) {
        let Some(store) = &self.store else {
            return;
        };
        let result = serde_json::to_value(record)
            .map_err(TaskbusError::from)
            .and_then(|value| store.append(kind, value));
        if let Err(e) = result {
            tracing::warn!("⚠️ Failed to record {}: {e}", kind);
        }
    }
}

fn retry_delay(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}
