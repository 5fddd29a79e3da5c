//! Task definitions for one-shot scheduled work.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key linking a spawned instance to its recurring job.
pub const META_JOB_ID: &str = "jobId";
/// Metadata flag set on instances spawned from a recurring job.
pub const META_RECURRING: &str = "recurring";

/// Future returned by a unit of work.
pub type WorkFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A zero-argument unit of deferred computation.
///
/// Cloning is cheap; every retry and every recurring instance calls the
/// same closure again.
#[derive(Clone)]
pub struct Work(Arc<dyn Fn() -> WorkFuture + Send + Sync>);

impl Work {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self(Arc::new(move || Box::pin(f())))
    }

    /// Start one execution.
    pub fn run(&self) -> WorkFuture {
        (self.0)()
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Work(..)")
    }
}

/// Execution priority. Lower value runs first.
///
/// `Display` and `FromStr` only know the four built-in names. Names from a
/// customised `scheduler.priority_levels` table resolve through
/// `Scheduler::priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const CRITICAL: Self = Self(0);
    pub const HIGH: Self = Self(1);
    pub const MEDIUM: Self = Self(2);
    pub const LOW: Self = Self(3);
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::CRITICAL => write!(f, "critical"),
            Self::HIGH => write!(f, "high"),
            Self::MEDIUM => write!(f, "medium"),
            Self::LOW => write!(f, "low"),
            Self(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::CRITICAL),
            "high" => Ok(Self::HIGH),
            "medium" => Ok(Self::MEDIUM),
            "low" => Ok(Self::LOW),
            other => other
                .parse::<u8>()
                .map(Self)
                .map_err(|_| format!("unknown priority '{s}'")),
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Scheduled,
    Queued,
    Executing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and failed tasks never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Options accepted by `Scheduler::schedule_task`.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub priority: Priority,
    /// Retry ceiling; `None` uses the scheduler's configured default.
    pub max_retries: Option<u32>,
    pub dependencies: BTreeSet<String>,
    pub resources: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Wait for another task or job to succeed first.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    /// Declare an advisory resource tag.
    pub fn resource(mut self, tag: impl Into<String>) -> Self {
        self.resources.push(tag.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A one-shot unit of scheduled work.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique task ID.
    pub id: String,
    /// What to run.
    pub work: Work,
    /// Must not start before this instant.
    pub scheduled_time: DateTime<Utc>,
    pub priority: Priority,
    /// Retries consumed so far.
    pub retries: u32,
    pub max_retries: u32,
    /// Ids that must succeed before this task may run.
    pub dependencies: BTreeSet<String>,
    /// Advisory resource tags (not enforced).
    pub resources: Vec<String>,
    pub metadata: Map<String, Value>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Start of the most recent attempt.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// How many times work has been started.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub(crate) deferrals: u32,
    pub(crate) run_id: u64,
}

impl Task {
    /// Create a new task in `scheduled` state.
    pub fn new(
        id: impl Into<String>,
        work: Work,
        when: DateTime<Utc>,
        options: TaskOptions,
        default_max_retries: u32,
    ) -> Self {
        Self {
            id: id.into(),
            work,
            scheduled_time: when,
            priority: options.priority,
            retries: 0,
            max_retries: options.max_retries.unwrap_or(default_max_retries),
            dependencies: options.dependencies,
            resources: options.resources,
            metadata: options.metadata,
            status: TaskStatus::Scheduled,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            attempts: 0,
            last_error: None,
            result: None,
            deferrals: 0,
            run_id: 0,
        }
    }

    /// Check if this task is due and waiting to be queued.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Scheduled && self.scheduled_time <= now
    }

    /// Whether this is an instance spawned from a recurring job.
    pub fn is_recurring(&self) -> bool {
        self.metadata.get(META_RECURRING).and_then(Value::as_bool) == Some(true)
    }

    /// Id of the recurring job that spawned this task, if any.
    pub fn job_id(&self) -> Option<&str> {
        self.metadata.get(META_JOB_ID).and_then(Value::as_str)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            scheduled_time: self.scheduled_time,
            priority: self.priority,
            retries: self.retries,
            max_retries: self.max_retries,
            dependencies: self.dependencies.iter().cloned().collect(),
            resources: self.resources.clone(),
            metadata: self.metadata.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            result: self.result.clone(),
        }
    }
}

/// Read-only view of a task, safe to hand out and serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub scheduled_time: DateTime<Utc>,
    pub priority: Priority,
    pub retries: u32,
    pub max_retries: u32,
    pub dependencies: Vec<String>,
    pub resources: Vec<String>,
    pub metadata: Map<String, Value>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering_and_names() {
        assert!(Priority::CRITICAL < Priority::HIGH);
        assert!(Priority::MEDIUM < Priority::LOW);
        assert_eq!(Priority::default(), Priority::MEDIUM);
        assert_eq!("Critical".parse::<Priority>().unwrap(), Priority::CRITICAL);
        assert_eq!("7".parse::<Priority>().unwrap(), Priority(7));
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(Priority::LOW.to_string(), "low");
        assert_eq!(Priority(9).to_string(), "9");
    }

    #[test]
    fn test_new_task_defaults() {
        let work = Work::new(|| async { Ok(json!(null)) });
        let when = Utc::now();
        let task = Task::new("t1", work, when, TaskOptions::new(), 3);
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.priority, Priority::MEDIUM);
        assert_eq!(task.max_retries, 3);
        assert!(task.is_due(when));
        assert!(!task.is_recurring());
    }

    #[test]
    fn test_options_builder() {
        let opts = TaskOptions::new()
            .priority(Priority::HIGH)
            .max_retries(0)
            .depends_on("a")
            .depends_on("a")
            .resource("gpu")
            .metadata("owner", json!("ops"));
        assert_eq!(opts.priority, Priority::HIGH);
        assert_eq!(opts.max_retries, Some(0));
        assert_eq!(opts.dependencies.len(), 1);
        assert_eq!(opts.resources, vec!["gpu".to_string()]);
        assert_eq!(opts.metadata["owner"], "ops");
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_value(TaskStatus::Executing).unwrap(), json!("executing"));
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }

    #[tokio::test]
    async fn test_work_runs_each_call() {
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = counter.clone();
        let work = Work::new(move || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                Ok(json!(n))
            }
        });
        assert_eq!(work.run().await.unwrap(), json!(1));
        assert_eq!(work.clone().run().await.unwrap(), json!(2));
    }
}
