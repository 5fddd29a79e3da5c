//! Recurring job definitions.
//! A job never runs its work directly: each time it comes due it spawns a
//! one-shot [`Task`] instance that goes through the normal queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::interval::Schedule;
use crate::tasks::{META_JOB_ID, META_RECURRING, Priority, Task, TaskOptions, TaskStatus, Work};

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Cancelled,
}

/// Options accepted by `Scheduler::schedule_recurring_job`.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub priority: Priority,
    /// Retry ceiling for each spawned instance.
    pub max_retries: Option<u32>,
    pub resources: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl JobOptions {
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

    pub fn resource(mut self, tag: impl Into<String>) -> Self {
        self.resources.push(tag.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A persistent schedule that spawns task instances.
#[derive(Debug, Clone)]
pub struct RecurringJob {
    pub id: String,
    pub work: Work,
    pub schedule: Schedule,
    pub priority: Priority,
    pub max_retries: Option<u32>,
    pub resources: Vec<String>,
    pub metadata: Map<String, Value>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub last_executed: Option<DateTime<Utc>>,
    pub next_execution: DateTime<Utc>,
    /// Completion time of the latest successful instance.
    pub last_success: Option<DateTime<Utc>>,
    /// Instances spawned so far.
    pub run_count: u64,
}

impl RecurringJob {
    pub fn new(id: impl Into<String>, work: Work, schedule: Schedule, options: JobOptions) -> Self {
        let now = Utc::now();
        let next_execution = schedule.next_after(now);
        Self {
            id: id.into(),
            work,
            schedule,
            priority: options.priority,
            max_retries: options.max_retries,
            resources: options.resources,
            metadata: options.metadata,
            status: JobStatus::Active,
            created_at: now,
            last_executed: None,
            next_execution,
            last_success: None,
            run_count: 0,
        }
    }

    /// Check if this job should spawn an instance now.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.next_execution <= now
    }

    /// Stamp the run, advance the schedule, and build the queued instance.
    pub fn spawn_instance(&mut self, now: DateTime<Utc>, default_max_retries: u32) -> Task {
        self.last_executed = Some(now);
        self.next_execution = self.schedule.next_after(now);
        self.run_count += 1;

        let mut options = TaskOptions {
            priority: self.priority,
            max_retries: self.max_retries,
            resources: self.resources.clone(),
            metadata: self.metadata.clone(),
            ..TaskOptions::default()
        };
        options
            .metadata
            .insert(META_JOB_ID.to_string(), Value::String(self.id.clone()));
        options
            .metadata
            .insert(META_RECURRING.to_string(), Value::Bool(true));

        let id = format!("{}-{}", self.id, now.timestamp_millis());
        let mut task = Task::new(id, self.work.clone(), now, options, default_max_retries);
        task.status = TaskStatus::Queued;
        task
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            schedule: self.schedule.expression.clone(),
            interval_ms: self.schedule.interval_ms,
            priority: self.priority,
            resources: self.resources.clone(),
            metadata: self.metadata.clone(),
            status: self.status,
            created_at: self.created_at,
            last_executed: self.last_executed,
            next_execution: self.next_execution,
            last_success: self.last_success,
            run_count: self.run_count,
        }
    }
}

/// Read-only view of a recurring job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub schedule: String,
    pub interval_ms: u64,
    pub priority: Priority,
    pub resources: Vec<String>,
    pub metadata: Map<String, Value>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub last_executed: Option<DateTime<Utc>>,
    pub next_execution: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub run_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Work {
        Work::new(|| async { Ok(json!(null)) })
    }

    #[test]
    fn test_new_job_not_due_immediately() {
        let job = RecurringJob::new("j", noop(), Schedule::parse("every 5 minutes"), JobOptions::new());
        assert_eq!(job.status, JobStatus::Active);
        assert!(!job.is_due(Utc::now()));
        assert!(job.is_due(job.next_execution));
    }

    #[test]
    fn test_spawn_instance() {
        let mut job = RecurringJob::new(
            "report",
            noop(),
            Schedule::parse("every 5 minutes"),
            JobOptions::new()
                .priority(Priority::HIGH)
                .metadata("team", json!("ops")),
        );
        let now = Utc::now();
        let task = job.spawn_instance(now, 3);

        assert_eq!(task.id, format!("report-{}", now.timestamp_millis()));
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, Priority::HIGH);
        assert_eq!(task.job_id(), Some("report"));
        assert!(task.is_recurring());
        assert_eq!(task.metadata["team"], "ops");
        assert_eq!(task.max_retries, 3);

        assert_eq!(job.last_executed, Some(now));
        assert_eq!(job.next_execution, now + chrono::Duration::minutes(5));
        assert_eq!(job.run_count, 1);
    }
}
