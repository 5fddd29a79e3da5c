//! # Taskbus Scheduler
//!
//! In-process priority task scheduler.
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval, 1s)
//!   ├── one-shot Task:  scheduled → queued → executing → completed | failed
//!   │                     ↑ retry after delay ──────────┘
//!   ├── RecurringJob: "every 5 minutes" → spawns "<job>-<millis>" task instances
//!   └── tick
//!         1. enqueue due tasks
//!         2. spawn instances of due jobs
//!         3. drain ReadyQueue by priority while slots are free
//!            (dependency-blocked tasks go to the back of their class)
//!         4. run work concurrently, route result to retry / completion
//! ```

pub mod deps;
pub mod engine;
pub mod interval;
pub mod jobs;
pub mod queue;
pub mod tasks;

pub use deps::{AlwaysSatisfied, CompletedDependencies, DependencyLookup, DependencyResolver};
pub use engine::{JOB_RECORDS, OutcomeHook, Scheduler, SchedulerStats, TASK_RECORDS, TaskOutcome, TickReport};
pub use interval::Schedule;
pub use jobs::{JobOptions, JobSnapshot, JobStatus, RecurringJob};
pub use queue::ReadyQueue;
pub use tasks::{Priority, Task, TaskOptions, TaskSnapshot, TaskStatus, Work, WorkFuture};
