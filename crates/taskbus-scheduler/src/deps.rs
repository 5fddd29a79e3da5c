//! Dependency gating.
//!
//! The scheduler asks a [`DependencyResolver`] whether each dependency of a
//! queued task is satisfied before dispatching it. The default resolver
//! treats every dependency as satisfied; [`CompletedDependencies`] waits for
//! the named task to complete or the named recurring job to succeed once.

use crate::tasks::TaskStatus;

/// Read access to scheduler state for resolvers.
pub trait DependencyLookup {
    /// Status of a one-shot task the scheduler still knows about.
    fn task_status(&self, id: &str) -> Option<TaskStatus>;
    /// Whether a recurring job with this id has had a successful instance.
    fn job_succeeded(&self, id: &str) -> bool;
}

/// Decides whether a dependency allows a task to run.
pub trait DependencyResolver: Send + Sync {
    fn is_satisfied(&self, dependency: &str, lookup: &dyn DependencyLookup) -> bool;
}

/// Every dependency is satisfied.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSatisfied;

impl DependencyResolver for AlwaysSatisfied {
    fn is_satisfied(&self, _dependency: &str, _lookup: &dyn DependencyLookup) -> bool {
        true
    }
}

/// A dependency is satisfied once the task it names has completed, or the
/// recurring job it names has succeeded at least once.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletedDependencies;

impl DependencyResolver for CompletedDependencies {
    fn is_satisfied(&self, dependency: &str, lookup: &dyn DependencyLookup) -> bool {
        lookup.task_status(dependency) == Some(TaskStatus::Completed)
            || lookup.job_succeeded(dependency)
    }
}

/// True when every dependency in `dependencies` is satisfied.
pub fn all_satisfied<'a>(
    resolver: &dyn DependencyResolver,
    dependencies: impl IntoIterator<Item = &'a String>,
    lookup: &dyn DependencyLookup,
) -> bool {
    dependencies
        .into_iter()
        .all(|dep| resolver.is_satisfied(dep, lookup))
}
