//! Ready queue with one FIFO lane per priority value.
//!
//! Pops always come from the lowest-valued non-empty lane, so a critical
//! task queued after a pile of low ones still runs first. Ties keep
//! insertion order.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::tasks::Priority;

/// Priority-ordered queue of task ids ready to run.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    lanes: BTreeMap<Priority, VecDeque<String>>,
    members: HashSet<String>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at the back of the task's lane. Returns false if already queued.
    pub fn push(&mut self, id: impl Into<String>, priority: Priority) -> bool {
        let id = id.into();
        if !self.members.insert(id.clone()) {
            return false;
        }
        tracing::debug!("📥 Queue[{}] enqueue: {} (queued: {})", priority, id, self.members.len());
        self.lanes.entry(priority).or_default().push_back(id);
        true
    }

    /// Pop the next id, highest priority first.
    pub fn pop(&mut self) -> Option<String> {
        let mut entry = self.lanes.first_entry()?;
        let id = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        let id = id?;
        self.members.remove(&id);
        Some(id)
    }

    /// Drop an id wherever it sits.
    pub fn remove(&mut self, id: &str) -> bool {
        if !self.members.remove(id) {
            return false;
        }
        self.lanes.retain(|_, lane| {
            lane.retain(|queued| queued != id);
            !lane.is_empty()
        });
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Queued ids in pop order.
    pub fn ids(&self) -> Vec<String> {
        self.lanes.values().flatten().cloned().collect()
    }
}
