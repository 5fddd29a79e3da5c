//! Per-channel message history: bounded ring buffers with age eviction.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::message::Message;

#[derive(Debug)]
struct Retained {
    /// Bus clock at record time. Publishers can override the message timestamp,
    /// so retention never looks at it.
    at: DateTime<Utc>,
    message: Message,
}

/// Retained messages, keyed by the channel they were published on.
#[derive(Debug)]
pub struct MessageHistory {
    max_messages: usize,
    channels: HashMap<String, VecDeque<Retained>>,
}

impl MessageHistory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.max(1),
            channels: HashMap::new(),
        }
    }

    /// Append a message retained at `at`; the oldest entry for that channel is
    /// dropped past the cap.
    pub fn record(&mut self, message: Message, at: DateTime<Utc>) {
        let entries = self
            .channels
            .entry(message.metadata.channel.clone())
            .or_default();
        entries.push_back(Retained { at, message });
        while entries.len() > self.max_messages {
            entries.pop_front();
        }
    }

    /// Drop entries retained before `cutoff`. Returns how many were removed.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.channels.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.at >= cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// Entries for `channel` at or after `since`, keeping the newest `limit`,
    /// oldest first.
    pub fn query(
        &self,
        channel: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<Message> {
        let Some(entries) = self.channels.get(channel) else {
            return Vec::new();
        };
        let matching: Vec<&Message> = entries
            .iter()
            .map(|e| &e.message)
            .filter(|m| since.is_none_or(|since| m.metadata.timestamp >= since))
            .collect();
        let skip = limit.map_or(0, |limit| matching.len().saturating_sub(limit));
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// Channels with at least one retained message.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Total retained messages.
    pub fn len(&self) -> usize {
        self.channels.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}
