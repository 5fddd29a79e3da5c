//! Message bus with allow-listed publish, wildcard subscriptions and request/reply.
//!
//! Delivery is synchronous on the publishing call: handlers run in
//! subscription order (exact subscribers first, then wildcard ones) after
//! the registry lock is released, so a handler may publish or subscribe.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use taskbus_core::config::BusConfig;
use taskbus_core::redact::redact;
use taskbus_core::{Result, TaskbusError};

use crate::history::MessageHistory;
use crate::matcher::{is_pattern, matches};
use crate::message::Message;

/// Channels with this prefix carry replies and are always enabled.
pub const REPLY_PREFIX: &str = "reply:";

/// Subscriber callback. A returned error is logged; it never reaches the publisher.
pub type Handler = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Remove the subscription after its first delivery.
    pub once: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Retain in history even when `persist_all` is off.
    pub persist: bool,
    /// Merged over the generated metadata.
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides `bus.request_timeout_ms`.
    pub timeout: Option<Duration>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryQuery {
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub subscriptions: usize,
    pub exact_channels: usize,
    pub wildcard_subscriptions: usize,
    pub history_channels: usize,
    pub retained_messages: usize,
    pub published: u64,
    pub rejected: u64,
    pub handler_failures: u64,
}

/// Read-only view of a live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub channel: String,
    pub once: bool,
    pub created_at: DateTime<Utc>,
}

struct Subscription {
    id: String,
    channel: String,
    handler: Handler,
    once: bool,
    created_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct Registry {
    exact: HashMap<String, Vec<Arc<Subscription>>>,
    wildcard: Vec<Arc<Subscription>>,
    next_seq: u64,
}

impl Registry {
    fn insert(&mut self, sub: Arc<Subscription>) {
        if is_pattern(&sub.channel) {
            self.wildcard.push(sub);
        } else {
            self.exact.entry(sub.channel.clone()).or_default().push(sub);
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        if let Some(pos) = self.wildcard.iter().position(|s| s.id == id) {
            self.wildcard.remove(pos);
            return true;
        }
        let mut emptied = None;
        let mut found = false;
        for (channel, subs) in self.exact.iter_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                found = true;
                if subs.is_empty() {
                    emptied = Some(channel.clone());
                }
                break;
            }
        }
        if let Some(channel) = emptied {
            self.exact.remove(&channel);
        }
        found
    }

    fn contains(&self, id: &str) -> bool {
        self.wildcard.iter().any(|s| s.id == id)
            || self.exact.values().flatten().any(|s| s.id == id)
    }

    /// Subscriptions a message on `channel` goes to, in delivery order.
    fn targets(&self, channel: &str) -> Vec<Arc<Subscription>> {
        let mut targets: Vec<Arc<Subscription>> =
            self.exact.get(channel).cloned().unwrap_or_default();
        targets.extend(
            self.wildcard
                .iter()
                .filter(|s| matches(&s.channel, channel))
                .cloned(),
        );
        targets
    }

    fn all(&self) -> impl Iterator<Item = &Arc<Subscription>> {
        self.exact.values().flatten().chain(self.wildcard.iter())
    }

    fn len(&self) -> usize {
        self.exact.values().map(Vec::len).sum::<usize>() + self.wildcard.len()
    }

    fn clear(&mut self) {
        self.exact.clear();
        self.wildcard.clear();
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    rejected: AtomicU64,
    handler_failures: AtomicU64,
}

/// The message bus. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessageBus {
    config: Arc<BusConfig>,
    registry: Arc<RwLock<Registry>>,
    history: Arc<Mutex<MessageHistory>>,
    counters: Arc<Counters>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        let history = MessageHistory::new(config.message_history.max_messages);
        Self {
            config: Arc::new(config),
            registry: Arc::new(RwLock::new(Registry::default())),
            history: Arc::new(Mutex::new(history)),
            counters: Arc::new(Counters::default()),
            sweeper: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    fn history(&self) -> MutexGuard<'_, MessageHistory> {
        self.history.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Message history mutex poisoned (recovering)");
            poisoned.into_inner()
        })
    }

    /// Start the history sweep when retention is enabled. Must be called
    /// inside a Tokio runtime; calling it twice is a no-op.
    pub fn initialize(&self) {
        let history = &self.config.message_history;
        if !history.enabled {
            tracing::info!("🚌 Message bus ready (history off)");
            return;
        }
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }

        let period = Duration::from_millis(history.sweep_interval_ms.max(1));
        tracing::info!(
            "🚌 Message bus ready (history: {} per channel, retention {}ms, sweep every {}ms)",
            history.max_messages,
            history.retention_time_ms,
            history.sweep_interval_ms
        );
        let bus = self.clone();
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                bus.sweep_history();
            }
        }));
    }

    /// Stop the sweep and drop every subscription and retained message.
    /// Pending requests fail once their reply subscription is gone.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.history().clear();
        tracing::info!("🛑 Message bus stopped");
    }

    /// Register a handler. `channel` may contain `*` wildcards.
    pub fn subscribe<F>(&self, channel: &str, handler: F, options: SubscribeOptions) -> String
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.next_seq += 1;
        let sub = Arc::new(Subscription {
            id: id.clone(),
            channel: channel.to_string(),
            handler: Arc::new(handler),
            once: options.once,
            created_at: Utc::now(),
            seq: registry.next_seq,
        });
        registry.insert(sub);
        tracing::debug!("📥 Subscribed {} to '{}'", id, channel);
        id
    }

    /// Remove a subscription. Unknown ids return false.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscription_id);
        if removed {
            tracing::debug!("📤 Unsubscribed {}", subscription_id);
        }
        removed
    }

    /// Whether publishing on `channel` is allowed.
    ///
    /// An exact allow-list entry wins; otherwise the longest matching
    /// wildcard entry decides. Unlisted channels are disabled.
    pub fn is_channel_enabled(&self, channel: &str) -> bool {
        if channel.starts_with(REPLY_PREFIX) {
            return true;
        }
        let channels = &self.config.enabled_channels;
        if let Some(enabled) = channels.get(channel) {
            return *enabled;
        }
        channels
            .iter()
            .filter(|(pattern, _)| is_pattern(pattern) && matches(pattern, channel))
            .max_by_key(|(pattern, _)| pattern.len())
            .is_some_and(|(_, enabled)| *enabled)
    }

    /// Publish `data` on `channel`. Returns false when the channel is disabled.
    pub fn publish(&self, channel: &str, data: Value, options: PublishOptions) -> bool {
        if !self.is_channel_enabled(channel) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("🚫 Publish to disabled channel '{}' ignored", channel);
            return false;
        }

        let message = Message::new(channel, data, options.metadata);
        tracing::debug!(
            "📨 [{}] {} {}",
            channel,
            message.metadata.id,
            redact(&message.data)
        );

        let history = &self.config.message_history;
        if history.enabled && (options.persist || history.persist_all) {
            self.history().record(message.clone(), Utc::now());
        }
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        for sub in self.claim_targets(channel) {
            self.deliver(&sub, &message);
        }
        true
    }

    /// Resolve delivery targets, removing `once` subscriptions so a
    /// concurrent publish cannot deliver to them a second time.
    fn claim_targets(&self, channel: &str) -> Vec<Arc<Subscription>> {
        let targets = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .targets(channel);
        if !targets.iter().any(|s| s.once) {
            return targets;
        }

        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        targets
            .into_iter()
            .filter(|s| {
                if s.once {
                    registry.remove(&s.id)
                } else {
                    registry.contains(&s.id)
                }
            })
            .collect()
    }

    fn deliver(&self, sub: &Subscription, message: &Message) {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| (sub.handler)(message)));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "handler panicked".to_string(),
        };
        self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "⚠️ Subscriber {} on '{}' failed for message {}: {}",
            sub.id,
            sub.channel,
            message.metadata.id,
            failure
        );
    }

    /// Publish and wait for a single reply on a generated `reply:` channel.
    pub async fn request(
        &self,
        channel: &str,
        payload: Value,
        options: RequestOptions,
    ) -> Result<Value> {
        let response_channel = format!("{REPLY_PREFIX}{}", uuid::Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe(
            &response_channel,
            move |reply| {
                let sender = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(sender) = sender {
                    let _ = sender.send(reply.data.clone());
                }
                Ok(())
            },
            SubscribeOptions { once: true },
        );
        let _cleanup = ReplyGuard {
            bus: self,
            subscription,
        };

        let mut metadata = options.metadata;
        metadata.insert(
            "responseChannel".to_string(),
            Value::String(response_channel.clone()),
        );
        let published = self.publish(
            channel,
            payload,
            PublishOptions {
                persist: false,
                metadata,
            },
        );
        if !published {
            return Err(TaskbusError::ChannelDisabled(channel.to_string()));
        }

        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.request_timeout_ms));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TaskbusError::Shutdown(format!(
                "reply channel '{response_channel}' closed"
            ))),
            Err(_) => {
                tracing::warn!(
                    "⏱️ Request on '{}' timed out after {}ms",
                    channel,
                    timeout.as_millis()
                );
                Err(TaskbusError::Timeout(format!(
                    "no reply on '{channel}' within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Reply to a request. Same as `publish` on the request's `responseChannel`.
    pub fn respond(&self, response_channel: &str, payload: Value, options: PublishOptions) -> bool {
        self.publish(response_channel, payload, options)
    }

    pub fn message_history(&self, channel: &str, query: HistoryQuery) -> Result<Vec<Message>> {
        if !self.config.message_history.enabled {
            return Err(TaskbusError::NotEnabled("message history".into()));
        }
        Ok(self.history().query(channel, query.since, query.limit))
    }

    /// Evict retained messages older than the retention window.
    pub fn sweep_history(&self) -> usize {
        let retention = chrono::Duration::milliseconds(
            i64::try_from(self.config.message_history.retention_time_ms).unwrap_or(i64::MAX),
        );
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.history().evict_older_than(cutoff);
        if removed > 0 {
            tracing::debug!("🧹 Evicted {} expired messages", removed);
        }
        removed
    }

    /// A literal channel counts its direct subscribers. A pattern counts every
    /// subscription that overlaps it in either direction.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        if !is_pattern(channel) {
            return registry.exact.get(channel).map_or(0, Vec::len);
        }
        registry
            .all()
            .filter(|s| matches(channel, &s.channel) || matches(&s.channel, channel))
            .count()
    }

    /// Live subscriptions in the order they were made.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut subs: Vec<&Arc<Subscription>> = registry.all().collect();
        subs.sort_by_key(|s| s.seq);
        subs.into_iter()
            .map(|s| SubscriptionInfo {
                id: s.id.clone(),
                channel: s.channel.clone(),
                once: s.once,
                created_at: s.created_at,
            })
            .collect()
    }

    pub fn stats(&self) -> BusStats {
        let (subscriptions, exact_channels, wildcard_subscriptions) = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            (registry.len(), registry.exact.len(), registry.wildcard.len())
        };
        let (history_channels, retained_messages) = {
            let history = self.history();
            (history.channel_count(), history.len())
        };
        BusStats {
            subscriptions,
            exact_channels,
            wildcard_subscriptions,
            history_channels,
            retained_messages,
            published: self.counters.published.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            handler_failures: self.counters.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// Removes a request's reply subscription however the request ends.
struct ReplyGuard<'a> {
    bus: &'a MessageBus,
    subscription: String,
}

impl Drop for ReplyGuard<'_> {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use taskbus_core::config::MessageHistoryConfig;

    fn collector(bus: &MessageBus, channel: &str) -> Arc<Mutex<Vec<Message>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(
            channel,
            move |msg| {
                s.lock().unwrap().push(msg.clone());
                Ok(())
            },
            SubscribeOptions::default(),
        );
        seen
    }

    fn channels(seen: &Arc<Mutex<Vec<Message>>>) -> Vec<String> {
        seen.lock()
            .unwrap()
            .iter()
            .map(|m| m.channel().to_string())
            .collect()
    }

    fn allow(entries: &[(&str, bool)]) -> BusConfig {
        BusConfig {
            enabled_channels: entries
                .iter()
                .map(|(c, e)| (c.to_string(), *e))
                .collect::<BTreeMap<_, _>>(),
            ..BusConfig::default()
        }
    }

    fn with_history(max_messages: usize, persist_all: bool) -> BusConfig {
        BusConfig {
            message_history: MessageHistoryConfig {
                enabled: true,
                max_messages,
                persist_all,
                ..MessageHistoryConfig::default()
            },
            ..BusConfig::default()
        }
    }

    fn persisted() -> PublishOptions {
        PublishOptions {
            persist: true,
            ..PublishOptions::default()
        }
    }

    #[test]
    fn test_wildcard_routing() {
        let bus = MessageBus::new(BusConfig::default());
        let agent = collector(&bus, "agent:*");

        assert!(bus.publish("agent:failure", json!({"agent": "a1"}), PublishOptions::default()));
        assert!(bus.publish("agent:status", json!("up"), PublishOptions::default()));
        assert!(bus.publish("system:error", json!("disk"), PublishOptions::default()));

        assert_eq!(channels(&agent), vec!["agent:failure", "agent:status"]);
    }

    #[test]
    fn test_exact_before_wildcard_delivery() {
        let bus = MessageBus::new(BusConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        for (channel, tag) in [("agent:*", "wild"), ("agent:status", "exact")] {
            let o = order.clone();
            bus.subscribe(
                channel,
                move |_| {
                    o.lock().unwrap().push(tag);
                    Ok(())
                },
                SubscribeOptions::default(),
            );
        }

        bus.publish("agent:status", json!(null), PublishOptions::default());
        assert_eq!(*order.lock().unwrap(), vec!["exact", "wild"]);
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let bus = MessageBus::new(BusConfig::default());
        bus.subscribe("jobs", |_| Err(anyhow::anyhow!("nope")), SubscribeOptions::default());
        bus.subscribe(
            "jobs",
            |_| {
                let explode = true;
                if explode {
                    panic!("handler blew up");
                }
                Ok(())
            },
            SubscribeOptions::default(),
        );
        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        bus.subscribe(
            "jobs",
            move |_| {
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            SubscribeOptions::default(),
        );

        assert!(bus.publish("jobs", json!(1), PublishOptions::default()));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().handler_failures, 2);
    }

    #[test]
    fn test_allow_list() {
        let bus = MessageBus::new(allow(&[("agent:*", true), ("agent:debug", false)]));
        let seen = collector(&bus, "*");

        assert!(bus.publish("agent:status", json!(1), PublishOptions::default()));
        assert!(!bus.publish("agent:debug", json!(2), PublishOptions::default()));
        assert!(!bus.publish("system:error", json!(3), PublishOptions::default()));
        assert!(bus.publish("reply:abc", json!(4), PublishOptions::default()));

        assert_eq!(channels(&seen), vec!["agent:status", "reply:abc"]);
        let stats = bus.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.rejected, 2);
    }

    #[test]
    fn test_longest_wildcard_wins() {
        let bus = MessageBus::new(allow(&[("*", false), ("agent:*", true), ("agent:x*", false)]));
        assert!(bus.is_channel_enabled("agent:status"));
        assert!(!bus.is_channel_enabled("agent:xray"));
        assert!(!bus.is_channel_enabled("system:error"));
    }

    #[test]
    fn test_metadata_merge_on_publish() {
        let bus = MessageBus::new(BusConfig::default());
        let seen = collector(&bus, "audit");
        let mut metadata = Map::new();
        metadata.insert("id".into(), json!("fixed-id"));
        metadata.insert("channel".into(), json!("elsewhere"));
        metadata.insert("traceId".into(), json!("t-9"));
        bus.publish("audit", json!({}), PublishOptions { persist: false, metadata });

        let msg = seen.lock().unwrap()[0].clone();
        assert_eq!(msg.metadata.id, "fixed-id");
        assert_eq!(msg.metadata.channel, "audit");
        assert_eq!(msg.metadata.extra["traceId"], "t-9");
    }

    #[test]
    fn test_once_and_unsubscribe() {
        let bus = MessageBus::new(BusConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.subscribe(
            "tick",
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            SubscribeOptions { once: true },
        );
        bus.publish("tick", json!(1), PublishOptions::default());
        bus.publish("tick", json!(2), PublishOptions::default());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().subscriptions, 0);

        let id = bus.subscribe("tick", |_| Ok(()), SubscribeOptions::default());
        assert!(bus.unsubscribe(&id));
        assert!(!bus.unsubscribe(&id));
        assert!(!bus.unsubscribe("no-such-subscription"));
    }

    #[test]
    fn test_subscriber_count() {
        let bus = MessageBus::new(BusConfig::default());
        for channel in ["agent:status", "agent:status", "agent:*", "system:*"] {
            bus.subscribe(channel, |_| Ok(()), SubscribeOptions::default());
        }

        assert_eq!(bus.subscriber_count("agent:status"), 2);
        assert_eq!(bus.subscriber_count("system:error"), 0);
        assert_eq!(bus.subscriber_count("agent:*"), 3);
        assert_eq!(bus.subscriber_count("*"), 4);
        assert_eq!(bus.subscriber_count("*:status"), 2);

        let listed: Vec<String> = bus.subscriptions().into_iter().map(|s| s.channel).collect();
        assert_eq!(listed, vec!["agent:status", "agent:status", "agent:*", "system:*"]);
    }

    #[test]
    fn test_history_bound() {
        let bus = MessageBus::new(with_history(3, false));
        for n in 0..5 {
            bus.publish("metrics", json!(n), persisted());
        }
        bus.publish("metrics", json!("not kept"), PublishOptions::default());

        let kept = bus.message_history("metrics", HistoryQuery::default()).unwrap();
        let data: Vec<_> = kept.into_iter().map(|m| m.data).collect();
        assert_eq!(data, vec![json!(2), json!(3), json!(4)]);

        let limited = bus
            .message_history("metrics", HistoryQuery { since: None, limit: Some(1) })
            .unwrap();
        assert_eq!(limited[0].data, json!(4));
    }

    #[test]
    fn test_persist_all() {
        let bus = MessageBus::new(with_history(10, true));
        bus.publish("log", json!("a"), PublishOptions::default());
        assert_eq!(bus.message_history("log", HistoryQuery::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_history_disabled() {
        let bus = MessageBus::new(BusConfig::default());
        bus.publish("metrics", json!(1), persisted());
        let err = bus.message_history("metrics", HistoryQuery::default()).unwrap_err();
        assert!(matches!(err, TaskbusError::NotEnabled(_)));
        assert_eq!(bus.stats().retained_messages, 0);
    }

    fn stamped(at: DateTime<Utc>) -> PublishOptions {
        let mut metadata = Map::new();
        metadata.insert("timestamp".into(), serde_json::to_value(at).unwrap());
        PublishOptions { persist: true, metadata }
    }

    #[test]
    fn test_sweep_evicts_expired() {
        let mut config = with_history(10, false);
        config.message_history.retention_time_ms = 20;
        let bus = MessageBus::new(config);

        bus.publish("events", json!("future"), stamped(Utc::now() + chrono::Duration::days(1)));
        bus.publish("events", json!("plain"), persisted());
        std::thread::sleep(std::time::Duration::from_millis(40));
        bus.publish("events", json!("fresh"), persisted());

        assert_eq!(bus.sweep_history(), 2);
        let kept = bus.message_history("events", HistoryQuery::default()).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].data, json!("fresh"));
    }

    #[test]
    fn test_backdated_message_kept_within_retention() {
        let mut config = with_history(10, false);
        config.message_history.retention_time_ms = 60_000;
        let bus = MessageBus::new(config);

        bus.publish("events", json!("old"), stamped(Utc::now() - chrono::Duration::hours(1)));
        assert_eq!(bus.sweep_history(), 0);
        assert_eq!(bus.message_history("events", HistoryQuery::default()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let bus = MessageBus::new(BusConfig::default());
        let responder = bus.clone();
        bus.subscribe(
            "math:double",
            move |msg| {
                let reply_to = msg
                    .metadata
                    .response_channel
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("missing responseChannel"))?;
                let n = msg.data.as_i64().unwrap_or_default();
                responder.respond(&reply_to, json!(n * 2), PublishOptions::default());
                Ok(())
            },
            SubscribeOptions::default(),
        );

        let reply = bus
            .request("math:double", json!(21), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, json!(42));
        assert_eq!(bus.stats().subscriptions, 1);
    }

    #[tokio::test]
    async fn test_request_reply_from_another_task() {
        let bus = MessageBus::new(BusConfig::default());
        let responder = bus.clone();
        bus.subscribe(
            "slow:echo",
            move |msg| {
                let bus = responder.clone();
                let reply_to = msg.metadata.response_channel.clone().unwrap_or_default();
                let data = msg.data.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    bus.respond(&reply_to, data, PublishOptions::default());
                });
                Ok(())
            },
            SubscribeOptions::default(),
        );

        let reply = bus
            .request("slow:echo", json!({"k": "v"}), RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, json!({"k": "v"}));
    }

    #[tokio::test]
    async fn test_request_timeout_and_late_reply() {
        let bus = MessageBus::new(BusConfig::default());
        let seen = collector(&bus, "ghost:service");

        let err = bus
            .request(
                "ghost:service",
                json!("ping"),
                RequestOptions {
                    timeout: Some(Duration::from_millis(20)),
                    ..RequestOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TaskbusError::Timeout(_)));

        // Only the collector remains; the reply subscription is gone.
        assert_eq!(bus.stats().subscriptions, 1);
        let reply_to = seen.lock().unwrap()[0]
            .metadata
            .response_channel
            .clone()
            .unwrap();
        assert!(reply_to.starts_with(REPLY_PREFIX));
        assert!(bus.respond(&reply_to, json!("pong"), PublishOptions::default()));
        assert_eq!(bus.subscriber_count(&reply_to), 0);
    }

    #[tokio::test]
    async fn test_request_on_disabled_channel() {
        let bus = MessageBus::new(allow(&[("agent:*", true)]));
        let err = bus
            .request("system:query", json!(null), RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskbusError::ChannelDisabled(_)));
        assert_eq!(bus.stats().subscriptions, 0);
    }

    #[tokio::test]
    async fn test_shutdown_clears_state() {
        let bus = MessageBus::new(with_history(10, true));
        bus.initialize();
        bus.initialize();
        bus.subscribe("a", |_| Ok(()), SubscribeOptions::default());
        bus.publish("a", json!(1), PublishOptions::default());

        bus.shutdown();
        let stats = bus.stats();
        assert_eq!(stats.subscriptions, 0);
        assert_eq!(stats.retained_messages, 0);
    }
}
