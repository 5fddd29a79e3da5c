//! Health monitor, an ordinary bus consumer.
//!
//! Watches `agent:*` and `system:*`, counts `agent:failure` reports per
//! agent, and asks for a restart on `agent:control` once an agent reaches
//! the failure threshold.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use serde_json::{Value, json};

use taskbus_bus::{Message, MessageBus, PublishOptions, SubscribeOptions};
use taskbus_core::config::MonitorConfig;
use taskbus_core::redact::redact;

pub const FAILURE_CHANNEL: &str = "agent:failure";
pub const CONTROL_CHANNEL: &str = "agent:control";

pub struct HealthMonitor {
    bus: MessageBus,
    failures: Arc<Mutex<HashMap<String, u32>>>,
    subscriptions: Vec<String>,
}

impl HealthMonitor {
    /// Subscribe to the watched channels.
    pub fn install(bus: &MessageBus, config: &MonitorConfig) -> Self {
        let failures: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
        let threshold = config.failure_threshold.max(1);

        let agent_bus = bus.clone();
        let agent_failures = failures.clone();
        let agent_sub = bus.subscribe(
            "agent:*",
            move |msg| on_agent_message(&agent_bus, &agent_failures, threshold, msg),
            SubscribeOptions::default(),
        );
        let system_sub = bus.subscribe(
            "system:*",
            |msg| {
                tracing::debug!("🩺 [{}] {}", msg.channel(), redact(&msg.data));
                Ok(())
            },
            SubscribeOptions::default(),
        );

        tracing::info!("🩺 Health monitor watching agent:* and system:* (restart after {} failures)", threshold);
        Self {
            bus: bus.clone(),
            failures,
            subscriptions: vec![agent_sub, system_sub],
        }
    }

    /// Failures counted for `agent` since its last restart request.
    pub fn failure_count(&self, agent: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent)
            .copied()
            .unwrap_or(0)
    }

    pub fn uninstall(&self) {
        for id in &self.subscriptions {
            self.bus.unsubscribe(id);
        }
    }
}

fn on_agent_message(
    bus: &MessageBus,
    failures: &Mutex<HashMap<String, u32>>,
    threshold: u32,
    msg: &Message,
) -> anyhow::Result<()> {
    if msg.channel() != FAILURE_CHANNEL {
        tracing::debug!("🩺 [{}] {}", msg.channel(), redact(&msg.data));
        return Ok(());
    }

    let agent = msg
        .data
        .get("agent")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("agent:failure message {} has no agent name", msg.metadata.id))?;

    let restart = {
        let mut failures = failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(agent.to_string()).or_insert(0);
        *count += 1;
        tracing::warn!("⚠️ Agent '{}' failure {}/{}", agent, count, threshold);
        if *count >= threshold {
            *count = 0;
            true
        } else {
            false
        }
    };

    if restart {
        tracing::warn!("🔄 Requesting restart of agent '{}'", agent);
        let sent = bus.publish(
            CONTROL_CHANNEL,
            json!({ "command": "restart", "agent": agent }),
            PublishOptions::default(),
        );
        if !sent {
            tracing::warn!("⚠️ Restart request for '{}' was not delivered", agent);
        }
    }
    Ok(())
}
