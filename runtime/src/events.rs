//! Runtime event bus
//!
//! Lifecycle events of instances, activities, signals and schedules are
//! broadcast to any number of observers. Publishing never blocks and never
//! fails; slow observers lag and lose the oldest events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 1024;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event observed by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    InstanceStarted {
        instance_id: String,
        run_id: String,
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A worker picked up an instance a previous worker left running.
    InstanceResumed {
        instance_id: String,
        recorded_events: usize,
        timestamp: DateTime<Utc>,
    },

    InstanceCompleted {
        instance_id: String,
        kind: String,
        timestamp: DateTime<Utc>,
    },

    InstanceFailed {
        instance_id: String,
        kind: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    ActivityAttemptFailed {
        instance_id: String,
        activity: String,
        attempt: u32,
        error: String,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },

    TimerFired {
        instance_id: String,
        seq: u64,
        timestamp: DateTime<Utc>,
    },

    SignalSent {
        instance_id: String,
        channel: String,
        timestamp: DateTime<Utc>,
    },

    SignalReceived {
        instance_id: String,
        channel: String,
        timestamp: DateTime<Utc>,
    },

    ScheduleFired {
        schedule_id: String,
        instance_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl RuntimeEvent {
    /// Event type name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::InstanceStarted { .. } => "instance_started",
            Self::InstanceResumed { .. } => "instance_resumed",
            Self::InstanceCompleted { .. } => "instance_completed",
            Self::InstanceFailed { .. } => "instance_failed",
            Self::ActivityAttemptFailed { .. } => "activity_attempt_failed",
            Self::TimerFired { .. } => "timer_fired",
            Self::SignalSent { .. } => "signal_sent",
            Self::SignalReceived { .. } => "signal_received",
            Self::ScheduleFired { .. } => "schedule_fired",
        }
    }

    /// Instance the event concerns.
    pub fn instance_id(&self) -> &str {
        match self {
            Self::InstanceStarted { instance_id, .. }
            | Self::InstanceResumed { instance_id, .. }
            | Self::InstanceCompleted { instance_id, .. }
            | Self::InstanceFailed { instance_id, .. }
            | Self::ActivityAttemptFailed { instance_id, .. }
            | Self::TimerFired { instance_id, .. }
            | Self::SignalSent { instance_id, .. }
            | Self::SignalReceived { instance_id, .. }
            | Self::ScheduleFired { instance_id, .. } => instance_id,
        }
    }
}

/// Broadcast bus for [`RuntimeEvent`]s
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: RuntimeEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => trace!(event_type, receivers, "Event published"),
            Err(_) => trace!(event_type, "Event published (no receivers)"),
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(RuntimeEvent::SignalSent {
            instance_id: "manual-payment-1".to_string(),
            channel: "resolve-manual-order".to_string(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "signal_sent");
        assert_eq!(event.instance_id(), "manual-payment-1");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(RuntimeEvent::TimerFired {
            instance_id: "stale-1".to_string(),
            seq: 1,
            timestamp: Utc::now(),
        });
    }
}
