//! Event bus shared by agents and the orchestrator

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::protocol::{Event, LogLevel};

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Process-wide publish/subscribe channel for [`Event`]s
///
/// Publishing never blocks and never fails: with no subscribers the event
/// is dropped. Slow subscribers skip the events they lagged behind on.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: Event) {
        debug!(kind = event.kind(), "Publishing event");
        let _ = self.sender.send(event);
    }

    /// Publish a log line on behalf of `source`
    pub fn log(&self, source: &str, level: LogLevel, message: impl Into<String>) {
        self.publish(Event::Log {
            source: source.to_string(),
            level,
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiving end of the bus
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Handle given to a task adapter for the duration of one invocation
#[derive(Clone)]
pub struct Emitter {
    agent: String,
    bus: EventBus,
    streaming: bool,
}

impl Emitter {
    pub(crate) fn new(agent: &str, bus: EventBus, streaming: bool) -> Self {
        Self {
            agent: agent.to_string(),
            bus,
            streaming,
        }
    }

    /// Emit a log line attributed to the agent
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.bus.log(&self.agent, level, message);
    }

    /// Emit incremental output. Dropped unless the step is streaming.
    pub fn stream(&self, chunk: Value) {
        if !self.streaming {
            return;
        }
        self.bus.publish(Event::StreamChunk {
            agent: self.agent.clone(),
            chunk,
            at: Utc::now(),
        });
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }
}
