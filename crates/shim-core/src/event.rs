//! Best-effort event publishing: the dispatcher and the
//! exit reaper both publish lifecycle events to the orchestrator, but a
//! publish failure never fails the RPC that triggered it and is never
//! retried — it is logged and forgotten, matching `RemoteEventSender` in
//! the reference shim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TaskCreate {
        container_id: String,
        pid: u32,
    },
    TaskStart {
        container_id: String,
        pid: u32,
    },
    TaskExit {
        container_id: String,
        id: String,
        pid: u32,
        exit_status: u32,
        exited_at: DateTime<Utc>,
    },
    TaskDelete {
        container_id: String,
        pid: u32,
        exit_status: u32,
        exited_at: DateTime<Utc>,
    },
    TaskPaused {
        container_id: String,
    },
    TaskResumed {
        container_id: String,
    },
    TaskOom {
        container_id: String,
    },
    TaskExecAdded {
        container_id: String,
        exec_id: String,
    },
    TaskExecStarted {
        container_id: String,
        exec_id: String,
        pid: u32,
    },
}

/// Publishes one event per call. Implementations must not block the
/// caller on delivery and must not propagate transport failures.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event);
}

/// Drops every event. Used where no one is listening (e.g. a detached
/// cleanup path) without special-casing the caller.
#[derive(Default)]
pub struct NopEventPublisher;

#[async_trait]
impl EventPublisher for NopEventPublisher {
    async fn publish(&self, _event: Event) {}
}

/// Records every published event in order. Used by tests that assert on
/// the exact event sequence a dispatcher call produces.
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: tokio::sync::Mutex<Vec<Event>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: Event) {
        self.events.lock().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_publisher_preserves_order() {
        let publisher = RecordingEventPublisher::new();
        publisher
            .publish(Event::TaskCreate {
                container_id: "a".into(),
                pid: 1,
            })
            .await;
        publisher
            .publish(Event::TaskStart {
                container_id: "a".into(),
                pid: 1,
            })
            .await;
        let events = publisher.events().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::TaskCreate { .. }));
        assert!(matches!(events[1], Event::TaskStart { .. }));
    }
}
