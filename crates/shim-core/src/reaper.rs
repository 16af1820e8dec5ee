//! The exit reaper: the single consumer
//! of exit records produced by every `WaitTracker`. Bridges a bounded
//! mpsc channel to event publishing, so a slow or failing publisher can
//! never block the wait trackers that feed it — it only ever applies
//! backpressure up to the channel's capacity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::event::{Event, EventPublisher};

/// Channel depth for records flowing from wait trackers into the reaper.
pub const REAPER_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct ExitRecord {
    pub container_id: String,
    pub exec_id: Option<String>,
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: DateTime<Utc>,
}

pub struct ExitReaper {
    tx: mpsc::Sender<ExitRecord>,
}

impl ExitReaper {
    /// Spawns the reaper task and returns a handle to enqueue records
    /// onto it. The task runs until every sender (including this handle's
    /// clones) is dropped.
    pub fn spawn(publisher: Arc<dyn EventPublisher>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ExitRecord>(REAPER_QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let event = match &record.exec_id {
                    None => Event::TaskExit {
                        container_id: record.container_id.clone(),
                        id: record.container_id.clone(),
                        pid: record.pid,
                        exit_status: record.exit_status,
                        exited_at: record.exited_at,
                    },
                    Some(exec_id) => Event::TaskExit {
                        container_id: record.container_id.clone(),
                        id: exec_id.clone(),
                        pid: record.pid,
                        exit_status: record.exit_status,
                        exited_at: record.exited_at,
                    },
                };
                publisher.publish(event).await;
            }
        });

        Self { tx }
    }

    /// Enqueues a record. If the channel is full, waits for room rather
    /// than dropping — the reaper is slow, not unbounded, but an exit
    /// must never be silently lost.
    pub async fn enqueue(&self, record: ExitRecord) {
        if self.tx.send(record).await.is_err() {
            tracing::error!("exit reaper channel closed; exit record dropped");
        }
    }

    pub fn handle(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordingEventPublisher;

    #[tokio::test]
    async fn enqueued_record_becomes_published_event() {
        let publisher = Arc::new(RecordingEventPublisher::new());
        let reaper = ExitReaper::spawn(publisher.clone());

        reaper
            .enqueue(ExitRecord {
                container_id: "c1".into(),
                exec_id: None,
                pid: 42,
                exit_status: 0,
                exited_at: Utc::now(),
            })
            .await;

        // Give the reaper task a turn.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let events = publisher.events().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::TaskExit { pid: 42, .. }));
    }
}
