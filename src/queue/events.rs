// Job lifecycle events: logged, and fanned out to any subscriber (metrics sinks, dashboards)

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::queue::jobs::JobKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Completed {
        job_id: String,
        kind: JobKind,
        subject_id: String,
        attempts: u32,
    },
    Retrying {
        job_id: String,
        kind: JobKind,
        subject_id: String,
        attempts: u32,
        delay_ms: u64,
        error: String,
    },
    Failed {
        job_id: String,
        kind: JobKind,
        subject_id: String,
        attempts: u32,
        error: String,
    },
    Discarded {
        job_id: String,
        kind: JobKind,
        subject_id: String,
        reason: String,
    },
    Stalled {
        job_id: String,
        requeued: bool,
    },
}

#[derive(Clone)]
pub struct JobEvents {
    tx: broadcast::Sender<JobEvent>,
}

impl JobEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: JobEvent) {
        match &event {
            JobEvent::Completed { job_id, kind, subject_id, attempts } => {
                info!(job_id = %job_id, kind = %kind, subject_id = %subject_id, attempts, "Job completed");
            }
            JobEvent::Retrying { job_id, kind, subject_id, attempts, delay_ms, error } => {
                warn!(job_id = %job_id, kind = %kind, subject_id = %subject_id, attempts, delay_ms, error = %error, "Job failed, retry scheduled");
            }
            JobEvent::Failed { job_id, kind, subject_id, attempts, error } => {
                warn!(job_id = %job_id, kind = %kind, subject_id = %subject_id, attempts, error = %error, "Job failed");
            }
            JobEvent::Discarded { job_id, kind, subject_id, reason } => {
                warn!(job_id = %job_id, kind = %kind, subject_id = %subject_id, reason = %reason, "Job discarded");
            }
            JobEvent::Stalled { job_id, requeued } => {
                warn!(job_id = %job_id, requeued, "Stalled job reclaimed");
            }
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for JobEvents {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let events = JobEvents::default();
        let mut rx = events.subscribe();

        events.emit(JobEvent::Stalled { job_id: "trade_analysis:t1".to_string(), requeued: true });

        let received = rx.recv().await.unwrap();
        assert_eq!(
            received,
            JobEvent::Stalled { job_id: "trade_analysis:t1".to_string(), requeued: true }
        );
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        JobEvents::new(4).emit(JobEvent::Stalled { job_id: "x".to_string(), requeued: false });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(JobEvent::Completed {
            job_id: "trade_analysis:t1".to_string(),
            kind: JobKind::TradeAnalysis,
            subject_id: "t1".to_string(),
            attempts: 1,
        })
        .unwrap();
        assert_eq!(json["event"], "completed");
        assert_eq!(json["kind"], "trade_analysis");
    }
}
