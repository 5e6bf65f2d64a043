use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::circuit::CircuitState;
use crate::dead_letter::DeadLetterId;
use crate::job::{ExecutionId, FencingToken, InstanceId, JobId};

/// Metadata envelope attached to every lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub instance_id: InstanceId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(instance_id: InstanceId, correlation_id: Option<Uuid>) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            instance_id,
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WardenEvent {
    pub meta: EventMeta,
    pub payload: EventPayload,
}

impl WardenEvent {
    pub fn new(instance_id: InstanceId, payload: EventPayload) -> Self {
        Self {
            meta: EventMeta::new(instance_id, None),
            payload,
        }
    }

    /// Builds an event that shares the correlation id of an execution.
    pub fn correlated(instance_id: InstanceId, execution: ExecutionId, payload: EventPayload) -> Self {
        Self {
            meta: EventMeta::new(instance_id, Some(execution.0)),
            payload,
        }
    }
}

/// Why an acquisition attempt ended without a lock.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockFailReason {
    /// Another owner holds the lease.
    Contended,
    /// The store could not be reached or returned an error.
    StoreError,
    /// This process already holds the lease for the job.
    HeldLocally,
}

impl LockFailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockFailReason::Contended => "contended",
            LockFailReason::StoreError => "store_error",
            LockFailReason::HeldLocally => "held_locally",
        }
    }
}

/// Event payload emitted for lock, breaker and job transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EventPayload {
    LockAcquired {
        job_id: JobId,
        fencing_token: FencingToken,
        attempts: u32,
    },
    LockFailed {
        job_id: JobId,
        reason: LockFailReason,
        attempts: u32,
    },
    LockExtended {
        job_id: JobId,
        fencing_token: FencingToken,
        ttl_ms: u64,
    },
    LockReleased {
        job_id: JobId,
        fencing_token: FencingToken,
        held_for_ms: u64,
    },
    /// An extension found the lease gone or owned by someone else.
    LockLost {
        job_id: JobId,
        fencing_token: FencingToken,
    },
    CircuitStateChanged {
        breaker: String,
        from: CircuitState,
        to: CircuitState,
    },
    CircuitRejected {
        breaker: String,
        state: CircuitState,
    },
    JobStarted {
        job_id: JobId,
        execution_id: ExecutionId,
        fencing_token: FencingToken,
    },
    JobRetrying {
        job_id: JobId,
        execution_id: ExecutionId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    JobSucceeded {
        job_id: JobId,
        execution_id: ExecutionId,
        attempts: u32,
        duration_ms: u64,
    },
    JobFailed {
        job_id: JobId,
        execution_id: ExecutionId,
        attempts: u32,
        error: String,
    },
    JobDeadLettered {
        job_id: JobId,
        execution_id: ExecutionId,
        entry_id: DeadLetterId,
        attempts: u32,
    },
    /// The lock was held elsewhere, so this instance did not run the job.
    JobSkipped {
        job_id: JobId,
        execution_id: ExecutionId,
    },
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::LockAcquired { .. } => "lock_acquired",
            EventPayload::LockFailed { .. } => "lock_failed",
            EventPayload::LockExtended { .. } => "lock_extended",
            EventPayload::LockReleased { .. } => "lock_released",
            EventPayload::LockLost { .. } => "lock_lost",
            EventPayload::CircuitStateChanged { .. } => "circuit_state_changed",
            EventPayload::CircuitRejected { .. } => "circuit_rejected",
            EventPayload::JobStarted { .. } => "job_started",
            EventPayload::JobRetrying { .. } => "job_retrying",
            EventPayload::JobSucceeded { .. } => "job_succeeded",
            EventPayload::JobFailed { .. } => "job_failed",
            EventPayload::JobDeadLettered { .. } => "job_dead_lettered",
            EventPayload::JobSkipped { .. } => "job_skipped",
        }
    }

    /// Job the event concerns, if any. Breaker events have none.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            EventPayload::LockAcquired { job_id, .. }
            | EventPayload::LockFailed { job_id, .. }
            | EventPayload::LockExtended { job_id, .. }
            | EventPayload::LockReleased { job_id, .. }
            | EventPayload::LockLost { job_id, .. }
            | EventPayload::JobStarted { job_id, .. }
            | EventPayload::JobRetrying { job_id, .. }
            | EventPayload::JobSucceeded { job_id, .. }
            | EventPayload::JobFailed { job_id, .. }
            | EventPayload::JobDeadLettered { job_id, .. }
            | EventPayload::JobSkipped { job_id, .. } => Some(job_id),
            EventPayload::CircuitStateChanged { .. } | EventPayload::CircuitRejected { .. } => {
                None
            }
        }
    }
}

/// Sink for lifecycle events.
///
/// Publishing must not block; implementations that forward events out of
/// process should buffer internally.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: WardenEvent) -> anyhow::Result<()>;
}

/// Source of lifecycle events for in-process listeners.
pub trait EventSubscriber: Send + Sync {
    /// Subscribe to events, returning a broadcast receiver.
    ///
    /// Multiple subscribers can receive the same events (fan-out).
    fn subscribe(&self) -> broadcast::Receiver<WardenEvent>;
}

/// Publisher that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: WardenEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shared publisher handle used by every component.
pub type SharedPublisher = Arc<dyn EventPublisher>;

pub(crate) fn noop_publisher() -> SharedPublisher {
    Arc::new(NoopPublisher)
}

/// Publishes `payload` and logs, rather than propagates, a publisher error.
pub(crate) fn emit(publisher: &dyn EventPublisher, instance_id: &InstanceId, payload: EventPayload) {
    let name = payload.name();
    if let Err(err) = publisher.publish(WardenEvent::new(instance_id.clone(), payload)) {
        tracing::warn!(event = name, "failed to publish event: {err}");
    }
}

/// In-process event bus using tokio broadcast channels.
///
/// Events are broadcast to all active subscribers; a subscriber that lags
/// behind receives `RecvError::Lagged` but never blocks the publisher.
/// Events published with no subscribers are dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<WardenEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl EventPublisher for InProcEventBus {
    fn publish(&self, event: WardenEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

impl EventSubscriber for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<WardenEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn acquired(job: &str, token: u64) -> WardenEvent {
        WardenEvent::new(
            InstanceId::new("test-instance"),
            EventPayload::LockAcquired {
                job_id: JobId::from(job),
                fencing_token: FencingToken(token),
                attempts: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(100);

        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        for i in 0..5 {
            bus.publish(acquired("report", i)).unwrap();
        }

        for i in 0..5 {
            let evt1 = timeout(Duration::from_millis(100), rx1.recv())
                .await
                .unwrap()
                .unwrap();
            let evt2 = timeout(Duration::from_millis(100), rx2.recv())
                .await
                .unwrap()
                .unwrap();
            for evt in [evt1, evt2] {
                match evt.payload {
                    EventPayload::LockAcquired { fencing_token, .. } => {
                        assert_eq!(fencing_token, FencingToken(i))
                    }
                    other => panic!("unexpected payload {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(acquired("report", i)).unwrap();
        }

        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        match result.unwrap() {
            Err(broadcast::error::RecvError::Lagged(_)) | Ok(_) => {}
            Err(broadcast::error::RecvError::Closed) => {
                panic!("Channel should not be closed");
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::new(4);
        assert!(bus.publish(acquired("report", 1)).is_ok());
        assert!(NoopPublisher.publish(acquired("report", 1)).is_ok());
    }

    #[test]
    fn test_event_bus_debug_format() {
        let bus = InProcEventBus::new(100);
        let _rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();

        let debug_str = format!("{:?}", bus);
        assert!(debug_str.contains("InProcEventBus"));
        assert!(debug_str.contains("subscribers: 2"));
        assert!(debug_str.contains("capacity: 100"));
    }

    #[test]
    fn test_event_meta_creation() {
        let correlation_id = Uuid::now_v7();
        let meta = EventMeta::new(InstanceId::new("a"), Some(correlation_id));
        assert_eq!(meta.version, 1);
        assert_eq!(meta.correlation_id, correlation_id);
        assert_eq!(meta.instance_id.as_str(), "a");
        assert!(meta.timestamp <= Utc::now());
    }

    #[test]
    fn test_payload_serializes_with_type_tag() {
        let payload = EventPayload::CircuitStateChanged {
            breaker: "mailer".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "circuit_state_changed");
        assert_eq!(json["to"], "open");
        assert!(payload.job_id().is_none());
        assert_eq!(payload.name(), "circuit_state_changed");
    }

    #[test]
    fn test_payload_job_id() {
        let payload = EventPayload::JobSkipped {
            job_id: JobId::from("daily-report"),
            execution_id: ExecutionId::new(),
        };
        assert_eq!(payload.job_id().map(JobId::as_str), Some("daily-report"));
    }
}
