use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use warden::{EventPayload, EventPublisher, JobId, WardenEvent};

/// Publisher that keeps every event in memory.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<WardenEvent>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `publish` return an error (events are still recorded).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<WardenEvent> {
        self.events.lock().clone()
    }

    pub fn payloads(&self) -> Vec<EventPayload> {
        self.events.lock().iter().map(|event| event.payload.clone()).collect()
    }

    /// Event names in publication order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|event| event.payload.name()).collect()
    }

    /// Event names for one job, in publication order.
    pub fn names_for(&self, job_id: &JobId) -> Vec<&'static str> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.payload.job_id() == Some(job_id))
            .map(|event| event.payload.name())
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.payload.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: WardenEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("injected publisher fault");
        }
        Ok(())
    }
}
