//! Shared fixtures for warden tests.

pub mod events;
pub mod mock;
pub mod store;

pub use events::RecordingPublisher;
pub use mock::{CallRecord, Outcome, ScriptedHandler};
pub use store::FaultyStore;

/// Install a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; output goes through the libtest capture.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
