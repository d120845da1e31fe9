//! Shared setup for the integration tests.
#![allow(dead_code)]

use backend_lib::coordinator::{CoordinatorConfig, SessionCoordinator};
use backend_lib::hub::ChannelHub;
use backend_lib::storage::MemoryStore;
use backend_lib::telemetry::{LifecycleEvent, Telemetry};
use parking_lot::Mutex;
use std::sync::Arc;

/// Telemetry sink that keeps every event
#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingTelemetry {
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }
}

impl Telemetry for RecordingTelemetry {
    fn record(&self, event: LifecycleEvent) {
        self.events.lock().push(event);
    }
}

pub struct Harness {
    pub coordinator: Arc<SessionCoordinator>,
    pub store: MemoryStore,
    pub hub: Arc<ChannelHub>,
    pub telemetry: Arc<RecordingTelemetry>,
}

pub fn harness() -> Harness {
    harness_with(CoordinatorConfig::default())
}

pub fn harness_with(config: CoordinatorConfig) -> Harness {
    let store = MemoryStore::new();
    let hub = Arc::new(ChannelHub::new());
    let telemetry = Arc::new(RecordingTelemetry::default());
    let coordinator = Arc::new(SessionCoordinator::new(
        config,
        Arc::new(store.clone()),
        hub.clone(),
        telemetry.clone(),
    ));

    Harness {
        coordinator,
        store,
        hub,
        telemetry,
    }
}

/// Wait until every job queued so far for `session_id` has run
pub async fn drain(coordinator: &SessionCoordinator, session_id: &str) {
    coordinator.pipeline().enqueue(session_id, async {}).wait().await;
}
