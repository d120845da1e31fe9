//! Lifecycle telemetry (connect, disconnect, reconnect, end).
//!
//! Sinks are external collaborators. Events are handed over on a detached
//! task, so a slow or failing sink never holds up the caller.
use crate::metrics::LIFECYCLE_EVENT;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Connect,
    Disconnect,
    Reconnect,
    End,
}

impl LifecycleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleKind::Connect => "connect",
            LifecycleKind::Disconnect => "disconnect",
            LifecycleKind::Reconnect => "reconnect",
            LifecycleKind::End => "end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub session_id: String,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
}

impl LifecycleEvent {
    pub fn new(kind: LifecycleKind, session_id: impl Into<String>) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            reason: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Telemetry sink
pub trait Telemetry: Send + Sync {
    fn record(&self, event: LifecycleEvent);
}

/// Emits lifecycle events as structured log lines plus a counter
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn record(&self, event: LifecycleEvent) {
        counter!(LIFECYCLE_EVENT, "kind" => event.kind.as_str()).increment(1);
        tracing::info!(
            target: "pika::telemetry",
            kind = event.kind.as_str(),
            session_id = %event.session_id,
            reason = event.reason.as_deref().unwrap_or(""),
            metadata = %event.metadata,
            "lifecycle event"
        );
    }
}

/// Fire-and-forget: the event is recorded on its own task
pub fn emit_detached(telemetry: &Arc<dyn Telemetry>, event: LifecycleEvent) {
    let telemetry = Arc::clone(telemetry);
    tokio::spawn(async move {
        telemetry.record(event);
    });
}
