// ============================
// pika-backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the Pika! live DJ server.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod hub;
pub mod messages;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod polls;
pub mod protocol;
pub mod readiness;
pub mod storage;
pub mod telemetry;
pub mod tempo;
pub mod validation;
pub mod websocket;
pub mod ws_router;

use crate::config::{Settings, StoreBackend};
use crate::coordinator::{CoordinatorConfig, SessionCoordinator};
use crate::error::AppError;
use crate::hub::ChannelHub;
use crate::storage::{FlatFileStorage, MemoryStore, SessionStore};
use crate::telemetry::{Telemetry, TracingTelemetry};
use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Settings the server was started with
    pub settings: Arc<Settings>,
    /// Owner of all live-session state
    pub coordinator: Arc<SessionCoordinator>,
    /// Broadcast channels connections follow
    pub hub: Arc<ChannelHub>,
    /// Durable store backend
    pub store: Arc<dyn SessionStore>,
}

impl AppState {
    /// Create a new application state
    pub fn new(store: Arc<dyn SessionStore>, settings: Settings) -> Result<Self, AppError> {
        Self::with_telemetry(store, settings, Arc::new(TracingTelemetry))
    }

    /// Create a new application state with a custom telemetry sink
    pub fn with_telemetry(
        store: Arc<dyn SessionStore>,
        settings: Settings,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, AppError> {
        settings.validate()?;

        let hub = Arc::new(ChannelHub::new());
        let coordinator = Arc::new(SessionCoordinator::new(
            CoordinatorConfig::from(&settings),
            Arc::clone(&store),
            hub.clone(),
            telemetry,
        ));

        Ok(Self {
            settings: Arc::new(settings),
            coordinator,
            hub,
            store,
        })
    }

    /// Create a new application state with the store selected in `settings`
    pub fn from_settings(settings: Settings) -> Result<Self, anyhow::Error> {
        let store: Arc<dyn SessionStore> = match settings.storage.backend {
            StoreBackend::File => Arc::new(FlatFileStorage::new(&settings.storage.path)?),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Ok(Self::new(store, settings)?)
    }
}
