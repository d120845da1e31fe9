// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const SESSION_STARTED: &str = "session.started";
pub const SESSION_RECONNECTED: &str = "session.reconnected";
pub const SESSION_ENDED: &str = "session.ended";
pub const SESSION_LIVE: &str = "session.live";
pub const TRACK_PERSISTED: &str = "track.persisted";
pub const TRACK_DEDUPLICATED: &str = "track.deduplicated";
pub const TRACK_NOT_READY: &str = "track.not_ready";
pub const LIKE_PERSISTED: &str = "like.persisted";
pub const LIKE_RETRY: &str = "like.retry";
pub const LIKE_DROPPED: &str = "like.dropped";
pub const TEMPO_FLUSHED: &str = "tempo.flushed";
pub const STORE_WRITE_FAILED: &str = "store.write_failed";
pub const LIFECYCLE_EVENT: &str = "lifecycle.event";
pub const MESSAGE_REJECTED: &str = "message.rejected";
