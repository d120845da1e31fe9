// ============================
// crates/backend-lib/src/storage/mod.rs
// ============================
//! Durable store abstraction.
//!
//! The coordinator only needs insert, update-by-predicate and
//! select-with-order-and-limit against four tables (sessions, played tracks,
//! likes, tempo votes) plus polls. [`SessionStore`] expresses exactly that;
//! [`FlatFileStorage`] and [`MemoryStore`] are the two backends.
//!
//! Visibility is allowed to be eventual: a row returned from an insert may
//! not show up in a following select straight away.

mod flat_file;
mod memory;

pub use flat_file::FlatFileStorage;
pub use memory::{MemoryStore, WriteKind, WriteRecord};

use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pika_common::TrackInfo;
use serde::{Deserialize, Serialize};

/// Durable session row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: String,
    pub dj_name: String,
    pub dj_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A played track before the store assigns its id
#[derive(Debug, Clone, PartialEq)]
pub struct NewPlayedTrack {
    pub session_id: String,
    pub track: TrackInfo,
    pub played_at: DateTime<Utc>,
}

/// One play instance of a track within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayedTrackRow {
    pub id: u64,
    pub session_id: String,
    #[serde(flatten)]
    pub track: TrackInfo,
    pub played_at: DateTime<Utc>,
}

/// A listener reaction tied to one play instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LikeRow {
    pub session_id: String,
    pub played_track_id: u64,
    /// `None` for anonymous listeners
    pub client_id: Option<String>,
    pub liked_at: DateTime<Utc>,
}

/// Final tempo tallies for one track of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoVoteRow {
    pub session_id: String,
    pub artist: String,
    pub title: String,
    pub slower: u32,
    pub perfect: u32,
    pub faster: u32,
    pub recorded_at: DateTime<Utc>,
}

/// A poll before the store assigns its id
#[derive(Debug, Clone, PartialEq)]
pub struct NewPoll {
    pub session_id: String,
    pub question: String,
    pub options: Vec<String>,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollRow {
    pub id: u64,
    pub session_id: String,
    pub question: String,
    pub options: Vec<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub votes: Vec<u32>,
}

/// Trait for durable store backends
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert the durable row for a newly registered session
    async fn insert_session(&self, row: &SessionRow) -> Result<(), AppError>;

    /// Set `ended_at` on a session row
    async fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>)
        -> Result<(), AppError>;

    /// Load a session row
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRow>, AppError>;

    /// Insert a played track; the store assigns the row id
    async fn insert_played_track(&self, track: &NewPlayedTrack)
        -> Result<PlayedTrackRow, AppError>;

    /// Most recent play of `artist`/`title` in a session (order by `played_at` desc, limit 1)
    async fn latest_played_track(
        &self,
        session_id: &str,
        artist: &str,
        title: &str,
    ) -> Result<Option<PlayedTrackRow>, AppError>;

    /// All plays of a session in play order
    async fn played_tracks(&self, session_id: &str) -> Result<Vec<PlayedTrackRow>, AppError>;

    async fn insert_like(&self, like: &LikeRow) -> Result<(), AppError>;

    async fn insert_tempo_votes(&self, votes: &TempoVoteRow) -> Result<(), AppError>;

    /// Insert a poll; the store assigns the poll id
    async fn insert_poll(&self, poll: &NewPoll) -> Result<u64, AppError>;

    /// Record a poll's final tallies
    async fn close_poll(
        &self,
        poll_id: u64,
        votes: &[u32],
        closed_at: DateTime<Utc>,
    ) -> Result<(), AppError>;
}
