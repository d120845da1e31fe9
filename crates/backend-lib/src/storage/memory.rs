//! In-process store.
//!
//! Backs `storage.backend = "memory"` and the test suites. Every successful
//! write is appended to an ordered write log, and a handful of knobs inject
//! the latency, failures and lagging visibility a remote store shows.
use super::{
    LikeRow, NewPlayedTrack, NewPoll, PlayedTrackRow, PollRow, SessionRow, SessionStore,
    TempoVoteRow,
};
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Which table a logged write touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Session,
    SessionEnded,
    PlayedTrack,
    Like,
    TempoVotes,
    Poll,
    PollClosed,
}

/// One successful write, in commit order
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub seq: u64,
    pub kind: WriteKind,
    pub session_id: String,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, SessionRow>,
    tracks: Vec<PlayedTrackRow>,
    likes: Vec<LikeRow>,
    tempo: Vec<TempoVoteRow>,
    polls: Vec<PollRow>,
    writes: Vec<WriteRecord>,
    next_id: u64,
    track_lookups: usize,
}

impl Tables {
    fn log(&mut self, kind: WriteKind, session_id: &str) {
        let seq = self.writes.len() as u64 + 1;
        self.writes.push(WriteRecord {
            seq,
            kind,
            session_id: session_id.to_string(),
        });
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default, Clone)]
struct Faults {
    session_insert_delay: Duration,
    track_insert_delay: Duration,
    fail_session_inserts: bool,
    fail_track_inserts: bool,
    fail_session_updates: bool,
    /// Played tracks stay invisible to `latest_played_track`
    hide_tracks: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_session_insert_delay(&self, delay: Duration) {
        self.faults.lock().session_insert_delay = delay;
    }

    pub fn set_track_insert_delay(&self, delay: Duration) {
        self.faults.lock().track_insert_delay = delay;
    }

    pub fn fail_session_inserts(&self, fail: bool) {
        self.faults.lock().fail_session_inserts = fail;
    }

    pub fn fail_track_inserts(&self, fail: bool) {
        self.faults.lock().fail_track_inserts = fail;
    }

    pub fn fail_session_updates(&self, fail: bool) {
        self.faults.lock().fail_session_updates = fail;
    }

    pub fn hide_tracks(&self, hide: bool) {
        self.faults.lock().hide_tracks = hide;
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.tables.lock().writes.clone()
    }

    pub fn writes_of(&self, kind: WriteKind) -> Vec<WriteRecord> {
        self.tables
            .lock()
            .writes
            .iter()
            .filter(|w| w.kind == kind)
            .cloned()
            .collect()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRow> {
        self.tables.lock().sessions.get(session_id).cloned()
    }

    pub fn tracks(&self) -> Vec<PlayedTrackRow> {
        self.tables.lock().tracks.clone()
    }

    pub fn likes(&self) -> Vec<LikeRow> {
        self.tables.lock().likes.clone()
    }

    pub fn tempo_rows(&self) -> Vec<TempoVoteRow> {
        self.tables.lock().tempo.clone()
    }

    pub fn polls(&self) -> Vec<PollRow> {
        self.tables.lock().polls.clone()
    }

    /// Number of `latest_played_track` calls served so far
    pub fn track_lookups(&self) -> usize {
        self.tables.lock().track_lookups
    }

    fn faults(&self) -> Faults {
        self.faults.lock().clone()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, row: &SessionRow) -> Result<(), AppError> {
        let faults = self.faults();
        if !faults.session_insert_delay.is_zero() {
            tokio::time::sleep(faults.session_insert_delay).await;
        }
        if faults.fail_session_inserts {
            return Err(AppError::Store("session insert rejected".to_string()));
        }

        let mut tables = self.tables.lock();
        tables.sessions.insert(row.session_id.clone(), row.clone());
        tables.log(WriteKind::Session, &row.session_id);
        Ok(())
    }

    async fn end_session(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if self.faults().fail_session_updates {
            return Err(AppError::Store("session update rejected".to_string()));
        }

        let mut tables = self.tables.lock();
        let row = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;
        row.ended_at = Some(ended_at);
        tables.log(WriteKind::SessionEnded, session_id);
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRow>, AppError> {
        Ok(self.session(session_id))
    }

    async fn insert_played_track(
        &self,
        track: &NewPlayedTrack,
    ) -> Result<PlayedTrackRow, AppError> {
        let faults = self.faults();
        if !faults.track_insert_delay.is_zero() {
            tokio::time::sleep(faults.track_insert_delay).await;
        }
        if faults.fail_track_inserts {
            return Err(AppError::Store("track insert rejected".to_string()));
        }

        let mut tables = self.tables.lock();
        let row = PlayedTrackRow {
            id: tables.next_id(),
            session_id: track.session_id.clone(),
            track: track.track.clone(),
            played_at: track.played_at,
        };
        tables.tracks.push(row.clone());
        tables.log(WriteKind::PlayedTrack, &track.session_id);
        Ok(row)
    }

    async fn latest_played_track(
        &self,
        session_id: &str,
        artist: &str,
        title: &str,
    ) -> Result<Option<PlayedTrackRow>, AppError> {
        let hidden = self.faults().hide_tracks;
        let mut tables = self.tables.lock();
        tables.track_lookups += 1;
        if hidden {
            return Ok(None);
        }

        // Insertion order breaks played_at ties
        Ok(tables
            .tracks
            .iter()
            .filter(|row| {
                row.session_id == session_id
                    && row.track.artist == artist
                    && row.track.title == title
            })
            .fold(None, |latest: Option<&PlayedTrackRow>, row| match latest {
                Some(current) if current.played_at > row.played_at => Some(current),
                _ => Some(row),
            })
            .cloned())
    }

    async fn played_tracks(&self, session_id: &str) -> Result<Vec<PlayedTrackRow>, AppError> {
        Ok(self
            .tables
            .lock()
            .tracks
            .iter()
            .filter(|row| row.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn insert_like(&self, like: &LikeRow) -> Result<(), AppError> {
        let mut tables = self.tables.lock();
        if !tables.tracks.iter().any(|t| t.id == like.played_track_id) {
            return Err(AppError::Store(format!(
                "like references unknown played track {}",
                like.played_track_id
            )));
        }
        tables.likes.push(like.clone());
        tables.log(WriteKind::Like, &like.session_id);
        Ok(())
    }

    async fn insert_tempo_votes(&self, votes: &TempoVoteRow) -> Result<(), AppError> {
        let mut tables = self.tables.lock();
        tables.tempo.push(votes.clone());
        tables.log(WriteKind::TempoVotes, &votes.session_id);
        Ok(())
    }

    async fn insert_poll(&self, poll: &NewPoll) -> Result<u64, AppError> {
        let mut tables = self.tables.lock();
        let id = tables.next_id();
        tables.polls.push(PollRow {
            id,
            session_id: poll.session_id.clone(),
            question: poll.question.clone(),
            options: poll.options.clone(),
            opened_at: poll.opened_at,
            closed_at: None,
            votes: vec![0; poll.options.len()],
        });
        tables.log(WriteKind::Poll, &poll.session_id);
        Ok(id)
    }

    async fn close_poll(
        &self,
        poll_id: u64,
        votes: &[u32],
        closed_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut tables = self.tables.lock();
        let row = tables
            .polls
            .iter_mut()
            .find(|p| p.id == poll_id)
            .ok_or_else(|| AppError::Store(format!("poll {poll_id} not found")))?;
        row.votes = votes.to_vec();
        row.closed_at = Some(closed_at);
        let session_id = row.session_id.clone();
        tables.log(WriteKind::PollClosed, &session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pika_common::TrackInfo;

    fn new_track(session_id: &str, artist: &str, title: &str) -> NewPlayedTrack {
        NewPlayedTrack {
            session_id: session_id.to_string(),
            track: TrackInfo::new(artist, title),
            played_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_write_log_is_ordered() {
        let store = MemoryStore::new();
        store
            .insert_session(&SessionRow {
                session_id: "s1".to_string(),
                dj_name: "DJ".to_string(),
                dj_id: None,
                started_at: Utc::now(),
                ended_at: None,
            })
            .await
            .unwrap();
        let row = store.insert_played_track(&new_track("s1", "A", "B")).await.unwrap();
        store
            .insert_like(&LikeRow {
                session_id: "s1".to_string(),
                played_track_id: row.id,
                client_id: None,
                liked_at: Utc::now(),
            })
            .await
            .unwrap();

        let kinds: Vec<WriteKind> = store.writes().iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![WriteKind::Session, WriteKind::PlayedTrack, WriteKind::Like]
        );
    }

    #[tokio::test]
    async fn test_like_requires_existing_track() {
        let store = MemoryStore::new();
        let result = store
            .insert_like(&LikeRow {
                session_id: "s1".to_string(),
                played_track_id: 42,
                client_id: Some("c1".to_string()),
                liked_at: Utc::now(),
            })
            .await;
        assert!(result.is_err());
        assert!(store.likes().is_empty());
    }

    #[tokio::test]
    async fn test_hidden_tracks_are_not_visible() {
        let store = MemoryStore::new();
        store.insert_played_track(&new_track("s1", "A", "B")).await.unwrap();
        store.hide_tracks(true);
        assert!(store
            .latest_played_track("s1", "A", "B")
            .await
            .unwrap()
            .is_none());
        store.hide_tracks(false);
        assert!(store
            .latest_played_track("s1", "A", "B")
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.track_lookups(), 2);
    }
}
