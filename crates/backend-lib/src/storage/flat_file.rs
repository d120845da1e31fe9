//! Flat-file implementation of the `SessionStore` trait.
//!
//! Layout under the root directory:
//!
//! ```text
//! sessions/<session_id>/session.json   session row, rewritten on end
//! sessions/<session_id>/tracks.log     one PlayedTrackRow per line
//! sessions/<session_id>/likes.log      one LikeRow per line
//! sessions/<session_id>/tempo.log      one TempoVoteRow per line
//! polls/<poll_id>.json                 poll row, rewritten on close
//! ```
use super::{
    LikeRow, NewPlayedTrack, NewPoll, PlayedTrackRow, PollRow, SessionRow, SessionStore,
    TempoVoteRow,
};
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{fs as tokio_fs, io::AsyncWriteExt};

const SESSION_FILE: &str = "session.json";
const TRACKS_LOG: &str = "tracks.log";
const LIKES_LOG: &str = "likes.log";
const TEMPO_LOG: &str = "tempo.log";

#[derive(Clone)]
pub struct FlatFileStorage {
    root: PathBuf,
    next_id: Arc<AtomicU64>,
}

impl FlatFileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("sessions"))?;
        fs::create_dir_all(root.join("polls"))?;

        // Seeded from the clock so ids stay unique across restarts
        let seed = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(1);
        Ok(Self {
            root,
            next_id: Arc::new(AtomicU64::new(seed)),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, AppError> {
        if session_id.is_empty()
            || session_id.contains(['/', '\\'])
            || session_id.contains("..")
        {
            return Err(AppError::InvalidInput(format!(
                "session id '{session_id}' is not a valid path component"
            )));
        }
        Ok(self.root.join("sessions").join(session_id))
    }

    fn poll_path(&self, poll_id: u64) -> PathBuf {
        self.root.join("polls").join(format!("{poll_id}.json"))
    }

    async fn append_line<T: Serialize>(&self, path: &Path, row: &T) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(row)?;
        line.push('\n');

        let mut file = tokio_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>, AppError> {
        if !tokio_fs::try_exists(path).await? {
            return Ok(Vec::new());
        }

        let content = tokio_fs::read_to_string(path).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AppError::from))
            .collect()
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(value)?;
        tokio_fs::write(path, json).await?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, AppError> {
        if !tokio_fs::try_exists(path).await? {
            return Ok(None);
        }
        let content = tokio_fs::read_to_string(path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

#[async_trait]
impl SessionStore for FlatFileStorage {
    async fn insert_session(&self, row: &SessionRow) -> Result<(), AppError> {
        let path = self.session_dir(&row.session_id)?.join(SESSION_FILE);
        self.write_json(&path, row).await
    }

    async fn end_session(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let path = self.session_dir(session_id)?.join(SESSION_FILE);
        let mut row: SessionRow = self
            .read_json(&path)
            .await?
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;

        row.ended_at = Some(ended_at);
        self.write_json(&path, &row).await
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRow>, AppError> {
        let path = self.session_dir(session_id)?.join(SESSION_FILE);
        self.read_json(&path).await
    }

    async fn insert_played_track(
        &self,
        track: &NewPlayedTrack,
    ) -> Result<PlayedTrackRow, AppError> {
        let path = self.session_dir(&track.session_id)?.join(TRACKS_LOG);
        let row = PlayedTrackRow {
            id: self.next_id(),
            session_id: track.session_id.clone(),
            track: track.track.clone(),
            played_at: track.played_at,
        };
        self.append_line(&path, &row).await?;
        Ok(row)
    }

    async fn latest_played_track(
        &self,
        session_id: &str,
        artist: &str,
        title: &str,
    ) -> Result<Option<PlayedTrackRow>, AppError> {
        let rows = self.played_tracks(session_id).await?;

        // Later lines win ties on played_at
        Ok(rows
            .into_iter()
            .filter(|row| row.track.artist == artist && row.track.title == title)
            .fold(None, |latest: Option<PlayedTrackRow>, row| match latest {
                Some(current) if current.played_at > row.played_at => Some(current),
                _ => Some(row),
            }))
    }

    async fn played_tracks(&self, session_id: &str) -> Result<Vec<PlayedTrackRow>, AppError> {
        let path = self.session_dir(session_id)?.join(TRACKS_LOG);
        self.read_lines(&path).await
    }

    async fn insert_like(&self, like: &LikeRow) -> Result<(), AppError> {
        let path = self.session_dir(&like.session_id)?.join(LIKES_LOG);
        self.append_line(&path, like).await
    }

    async fn insert_tempo_votes(&self, votes: &TempoVoteRow) -> Result<(), AppError> {
        let path = self.session_dir(&votes.session_id)?.join(TEMPO_LOG);
        self.append_line(&path, votes).await
    }

    async fn insert_poll(&self, poll: &NewPoll) -> Result<u64, AppError> {
        let id = self.next_id();
        let row = PollRow {
            id,
            session_id: poll.session_id.clone(),
            question: poll.question.clone(),
            options: poll.options.clone(),
            opened_at: poll.opened_at,
            closed_at: None,
            votes: vec![0; poll.options.len()],
        };
        self.write_json(&self.poll_path(id), &row).await?;
        Ok(id)
    }

    async fn close_poll(
        &self,
        poll_id: u64,
        votes: &[u32],
        closed_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let path = self.poll_path(poll_id);
        let mut row: PollRow = self
            .read_json(&path)
            .await?
            .ok_or_else(|| AppError::Store(format!("poll {poll_id} not found")))?;

        row.votes = votes.to_vec();
        row.closed_at = Some(closed_at);
        self.write_json(&path, &row).await
    }
}
