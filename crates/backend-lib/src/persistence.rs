// ============================
// crates/backend-lib/src/persistence.rs
// ============================
//! Persistence jobs: played tracks, likes and tempo tallies.
//!
//! These functions are meant to run inside a session's pipeline lane (see
//! [`crate::pipeline`]); they rely on it for ordering. None of them return
//! an error: every failure is logged and counted, and the outcome enum tells
//! tests what happened.
use crate::metrics::{
    LIKE_DROPPED, LIKE_PERSISTED, LIKE_RETRY, STORE_WRITE_FAILED, TEMPO_FLUSHED,
    TRACK_DEDUPLICATED, TRACK_NOT_READY, TRACK_PERSISTED,
};
use crate::readiness::ReadinessGate;
use crate::storage::{LikeRow, NewPlayedTrack, PlayedTrackRow, SessionStore, TempoVoteRow};
use crate::tempo::TempoCounts;
use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use pika_common::TrackInfo;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bounded retry with doubling delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base, 2*base, 4*base, ...
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_backoff.saturating_mul(1u32 << retry.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackOutcome {
    Persisted(PlayedTrackRow),
    /// Same track as the last one persisted for the session
    Duplicate,
    /// Session row never confirmed within the timeout
    NotReady,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LikeOutcome {
    Persisted { played_track_id: u64, lookups: u32 },
    /// No matching played track appeared; the like is lost
    Dropped { lookups: u32 },
    Failed,
}

#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn SessionStore>,
    gate: Arc<ReadinessGate>,
    /// Session id -> `artist:title` of the last persisted track
    dedup: Arc<DashMap<String, String>>,
    track_ready_timeout: Duration,
    like_retry: RetryPolicy,
}

impl Persistence {
    pub fn new(
        store: Arc<dyn SessionStore>,
        gate: Arc<ReadinessGate>,
        track_ready_timeout: Duration,
        like_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            gate,
            dedup: Arc::new(DashMap::new()),
            track_ready_timeout,
            like_retry,
        }
    }

    /// Write a played-track row unless it repeats the session's last one
    pub async fn persist_track(&self, session_id: &str, track: &TrackInfo) -> TrackOutcome {
        let key = track.dedup_key();

        if !self
            .gate
            .ensure_ready(session_id, self.track_ready_timeout)
            .await
        {
            counter!(TRACK_NOT_READY).increment(1);
            warn!(
                session_id,
                artist = %track.artist,
                title = %track.title,
                "Session not persisted in time, skipping track write"
            );
            return TrackOutcome::NotReady;
        }

        // The session may have ended between the signal and now
        if !self.gate.is_persisted(session_id) {
            counter!(TRACK_NOT_READY).increment(1);
            warn!(session_id, key = %key, "Session no longer persisted, skipping track write");
            return TrackOutcome::NotReady;
        }

        if self.dedup.get(session_id).is_some_and(|last| *last == key) {
            counter!(TRACK_DEDUPLICATED).increment(1);
            debug!(session_id, key = %key, "Track already persisted, skipping");
            return TrackOutcome::Duplicate;
        }

        let new_track = NewPlayedTrack {
            session_id: session_id.to_string(),
            track: track.clone(),
            played_at: Utc::now(),
        };
        match self.store.insert_played_track(&new_track).await {
            Ok(row) => {
                self.dedup.insert(session_id.to_string(), key);
                counter!(TRACK_PERSISTED).increment(1);
                info!(session_id, track_id = row.id, artist = %track.artist, title = %track.title, "Persisted track");
                TrackOutcome::Persisted(row)
            },
            Err(e) => {
                counter!(STORE_WRITE_FAILED, "table" => "played_tracks").increment(1);
                error!(
                    session_id,
                    artist = %track.artist,
                    title = %track.title,
                    error = %e,
                    "Failed to persist track"
                );
                TrackOutcome::Failed
            },
        }
    }

    /// Attach a like to the most recent play of `track` in the session.
    ///
    /// If the played-track row is not visible yet, look again after 100ms,
    /// 200ms, 400ms (with the default policy) and then give up.
    pub async fn persist_like(
        &self,
        track: &TrackInfo,
        session_id: &str,
        client_id: Option<&str>,
    ) -> LikeOutcome {
        let mut retry = 0;
        loop {
            let lookups = retry + 1;
            match self
                .store
                .latest_played_track(session_id, &track.artist, &track.title)
                .await
            {
                Ok(Some(played)) => {
                    let like = LikeRow {
                        session_id: session_id.to_string(),
                        played_track_id: played.id,
                        client_id: client_id.map(str::to_string),
                        liked_at: Utc::now(),
                    };
                    return match self.store.insert_like(&like).await {
                        Ok(()) => {
                            counter!(LIKE_PERSISTED).increment(1);
                            debug!(session_id, track_id = played.id, lookups, "Persisted like");
                            LikeOutcome::Persisted {
                                played_track_id: played.id,
                                lookups,
                            }
                        },
                        Err(e) => {
                            counter!(STORE_WRITE_FAILED, "table" => "likes").increment(1);
                            error!(
                                session_id,
                                track_id = played.id,
                                client_id = client_id.unwrap_or("anonymous"),
                                error = %e,
                                "Failed to persist like"
                            );
                            LikeOutcome::Failed
                        },
                    };
                },
                Ok(None) => {},
                Err(e) => {
                    warn!(session_id, error = %e, "Played track lookup failed");
                },
            }

            if retry >= self.like_retry.max_retries {
                counter!(LIKE_DROPPED).increment(1);
                warn!(
                    session_id,
                    artist = %track.artist,
                    title = %track.title,
                    client_id = client_id.unwrap_or("anonymous"),
                    lookups,
                    "No played track found for like, dropping it"
                );
                return LikeOutcome::Dropped { lookups };
            }

            let delay = self.like_retry.delay(retry);
            counter!(LIKE_RETRY).increment(1);
            debug!(session_id, retry = retry + 1, delay_ms = delay.as_millis() as u64, "Played track not visible yet, retrying like");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }

    /// Write final tempo tallies for a track; no-op when nobody voted
    pub async fn flush_tempo(
        &self,
        session_id: &str,
        track: &TrackInfo,
        counts: TempoCounts,
    ) -> bool {
        if counts.is_empty() {
            return false;
        }

        let row = TempoVoteRow {
            session_id: session_id.to_string(),
            artist: track.artist.clone(),
            title: track.title.clone(),
            slower: counts.slower,
            perfect: counts.perfect,
            faster: counts.faster,
            recorded_at: Utc::now(),
        };
        match self.store.insert_tempo_votes(&row).await {
            Ok(()) => {
                counter!(TEMPO_FLUSHED).increment(1);
                debug!(session_id, key = %track.dedup_key(), total = counts.total(), "Flushed tempo votes");
                true
            },
            Err(e) => {
                counter!(STORE_WRITE_FAILED, "table" => "tempo_votes").increment(1);
                error!(
                    session_id,
                    artist = %track.artist,
                    title = %track.title,
                    slower = counts.slower,
                    perfect = counts.perfect,
                    faster = counts.faster,
                    error = %e,
                    "Failed to flush tempo votes"
                );
                false
            },
        }
    }

    /// `artist:title` of the last persisted track
    pub fn last_persisted_key(&self, session_id: &str) -> Option<String> {
        self.dedup.get(session_id).map(|key| key.clone())
    }

    pub fn forget_session(&self, session_id: &str) {
        self.dedup.remove(session_id);
    }

    pub fn dedup_entries(&self) -> usize {
        self.dedup.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PersistencePipeline;
    use crate::storage::{MemoryStore, WriteKind};
    use tokio::time::Instant;

    fn setup() -> (Persistence, MemoryStore, Arc<ReadinessGate>) {
        let store = MemoryStore::new();
        let gate = Arc::new(ReadinessGate::new());
        let persistence = Persistence::new(
            Arc::new(store.clone()),
            Arc::clone(&gate),
            Duration::from_secs(4),
            RetryPolicy::default(),
        );
        (persistence, store, gate)
    }

    #[test]
    fn test_retry_delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_identical_tracks_are_persisted_once() {
        let (persistence, store, gate) = setup();
        gate.mark_persisted("s1");
        let track = TrackInfo::new("A", "B");

        for _ in 0..10 {
            persistence.persist_track("s1", &track).await;
        }
        assert_eq!(store.tracks().len(), 1);

        let outcome = persistence
            .persist_track("s1", &TrackInfo::new("A", "C"))
            .await;
        assert!(matches!(outcome, TrackOutcome::Persisted(_)));
        assert_eq!(store.tracks().len(), 2);
        assert_eq!(persistence.last_persisted_key("s1").as_deref(), Some("A:C"));

        // going back to the first track is a new play
        persistence.persist_track("s1", &track).await;
        assert_eq!(store.tracks().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_insert_does_not_set_dedup_key() {
        let (persistence, store, gate) = setup();
        gate.mark_persisted("s1");
        let track = TrackInfo::new("A", "B");

        store.fail_track_inserts(true);
        assert_eq!(
            persistence.persist_track("s1", &track).await,
            TrackOutcome::Failed
        );
        assert!(persistence.last_persisted_key("s1").is_none());

        store.fail_track_inserts(false);
        assert!(matches!(
            persistence.persist_track("s1", &track).await,
            TrackOutcome::Persisted(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_waits_for_session_row() {
        let (persistence, store, gate) = setup();
        let track = TrackInfo::new("A", "B");

        let task = {
            let persistence = persistence.clone();
            let track = track.clone();
            tokio::spawn(async move { persistence.persist_track("s1", &track).await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.tracks().is_empty());

        gate.signal_ready("s1", true);
        assert!(matches!(task.await.unwrap(), TrackOutcome::Persisted(_)));
        assert_eq!(store.tracks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_skipped_when_gate_expires() {
        let (persistence, store, _gate) = setup();
        let outcome = persistence
            .persist_track("s1", &TrackInfo::new("A", "B"))
            .await;
        assert_eq!(outcome, TrackOutcome::NotReady);
        assert!(store.tracks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_like_gives_up_after_bounded_retries() {
        let (persistence, store, _gate) = setup();
        let start = Instant::now();

        let outcome = persistence
            .persist_like(&TrackInfo::new("A", "B"), "s1", Some("client-1"))
            .await;

        assert_eq!(outcome, LikeOutcome::Dropped { lookups: 4 });
        assert_eq!(store.track_lookups(), 4);
        // 100 + 200 + 400
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(700));
        assert!(elapsed < Duration::from_millis(800));
        assert!(store.likes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_like_succeeds_once_track_becomes_visible() {
        let (persistence, store, gate) = setup();
        gate.mark_persisted("s1");
        let track = TrackInfo::new("A", "B");
        let TrackOutcome::Persisted(row) = persistence.persist_track("s1", &track).await else {
            panic!("track not persisted");
        };

        store.hide_tracks(true);
        let task = {
            let persistence = persistence.clone();
            let track = track.clone();
            tokio::spawn(async move { persistence.persist_like(&track, "s1", None).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        store.hide_tracks(false);

        assert_eq!(
            task.await.unwrap(),
            LikeOutcome::Persisted {
                played_track_id: row.id,
                lookups: 3
            }
        );
        assert_eq!(store.likes()[0].client_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_like_submitted_behind_track_attaches_to_new_play() {
        let (persistence, store, gate) = setup();
        gate.mark_persisted("s1");
        let pipeline = PersistencePipeline::new();
        let track = TrackInfo::new("A", "B");

        // An earlier play of the same track, then something else
        persistence.persist_track("s1", &track).await;
        persistence
            .persist_track("s1", &TrackInfo::new("X", "Y"))
            .await;

        store.set_track_insert_delay(Duration::from_millis(250));
        {
            let persistence = persistence.clone();
            let track = track.clone();
            pipeline.enqueue("s1", async move {
                persistence.persist_track("s1", &track).await;
            });
        }
        let like = {
            let persistence = persistence.clone();
            let track = track.clone();
            pipeline.enqueue("s1", async move {
                persistence
                    .persist_like(&track, "s1", Some("client-1"))
                    .await;
            })
        };
        like.wait().await;

        let tracks = store.tracks();
        let newest_play = tracks.last().unwrap();
        assert_eq!(newest_play.track.dedup_key(), "A:B");
        let likes = store.likes();
        assert_eq!(likes.len(), 1);
        assert_eq!(likes[0].played_track_id, newest_play.id);

        let kinds: Vec<WriteKind> = store.writes().iter().map(|w| w.kind).collect();
        assert_eq!(kinds.last(), Some(&WriteKind::Like));
    }

    #[tokio::test]
    async fn test_empty_tempo_tally_is_not_flushed() {
        let (persistence, store, _gate) = setup();
        let track = TrackInfo::new("A", "B");

        assert!(!persistence
            .flush_tempo("s1", &track, TempoCounts::default())
            .await);
        assert!(store.tempo_rows().is_empty());

        let counts = TempoCounts {
            slower: 1,
            perfect: 2,
            faster: 0,
        };
        assert!(persistence.flush_tempo("s1", &track, counts).await);
        let rows = store.tempo_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].perfect, 2);
    }
}
