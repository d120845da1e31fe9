// ============================
// crates/backend-lib/src/coordinator.rs
// ============================
//! Session coordinator.
//!
//! One instance per process owns every piece of per-session state: the live
//! registry, listener bookkeeping, tempo tallies, polls, the readiness gate,
//! the dedup keys and the pipeline lanes. Handlers call into it; it never
//! talks to a socket directly, only to the [`Broadcaster`].
//!
//! Any operation that adds per-session state or enqueues a persistence job
//! does so while holding the session's registry entry. Teardown removes
//! that entry first, so nothing can be added for a session once its
//! teardown has started, and the final release job sees a complete picture.
use crate::config::Settings;
use crate::error::AppError;
use crate::hub::{Broadcaster, Channel};
use crate::metrics::{
    SESSION_ENDED, SESSION_LIVE, SESSION_RECONNECTED, SESSION_STARTED, STORE_WRITE_FAILED,
};
use crate::persistence::{Persistence, RetryPolicy};
use crate::pipeline::PersistencePipeline;
use crate::polls::{ActivePoll, PollBoard, PollResult};
use crate::readiness::ReadinessGate;
use crate::storage::{NewPoll, PlayedTrackRow, SessionRow, SessionStore};
use crate::telemetry::{emit_detached, LifecycleEvent, LifecycleKind, Telemetry};
use crate::tempo::{TempoBoard, TempoCounts};
use chrono::{DateTime, Utc};
use dashmap::{
    mapref::{
        entry::Entry,
        one::{Ref, RefMut},
    },
    DashMap,
};
use futures_util::future::join_all;
use metrics::{counter, gauge};
use pika_common::{ServerMessage, TempoDirection, TrackInfo};
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Identifies one WebSocket connection
pub type ConnectionId = Uuid;

/// Timeouts and policies the coordinator runs with
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Gate timeout for played-track writes and the end-of-session update
    pub track_ready_timeout: Duration,
    /// Gate timeout for poll creation
    pub poll_ready_timeout: Duration,
    pub like_retry: RetryPolicy,
    /// Treat sessions as persisted as soon as they register
    pub bypass_readiness: bool,
}

impl From<&Settings> for CoordinatorConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            track_ready_timeout: settings.readiness.track_timeout(),
            poll_ready_timeout: settings.readiness.poll_timeout(),
            like_retry: RetryPolicy {
                max_retries: settings.likes.max_retries,
                base_backoff: Duration::from_millis(settings.likes.base_backoff_ms),
            },
            bypass_readiness: settings.storage.bypass_readiness,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

#[derive(Debug, Clone)]
struct LiveSession {
    dj_name: String,
    dj_id: Option<String>,
    /// Connection currently acting as the DJ
    owner: ConnectionId,
    current_track: Option<TrackInfo>,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Started,
    /// The session was already live; this connection took it over
    Reconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `END_SESSION` from the DJ
    Ended,
    /// DJ connection closed
    Disconnected,
    /// Server shutting down
    Shutdown,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Ended => "ended",
            EndReason::Disconnected => "disconnected",
            EndReason::Shutdown => "shutdown",
        }
    }

    fn lifecycle_kind(self) -> LifecycleKind {
        match self {
            EndReason::Disconnected => LifecycleKind::Disconnect,
            EndReason::Ended | EndReason::Shutdown => LifecycleKind::End,
        }
    }
}

/// A live session as listed by discovery
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub dj_name: String,
    pub current_track: Option<TrackInfo>,
    pub listener_count: usize,
    pub started_at: DateTime<Utc>,
}

/// A listener's view of a session at subscribe time
#[derive(Debug)]
pub struct Subscription {
    /// `SESSION_STATE` reply
    pub state: ServerMessage,
    pub feed: broadcast::Receiver<ServerMessage>,
}

/// Durable history of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecap {
    pub session: SessionRow,
    pub tracks: Vec<PlayedTrackRow>,
}

pub struct SessionCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn SessionStore>,
    hub: Arc<dyn Broadcaster>,
    telemetry: Arc<dyn Telemetry>,
    gate: Arc<ReadinessGate>,
    pipeline: PersistencePipeline,
    persistence: Persistence,
    tempo: TempoBoard,
    polls: PollBoard,
    sessions: Arc<DashMap<String, LiveSession>>,
    listeners: DashMap<String, HashSet<ConnectionId>>,
}

impl SessionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn SessionStore>,
        hub: Arc<dyn Broadcaster>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let gate = Arc::new(ReadinessGate::new());
        let persistence = Persistence::new(
            Arc::clone(&store),
            Arc::clone(&gate),
            config.track_ready_timeout,
            config.like_retry,
        );

        Self {
            config,
            store,
            hub,
            telemetry,
            gate,
            pipeline: PersistencePipeline::new(),
            persistence,
            tempo: TempoBoard::new(),
            polls: PollBoard::new(),
            sessions: Arc::new(DashMap::new()),
            listeners: DashMap::new(),
        }
    }

    /// Start a session, or re-attach the DJ of one that is still live
    pub fn register_session(
        &self,
        conn: ConnectionId,
        session_id: &str,
        dj_name: &str,
        dj_id: Option<String>,
        current_track: Option<TrackInfo>,
    ) -> Result<Registration, AppError> {
        let registration = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let session = entry.get_mut();
                let previous_owner = session.owner;
                session.owner = conn;
                session.dj_name = dj_name.to_string();
                drop(entry);

                counter!(SESSION_RECONNECTED).increment(1);
                info!(session_id, %previous_owner, connection = %conn, "DJ reconnected to live session");
                emit_detached(
                    &self.telemetry,
                    LifecycleEvent::new(LifecycleKind::Reconnect, session_id)
                        .with_metadata(json!({ "djName": dj_name })),
                );
                Registration::Reconnected
            },
            Entry::Vacant(slot) => {
                let started_at = Utc::now();
                let session = slot.insert(LiveSession {
                    dj_name: dj_name.to_string(),
                    dj_id: dj_id.clone(),
                    owner: conn,
                    current_track: None,
                    started_at,
                });
                self.persist_session_row(SessionRow {
                    session_id: session_id.to_string(),
                    dj_name: dj_name.to_string(),
                    dj_id: dj_id.clone(),
                    started_at,
                    ended_at: None,
                });
                drop(session);

                counter!(SESSION_STARTED).increment(1);
                gauge!(SESSION_LIVE).set(self.sessions.len() as f64);
                info!(session_id, dj_name, connection = %conn, "Session started");

                self.hub.publish(
                    &Channel::Discovery,
                    ServerMessage::SessionStarted {
                        session_id: session_id.to_string(),
                        dj_name: dj_name.to_string(),
                    },
                );
                emit_detached(
                    &self.telemetry,
                    LifecycleEvent::new(LifecycleKind::Connect, session_id)
                        .with_metadata(json!({ "djName": dj_name, "djId": dj_id })),
                );
                Registration::Started
            },
        };

        if let Some(track) = current_track {
            self.change_track(conn, session_id, track)?;
        }
        Ok(registration)
    }

    /// Insert the durable row and report to the gate.
    ///
    /// Called with the new registry entry held. If a previous session under
    /// the same id is still draining its lane, the insert is queued behind
    /// that session's end job so the old `ended_at` cannot land on the new
    /// row. Otherwise it runs on its own task.
    fn persist_session_row(&self, row: SessionRow) {
        let bypass = self.config.bypass_readiness;
        if bypass {
            self.gate.mark_persisted(&row.session_id);
        }

        let session_id = row.session_id.clone();
        let store = Arc::clone(&self.store);
        let gate = Arc::clone(&self.gate);
        let insert = async move {
            let persisted = match store.insert_session(&row).await {
                Ok(()) => {
                    debug!(session_id = %row.session_id, "Session row persisted");
                    true
                },
                Err(e) => {
                    counter!(STORE_WRITE_FAILED, "table" => "sessions").increment(1);
                    error!(
                        session_id = %row.session_id,
                        dj_name = %row.dj_name,
                        error = %e,
                        "Failed to persist session"
                    );
                    false
                },
            };
            if !bypass {
                gate.signal_ready(&row.session_id, persisted);
            }
        };

        if self.pipeline.has_lane(&session_id) {
            debug!(session_id = %session_id, "Previous session still draining, queueing insert");
            let persistence = self.persistence.clone();
            let id = session_id.clone();
            self.pipeline.enqueue(&session_id, async move {
                persistence.forget_session(&id);
                insert.await;
            });
            return;
        }

        let gate = Arc::clone(&self.gate);
        let sessions = Arc::clone(&self.sessions);
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            insert.await;
            // Ended and released before the row landed; otherwise the
            // release job still queued in the lane clears the flag
            if !sessions.contains_key(&session_id) && !pipeline.has_lane(&session_id) {
                gate.forget(&session_id);
            }
        });
    }

    /// New "now playing" track from the DJ
    pub fn change_track(
        &self,
        conn: ConnectionId,
        session_id: &str,
        track: TrackInfo,
    ) -> Result<(), AppError> {
        let mut session = self.owned_session(conn, session_id)?;
        let previous = session.current_track.replace(track.clone());

        if let Some(previous) = previous.filter(|prev| !prev.same_song(&track)) {
            let counts = self.tempo.take(session_id);
            self.enqueue_tempo_flush(session_id, previous, counts);
        }

        let now_playing = ServerMessage::NowPlaying {
            session_id: session_id.to_string(),
            track: track.clone(),
        };
        self.hub
            .publish(&Channel::Session(session_id.to_string()), now_playing.clone());
        self.hub.publish(&Channel::Discovery, now_playing);

        let persistence = self.persistence.clone();
        let id = session_id.to_string();
        self.pipeline.enqueue(session_id, async move {
            persistence.persist_track(&id, &track).await;
        });

        drop(session);
        Ok(())
    }

    /// Broadcast a like and persist it behind any pending track write
    pub fn record_like(
        &self,
        session_id: &str,
        track: TrackInfo,
        client_id: Option<String>,
    ) -> Result<(), AppError> {
        let _live = self.live(session_id)?;

        self.hub.publish(
            &Channel::Session(session_id.to_string()),
            ServerMessage::LikeReceived {
                session_id: session_id.to_string(),
                track: track.clone(),
            },
        );

        let persistence = self.persistence.clone();
        let id = session_id.to_string();
        self.pipeline.enqueue(session_id, async move {
            persistence
                .persist_like(&track, &id, client_id.as_deref())
                .await;
        });
        Ok(())
    }

    /// Count a tempo vote in memory and broadcast the new totals
    pub fn record_tempo_vote(
        &self,
        session_id: &str,
        client_id: Option<&str>,
        direction: TempoDirection,
    ) -> Result<TempoCounts, AppError> {
        let counts = {
            let session = self.live(session_id)?;
            // Tallies belong to the current track
            if session.current_track.is_none() {
                return Err(AppError::InvalidInput("no track is playing".to_string()));
            }
            self.tempo.record_vote(session_id, client_id, direction)
        };

        self.hub.publish(
            &Channel::Session(session_id.to_string()),
            ServerMessage::TempoFeedback {
                session_id: session_id.to_string(),
                slower: counts.slower,
                perfect: counts.perfect,
                faster: counts.faster,
                total: counts.total(),
            },
        );
        Ok(counts)
    }

    /// Add a listener; returns the `SESSION_STATE` reply and the session feed.
    ///
    /// The feed is taken while the registry entry is held, so a teardown
    /// racing the subscription still closes the channel it created.
    pub fn subscribe_listener(
        &self,
        conn: ConnectionId,
        session_id: &str,
    ) -> Result<Subscription, AppError> {
        let session = self.live(session_id)?;
        let listener_count = {
            let mut listeners = self.listeners.entry(session_id.to_string()).or_default();
            listeners.insert(conn);
            listeners.len()
        };
        let feed = self.hub.subscribe(&Channel::Session(session_id.to_string()));

        Ok(Subscription {
            state: ServerMessage::SessionState {
                session_id: session_id.to_string(),
                dj_name: session.dj_name.clone(),
                current_track: session.current_track.clone(),
                listener_count,
            },
            feed,
        })
    }

    /// Broadcasts of a live session; never re-creates the channel of an ended one
    pub fn session_feed(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<ServerMessage>, AppError> {
        let _live = self.live(session_id)?;
        Ok(self.hub.subscribe(&Channel::Session(session_id.to_string())))
    }

    /// Bookkeeping only; the heartbeat reports the new count
    pub fn remove_listener(&self, conn: ConnectionId, session_id: &str) {
        if let Some(mut listeners) = self.listeners.get_mut(session_id) {
            listeners.remove(&conn);
        }
        self.listeners
            .remove_if(session_id, |_, listeners| listeners.is_empty());
    }

    pub fn listener_count(&self, session_id: &str) -> usize {
        self.listeners.get(session_id).map_or(0, |l| l.len())
    }

    /// Open a poll once the session row exists.
    ///
    /// The gate wait and the poll insert run in the session's lane, so the
    /// caller suspends until both finished.
    pub async fn start_poll(
        self: &Arc<Self>,
        conn: ConnectionId,
        session_id: &str,
        question: String,
        options: Vec<String>,
        duration_seconds: Option<u64>,
    ) -> Result<u64, AppError> {
        let (tx, rx) = oneshot::channel();
        {
            let _session = self.owned_session(conn, session_id)?;
            if let Some(open) = self.polls.active_poll_id(session_id) {
                return Err(AppError::InvalidInput(format!("poll {open} is still open")));
            }

            let gate = Arc::clone(&self.gate);
            let store = Arc::clone(&self.store);
            let timeout = self.config.poll_ready_timeout;
            let new_poll = NewPoll {
                session_id: session_id.to_string(),
                question: question.clone(),
                options: options.clone(),
                opened_at: Utc::now(),
            };
            self.pipeline.enqueue(session_id, async move {
                let result = if gate.ensure_ready(&new_poll.session_id, timeout).await {
                    store.insert_poll(&new_poll).await.inspect_err(|e| {
                        counter!(STORE_WRITE_FAILED, "table" => "polls").increment(1);
                        error!(
                            session_id = %new_poll.session_id,
                            question = %new_poll.question,
                            error = %e,
                            "Failed to persist poll"
                        );
                    })
                } else {
                    Err(AppError::SessionNotReady(new_poll.session_id.clone()))
                };
                let _ = tx.send(result);
            });
        }

        let poll_id = rx
            .await
            .map_err(|_| AppError::Internal("poll job was dropped".to_string()))??;
        let ends_at = duration_seconds
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        {
            let Some(_live) = self.sessions.get(session_id) else {
                self.close_orphan_poll(poll_id);
                return Err(AppError::SessionNotFound(session_id.to_string()));
            };
            let poll = ActivePoll::new(poll_id, question.clone(), options.clone(), ends_at);
            if let Err(e) = self.polls.open(session_id, poll) {
                self.close_orphan_poll(poll_id);
                return Err(e);
            }
        }

        info!(session_id, poll_id, "Poll started");
        self.hub.publish(
            &Channel::Session(session_id.to_string()),
            ServerMessage::PollStarted {
                session_id: session_id.to_string(),
                poll_id,
                question,
                options,
                ends_at: ends_at.map(|t| t.timestamp_millis()),
            },
        );

        if let Some(secs) = duration_seconds {
            let coordinator = Arc::downgrade(self);
            let id = session_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                if let Some(coordinator) = Weak::upgrade(&coordinator) {
                    coordinator.expire_poll(&id, poll_id);
                }
            });
        }
        Ok(poll_id)
    }

    /// Count a poll vote; returns the updated tallies
    pub fn vote_on_poll(
        &self,
        session_id: &str,
        poll_id: u64,
        client_id: Option<&str>,
        option_index: usize,
    ) -> Result<Vec<u32>, AppError> {
        let votes = {
            let _live = self.live(session_id)?;
            self.polls
                .vote(session_id, poll_id, client_id, option_index)?
        };

        self.hub.publish(
            &Channel::Session(session_id.to_string()),
            ServerMessage::PollUpdate {
                session_id: session_id.to_string(),
                poll_id,
                total_votes: votes.iter().sum(),
                votes: votes.clone(),
            },
        );
        Ok(votes)
    }

    /// DJ closes a poll early
    pub fn end_poll(
        &self,
        conn: ConnectionId,
        session_id: &str,
        poll_id: u64,
    ) -> Result<PollResult, AppError> {
        let _session = self.owned_session(conn, session_id)?;
        self.close_poll(session_id, Some(poll_id))
            .ok_or_else(|| AppError::InvalidInput(format!("poll {poll_id} is not open")))
    }

    fn expire_poll(&self, session_id: &str, poll_id: u64) {
        let Some(_live) = self.sessions.get(session_id) else {
            return;
        };
        if self.close_poll(session_id, Some(poll_id)).is_some() {
            info!(session_id, poll_id, "Poll duration elapsed");
        }
    }

    /// Close the active poll, broadcast and persist its final tallies.
    ///
    /// Callers hold the registry entry, or are tearing the session down.
    fn close_poll(&self, session_id: &str, poll_id: Option<u64>) -> Option<PollResult> {
        let result = self.polls.close(session_id, poll_id)?;

        self.hub.publish(
            &Channel::Session(session_id.to_string()),
            ServerMessage::PollEnded {
                session_id: session_id.to_string(),
                poll_id: result.poll_id,
                votes: result.votes.clone(),
                total_votes: result.total(),
            },
        );

        let store = Arc::clone(&self.store);
        let closed = result.clone();
        let id = session_id.to_string();
        self.pipeline.enqueue(session_id, async move {
            if let Err(e) = store
                .close_poll(closed.poll_id, &closed.votes, Utc::now())
                .await
            {
                counter!(STORE_WRITE_FAILED, "table" => "polls").increment(1);
                error!(
                    session_id = %id,
                    poll_id = closed.poll_id,
                    votes = ?closed.votes,
                    error = %e,
                    "Failed to record final poll tallies"
                );
            }
        });
        Some(result)
    }

    /// Close a poll row whose session vanished while it was being created
    fn close_orphan_poll(&self, poll_id: u64) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.close_poll(poll_id, &[], Utc::now()).await {
                warn!(poll_id, error = %e, "Failed to close orphaned poll");
            }
        });
    }

    fn enqueue_tempo_flush(&self, session_id: &str, track: TrackInfo, counts: TempoCounts) {
        if counts.is_empty() {
            return;
        }
        let persistence = self.persistence.clone();
        let id = session_id.to_string();
        self.pipeline.enqueue(session_id, async move {
            persistence.flush_tempo(&id, &track, counts).await;
        });
    }

    /// `END_SESSION` from the DJ connection
    pub async fn end_session(&self, conn: ConnectionId, session_id: &str) -> Result<(), AppError> {
        let Some((_, session)) = self
            .sessions
            .remove_if(session_id, |_, session| session.owner == conn)
        else {
            return Err(if self.sessions.contains_key(session_id) {
                AppError::NotSessionOwner(session_id.to_string())
            } else {
                AppError::SessionNotFound(session_id.to_string())
            });
        };

        self.teardown(session_id, session, EndReason::Ended).await;
        Ok(())
    }

    /// DJ connection closed.
    ///
    /// A connection that lost the session to a reconnect leaves it alone.
    pub async fn disconnect_dj(&self, conn: ConnectionId, session_id: &str) {
        match self
            .sessions
            .remove_if(session_id, |_, session| session.owner == conn)
        {
            Some((_, session)) => {
                self.teardown(session_id, session, EndReason::Disconnected)
                    .await;
            },
            None => debug!(session_id, connection = %conn, "Connection no longer owns session"),
        }
    }

    /// End every live session through the normal teardown path
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!(sessions = ids.len(), "Ending live sessions for shutdown");

        let teardowns = ids.into_iter().filter_map(|id| {
            let (id, session) = self.sessions.remove(&id)?;
            Some(async move { self.teardown(&id, session, EndReason::Shutdown).await })
        });
        join_all(teardowns.collect::<Vec<_>>()).await;
    }

    /// Runs after the registry entry is gone; returns once every
    /// per-session structure has been released
    async fn teardown(&self, session_id: &str, session: LiveSession, reason: EndReason) {
        gauge!(SESSION_LIVE).set(self.sessions.len() as f64);

        // Needs the current track, so it goes first
        let counts = self.tempo.take(session_id);
        if let Some(track) = session.current_track.clone() {
            self.enqueue_tempo_flush(session_id, track, counts);
        }
        self.close_poll(session_id, None);

        {
            let gate = Arc::clone(&self.gate);
            let store = Arc::clone(&self.store);
            let timeout = self.config.track_ready_timeout;
            let id = session_id.to_string();
            self.pipeline.enqueue(session_id, async move {
                if !gate.ensure_ready(&id, timeout).await {
                    warn!(session_id = %id, "Session row never persisted, not marking it ended");
                    return;
                }
                if let Err(e) = store.end_session(&id, Utc::now()).await {
                    counter!(STORE_WRITE_FAILED, "table" => "sessions").increment(1);
                    error!(session_id = %id, error = %e, "Failed to mark session ended");
                }
            });
        }

        self.listeners.remove(session_id);

        let ended = ServerMessage::SessionEnded {
            session_id: session_id.to_string(),
        };
        let channel = Channel::Session(session_id.to_string());
        self.hub.publish(&Channel::Discovery, ended.clone());
        self.hub.publish(&channel, ended);
        self.hub.close(&channel);

        counter!(SESSION_ENDED, "reason" => reason.as_str()).increment(1);
        let duration_secs = (Utc::now() - session.started_at).num_seconds();
        info!(session_id, reason = reason.as_str(), duration_secs, "Session ended");

        emit_detached(
            &self.telemetry,
            LifecycleEvent::new(reason.lifecycle_kind(), session_id)
                .with_reason(reason.as_str())
                .with_metadata(json!({
                    "djName": session.dj_name,
                    "djId": session.dj_id,
                    "durationSecs": duration_secs,
                })),
        );

        // Queued behind every earlier job of the session
        let sessions = Arc::clone(&self.sessions);
        let gate = Arc::clone(&self.gate);
        let persistence = self.persistence.clone();
        let pipeline = self.pipeline.clone();
        let id = session_id.to_string();
        self.pipeline
            .enqueue(session_id, async move {
                // The vacant entry keeps a re-registration out until the lane is closed
                match sessions.entry(id.clone()) {
                    Entry::Occupied(_) => {
                        debug!(session_id = %id, "Session re-registered, keeping its lane");
                    },
                    Entry::Vacant(_slot) => {
                        pipeline.close(&id);
                        gate.forget(&id);
                        persistence.forget_session(&id);
                    },
                }
            })
            .wait()
            .await;
    }

    /// Broadcast `LISTENER_COUNT` for every live session
    pub fn broadcast_listener_counts(&self) -> usize {
        let counts: Vec<(String, usize)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), self.listener_count(entry.key())))
            .collect();

        for (session_id, count) in &counts {
            self.hub.publish(
                &Channel::Session(session_id.clone()),
                ServerMessage::ListenerCount {
                    session_id: session_id.clone(),
                    count: *count,
                },
            );
        }
        counts.len()
    }

    /// Periodic listener-count broadcast; stops once the coordinator is dropped
    pub fn spawn_heartbeat(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                let sessions = coordinator.broadcast_listener_counts();
                debug!(sessions, "Heartbeat sent");
            }
        })
    }

    pub fn live_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary {
                session_id: entry.key().clone(),
                dj_name: entry.dj_name.clone(),
                current_track: entry.current_track.clone(),
                listener_count: self.listener_count(entry.key()),
                started_at: entry.started_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.started_at);
        summaries
    }

    /// Played-track history from the durable store
    pub async fn recap(&self, session_id: &str) -> Result<SessionRecap, AppError> {
        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;
        let tracks = self.store.played_tracks(session_id).await?;
        Ok(SessionRecap { session, tracks })
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn live_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn current_track(&self, session_id: &str) -> Option<TrackInfo> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.current_track.clone())
    }

    pub fn tempo_counts(&self, session_id: &str) -> TempoCounts {
        self.tempo.counts(session_id)
    }

    pub fn active_poll_id(&self, session_id: &str) -> Option<u64> {
        self.polls.active_poll_id(session_id)
    }

    pub fn gate(&self) -> &Arc<ReadinessGate> {
        &self.gate
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn pipeline(&self) -> &PersistencePipeline {
        &self.pipeline
    }

    /// Whether anything at all is still held for `session_id`.
    ///
    /// Readiness waiters are not included; they expire on their own.
    pub fn retains_state(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
            || self.listeners.contains_key(session_id)
            || self.tempo.contains(session_id)
            || self.polls.active_poll_id(session_id).is_some()
            || self.gate.has_outcome(session_id)
            || self.persistence.last_persisted_key(session_id).is_some()
            || self.pipeline.has_lane(session_id)
    }

    fn live(&self, session_id: &str) -> Result<Ref<'_, String, LiveSession>, AppError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))
    }

    fn owned_session(
        &self,
        conn: ConnectionId,
        session_id: &str,
    ) -> Result<RefMut<'_, String, LiveSession>, AppError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;
        if session.owner != conn {
            return Err(AppError::NotSessionOwner(session_id.to_string()));
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ChannelHub;
    use crate::storage::MemoryStore;
    use crate::telemetry::TracingTelemetry;

    fn coordinator() -> (Arc<SessionCoordinator>, MemoryStore) {
        let store = MemoryStore::new();
        let coordinator = SessionCoordinator::new(
            CoordinatorConfig::default(),
            Arc::new(store.clone()),
            Arc::new(ChannelHub::new()),
            Arc::new(TracingTelemetry),
        );
        (Arc::new(coordinator), store)
    }

    #[tokio::test]
    async fn test_only_owner_controls_session() {
        let (coordinator, _store) = coordinator();
        let dj = Uuid::new_v4();
        let other = Uuid::new_v4();
        coordinator
            .register_session(dj, "s1", "DJ", None, None)
            .unwrap();

        let err = coordinator
            .change_track(other, "s1", TrackInfo::new("A", "B"))
            .unwrap_err();
        assert!(matches!(err, AppError::NotSessionOwner(_)));
        assert!(matches!(
            coordinator.end_session(other, "s1").await,
            Err(AppError::NotSessionOwner(_))
        ));
        assert!(matches!(
            coordinator.change_track(dj, "nope", TrackInfo::new("A", "B")),
            Err(AppError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_reattaches_without_second_row() {
        let (coordinator, store) = coordinator();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(
            coordinator
                .register_session(first, "s1", "DJ", None, None)
                .unwrap(),
            Registration::Started
        );
        assert_eq!(
            coordinator
                .register_session(second, "s1", "DJ", None, None)
                .unwrap(),
            Registration::Reconnected
        );

        // The stale connection closing must not end the session
        coordinator.disconnect_dj(first, "s1").await;
        assert!(coordinator.is_live("s1"));

        coordinator.end_session(second, "s1").await.unwrap();
        assert_eq!(store.writes_of(crate::storage::WriteKind::Session).len(), 1);
    }

    #[tokio::test]
    async fn test_tempo_votes_require_live_session() {
        let (coordinator, _store) = coordinator();
        assert!(coordinator
            .record_tempo_vote("s1", None, TempoDirection::Faster)
            .is_err());

        coordinator
            .register_session(Uuid::new_v4(), "s1", "DJ", None, Some(TrackInfo::new("A", "B")))
            .unwrap();
        let counts = coordinator
            .record_tempo_vote("s1", Some("c1"), TempoDirection::Faster)
            .unwrap();
        assert_eq!(counts.faster, 1);
    }

    #[tokio::test]
    async fn test_tempo_vote_without_track_is_rejected() {
        let (coordinator, store) = coordinator();
        let dj = Uuid::new_v4();
        coordinator
            .register_session(dj, "s1", "DJ", None, None)
            .unwrap();

        let err = coordinator
            .record_tempo_vote("s1", Some("c1"), TempoDirection::Faster)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert!(coordinator.tempo_counts("s1").is_empty());

        coordinator
            .change_track(dj, "s1", TrackInfo::new("A", "B"))
            .unwrap();
        coordinator
            .change_track(dj, "s1", TrackInfo::new("C", "D"))
            .unwrap();
        coordinator.end_session(dj, "s1").await.unwrap();
        assert!(store.tempo_rows().is_empty());
    }

    #[tokio::test]
    async fn test_listener_bookkeeping() {
        let (coordinator, _store) = coordinator();
        coordinator
            .register_session(Uuid::new_v4(), "s1", "DJ", None, None)
            .unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        coordinator.subscribe_listener(a, "s1").unwrap();
        let subscription = coordinator.subscribe_listener(b, "s1").unwrap();
        assert!(matches!(
            subscription.state,
            ServerMessage::SessionState {
                listener_count: 2,
                ..
            }
        ));

        coordinator.remove_listener(a, "s1");
        assert_eq!(coordinator.listener_count("s1"), 1);
        coordinator.remove_listener(b, "s1");
        assert_eq!(coordinator.listener_count("s1"), 0);
        assert_eq!(coordinator.live_sessions()[0].listener_count, 0);
    }
}
