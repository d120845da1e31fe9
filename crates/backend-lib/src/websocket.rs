// ==================
// crates/backend-lib/src/websocket.rs
// ==================
//! WebSocket Handler Module
//!
//! One `WebSocketHandler` per connection. It owns the connection's role
//! (`OPEN -> DJ | LISTENER -> CLOSED`), turns validated inbound messages
//! into coordinator calls and answers with ACK/NACK when the client asked
//! for it.
//!
//! Outbound traffic goes through a single `mpsc` sender drained by the
//! socket writer task. Broadcast channels the connection follows (discovery
//! always, plus its session once it has a role) are forwarded into the same
//! sender by small follow tasks.

use crate::coordinator::ConnectionId;
use crate::error::AppError;
use crate::hub::Channel;
use crate::messages::{ClientMessage, ConnectionRole, ConnectionState, Envelope, ServerMessage};
use crate::metrics::MESSAGE_REJECTED;
use crate::protocol;
use crate::AppState;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// WebSocket handler for processing messages
pub struct WebSocketHandler {
    state: Arc<AppState>,
    conn_id: ConnectionId,
    outbound: mpsc::Sender<ServerMessage>,
    connection: ConnectionState,
    discovery_feed: JoinHandle<()>,
    session_feed: Option<JoinHandle<()>>,
}

impl WebSocketHandler {
    pub fn new(state: Arc<AppState>, outbound: mpsc::Sender<ServerMessage>) -> Self {
        let conn_id = Uuid::new_v4();
        let discovery_feed = follow(
            state.hub.subscribe(&Channel::Discovery),
            outbound.clone(),
            conn_id,
        );
        debug!(connection = %conn_id, "Connection opened");

        Self {
            state,
            conn_id,
            outbound,
            connection: ConnectionState::default(),
            discovery_feed,
            session_feed: None,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    /// Process one inbound text frame
    pub async fn handle_text(&mut self, text: &str) {
        let max_bytes = self.state.settings.limits.max_message_bytes;
        if text.len() > max_bytes {
            counter!(MESSAGE_REJECTED, "reason" => "size").increment(1);
            warn!(connection = %self.conn_id, bytes = text.len(), max_bytes, "Inbound message too large");
            protocol::nack(
                &self.outbound,
                protocol::message_id_of(text).as_deref(),
                format!("message exceeds {max_bytes} bytes"),
            )
            .await;
            return;
        }

        let Envelope {
            message_id,
            message,
        } = match protocol::validate::<Envelope>(text) {
            Ok(envelope) => envelope,
            Err(issue) => {
                debug!(connection = %self.conn_id, error = %issue, "Invalid inbound message");
                protocol::nack(
                    &self.outbound,
                    protocol::message_id_of(text).as_deref(),
                    issue.to_string(),
                )
                .await;
                return;
            },
        };

        let kind = message.kind();
        match self.dispatch(message).await {
            Ok(()) => protocol::ack(&self.outbound, message_id.as_deref()).await,
            Err(e) => {
                counter!(MESSAGE_REJECTED, "reason" => e.error_code()).increment(1);
                warn!(connection = %self.conn_id, kind, error = %e, "Message rejected");
                protocol::nack(&self.outbound, message_id.as_deref(), e.to_string()).await;
            },
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<(), AppError> {
        let coordinator = Arc::clone(&self.state.coordinator);

        match message {
            ClientMessage::RegisterSession {
                session_id,
                dj_name,
                dj_id,
                current_track,
            } => {
                if self.connection.listener_session().is_some() {
                    return Err(AppError::InvalidInput(
                        "connection is subscribed as a listener".to_string(),
                    ));
                }
                if let Some(current) = self.connection.dj_session() {
                    if current != session_id {
                        return Err(AppError::InvalidInput(format!(
                            "connection already runs session {current}"
                        )));
                    }
                }

                let registration = coordinator.register_session(
                    self.conn_id,
                    &session_id,
                    &dj_name,
                    dj_id,
                    current_track,
                )?;
                info!(connection = %self.conn_id, session_id = %session_id, ?registration, "DJ registered");

                if self.connection.dj_session().is_none() {
                    let feed = coordinator.session_feed(&session_id)?;
                    self.connection.become_dj(session_id.as_str());
                    self.follow_session(feed);
                }
            },
            ClientMessage::BroadcastTrack { session_id, track } => {
                self.require_dj(&session_id)?;
                coordinator.change_track(self.conn_id, &session_id, track)?;
            },
            ClientMessage::EndSession { session_id } => {
                self.require_dj(&session_id)?;
                coordinator.end_session(self.conn_id, &session_id).await?;
                self.connection.role = ConnectionRole::Pending;
                self.stop_session_feed();
            },
            ClientMessage::Subscribe {
                session_id,
                client_id,
            } => {
                if self.connection.dj_session().is_some() {
                    return Err(AppError::InvalidInput(
                        "a DJ connection cannot subscribe as a listener".to_string(),
                    ));
                }

                let subscription = coordinator.subscribe_listener(self.conn_id, &session_id)?;
                if let Some(previous) = self.connection.listener_session() {
                    if previous != session_id {
                        coordinator.remove_listener(self.conn_id, previous);
                    }
                }
                self.connection
                    .become_listener(session_id.as_str(), client_id);
                self.follow_session(subscription.feed);
                protocol::send(&self.outbound, subscription.state).await;
            },
            ClientMessage::SendLike {
                session_id,
                track,
                client_id,
            } => {
                let client_id =
                    client_id.or_else(|| self.connection.listener_client_id().map(str::to_string));
                coordinator.record_like(&session_id, track, client_id)?;
            },
            ClientMessage::SendTempoRequest {
                session_id,
                preference,
                client_id,
            } => {
                let voter = self.voter_id(client_id);
                coordinator.record_tempo_vote(&session_id, Some(&voter), preference)?;
            },
            ClientMessage::StartPoll {
                session_id,
                question,
                options,
                duration_seconds,
            } => {
                self.require_dj(&session_id)?;
                coordinator
                    .start_poll(
                        self.conn_id,
                        &session_id,
                        question,
                        options,
                        duration_seconds,
                    )
                    .await?;
            },
            ClientMessage::VoteOnPoll {
                session_id,
                poll_id,
                option_index,
                client_id,
            } => {
                let voter = self.voter_id(client_id);
                coordinator.vote_on_poll(&session_id, poll_id, Some(&voter), option_index)?;
            },
            ClientMessage::EndPoll {
                session_id,
                poll_id,
            } => {
                self.require_dj(&session_id)?;
                coordinator.end_poll(self.conn_id, &session_id, poll_id)?;
            },
            ClientMessage::Ping => protocol::send(&self.outbound, ServerMessage::Pong).await,
        }

        Ok(())
    }

    /// Connection closed; runs the teardown for whatever role it held
    pub async fn on_close(&mut self) {
        self.discovery_feed.abort();
        self.stop_session_feed();

        match self.connection.close() {
            Some(ConnectionRole::Dj { session_id }) => {
                info!(connection = %self.conn_id, session_id = %session_id, "DJ disconnected");
                self.state
                    .coordinator
                    .disconnect_dj(self.conn_id, &session_id)
                    .await;
            },
            Some(ConnectionRole::Listener { session_id, .. }) => {
                debug!(connection = %self.conn_id, session_id = %session_id, "Listener disconnected");
                self.state
                    .coordinator
                    .remove_listener(self.conn_id, &session_id);
            },
            Some(ConnectionRole::Pending) | None => {},
        }
    }

    fn require_dj(&self, session_id: &str) -> Result<(), AppError> {
        if self.connection.dj_session() == Some(session_id) {
            Ok(())
        } else {
            Err(AppError::NotSessionOwner(session_id.to_string()))
        }
    }

    /// Identity a vote is counted under: explicit id, subscribed id, or the connection
    fn voter_id(&self, client_id: Option<String>) -> String {
        client_id
            .or_else(|| self.connection.listener_client_id().map(str::to_string))
            .unwrap_or_else(|| self.conn_id.to_string())
    }

    fn follow_session(&mut self, feed: broadcast::Receiver<ServerMessage>) {
        self.stop_session_feed();
        self.session_feed = Some(follow(feed, self.outbound.clone(), self.conn_id));
    }

    fn stop_session_feed(&mut self) {
        if let Some(feed) = self.session_feed.take() {
            feed.abort();
        }
    }
}

impl Drop for WebSocketHandler {
    fn drop(&mut self) {
        self.discovery_feed.abort();
        self.stop_session_feed();
    }
}

/// Forward a broadcast channel into the connection's outbound queue
fn follow(
    mut rx: broadcast::Receiver<ServerMessage>,
    outbound: mpsc::Sender<ServerMessage>,
    conn_id: ConnectionId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    if outbound.send(message).await.is_err() {
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(connection = %conn_id, skipped, "Connection lagging, broadcasts dropped");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
