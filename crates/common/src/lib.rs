// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between the Pika! DJ/listener clients and the server.
//! This module defines the WebSocket protocol messages and supporting types.

use serde::{Deserialize, Serialize};

/// Identifier of a live DJ session (opaque, chosen by the DJ client)
pub type SessionId = String;

/// A track as announced by the DJ client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub artist: String,
    pub title: String,
    /// Tempo in beats per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm: Option<f64>,
    /// Musical key, e.g. "Am" or "F#"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    // Fingerprint metrics, 0-100 scale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub danceability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acousticness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groove: Option<f64>,
}

impl TrackInfo {
    pub fn new(artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            artist: artist.into(),
            title: title.into(),
            ..Self::default()
        }
    }

    /// `artist:title`, exact and case-sensitive
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.artist, self.title)
    }

    /// Whether two announcements refer to the same song
    pub fn same_song(&self, other: &TrackInfo) -> bool {
        self.artist == other.artist && self.title == other.title
    }
}

/// Listener feedback on the current tempo
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TempoDirection {
    Slower,
    Perfect,
    Faster,
}

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// DJ announces a session; re-sending for a live session is a reconnect
    RegisterSession {
        session_id: SessionId,
        dj_name: String,
        #[serde(default)]
        dj_id: Option<String>,
        #[serde(default)]
        current_track: Option<TrackInfo>,
    },
    /// DJ changed the "now playing" track
    BroadcastTrack {
        session_id: SessionId,
        track: TrackInfo,
    },
    /// DJ ends the session explicitly
    EndSession { session_id: SessionId },
    /// Listener joins a session
    Subscribe {
        session_id: SessionId,
        #[serde(default)]
        client_id: Option<String>,
    },
    /// Listener likes a track
    SendLike {
        session_id: SessionId,
        track: TrackInfo,
        #[serde(default)]
        client_id: Option<String>,
    },
    /// Listener tempo feedback for the current track
    SendTempoRequest {
        session_id: SessionId,
        preference: TempoDirection,
        #[serde(default)]
        client_id: Option<String>,
    },
    /// DJ opens a poll
    StartPoll {
        session_id: SessionId,
        question: String,
        options: Vec<String>,
        #[serde(default)]
        duration_seconds: Option<u64>,
    },
    /// Listener votes on the active poll
    VoteOnPoll {
        session_id: SessionId,
        poll_id: u64,
        option_index: usize,
        #[serde(default)]
        client_id: Option<String>,
    },
    /// DJ closes a poll early
    EndPoll { session_id: SessionId, poll_id: u64 },
    Ping,
}

impl ClientMessage {
    /// Session the message targets, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientMessage::RegisterSession { session_id, .. }
            | ClientMessage::BroadcastTrack { session_id, .. }
            | ClientMessage::EndSession { session_id }
            | ClientMessage::Subscribe { session_id, .. }
            | ClientMessage::SendLike { session_id, .. }
            | ClientMessage::SendTempoRequest { session_id, .. }
            | ClientMessage::StartPoll { session_id, .. }
            | ClientMessage::VoteOnPoll { session_id, .. }
            | ClientMessage::EndPoll { session_id, .. } => Some(session_id),
            ClientMessage::Ping => None,
        }
    }

    /// Wire discriminant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::RegisterSession { .. } => "REGISTER_SESSION",
            ClientMessage::BroadcastTrack { .. } => "BROADCAST_TRACK",
            ClientMessage::EndSession { .. } => "END_SESSION",
            ClientMessage::Subscribe { .. } => "SUBSCRIBE",
            ClientMessage::SendLike { .. } => "SEND_LIKE",
            ClientMessage::SendTempoRequest { .. } => "SEND_TEMPO_REQUEST",
            ClientMessage::StartPoll { .. } => "START_POLL",
            ClientMessage::VoteOnPoll { .. } => "VOTE_ON_POLL",
            ClientMessage::EndPoll { .. } => "END_POLL",
            ClientMessage::Ping => "PING",
        }
    }
}

/// An inbound message plus the optional id that requests an ACK/NACK
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl Envelope {
    /// Fire-and-forget envelope (no acknowledgment)
    pub fn new(message: ClientMessage) -> Self {
        Self {
            message_id: None,
            message,
        }
    }

    pub fn with_id(message_id: impl Into<String>, message: ClientMessage) -> Self {
        Self {
            message_id: Some(message_id.into()),
            message,
        }
    }
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    Ack {
        message_id: String,
    },
    Nack {
        message_id: String,
        error: String,
    },
    /// Discovery: a new session went live
    SessionStarted {
        session_id: SessionId,
        dj_name: String,
    },
    /// Discovery and session: the session is over
    SessionEnded {
        session_id: SessionId,
    },
    /// Reply to `SUBSCRIBE`
    SessionState {
        session_id: SessionId,
        dj_name: String,
        current_track: Option<TrackInfo>,
        listener_count: usize,
    },
    NowPlaying {
        session_id: SessionId,
        track: TrackInfo,
    },
    LikeReceived {
        session_id: SessionId,
        track: TrackInfo,
    },
    TempoFeedback {
        session_id: SessionId,
        slower: u32,
        perfect: u32,
        faster: u32,
        total: u32,
    },
    ListenerCount {
        session_id: SessionId,
        count: usize,
    },
    PollStarted {
        session_id: SessionId,
        poll_id: u64,
        question: String,
        options: Vec<String>,
        /// Unix epoch milliseconds
        ends_at: Option<i64>,
    },
    PollUpdate {
        session_id: SessionId,
        poll_id: u64,
        votes: Vec<u32>,
        total_votes: u32,
    },
    PollEnded {
        session_id: SessionId,
        poll_id: u64,
        votes: Vec<u32>,
        total_votes: u32,
    },
    Pong,
}
