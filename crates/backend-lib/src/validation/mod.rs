// ============================
// crates/backend-lib/src/validation/mod.rs
// ============================
//! Message validation module.
//!
//! Serde takes care of shape; these rules cover what the types cannot
//! express (lengths, ranges, allowed characters). Each failure names the
//! offending field path so the NACK can point at it.

use pika_common::{ClientMessage, TrackInfo};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

const MAX_SESSION_ID_LENGTH: usize = 64;
const MAX_CLIENT_ID_LENGTH: usize = 64;
const MAX_DJ_NAME_LENGTH: usize = 100;
const MAX_TRACK_FIELD_LENGTH: usize = 200;
const MAX_KEY_LENGTH: usize = 8;
const MAX_BPM: f64 = 400.0;
const MAX_QUESTION_LENGTH: usize = 200;
const MAX_OPTION_LENGTH: usize = 100;
const MIN_POLL_OPTIONS: usize = 2;
const MAX_POLL_OPTIONS: usize = 10;
const MAX_POLL_DURATION_SECS: u64 = 60 * 60;

static ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());
static DISPLAY_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^<>{}\\\p{Cc}]*$").unwrap());

/// First problem found in an inbound payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: {message}")]
pub struct ValidationIssue {
    /// Dotted field path, `$` for the message as a whole
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationIssue>;

/// Payload types that carry rules beyond their serde shape
pub trait Validate {
    fn validate(&self) -> ValidationResult<()>;
}

impl Validate for pika_common::Envelope {
    fn validate(&self) -> ValidationResult<()> {
        if let Some(id) = &self.message_id {
            if id.is_empty() || id.len() > MAX_CLIENT_ID_LENGTH {
                return Err(ValidationIssue::new(
                    "messageId",
                    format!("must be between 1 and {MAX_CLIENT_ID_LENGTH} characters"),
                ));
            }
        }
        validate_client_message(&self.message)
    }
}

/// Validate an identifier (session or client)
fn validate_id<'a>(path: &str, id: &'a str, max_len: usize) -> ValidationResult<&'a str> {
    if id.is_empty() {
        return Err(ValidationIssue::new(path, "must not be empty"));
    }
    if id.len() > max_len {
        return Err(ValidationIssue::new(
            path,
            format!("must be at most {max_len} characters"),
        ));
    }
    if !ID_REGEX.is_match(id) {
        return Err(ValidationIssue::new(
            path,
            "must contain only letters, digits, '-' and '_'",
        ));
    }
    Ok(id)
}

pub fn validate_session_id(session_id: &str) -> ValidationResult<&str> {
    validate_id("sessionId", session_id, MAX_SESSION_ID_LENGTH)
}

fn validate_client_id(client_id: Option<&String>) -> ValidationResult<()> {
    if let Some(id) = client_id {
        validate_id("clientId", id, MAX_CLIENT_ID_LENGTH)?;
    }
    Ok(())
}

/// Validate human-readable text
fn validate_text(path: &str, text: &str, max_len: usize) -> ValidationResult<()> {
    if text.trim().is_empty() {
        return Err(ValidationIssue::new(path, "must not be empty"));
    }
    if text.chars().count() > max_len {
        return Err(ValidationIssue::new(
            path,
            format!("must be at most {max_len} characters"),
        ));
    }
    if !DISPLAY_NAME_REGEX.is_match(text) {
        return Err(ValidationIssue::new(path, "contains invalid characters"));
    }
    Ok(())
}

fn validate_metric(path: &str, value: Option<f64>, max: f64) -> ValidationResult<()> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 || v > max => Err(ValidationIssue::new(
            path,
            format!("must be between 0 and {max}"),
        )),
        _ => Ok(()),
    }
}

/// Validate a track announcement or like target
pub fn validate_track(prefix: &str, track: &TrackInfo) -> ValidationResult<()> {
    validate_text(&format!("{prefix}.artist"), &track.artist, MAX_TRACK_FIELD_LENGTH)?;
    validate_text(&format!("{prefix}.title"), &track.title, MAX_TRACK_FIELD_LENGTH)?;

    if let Some(bpm) = track.bpm {
        if !bpm.is_finite() || bpm <= 0.0 || bpm > MAX_BPM {
            return Err(ValidationIssue::new(
                format!("{prefix}.bpm"),
                format!("must be greater than 0 and at most {MAX_BPM}"),
            ));
        }
    }
    if let Some(key) = &track.key {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(ValidationIssue::new(
                format!("{prefix}.key"),
                format!("must be between 1 and {MAX_KEY_LENGTH} characters"),
            ));
        }
    }

    for (name, value) in [
        ("energy", track.energy),
        ("danceability", track.danceability),
        ("brightness", track.brightness),
        ("acousticness", track.acousticness),
        ("groove", track.groove),
    ] {
        validate_metric(&format!("{prefix}.{name}"), value, 100.0)?;
    }
    Ok(())
}

fn validate_poll(question: &str, options: &[String], duration: Option<u64>) -> ValidationResult<()> {
    validate_text("question", question, MAX_QUESTION_LENGTH)?;

    if options.len() < MIN_POLL_OPTIONS || options.len() > MAX_POLL_OPTIONS {
        return Err(ValidationIssue::new(
            "options",
            format!("must have between {MIN_POLL_OPTIONS} and {MAX_POLL_OPTIONS} entries"),
        ));
    }
    for (i, option) in options.iter().enumerate() {
        validate_text(&format!("options.{i}"), option, MAX_OPTION_LENGTH)?;
    }

    if let Some(secs) = duration {
        if secs == 0 || secs > MAX_POLL_DURATION_SECS {
            return Err(ValidationIssue::new(
                "durationSeconds",
                format!("must be between 1 and {MAX_POLL_DURATION_SECS}"),
            ));
        }
    }
    Ok(())
}

/// Validates a client message
pub fn validate_client_message(message: &ClientMessage) -> ValidationResult<()> {
    if let Some(session_id) = message.session_id() {
        validate_session_id(session_id)?;
    }

    match message {
        ClientMessage::RegisterSession {
            dj_name,
            dj_id,
            current_track,
            ..
        } => {
            validate_text("djName", dj_name, MAX_DJ_NAME_LENGTH)?;
            if let Some(id) = dj_id {
                validate_id("djId", id, MAX_CLIENT_ID_LENGTH)?;
            }
            if let Some(track) = current_track {
                validate_track("currentTrack", track)?;
            }
        },
        ClientMessage::BroadcastTrack { track, .. } => validate_track("track", track)?,
        ClientMessage::SendLike {
            track, client_id, ..
        } => {
            validate_track("track", track)?;
            validate_client_id(client_id.as_ref())?;
        },
        ClientMessage::Subscribe { client_id, .. }
        | ClientMessage::SendTempoRequest { client_id, .. }
        | ClientMessage::VoteOnPoll { client_id, .. } => validate_client_id(client_id.as_ref())?,
        ClientMessage::StartPoll {
            question,
            options,
            duration_seconds,
            ..
        } => validate_poll(question, options, *duration_seconds)?,
        ClientMessage::EndSession { .. } | ClientMessage::EndPoll { .. } | ClientMessage::Ping => {},
    }

    Ok(())
}
