// ============================
// crates/backend-lib/src/protocol.rs
// ============================
//! Protocol helpers shared by every message handler: parse-and-validate,
//! plus ACK/NACK replies for messages that carry a `messageId`.
use crate::metrics::MESSAGE_REJECTED;
use crate::validation::{Validate, ValidationIssue};
use metrics::counter;
use pika_common::ServerMessage;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tracing::debug;

/// serde names the offending field in backticks
static FIELD_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([A-Za-z0-9_]+)`").unwrap());

/// Finds `messageId` without deserializing the whole frame
static MESSAGE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""messageId"\s*:\s*"([^"\\]{1,64})""#).unwrap());

/// Parse `raw` and apply its validation rules.
///
/// Only the first issue is reported, which keeps the NACK short.
pub fn validate<T>(raw: &str) -> Result<T, ValidationIssue>
where
    T: DeserializeOwned + Validate,
{
    let parsed: T = serde_json::from_str(raw).map_err(|e| {
        counter!(MESSAGE_REJECTED, "reason" => "parse").increment(1);
        issue_from_serde(&e)
    })?;

    parsed.validate().inspect_err(|_| {
        counter!(MESSAGE_REJECTED, "reason" => "validation").increment(1);
    })?;
    Ok(parsed)
}

fn issue_from_serde(error: &serde_json::Error) -> ValidationIssue {
    let text = error.to_string();
    // Drop the " at line 1 column 42" suffix
    let message = text
        .rsplit_once(" at line ")
        .map_or(text.as_str(), |(head, _)| head)
        .to_string();

    let path = if message.contains("unknown variant") || message.contains("missing field `type`") {
        "type".to_string()
    } else if error.is_syntax() || error.is_eof() {
        "$".to_string()
    } else {
        FIELD_REGEX
            .captures(&message)
            .and_then(|caps| caps.get(1))
            .map_or_else(|| "$".to_string(), |m| m.as_str().to_string())
    };

    ValidationIssue::new(path, message)
}

/// Best-effort `messageId` lookup, usable on frames that failed to parse
pub fn message_id_of(raw: &str) -> Option<String> {
    MESSAGE_ID_REGEX
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Send a message to one connection; a closed connection is not an error
pub async fn send(tx: &mpsc::Sender<ServerMessage>, message: ServerMessage) {
    if let Err(e) = tx.send(message).await {
        debug!(message = ?e.0, "Connection closed, dropping outbound message");
    }
}

/// Acknowledge a message; no-op for fire-and-forget messages
pub async fn ack(tx: &mpsc::Sender<ServerMessage>, message_id: Option<&str>) {
    let Some(message_id) = message_id else {
        return;
    };
    send(
        tx,
        ServerMessage::Ack {
            message_id: message_id.to_string(),
        },
    )
    .await;
}

/// Reject a message with a human-readable reason; no-op without an id
pub async fn nack(
    tx: &mpsc::Sender<ServerMessage>,
    message_id: Option<&str>,
    error: impl Into<String>,
) {
    let Some(message_id) = message_id else {
        return;
    };
    send(
        tx,
        ServerMessage::Nack {
            message_id: message_id.to_string(),
            error: error.into(),
        },
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pika_common::{ClientMessage, Envelope};

    #[test]
    fn test_validate_accepts_good_message() {
        let raw = r#"{"type":"BROADCAST_TRACK","messageId":"m1","sessionId":"s1","track":{"artist":"A","title":"B"}}"#;
        let envelope: Envelope = validate(raw).unwrap();
        assert_eq!(envelope.message_id.as_deref(), Some("m1"));
        assert!(matches!(
            envelope.message,
            ClientMessage::BroadcastTrack { .. }
        ));
    }

    #[test]
    fn test_validate_reports_missing_field() {
        let raw = r#"{"type":"SUBSCRIBE","messageId":"m1"}"#;
        let issue = validate::<Envelope>(raw).unwrap_err();
        assert_eq!(issue.path, "sessionId");
        assert!(issue.message.contains("missing field"));
        assert!(!issue.message.contains("line"));
    }

    #[test]
    fn test_validate_reports_unknown_type() {
        let issue = validate::<Envelope>(r#"{"type":"DANCE","sessionId":"s1"}"#).unwrap_err();
        assert_eq!(issue.path, "type");
    }

    #[test]
    fn test_validate_reports_rule_violation() {
        let raw = r#"{"type":"SEND_TEMPO_REQUEST","sessionId":"bad id","preference":"faster"}"#;
        let issue = validate::<Envelope>(raw).unwrap_err();
        assert_eq!(issue.path, "sessionId");
    }

    #[test]
    fn test_validate_reports_malformed_json() {
        let issue = validate::<Envelope>("{not json").unwrap_err();
        assert_eq!(issue.path, "$");
    }

    #[test]
    fn test_message_id_of() {
        assert_eq!(
            message_id_of(r#"{"type":"NOPE","messageId": "abc-1"}"#).as_deref(),
            Some("abc-1")
        );
        assert!(message_id_of(r#"{"type":"PING"}"#).is_none());
    }

    #[tokio::test]
    async fn test_ack_and_nack_without_id_send_nothing() {
        let (tx, mut rx) = mpsc::channel(4);
        ack(&tx, None).await;
        nack(&tx, None, "bad").await;
        ack(&tx, Some("m1")).await;
        nack(&tx, Some("m2"), "bad").await;
        drop(tx);

        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::Ack {
                message_id: "m1".to_string()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::Nack {
                message_id: "m2".to_string(),
                error: "bad".to_string()
            })
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_closed_connection_is_swallowed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        ack(&tx, Some("m1")).await;
        nack(&tx, Some("m2"), "gone").await;
    }
}
