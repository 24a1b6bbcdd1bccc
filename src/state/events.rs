//! Typed push events.
//!
//! Raw topic payloads are decoded here, in one place, into [`PushEvent`]
//! variants. Every variant carries the identifier (card, session) that
//! its consumer uses to decide whether the event is still relevant.

use serde::{Deserialize, Serialize};

use super::card::{CardId, CardStatus, Grid, UserId};
use super::session::SessionId;
use super::transport::TransportError;

/// Topic names on the push connection.
pub mod topics {
    pub const OWNERSHIP_CHANGED: &str = "ownership.changed";
    pub const SESSION_STARTED: &str = "session.started";
    pub const SESSION_ENDED: &str = "session.ended";
    pub const NUMBER_DRAWN: &str = "number.drawn";
    pub const CLAIM_RESULT: &str = "claim.result";
    pub const CLAIM_SUBMITTED: &str = "claim.submitted";

    /// Topics the sync engine subscribes to.
    pub const CONSUMED: [&str; 5] = [
        OWNERSHIP_CHANGED,
        SESSION_STARTED,
        SESSION_ENDED,
        NUMBER_DRAWN,
        CLAIM_RESULT,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipChanged {
    pub card_id: CardId,
    pub status: CardStatus,
    #[serde(default)]
    pub owner_id: Option<UserId>,
    /// Server ordering token
    #[serde(default)]
    pub seq: Option<u64>,
    /// Grid, sent when the card may be new to the client
    #[serde(default)]
    pub numbers: Option<Grid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStarted {
    pub session_id: SessionId,
    #[serde(default)]
    pub numbers_drawn: Vec<u8>,
    #[serde(default)]
    pub players_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnded {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberDrawn {
    pub session_id: SessionId,
    pub number: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResult {
    pub card_id: CardId,
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A decoded push event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    OwnershipChanged(OwnershipChanged),
    SessionStarted(SessionStarted),
    SessionEnded(SessionEnded),
    NumberDrawn(NumberDrawn),
    ClaimResult(ClaimResult),
}

impl PushEvent {
    /// Decode a payload received on `topic`.
    pub fn decode(topic: &str, payload: &serde_json::Value) -> Result<Self, TransportError> {
        let malformed = |err: serde_json::Error| TransportError::Malformed {
            topic: topic.to_string(),
            reason: err.to_string(),
        };

        match topic {
            topics::OWNERSHIP_CHANGED => OwnershipChanged::deserialize(payload)
                .map(Self::OwnershipChanged)
                .map_err(malformed),
            topics::SESSION_STARTED => SessionStarted::deserialize(payload)
                .map(Self::SessionStarted)
                .map_err(malformed),
            topics::SESSION_ENDED => SessionEnded::deserialize(payload)
                .map(Self::SessionEnded)
                .map_err(malformed),
            topics::NUMBER_DRAWN => NumberDrawn::deserialize(payload)
                .map(Self::NumberDrawn)
                .map_err(malformed),
            topics::CLAIM_RESULT => ClaimResult::deserialize(payload)
                .map(Self::ClaimResult)
                .map_err(malformed),
            other => Err(TransportError::UnknownTopic(other.to_string())),
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            Self::OwnershipChanged(_) => topics::OWNERSHIP_CHANGED,
            Self::SessionStarted(_) => topics::SESSION_STARTED,
            Self::SessionEnded(_) => topics::SESSION_ENDED,
            Self::NumberDrawn(_) => topics::NUMBER_DRAWN,
            Self::ClaimResult(_) => topics::CLAIM_RESULT,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            Self::OwnershipChanged(e) => serde_json::to_value(e),
            Self::SessionStarted(e) => serde_json::to_value(e),
            Self::SessionEnded(e) => serde_json::to_value(e),
            Self::NumberDrawn(e) => serde_json::to_value(e),
            Self::ClaimResult(e) => serde_json::to_value(e),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}

/// Result of applying an event or late response to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Local state changed
    Changed,
    /// Already reflected (duplicate delivery)
    Unchanged,
    /// Held until the catalog snapshot arrives
    Deferred,
    /// Discarded; no longer relevant
    Stale(StaleReason),
}

impl Applied {
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed)
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }
}

/// Why an event was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Ordering token not newer than the one already applied
    OutOfOrder,
    /// Session id differs from the active session
    SessionMismatch,
    /// Session already finished
    SessionClosed,
    /// No session has started
    NoActiveSession,
    /// Response for an intent that was superseded or already resolved
    SupersededIntent,
    /// Response for a claim that is no longer outstanding
    UnknownClaim,
    /// Payload violates an invariant
    Malformed,
}

impl StaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfOrder => "out_of_order",
            Self::SessionMismatch => "session_mismatch",
            Self::SessionClosed => "session_closed",
            Self::NoActiveSession => "no_active_session",
            Self::SupersededIntent => "superseded_intent",
            Self::UnknownClaim => "unknown_claim",
            Self::Malformed => "malformed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_decode_ownership() {
        let event = PushEvent::decode(
            topics::OWNERSHIP_CHANGED,
            &json!({"cardId": 7, "status": "sold", "ownerId": "otherUser", "seq": 3}),
        )
        .unwrap();

        assert_eq!(
            event,
            PushEvent::OwnershipChanged(OwnershipChanged {
                card_id: CardId::from(7u64),
                status: CardStatus::Sold,
                owner_id: Some(UserId::from("otherUser")),
                seq: Some(3),
                numbers: None,
            })
        );
        assert_eq!(event.topic(), topics::OWNERSHIP_CHANGED);
    }

    #[test]
    fn test_decode_session_started_defaults() {
        let event =
            PushEvent::decode(topics::SESSION_STARTED, &json!({"sessionId": "S1"})).unwrap();
        match event {
            PushEvent::SessionStarted(started) => {
                assert_eq!(started.session_id.as_str(), "S1");
                assert!(started.numbers_drawn.is_empty());
                assert_eq!(started.players_count, None);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors() {
        let err = PushEvent::decode("chat.message", &json!({})).unwrap_err();
        assert_eq!(err, TransportError::UnknownTopic("chat.message".to_string()));

        let err = PushEvent::decode(topics::NUMBER_DRAWN, &json!({"sessionId": "S1"})).unwrap_err();
        assert!(matches!(err, TransportError::Malformed { .. }));
    }

    #[test]
    fn test_to_json_round_trips_topic_payload() {
        let event = PushEvent::NumberDrawn(NumberDrawn {
            session_id: SessionId::from("S1"),
            number: 17,
        });
        assert_eq!(event.to_json(), json!({"sessionId": "S1", "number": 17}));
    }
}
