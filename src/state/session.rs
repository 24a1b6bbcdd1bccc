//! Game session state machine.
//!
//! Tracks the live session lifecycle and the append-only sequence of drawn
//! numbers.
//!
//! # State Diagram
//!
//! ```text
//! ┌───────────┐  session.started   ┌──────────┐  session.ended   ┌────────────┐
//! │  Waiting  │───────────────────▶│  Active  │─────────────────▶│  Finished  │
//! └───────────┘                    └────┬─────┘                  └─────┬──────┘
//!                                       │ ▲ number.drawn               │
//!                                       └─┘ (same session)             │
//!                                                                      │
//!              session.started (never-closed session id) ──────────────┘
//!                              starts a new Active session
//! ```
//!
//! Every event names its session. Events for any other session are stale
//! and dropped; nothing is inferred from missing events. Closed sessions
//! stay closed: a redelivered start for one is stale, and while a session
//! is active a start for another id is stale until the active one ends.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::card::MAX_NUMBER;
use super::events::{Applied, StaleReason};

/// Live session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Waiting,
    Active,
    Finished,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Finished => "finished",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Read-only snapshot of the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSession {
    pub id: Option<SessionId>,
    pub status: SessionStatus,
    /// Call order; no duplicates
    pub numbers_drawn: Vec<u8>,
    /// Advisory only
    pub players_count: Option<u32>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl GameSession {
    pub fn last_drawn(&self) -> Option<u8> {
        self.numbers_drawn.last().copied()
    }

    pub fn is_drawn(&self, number: u8) -> bool {
        self.numbers_drawn.contains(&number)
    }
}

/// Session transition events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started {
        session_id: SessionId,
        numbers_drawn: Vec<u8>,
        players_count: Option<u32>,
    },
    Ended {
        session_id: SessionId,
    },
    Drawn {
        session_id: SessionId,
        number: u8,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Started { session_id, .. }
            | Self::Ended { session_id }
            | Self::Drawn { session_id, .. } => session_id,
        }
    }
}

/// Session errors for direct (non-event) use.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("game is not active")]
    NotActive,
    #[error("number {0} is outside 1..=75")]
    InvalidNumber(u8),
}

/// Session state machine.
#[derive(Debug, Clone, Default)]
pub struct GameStateMachine {
    session: GameSession,
    /// Mirror of `numbers_drawn` for O(1) duplicate checks
    drawn: HashSet<u8>,
    /// Sessions that have ended
    closed: HashSet<SessionId>,
}

impl GameStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> &GameSession {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session.id.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.session.status.is_active()
    }

    /// Apply a session event. Stale events leave state untouched.
    pub fn apply(&mut self, event: SessionEvent) -> Applied {
        let outcome = self.transition(event.clone());
        match outcome {
            Applied::Stale(reason) => debug!(
                session_id = %event.session_id(),
                current = ?self.session.id,
                status = self.session.status.as_str(),
                reason = reason.as_str(),
                "Discarded stale session event"
            ),
            Applied::Changed => debug!(
                session_id = %event.session_id(),
                status = self.session.status.as_str(),
                drawn = self.session.numbers_drawn.len(),
                "Session updated"
            ),
            Applied::Unchanged | Applied::Deferred => {}
        }
        outcome
    }

    /// Append a draw to the active session.
    pub fn apply_draw(&mut self, number: u8) -> Result<Applied, SessionError> {
        let session_id = match (&self.session.id, self.session.status) {
            (Some(id), SessionStatus::Active) => id.clone(),
            _ => return Err(SessionError::NotActive),
        };
        if !is_valid_number(number) {
            return Err(SessionError::InvalidNumber(number));
        }
        Ok(self.apply(SessionEvent::Drawn { session_id, number }))
    }

    fn transition(&mut self, event: SessionEvent) -> Applied {
        use SessionStatus::*;

        match (self.session.status, event) {
            (
                Waiting | Finished,
                SessionEvent::Started {
                    session_id,
                    numbers_drawn,
                    players_count,
                },
            ) => {
                if self.closed.contains(&session_id) {
                    return Applied::Stale(StaleReason::SessionClosed);
                }
                self.begin(session_id, numbers_drawn, players_count);
                Applied::Changed
            }
            (
                Active,
                SessionEvent::Started {
                    session_id,
                    numbers_drawn,
                    players_count,
                },
            ) => {
                if self.session.id.as_ref() == Some(&session_id) {
                    // Redelivered start: keep our order, pick up any draws we missed
                    let appended = numbers_drawn
                        .into_iter()
                        .filter(|n| self.push_number(*n))
                        .count();
                    if players_count.is_some() {
                        self.session.players_count = players_count;
                    }
                    if appended > 0 {
                        Applied::Changed
                    } else {
                        Applied::Unchanged
                    }
                } else if self.closed.contains(&session_id) {
                    Applied::Stale(StaleReason::SessionClosed)
                } else {
                    // Only an end event closes the active session
                    warn!(
                        current = ?self.session.id,
                        next = %session_id,
                        "Start for another session while one is active, ignoring"
                    );
                    Applied::Stale(StaleReason::SessionMismatch)
                }
            }

            (Active, SessionEvent::Ended { session_id }) => {
                if self.session.id.as_ref() != Some(&session_id) {
                    return Applied::Stale(StaleReason::SessionMismatch);
                }
                self.session.status = Finished;
                self.session.ended_at = Some(chrono::Utc::now());
                self.closed.insert(session_id.clone());
                info!(session_id = %session_id, drawn = self.session.numbers_drawn.len(), "Session finished");
                Applied::Changed
            }
            (Finished, SessionEvent::Ended { session_id }) => {
                if self.session.id.as_ref() == Some(&session_id) {
                    Applied::Unchanged
                } else {
                    Applied::Stale(StaleReason::SessionMismatch)
                }
            }
            (Waiting, SessionEvent::Ended { .. }) => Applied::Stale(StaleReason::NoActiveSession),

            (Active, SessionEvent::Drawn { session_id, number }) => {
                if self.session.id.as_ref() != Some(&session_id) {
                    return Applied::Stale(StaleReason::SessionMismatch);
                }
                if !is_valid_number(number) {
                    return Applied::Stale(StaleReason::Malformed);
                }
                if self.push_number(number) {
                    Applied::Changed
                } else {
                    Applied::Unchanged
                }
            }
            (Finished, SessionEvent::Drawn { session_id, .. }) => {
                if self.session.id.as_ref() == Some(&session_id) {
                    Applied::Stale(StaleReason::SessionClosed)
                } else {
                    Applied::Stale(StaleReason::SessionMismatch)
                }
            }
            (Waiting, SessionEvent::Drawn { .. }) => Applied::Stale(StaleReason::NoActiveSession),
        }
    }

    fn begin(&mut self, session_id: SessionId, numbers_drawn: Vec<u8>, players_count: Option<u32>) {
        info!(session_id = %session_id, seeded = numbers_drawn.len(), "Session started");
        self.session = GameSession {
            id: Some(session_id),
            status: SessionStatus::Active,
            numbers_drawn: Vec::with_capacity(MAX_NUMBER as usize),
            players_count,
            started_at: Some(chrono::Utc::now()),
            ended_at: None,
        };
        self.drawn.clear();
        for number in numbers_drawn {
            self.push_number(number);
        }
    }

    /// Append if valid and unseen. Returns whether it was appended.
    fn push_number(&mut self, number: u8) -> bool {
        if !is_valid_number(number) {
            warn!(number, "Ignoring out-of-range draw");
            return false;
        }
        if !self.drawn.insert(number) {
            return false;
        }
        self.session.numbers_drawn.push(number);
        true
    }
}

fn is_valid_number(number: u8) -> bool {
    (1..=MAX_NUMBER).contains(&number)
}
