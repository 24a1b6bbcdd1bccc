//! Win claims.
//!
//! The client never decides a win. It sends one claim per user action for
//! the held board and reports whatever the server rules.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::card::CardId;
use super::events::{Applied, ClaimResult, StaleReason};
use super::session::SessionStatus;

/// Identifier minted for each claim submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ClaimId(u64);

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "claim-{}", self.0)
    }
}

/// Server adjudication, as returned by the claim endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Final ruling on a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimOutcome {
    pub card_id: CardId,
    pub accepted: bool,
    pub reason: Option<String>,
}

/// Claim state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ClaimState {
    #[default]
    Idle,
    Pending {
        id: ClaimId,
        card_id: CardId,
        submitted_at: chrono::DateTime<chrono::Utc>,
    },
    Resolved(ClaimOutcome),
}

impl ClaimState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

/// Claim errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    #[error("no board selected")]
    NoBoardSelected,
    #[error("game is not active")]
    GameNotActive,
    #[error("a claim is already pending")]
    ClaimAlreadyPending,
    #[error("claim could not be submitted: {0}")]
    Failed(String),
}

impl ClaimError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Submits claims and tracks their outcome.
#[derive(Debug, Default)]
pub struct ClaimSubmitter {
    state: ClaimState,
    next_id: u64,
}

impl ClaimSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ClaimState {
        &self.state
    }

    /// Start a claim for the held board.
    pub fn submit(
        &mut self,
        held: Option<&CardId>,
        status: SessionStatus,
    ) -> Result<(ClaimId, CardId), ClaimError> {
        if !status.is_active() {
            return Err(ClaimError::GameNotActive);
        }
        let card_id = held.ok_or(ClaimError::NoBoardSelected)?.clone();
        if self.state.is_pending() {
            debug!(card_id = %card_id, "Claim already pending, ignoring");
            return Err(ClaimError::ClaimAlreadyPending);
        }

        self.next_id += 1;
        let id = ClaimId(self.next_id);
        self.state = ClaimState::Pending {
            id,
            card_id: card_id.clone(),
            submitted_at: chrono::Utc::now(),
        };
        info!(card_id = %card_id, claim = %id, "Claim submitted");
        Ok((id, card_id))
    }

    /// Record the claim endpoint's answer. `Err` is a transport failure.
    pub fn complete(
        &mut self,
        claim_id: ClaimId,
        response: Result<ClaimResponse, String>,
    ) -> Result<Option<ClaimOutcome>, ClaimError> {
        let card_id = match &self.state {
            ClaimState::Pending { id, card_id, .. } if *id == claim_id => card_id.clone(),
            _ => {
                debug!(claim = %claim_id, "Discarding response for unknown claim");
                return Ok(None);
            }
        };

        match response {
            Ok(response) => {
                let outcome = ClaimOutcome {
                    card_id,
                    accepted: response.accepted,
                    reason: response.reason,
                };
                info!(
                    card_id = %outcome.card_id,
                    accepted = outcome.accepted,
                    reason = ?outcome.reason,
                    "Claim adjudicated"
                );
                self.state = ClaimState::Resolved(outcome.clone());
                Ok(Some(outcome))
            }
            Err(reason) => {
                warn!(card_id = %card_id, reason = %reason, "Claim submission failed");
                self.state = ClaimState::Idle;
                Err(ClaimError::Failed(reason))
            }
        }
    }

    /// Check a pushed ruling against the authoritative one.
    pub fn confirm_from_push(&mut self, result: &ClaimResult) -> Applied {
        match &self.state {
            ClaimState::Resolved(outcome) if outcome.card_id == result.card_id => {
                if outcome.accepted != result.accepted {
                    warn!(
                        card_id = %result.card_id,
                        rest = outcome.accepted,
                        push = result.accepted,
                        "Pushed claim result disagrees with claim response, ignoring"
                    );
                } else {
                    debug!(card_id = %result.card_id, "Claim result confirmed by push");
                }
                Applied::Unchanged
            }
            ClaimState::Pending { card_id, .. } if *card_id == result.card_id => {
                debug!(card_id = %card_id, "Pushed claim result before response, waiting for response");
                Applied::Unchanged
            }
            _ => Applied::Stale(StaleReason::UnknownClaim),
        }
    }
}
