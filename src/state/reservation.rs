//! Board reservation.
//!
//! A reservation is optimistic first and authoritative second. `reserve`
//! records a pending [`LocalReservationIntent`] whose card is shown as
//! reserved by the local user straight away. The server's answer either
//! confirms it (its card record replaces the guess) or rolls it back.
//!
//! At most one intent exists at a time. A new request, or an ownership
//! change that hands the card to someone else, supersedes the current
//! intent. Responses are matched by intent id, so a late answer to a
//! superseded intent is discarded.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::card::{Card, CardId, CardStatus, UserId};
use super::events::StaleReason;

/// Default time to wait for a reservation response.
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Status shown for the optimistic mark.
pub const OPTIMISTIC_STATUS: CardStatus = CardStatus::Reserved;

/// Identifier minted for each reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct IntentId(u64);

impl IntentId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "intent-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentOutcome {
    Pending,
    Confirmed,
    Rejected,
}

/// An in-flight reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReservationIntent {
    pub id: IntentId,
    pub card_id: CardId,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub deadline: Instant,
    pub outcome: IntentOutcome,
}

impl LocalReservationIntent {
    pub fn is_pending(&self) -> bool {
        self.outcome == IntentOutcome::Pending
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Why a reservation failed without a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Server(String),
    Network(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "no response in time"),
            Self::Server(msg) => write!(f, "server error: {}", msg),
            Self::Network(msg) => write!(f, "network error: {}", msg),
        }
    }
}

/// Server answer to a reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationResponse {
    /// Reservation granted; the server's card record
    Granted(Card),
    /// Someone else holds the card
    Conflict { holder: Option<UserId> },
    /// Transport or server fault
    Failed(FailureReason),
}

/// Reservation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    #[error("card {0} is not available")]
    NotAvailable(CardId),
    #[error("card {card_id} is held by someone else")]
    Conflict {
        card_id: CardId,
        holder: Option<UserId>,
    },
    #[error("reservation of card {card_id} failed: {reason}")]
    Failed {
        card_id: CardId,
        reason: FailureReason,
    },
    #[error("anonymous players cannot reserve cards")]
    Anonymous,
}

impl ReservationError {
    /// Whether calling `reserve` again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Card the failed request was for, when there was one.
    pub fn card_id(&self) -> Option<&CardId> {
        match self {
            Self::NotAvailable(card_id)
            | Self::Conflict { card_id, .. }
            | Self::Failed { card_id, .. } => Some(card_id),
            Self::Anonymous => None,
        }
    }
}

/// Result of resolving a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Intent confirmed; the server record to store
    Confirmed(Card),
    /// Response no longer relevant
    Discarded(StaleReason),
}

/// How an authoritative ownership change affected the local player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionChange {
    None,
    /// The pending intent's card went to someone else
    IntentSuperseded(CardId),
    /// The held board was released or reassigned
    SelectionCleared(CardId),
}

/// Drives reservations for the local player.
#[derive(Debug)]
pub struct ReservationCoordinator {
    user: Option<UserId>,
    timeout: Duration,
    next_id: u64,

    /// Current pending intent
    intent: Option<LocalReservationIntent>,

    /// Confirmed board
    held: Option<CardId>,

    /// Most recently resolved intent, with its final outcome
    last: Option<LocalReservationIntent>,
}

impl ReservationCoordinator {
    pub fn new(user: Option<UserId>, timeout: Duration) -> Self {
        Self {
            user,
            timeout,
            next_id: 0,
            intent: None,
            held: None,
            last: None,
        }
    }

    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    pub fn intent(&self) -> Option<&LocalReservationIntent> {
        self.intent.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.intent.is_some()
    }

    pub fn held(&self) -> Option<&CardId> {
        self.held.as_ref()
    }

    pub fn last_resolved(&self) -> Option<&LocalReservationIntent> {
        self.last.as_ref()
    }

    /// The optimistic mark to show over the catalog: card and local owner.
    pub fn optimistic_mark(&self) -> Option<(&CardId, &UserId)> {
        match (&self.intent, &self.user) {
            (Some(intent), Some(user)) => Some((&intent.card_id, user)),
            _ => None,
        }
    }

    /// Start reserving `card_id`.
    ///
    /// `known` is the catalog's authoritative record. Fails without side
    /// effects unless the card is known, available and not already the
    /// subject of the pending intent.
    pub fn reserve(
        &mut self,
        card_id: &CardId,
        known: Option<&Card>,
    ) -> Result<IntentId, ReservationError> {
        if self.user.is_none() {
            return Err(ReservationError::Anonymous);
        }

        let available = known.map(|c| c.is_available()).unwrap_or(false);
        let already_pending = self.intent.as_ref().map(|i| &i.card_id) == Some(card_id);
        if !available || already_pending {
            debug!(card_id = %card_id, "Card not available for reservation");
            return Err(ReservationError::NotAvailable(card_id.clone()));
        }

        if let Some(previous) = self.intent.take() {
            info!(
                previous = %previous.card_id,
                next = %card_id,
                intent = %previous.id,
                "Superseding pending reservation"
            );
            self.reject(previous);
        }

        self.next_id += 1;
        let intent = LocalReservationIntent {
            id: IntentId(self.next_id),
            card_id: card_id.clone(),
            requested_at: chrono::Utc::now(),
            deadline: Instant::now() + self.timeout,
            outcome: IntentOutcome::Pending,
        };
        info!(card_id = %card_id, intent = %intent.id, "Reservation requested");
        let id = intent.id;
        self.intent = Some(intent);
        Ok(id)
    }

    /// Resolve the server's answer for `intent_id`.
    pub fn complete(
        &mut self,
        intent_id: IntentId,
        response: ReservationResponse,
    ) -> Result<Resolution, ReservationError> {
        let intent = match self.intent.take() {
            Some(intent) if intent.id == intent_id => intent,
            other => {
                self.intent = other;
                debug!(intent = %intent_id, "Discarding response for superseded reservation");
                return Ok(Resolution::Discarded(StaleReason::SupersededIntent));
            }
        };
        let card_id = intent.card_id.clone();

        match response {
            ReservationResponse::Granted(card) => self.confirm(intent, card),
            ReservationResponse::Conflict { holder } => {
                info!(card_id = %card_id, holder = ?holder, "Reservation lost to another player");
                self.reject(intent);
                Err(ReservationError::Conflict { card_id, holder })
            }
            ReservationResponse::Failed(reason) => {
                warn!(card_id = %card_id, reason = %reason, "Reservation failed");
                self.reject(intent);
                Err(ReservationError::Failed { card_id, reason })
            }
        }
    }

    /// Fail the pending intent if its deadline has passed.
    pub fn expire_stale(&mut self) -> Option<ReservationError> {
        if !self.intent.as_ref().is_some_and(|i| i.is_expired()) {
            return None;
        }
        let intent = self.intent.take()?;
        warn!(card_id = %intent.card_id, intent = %intent.id, "Reservation timed out");
        let card_id = intent.card_id.clone();
        self.reject(intent);
        Some(ReservationError::Failed {
            card_id,
            reason: FailureReason::Timeout,
        })
    }

    /// React to an authoritative change of `card`.
    ///
    /// A held board that is no longer owned by the local user is dropped in
    /// the same update, and a pending intent for a card someone else took is
    /// superseded.
    pub fn on_card_changed(&mut self, card: &Card) -> SelectionChange {
        let owned_locally = self.user.as_ref().is_some_and(|u| card.is_owned_by(u));

        if self.intent.as_ref().map(|i| &i.card_id) == Some(&card.id)
            && !card.is_available()
            && !owned_locally
        {
            if let Some(intent) = self.intent.take() {
                info!(
                    card_id = %card.id,
                    owner = ?card.owner_id,
                    intent = %intent.id,
                    "Pending reservation superseded by ownership change"
                );
                self.reject(intent);
            }
            return SelectionChange::IntentSuperseded(card.id.clone());
        }

        if self.held.as_ref() == Some(&card.id) && !owned_locally {
            warn!(card_id = %card.id, owner = ?card.owner_id, "Held board reassigned, clearing selection");
            self.held = None;
            return SelectionChange::SelectionCleared(card.id.clone());
        }

        SelectionChange::None
    }

    /// After a rollback, hold `card` if its authoritative record already
    /// names the local user as owner. Returns whether it became the held board.
    pub fn adopt_if_owned(&mut self, card: &Card) -> bool {
        let owned_locally = self.user.as_ref().is_some_and(|u| card.is_owned_by(u));
        let pending = self.intent.as_ref().is_some_and(|i| i.card_id == card.id);
        if !owned_locally || pending || self.held.as_ref() == Some(&card.id) {
            return false;
        }

        info!(card_id = %card.id, status = card.status.as_str(), "Catalog shows board as ours, holding it");
        if let Some(last) = self.last.as_mut().filter(|l| l.card_id == card.id) {
            last.outcome = IntentOutcome::Confirmed;
        }
        self.held = Some(card.id.clone());
        true
    }

    /// Drop the held board when the card no longer exists.
    pub fn on_card_missing(&mut self, card_id: &CardId) -> SelectionChange {
        if self.intent.as_ref().map(|i| &i.card_id) == Some(card_id) {
            if let Some(intent) = self.intent.take() {
                self.reject(intent);
            }
            return SelectionChange::IntentSuperseded(card_id.clone());
        }
        if self.held.as_ref() == Some(card_id) {
            self.held = None;
            return SelectionChange::SelectionCleared(card_id.clone());
        }
        SelectionChange::None
    }

    fn confirm(
        &mut self,
        mut intent: LocalReservationIntent,
        card: Card,
    ) -> Result<Resolution, ReservationError> {
        let card_id = intent.card_id.clone();

        if card.id != card_id {
            warn!(expected = %card_id, got = %card.id, "Reservation response names another card");
            self.reject(intent);
            return Err(ReservationError::Failed {
                card_id,
                reason: FailureReason::Server("response for a different card".to_string()),
            });
        }
        if let Err(err) = card.validate() {
            warn!(card_id = %card_id, error = %err, "Reservation response carries an invalid card");
            self.reject(intent);
            return Err(ReservationError::Failed {
                card_id,
                reason: FailureReason::Server(err.to_string()),
            });
        }

        let owned_locally = self.user.as_ref().is_some_and(|u| card.is_owned_by(u));
        if !owned_locally {
            info!(card_id = %card_id, owner = ?card.owner_id, "Reservation granted to another owner");
            self.reject(intent);
            return Err(ReservationError::Conflict {
                card_id,
                holder: card.owner_id.clone(),
            });
        }

        intent.outcome = IntentOutcome::Confirmed;
        info!(
            card_id = %card_id,
            intent = %intent.id,
            status = card.status.as_str(),
            "Reservation confirmed"
        );
        self.held = Some(card_id);
        self.last = Some(intent);
        Ok(Resolution::Confirmed(card))
    }

    fn reject(&mut self, mut intent: LocalReservationIntent) {
        intent.outcome = IntentOutcome::Rejected;
        self.last = Some(intent);
    }
}
