//! Card catalog reconciliation.
//!
//! Holds the authoritative local card table. It is filled from REST catalog
//! snapshots and kept current by `ownership.changed` events. The two sources
//! arrive independently, so:
//!
//! - events seen before the first snapshot are remembered and re-applied on
//!   top of it;
//! - per-card ordering tokens (`version` in a snapshot, `seq` on an event)
//!   decide which write wins; without a token the last one received wins;
//! - only the response to the most recently requested snapshot is accepted.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::card::{Card, CardId, CardStatus};
use super::events::{Applied, OwnershipChanged, StaleReason};
use super::session::SessionStatus;

/// Why a snapshot was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    /// Startup load
    Initial,
    /// Mandatory reload after a reconnect
    Resync,
}

/// Local conditions checked before an initial snapshot may replace the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotGuard {
    pub intent_pending: bool,
    pub session_status: SessionStatus,
}

/// Result of a successful snapshot load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub loaded: usize,
    pub skipped: usize,
    /// Local cards kept because their version is newer than the snapshot's
    pub retained: usize,
    /// Remembered events re-applied on top of the snapshot
    pub replayed: usize,
}

/// Catalog errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("stale catalog snapshot: {0}")]
    StaleSnapshot(&'static str),
    #[error("card {0} is not in the catalog")]
    UnknownCard(CardId),
}

const RESERVATION_PENDING: &str = "reservation pending";
const SESSION_IN_PROGRESS: &str = "session already in progress";

impl CatalogError {
    /// Refused by the initial-load guard rather than by generation.
    pub fn is_guard_rejection(&self) -> bool {
        matches!(self, Self::StaleSnapshot(reason) if *reason == RESERVATION_PENDING || *reason == SESSION_IN_PROGRESS)
    }
}

/// Authoritative card table.
#[derive(Debug, Default)]
pub struct CatalogReconciler {
    /// Cards by id, ordered for display
    cards: BTreeMap<CardId, Card>,

    /// Whether any snapshot has been applied
    loaded: bool,

    /// Events that could not be applied yet (no snapshot, or unknown card)
    deferred: HashMap<CardId, OwnershipChanged>,

    /// Latest requested snapshot generation
    generation: u64,

    /// Kind of the latest requested snapshot
    pending_kind: Option<SnapshotKind>,
}

impl CatalogReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn get(&self, card_id: &CardId) -> Option<&Card> {
        self.cards.get(card_id)
    }

    pub fn cards(&self) -> impl Iterator<Item = &Card> {
        self.cards.values()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.cards.values().filter(|c| c.is_available()).count()
    }

    /// Kind of the outstanding snapshot request, if any.
    pub fn pending_snapshot(&self) -> Option<(u64, SnapshotKind)> {
        self.pending_kind.map(|kind| (self.generation, kind))
    }

    /// Register a new snapshot request. Any older request becomes stale.
    pub fn begin_snapshot(&mut self, kind: SnapshotKind) -> u64 {
        self.generation += 1;
        // A resync request outranks anything requested before it
        let kind = match (self.pending_kind, kind) {
            (Some(SnapshotKind::Resync), _) => SnapshotKind::Resync,
            (_, kind) => kind,
        };
        self.pending_kind = Some(kind);
        debug!(generation = self.generation, kind = ?kind, "Catalog snapshot requested");
        self.generation
    }

    /// Replace the table with a snapshot.
    ///
    /// Initial loads are refused while a reservation is pending or once the
    /// session has moved past waiting, so a slow startup fetch cannot
    /// overwrite state built from live events. Resync loads always apply.
    pub fn load_snapshot(
        &mut self,
        generation: u64,
        cards: Vec<Card>,
        guard: SnapshotGuard,
    ) -> Result<SnapshotOutcome, CatalogError> {
        let kind = match self.pending_kind {
            Some(kind) if generation == self.generation => kind,
            Some(_) => return Err(self.reject("superseded by a newer request")),
            None => return Err(self.reject("no snapshot outstanding")),
        };

        if kind == SnapshotKind::Initial {
            if guard.intent_pending {
                return Err(self.reject(RESERVATION_PENDING));
            }
            if guard.session_status != SessionStatus::Waiting {
                return Err(self.reject(SESSION_IN_PROGRESS));
            }
        }

        let mut outcome = SnapshotOutcome::default();
        let mut table = BTreeMap::new();
        for card in cards {
            if let Err(err) = card.validate() {
                warn!(card_id = %card.id, error = %err, "Skipping invalid card in snapshot");
                outcome.skipped += 1;
                continue;
            }
            let card = match self.cards.get(&card.id) {
                Some(current) if is_newer(current.version, card.version) => {
                    debug!(
                        card_id = %card.id,
                        local = ?current.version,
                        snapshot = ?card.version,
                        "Keeping newer local card over snapshot entry"
                    );
                    outcome.retained += 1;
                    current.clone()
                }
                _ => card,
            };
            if table.insert(card.id.clone(), card).is_some() {
                warn!("Duplicate card id in snapshot, keeping the last one");
            }
        }
        outcome.loaded = table.len();

        self.cards = table;
        self.loaded = true;
        self.pending_kind = None;

        let deferred = std::mem::take(&mut self.deferred);
        match kind {
            SnapshotKind::Initial => {
                for (_, event) in deferred {
                    if self.apply_ownership_event(&event).is_changed() {
                        outcome.replayed += 1;
                    }
                }
            }
            // Everything received before the disconnect is older than this snapshot
            SnapshotKind::Resync => {
                if !deferred.is_empty() {
                    debug!(dropped = deferred.len(), "Dropping deferred events superseded by resync");
                }
            }
        }

        info!(
            generation,
            kind = ?kind,
            loaded = outcome.loaded,
            skipped = outcome.skipped,
            retained = outcome.retained,
            replayed = outcome.replayed,
            "Catalog snapshot applied"
        );
        Ok(outcome)
    }

    /// Abandon the outstanding snapshot request (fetch failed).
    pub fn abandon_snapshot(&mut self, generation: u64) -> Option<SnapshotKind> {
        if generation != self.generation {
            return None;
        }
        self.pending_kind.take()
    }

    /// Apply an ownership change to one card.
    pub fn apply_ownership_event(&mut self, event: &OwnershipChanged) -> Applied {
        if !event.status.is_available() && event.owner_id.is_none() {
            warn!(card_id = %event.card_id, status = event.status.as_str(), "Ownership event without owner");
            return Applied::Stale(StaleReason::Malformed);
        }

        if !self.loaded {
            self.defer(event.clone());
            return Applied::Deferred;
        }

        match self.cards.get_mut(&event.card_id) {
            Some(card) => update_card(card, event),
            None => self.insert_from_event(event),
        }
    }

    /// Replace one card with an authoritative record (e.g. a reservation response).
    pub fn replace_card(&mut self, mut card: Card) -> Result<(), CatalogError> {
        let existing = self
            .cards
            .get(&card.id)
            .ok_or_else(|| CatalogError::UnknownCard(card.id.clone()))?;
        card.version = match (existing.version, card.version) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.cards.insert(card.id.clone(), card);
        Ok(())
    }

    /// Ownership status of a card, if known.
    pub fn status_of(&self, card_id: &CardId) -> Option<CardStatus> {
        self.cards.get(card_id).map(|c| c.status)
    }

    fn insert_from_event(&mut self, event: &OwnershipChanged) -> Applied {
        let Some(numbers) = event.numbers else {
            debug!(card_id = %event.card_id, "Ownership event for unknown card, deferring");
            self.defer(event.clone());
            return Applied::Deferred;
        };

        let mut card = Card::new(event.card_id.clone(), numbers);
        card.set_ownership(event.status, event.owner_id.clone());
        card.version = event.seq;
        if let Err(err) = card.validate() {
            warn!(card_id = %card.id, error = %err, "Ownership event carries an invalid card");
            return Applied::Stale(StaleReason::Malformed);
        }
        info!(card_id = %card.id, "Card added from ownership event");
        self.cards.insert(card.id.clone(), card);
        Applied::Changed
    }

    /// Keep one deferred event per card, preferring the newer token.
    fn defer(&mut self, event: OwnershipChanged) {
        let newer = match self.deferred.get(&event.card_id) {
            Some(existing) => !matches!((existing.seq, event.seq), (Some(a), Some(b)) if b <= a),
            None => true,
        };
        if newer {
            self.deferred.insert(event.card_id.clone(), event);
        }
    }

    fn reject(&self, reason: &'static str) -> CatalogError {
        warn!(generation = self.generation, reason, "Rejected catalog snapshot");
        CatalogError::StaleSnapshot(reason)
    }
}

/// Both tokens present and `local` is strictly ahead.
fn is_newer(local: Option<u64>, incoming: Option<u64>) -> bool {
    matches!((local, incoming), (Some(local), Some(incoming)) if local > incoming)
}

/// Apply an ownership event to a known card.
fn update_card(card: &mut Card, event: &OwnershipChanged) -> Applied {
    if let (Some(seq), Some(version)) = (event.seq, card.version) {
        if seq <= version {
            debug!(card_id = %card.id, seq, version, "Out-of-order ownership event");
            return Applied::Stale(StaleReason::OutOfOrder);
        }
    }
    if event.seq.is_some() {
        card.version = event.seq;
    }

    let owner = if event.status.is_available() {
        None
    } else {
        event.owner_id.clone()
    };
    if card.status == event.status && card.owner_id == owner {
        return Applied::Unchanged;
    }

    card.set_ownership(event.status, owner);
    debug!(
        card_id = %card.id,
        status = card.status.as_str(),
        owner = ?card.owner_id,
        "Ownership updated"
    );
    Applied::Changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::card::{test_grid, UserId};
    use pretty_assertions::assert_eq;

    const OPEN: SnapshotGuard = SnapshotGuard {
        intent_pending: false,
        session_status: SessionStatus::Waiting,
    };

    fn card(id: &str) -> Card {
        Card::new(id, test_grid(0))
    }

    fn event(id: &str, status: CardStatus, owner: Option<&str>, seq: Option<u64>) -> OwnershipChanged {
        OwnershipChanged {
            card_id: CardId::from(id),
            status,
            owner_id: owner.map(UserId::from),
            seq,
            numbers: None,
        }
    }

    fn loaded(cards: Vec<Card>) -> CatalogReconciler {
        let mut catalog = CatalogReconciler::new();
        let generation = catalog.begin_snapshot(SnapshotKind::Initial);
        catalog.load_snapshot(generation, cards, OPEN).unwrap();
        catalog
    }

    fn assert_owner_invariant(catalog: &CatalogReconciler) {
        for card in catalog.cards() {
            assert_eq!(card.owner_id.is_none(), card.is_available(), "card {}", card.id);
        }
    }

    #[test]
    fn test_load_snapshot() {
        let catalog = loaded(vec![card("2"), card("10"), card("1")]);
        assert!(catalog.is_loaded());
        assert_eq!(catalog.len(), 3);
        let ids: Vec<&str> = catalog.cards().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "10"]);
    }

    #[test]
    fn test_invalid_cards_are_skipped() {
        let mut bad = card("9");
        bad.numbers[0][0] = 70;
        let mut catalog = CatalogReconciler::new();
        let generation = catalog.begin_snapshot(SnapshotKind::Initial);
        let outcome = catalog
            .load_snapshot(generation, vec![card("1"), bad], OPEN)
            .unwrap();
        assert_eq!(outcome.loaded, 1);
        assert_eq!(outcome.skipped, 1);
        assert!(catalog.get(&"9".into()).is_none());
    }

    #[test]
    fn test_initial_snapshot_guards() {
        let mut catalog = CatalogReconciler::new();
        let generation = catalog.begin_snapshot(SnapshotKind::Initial);

        let pending = SnapshotGuard {
            intent_pending: true,
            ..OPEN
        };
        assert!(matches!(
            catalog.load_snapshot(generation, vec![card("1")], pending),
            Err(CatalogError::StaleSnapshot(_))
        ));

        let active = SnapshotGuard {
            session_status: SessionStatus::Active,
            ..OPEN
        };
        assert!(matches!(
            catalog.load_snapshot(generation, vec![card("1")], active),
            Err(CatalogError::StaleSnapshot(_))
        ));
        assert!(!catalog.is_loaded());

        let stale = catalog
            .load_snapshot(generation + 1, vec![card("1")], OPEN)
            .unwrap_err();
        assert!(!stale.is_guard_rejection());
    }

    #[test]
    fn test_resync_ignores_session_guard() {
        let mut catalog = loaded(vec![card("1")]);
        let generation = catalog.begin_snapshot(SnapshotKind::Resync);
        let guard = SnapshotGuard {
            intent_pending: true,
            session_status: SessionStatus::Active,
        };
        let sold = card("1").with_owner(CardStatus::Sold, "bob".into());
        catalog.load_snapshot(generation, vec![sold], guard).unwrap();
        assert_eq!(catalog.status_of(&"1".into()), Some(CardStatus::Sold));
    }

    #[test]
    fn test_snapshot_keeps_newer_local_card() {
        let mut catalog = loaded(vec![card("1").with_version(3), card("2").with_version(3)]);
        let mine = card("1").with_owner(CardStatus::Sold, "me".into()).with_version(5);
        catalog.replace_card(mine).unwrap();

        let generation = catalog.begin_snapshot(SnapshotKind::Resync);
        let outcome = catalog
            .load_snapshot(
                generation,
                vec![
                    card("1").with_version(4),
                    card("2").with_owner(CardStatus::Reserved, "bob".into()).with_version(4),
                ],
                OPEN,
            )
            .unwrap();

        assert_eq!(outcome.retained, 1);
        let kept = catalog.get(&"1".into()).unwrap();
        assert_eq!(kept.status, CardStatus::Sold);
        assert_eq!(kept.owner_id, Some(UserId::from("me")));
        assert_eq!(kept.version, Some(5));
        assert_eq!(catalog.status_of(&"2".into()), Some(CardStatus::Reserved));
        assert_owner_invariant(&catalog);
    }

    #[test]
    fn test_only_latest_generation_loads() {
        let mut catalog = CatalogReconciler::new();
        let first = catalog.begin_snapshot(SnapshotKind::Initial);
        let second = catalog.begin_snapshot(SnapshotKind::Initial);

        assert!(matches!(
            catalog.load_snapshot(first, vec![card("1")], OPEN),
            Err(CatalogError::StaleSnapshot(_))
        ));
        catalog.load_snapshot(second, vec![card("2")], OPEN).unwrap();

        // Nothing outstanding any more
        assert!(matches!(
            catalog.load_snapshot(second, vec![card("3")], OPEN),
            Err(CatalogError::StaleSnapshot(_))
        ));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_events_before_snapshot_are_replayed() {
        let mut catalog = CatalogReconciler::new();
        let generation = catalog.begin_snapshot(SnapshotKind::Initial);

        let applied = catalog.apply_ownership_event(&event("1", CardStatus::Sold, Some("bob"), None));
        assert_eq!(applied, Applied::Deferred);

        let outcome = catalog
            .load_snapshot(generation, vec![card("1"), card("2")], OPEN)
            .unwrap();
        assert_eq!(outcome.replayed, 1);
        assert_eq!(catalog.get(&"1".into()).unwrap().owner_id, Some(UserId::from("bob")));
        assert_owner_invariant(&catalog);
    }

    #[test]
    fn test_early_event_older_than_snapshot_loses() {
        let mut catalog = CatalogReconciler::new();
        let generation = catalog.begin_snapshot(SnapshotKind::Initial);
        catalog.apply_ownership_event(&event("1", CardStatus::Reserved, Some("bob"), Some(4)));

        let sold = card("1").with_owner(CardStatus::Sold, "carol".into()).with_version(7);
        let outcome = catalog.load_snapshot(generation, vec![sold], OPEN).unwrap();

        assert_eq!(outcome.replayed, 0);
        let card = catalog.get(&"1".into()).unwrap();
        assert_eq!(card.status, CardStatus::Sold);
        assert_eq!(card.owner_id, Some(UserId::from("carol")));
    }

    #[test]
    fn test_sequence_tokens_order_events() {
        let mut catalog = loaded(vec![card("1")]);

        assert_eq!(
            catalog.apply_ownership_event(&event("1", CardStatus::Sold, Some("bob"), Some(5))),
            Applied::Changed
        );
        // Older event delivered late
        assert_eq!(
            catalog.apply_ownership_event(&event("1", CardStatus::Available, None, Some(3))),
            Applied::Stale(StaleReason::OutOfOrder)
        );
        assert_eq!(catalog.status_of(&"1".into()), Some(CardStatus::Sold));

        assert_eq!(
            catalog.apply_ownership_event(&event("1", CardStatus::Available, None, Some(6))),
            Applied::Changed
        );
        assert_eq!(catalog.status_of(&"1".into()), Some(CardStatus::Available));
        assert_owner_invariant(&catalog);
    }

    #[test]
    fn test_last_received_wins_without_tokens() {
        let mut catalog = loaded(vec![card("1")]);
        catalog.apply_ownership_event(&event("1", CardStatus::Sold, Some("bob"), None));
        catalog.apply_ownership_event(&event("1", CardStatus::Reserved, Some("carol"), None));

        let card = catalog.get(&"1".into()).unwrap();
        assert_eq!(card.status, CardStatus::Reserved);
        assert_eq!(card.owner_id, Some(UserId::from("carol")));

        assert_eq!(
            catalog.apply_ownership_event(&event("1", CardStatus::Reserved, Some("carol"), None)),
            Applied::Unchanged
        );
    }

    #[test]
    fn test_owner_invariant_is_normalised() {
        let mut catalog = loaded(vec![card("1")]);

        // Available with an owner drops the owner
        catalog.apply_ownership_event(&event("1", CardStatus::Sold, Some("bob"), None));
        catalog.apply_ownership_event(&event("1", CardStatus::Available, Some("bob"), None));
        assert_eq!(catalog.get(&"1".into()).unwrap().owner_id, None);

        // Taken without an owner is rejected
        assert_eq!(
            catalog.apply_ownership_event(&event("1", CardStatus::Sold, None, None)),
            Applied::Stale(StaleReason::Malformed)
        );
        assert_owner_invariant(&catalog);
    }

    #[test]
    fn test_unknown_card_with_grid_is_inserted() {
        let mut catalog = loaded(vec![card("1")]);
        let mut ev = event("5", CardStatus::Sold, Some("bob"), Some(1));
        ev.numbers = Some(test_grid(1));

        assert_eq!(catalog.apply_ownership_event(&ev), Applied::Changed);
        assert_eq!(catalog.len(), 2);

        let bare = event("6", CardStatus::Sold, Some("bob"), None);
        assert_eq!(catalog.apply_ownership_event(&bare), Applied::Deferred);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_replace_card_keeps_newest_version() {
        let mut catalog = loaded(vec![card("1").with_version(8)]);
        let sold = card("1").with_owner(CardStatus::Sold, "me".into()).with_version(2);
        catalog.replace_card(sold).unwrap();

        let card = catalog.get(&"1".into()).unwrap();
        assert_eq!(card.status, CardStatus::Sold);
        assert_eq!(card.version, Some(8));

        assert_eq!(
            catalog.replace_card(Card::new("99", test_grid(0))),
            Err(CatalogError::UnknownCard("99".into()))
        );
    }

    #[test]
    fn test_abandon_snapshot() {
        let mut catalog = CatalogReconciler::new();
        let generation = catalog.begin_snapshot(SnapshotKind::Initial);
        assert_eq!(catalog.abandon_snapshot(generation + 1), None);
        assert_eq!(catalog.abandon_snapshot(generation), Some(SnapshotKind::Initial));
        assert_eq!(catalog.pending_snapshot(), None);
    }
}
