//! The sync engine.
//!
//! Owns every component and is the only writer of the merged card table and
//! session. Each public mutation ends by rebuilding [`SyncView`], so readers
//! always see one consistent snapshot.
//!
//! Network effects are not performed here. They are queued as [`Outbound`]
//! requests for the host to carry out; results come back through the
//! `complete_*` / `load_snapshot` calls, keyed by the id minted at request
//! time.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::card::{Card, CardId, UserId, GRID_SIZE};
use super::catalog::{CatalogError, CatalogReconciler, SnapshotGuard, SnapshotKind, SnapshotOutcome};
use super::claim::{ClaimError, ClaimId, ClaimOutcome, ClaimResponse, ClaimState, ClaimSubmitter};
use super::countdown::{Phase, SelectionCountdown};
use super::events::{topics, Applied, PushEvent};
use super::reservation::{
    IntentId, ReservationCoordinator, ReservationError, ReservationResponse, Resolution,
    OPTIMISTIC_STATUS,
};
use super::session::{GameSession, GameStateMachine, SessionEvent, SessionStatus};
use super::transport::{OutgoingMessage, TransportError, TransportLink};
use super::user::{Identity, User};
use crate::config::{ConfigError, SyncConfig};

/// Catalog page requested on every fetch.
const FIRST_PAGE: u32 = 1;

/// A request for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Fire-and-forget identity registration
    RegisterSession {
        user_id: UserId,
        display_name: Option<String>,
    },
    /// `GET catalog(page, limit)`; answer with `load_snapshot(generation, ..)`
    FetchCatalog { generation: u64, page: u32, limit: u32 },
    /// `POST reserve(cardId)`; answer with `complete_reservation(intent_id, ..)`
    Reserve { intent_id: IntentId, card_id: CardId },
    /// `POST submitClaim(cardId)`; answer with `complete_claim(claim_id, ..)`
    SubmitClaim { claim_id: ClaimId, card_id: CardId },
    /// Re-register a topic with the server after reconnecting
    Subscribe { topic: String },
}

/// Read model for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncView {
    /// Merged cards, ordered by id, including the optimistic mark
    pub cards: Vec<Card>,
    /// Board held by the local user
    pub selected_card: Option<Card>,
    pub session: GameSession,
    pub user: User,
    /// Card of the reservation awaiting a response
    pub pending_reservation: Option<CardId>,
    pub claim: ClaimState,
    pub phase: Phase,
    pub countdown_secs: u32,
    pub connection: &'static str,
}

impl SyncView {
    pub fn card(&self, card_id: &CardId) -> Option<&Card> {
        self.cards.iter().find(|c| &c.id == card_id)
    }

    /// Matched cells of the selected board.
    pub fn marked_cells(&self) -> Option<[[bool; GRID_SIZE]; GRID_SIZE]> {
        self.selected_card
            .as_ref()
            .map(|card| card.marked(&self.session.numbers_drawn))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Composes catalog, reservations, session, claims and the push link.
#[derive(Debug)]
pub struct SyncEngine {
    config: SyncConfig,
    user: User,
    catalog: CatalogReconciler,
    reservations: ReservationCoordinator,
    session: GameStateMachine,
    claims: ClaimSubmitter,
    link: TransportLink,
    countdown: SelectionCountdown,

    /// Decoded events written by the link's topic handlers
    inbox: Rc<RefCell<VecDeque<PushEvent>>>,

    /// Events held back while a resync snapshot is outstanding
    held_back: VecDeque<PushEvent>,

    /// Requests waiting for the host
    outbound: Vec<Outbound>,

    view: SyncView,
}

impl SyncEngine {
    /// Build an engine. Fails if `config` does not validate.
    pub fn new(config: SyncConfig, identity: Option<Identity>) -> Result<Self, ConfigError> {
        config.validate()?;
        let user = User::from(identity);
        let inbox = Rc::new(RefCell::new(VecDeque::new()));

        let mut link =
            TransportLink::new(config.max_reconnect_attempts, config.reconnect_base_delay());
        for topic in topics::CONSUMED {
            let sink = Rc::clone(&inbox);
            link.subscribe(
                topic,
                Box::new(move |payload: &serde_json::Value| {
                    match PushEvent::decode(topic, payload) {
                        Ok(event) => sink.borrow_mut().push_back(event),
                        Err(err) => warn!(topic, error = %err, "Dropping undecodable push event"),
                    }
                }),
            );
        }

        let reservations = ReservationCoordinator::new(user.id.clone(), config.reservation_timeout());
        let countdown = SelectionCountdown::new(config.selection_window_secs);

        let mut engine = Self {
            config,
            user,
            catalog: CatalogReconciler::new(),
            reservations,
            session: GameStateMachine::new(),
            claims: ClaimSubmitter::new(),
            link,
            countdown,
            inbox,
            held_back: VecDeque::new(),
            outbound: Vec::new(),
            view: SyncView {
                cards: Vec::new(),
                selected_card: None,
                session: GameSession::default(),
                user: User::anonymous(),
                pending_reservation: None,
                claim: ClaimState::Idle,
                phase: Phase::Picking,
                countdown_secs: 0,
                connection: "connected",
            },
        };
        engine.refresh();
        Ok(engine)
    }

    /// Build from `BINGO_*` environment configuration.
    pub fn from_env(identity: Option<Identity>) -> crate::Result<Self> {
        let config = SyncConfig::from_env()?;
        Ok(Self::new(config, identity)?)
    }

    /// Queue session registration (when identified) and the initial catalog fetch.
    pub fn start(&mut self) -> u64 {
        if let Some(user_id) = &self.user.id {
            info!(user = self.user.label(), "Registering session");
            self.outbound.push(Outbound::RegisterSession {
                user_id: user_id.clone(),
                display_name: self.user.display_name.clone(),
            });
        }
        let generation = self.request_snapshot();
        self.refresh();
        generation
    }

    pub fn view(&self) -> &SyncView {
        &self.view
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn catalog(&self) -> &CatalogReconciler {
        &self.catalog
    }

    pub fn reservations(&self) -> &ReservationCoordinator {
        &self.reservations
    }

    pub fn session(&self) -> &GameSession {
        self.session.session()
    }

    pub fn link(&self) -> &TransportLink {
        &self.link
    }

    /// The push link, for hosts that add their own topic handlers.
    pub fn link_mut(&mut self) -> &mut TransportLink {
        &mut self.link
    }

    /// Take the requests queued for the host.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    /// Take the events emitted on the push link.
    pub fn drain_emitted(&mut self) -> Vec<OutgoingMessage> {
        self.link.drain_outbox()
    }

    // ---------------------------------------------------------------------
    // Catalog
    // ---------------------------------------------------------------------

    /// Queue a catalog fetch. Returns its generation.
    pub fn request_snapshot(&mut self) -> u64 {
        let generation = self.catalog.begin_snapshot(SnapshotKind::Initial);
        self.push_fetch(generation);
        generation
    }

    /// Apply the catalog fetched for `generation`.
    pub fn load_snapshot(
        &mut self,
        generation: u64,
        cards: Vec<Card>,
    ) -> Result<SnapshotOutcome, CatalogError> {
        let resync = matches!(
            self.catalog.pending_snapshot(),
            Some((pending, SnapshotKind::Resync)) if pending == generation
        );
        let guard = SnapshotGuard {
            intent_pending: self.reservations.has_pending(),
            session_status: self.session.status(),
        };

        let outcome = match self.catalog.load_snapshot(generation, cards, guard) {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.is_guard_rejection() && !self.catalog.is_loaded() {
                    // Nothing to protect yet: fetch again as a resync so live
                    // events are held back and replayed on top
                    info!("Initial catalog arrived after the game moved on, resyncing");
                    self.begin_resync();
                }
                self.refresh();
                return Err(err);
            }
        };

        self.reconcile_selection();
        if resync {
            self.release_held_back();
        }
        self.refresh();
        Ok(outcome)
    }

    /// The fetch for `generation` failed.
    pub fn snapshot_failed(&mut self, generation: u64) {
        match self.catalog.abandon_snapshot(generation) {
            Some(SnapshotKind::Resync) => {
                warn!(generation, "Resync fetch failed, retrying");
                self.begin_resync();
            }
            Some(SnapshotKind::Initial) => {
                warn!(generation, "Catalog fetch failed");
            }
            None => debug!(generation, "Ignoring failure of a superseded fetch"),
        }
        self.refresh();
    }

    // ---------------------------------------------------------------------
    // Reservation
    // ---------------------------------------------------------------------

    /// Reserve a card. No request is queued unless the card is available.
    pub fn reserve(&mut self, card_id: impl Into<CardId>) -> Result<IntentId, ReservationError> {
        let card_id = card_id.into();
        let intent_id = self
            .reservations
            .reserve(&card_id, self.catalog.get(&card_id))?;
        self.outbound.push(Outbound::Reserve {
            intent_id,
            card_id,
        });
        self.refresh();
        Ok(intent_id)
    }

    /// Apply the server's answer to a reservation request.
    pub fn complete_reservation(
        &mut self,
        intent_id: IntentId,
        response: ReservationResponse,
    ) -> Result<(), ReservationError> {
        let result = match self.reservations.complete(intent_id, response) {
            Ok(Resolution::Confirmed(card)) => {
                let card_id = card.id.clone();
                if let Err(err) = self.catalog.replace_card(card) {
                    warn!(card_id = %card_id, error = %err, "Confirmed card missing from catalog");
                    self.reservations.on_card_missing(&card_id);
                }
                Ok(())
            }
            Ok(Resolution::Discarded(_)) => Ok(()),
            Err(err) if self.adopt_after_rollback(&err) => Ok(()),
            Err(err) => Err(err),
        };
        self.refresh();
        result
    }

    /// Advance timers by one second: countdown and reservation deadline.
    pub fn tick(&mut self) -> Option<ReservationError> {
        self.countdown.tick();
        let expired = self.reservations.expire_stale();
        let adopted = expired
            .as_ref()
            .is_some_and(|err| self.adopt_after_rollback(err));
        self.refresh();
        if adopted {
            None
        } else {
            expired
        }
    }

    // ---------------------------------------------------------------------
    // Claims
    // ---------------------------------------------------------------------

    /// Claim a win for the held board.
    pub fn submit_claim(&mut self) -> Result<ClaimId, ClaimError> {
        let held = self.selected_card_id();
        let (claim_id, card_id) = self.claims.submit(held.as_ref(), self.session.status())?;

        let notice = serde_json::json!({ "cardId": card_id });
        if let Err(err) = self.link.emit(topics::CLAIM_SUBMITTED, notice) {
            warn!(card_id = %card_id, error = %err, "Could not announce claim");
        }
        self.outbound.push(Outbound::SubmitClaim { claim_id, card_id });
        self.refresh();
        Ok(claim_id)
    }

    /// Apply the claim endpoint's ruling. `Err` is a transport failure.
    pub fn complete_claim(
        &mut self,
        claim_id: ClaimId,
        response: Result<ClaimResponse, String>,
    ) -> Result<Option<ClaimOutcome>, ClaimError> {
        let result = self.claims.complete(claim_id, response);
        self.refresh();
        result
    }

    // ---------------------------------------------------------------------
    // Push connection
    // ---------------------------------------------------------------------

    /// Handle a message received on the push connection.
    pub fn receive(
        &mut self,
        topic: &str,
        payload: &serde_json::Value,
    ) -> Result<usize, TransportError> {
        let handled = self.link.deliver(topic, payload)?;
        let events: Vec<PushEvent> = self.inbox.borrow_mut().drain(..).collect();
        for event in events {
            if self.resync_outstanding() {
                debug!(topic = event.topic(), "Holding event until resync completes");
                self.held_back.push_back(event);
            } else {
                self.apply_event(event);
            }
        }
        self.refresh();
        Ok(handled)
    }

    pub fn disconnected(&mut self) {
        self.link.disconnect();
        self.refresh();
    }

    /// A reconnect attempt failed. Returns the delay before the next one.
    pub fn reconnect_failed(&mut self) -> Result<Duration, TransportError> {
        let result = self.link.record_failed_attempt();
        self.refresh();
        result
    }

    /// The connection is back. Queues the resync fetch, then re-subscription.
    /// Returns the resync generation, or `None` if already connected.
    pub fn reconnected(&mut self) -> Result<Option<u64>, TransportError> {
        if self.link.is_connected() {
            return Ok(None);
        }
        let topics = self.link.reconnect()?;
        let generation = self.begin_resync();
        self.outbound
            .extend(topics.into_iter().map(|topic| Outbound::Subscribe { topic }));
        self.refresh();
        Ok(Some(generation))
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn apply_event(&mut self, event: PushEvent) -> Applied {
        let topic = event.topic();
        let applied = match event {
            PushEvent::OwnershipChanged(change) => {
                let applied = self.catalog.apply_ownership_event(&change);
                if applied.is_changed() {
                    if let Some(card) = self.catalog.get(&change.card_id) {
                        self.reservations.on_card_changed(card);
                    }
                }
                applied
            }
            PushEvent::SessionStarted(started) => self.session.apply(SessionEvent::Started {
                session_id: started.session_id,
                numbers_drawn: started.numbers_drawn,
                players_count: started.players_count,
            }),
            PushEvent::SessionEnded(ended) => self.session.apply(SessionEvent::Ended {
                session_id: ended.session_id,
            }),
            PushEvent::NumberDrawn(drawn) => self.session.apply(SessionEvent::Drawn {
                session_id: drawn.session_id,
                number: drawn.number,
            }),
            PushEvent::ClaimResult(result) => self.claims.confirm_from_push(&result),
        };
        if let Applied::Stale(reason) = applied {
            debug!(topic, reason = reason.as_str(), "Discarded stale event");
        }
        applied
    }

    fn resync_outstanding(&self) -> bool {
        matches!(self.catalog.pending_snapshot(), Some((_, SnapshotKind::Resync)))
    }

    fn begin_resync(&mut self) -> u64 {
        let generation = self.catalog.begin_snapshot(SnapshotKind::Resync);
        self.push_fetch(generation);
        generation
    }

    fn push_fetch(&mut self, generation: u64) {
        self.outbound.push(Outbound::FetchCatalog {
            generation,
            page: FIRST_PAGE,
            limit: self.config.catalog_page_limit,
        });
    }

    /// A rolled-back card the catalog already shows as ours becomes the held board.
    fn adopt_after_rollback(&mut self, err: &ReservationError) -> bool {
        match err.card_id().and_then(|id| self.catalog.get(id)) {
            Some(card) => self.reservations.adopt_if_owned(card),
            None => false,
        }
    }

    fn release_held_back(&mut self) {
        if !self.held_back.is_empty() {
            debug!(count = self.held_back.len(), "Replaying events held during resync");
        }
        while let Some(event) = self.held_back.pop_front() {
            self.apply_event(event);
        }
    }

    /// Re-check the pending intent and held board against the catalog.
    fn reconcile_selection(&mut self) {
        let tracked: Vec<CardId> = self
            .reservations
            .intent()
            .map(|i| i.card_id.clone())
            .into_iter()
            .chain(self.reservations.held().cloned())
            .collect();
        for card_id in tracked {
            match self.catalog.get(&card_id) {
                Some(card) => self.reservations.on_card_changed(card),
                None => self.reservations.on_card_missing(&card_id),
            };
        }
    }

    /// Held board, only while the catalog still shows the local user as owner.
    fn selected_card_id(&self) -> Option<CardId> {
        let user = self.user.id.as_ref()?;
        self.reservations
            .held()
            .filter(|id| self.catalog.get(id).is_some_and(|c| c.is_owned_by(user)))
            .cloned()
    }

    fn refresh(&mut self) {
        self.view = self.build_view();
    }

    fn build_view(&self) -> SyncView {
        let mark = self.reservations.optimistic_mark();
        let cards = self
            .catalog
            .cards()
            .map(|card| {
                let mut card = card.clone();
                if let Some((card_id, user)) = mark {
                    if *card_id == card.id && card.is_available() {
                        card.set_ownership(OPTIMISTIC_STATUS, Some(user.clone()));
                    }
                }
                card
            })
            .collect();
        let selected_card = self
            .selected_card_id()
            .and_then(|id| self.catalog.get(&id).cloned());

        SyncView {
            cards,
            selected_card,
            session: self.session.session().clone(),
            user: self.user.clone(),
            pending_reservation: self.reservations.intent().map(|i| i.card_id.clone()),
            claim: self.claims.state().clone(),
            phase: self.countdown.phase(self.session.is_active()),
            countdown_secs: self.countdown.remaining(),
            connection: self.link.status().as_str(),
        }
    }

    /// Session status, for hosts gating UI on it.
    pub fn session_status(&self) -> SessionStatus {
        self.session.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::card::{test_grid, CardStatus};
    use crate::state::reservation::FailureReason;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> SyncEngine {
        SyncEngine::new(
            SyncConfig::default(),
            Some(Identity::new("me", Some("Me".to_string()))),
        )
        .unwrap()
    }

    fn loaded(cards: Vec<Card>) -> SyncEngine {
        let mut engine = engine();
        let generation = engine.start();
        engine.load_snapshot(generation, cards).unwrap();
        engine.drain_outbound();
        engine
    }

    #[test]
    fn test_start_queues_registration_then_fetch() {
        let mut engine = engine();
        let generation = engine.start();
        assert_eq!(
            engine.drain_outbound(),
            vec![
                Outbound::RegisterSession {
                    user_id: "me".into(),
                    display_name: Some("Me".to_string()),
                },
                Outbound::FetchCatalog {
                    generation,
                    page: 1,
                    limit: 100
                },
            ]
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SyncConfig {
            catalog_page_limit: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(
            SyncEngine::new(config, None),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_anonymous_start_skips_registration() {
        let mut engine = SyncEngine::new(SyncConfig::default(), None).unwrap();
        engine.start();
        let outbound = engine.drain_outbound();
        assert_eq!(outbound.len(), 1);
        assert!(matches!(outbound[0], Outbound::FetchCatalog { .. }));
        assert_eq!(engine.view().user.label(), "Guest");
    }

    #[test]
    fn test_optimistic_mark_and_rollback() {
        let mut engine = loaded(vec![Card::new("1", test_grid(0))]);

        let intent = engine.reserve("1").unwrap();
        let card = engine.view().card(&"1".into()).unwrap();
        assert_eq!(card.status, CardStatus::Reserved);
        assert_eq!(card.owner_id, Some("me".into()));
        assert_eq!(engine.view().pending_reservation, Some("1".into()));
        assert!(engine.view().selected_card.is_none());

        let err = engine
            .complete_reservation(
                intent,
                ReservationResponse::Failed(FailureReason::Server("boom".into())),
            )
            .unwrap_err();
        assert!(err.is_retryable());
        let card = engine.view().card(&"1".into()).unwrap();
        assert_eq!(card.status, CardStatus::Available);
        assert_eq!(card.owner_id, None);
    }

    #[test]
    fn test_undecodable_payload_is_dropped() {
        let mut engine = loaded(vec![Card::new("1", test_grid(0))]);
        let before = engine.view().clone();
        assert_eq!(
            engine.receive(topics::NUMBER_DRAWN, &json!({"oops": true})),
            Ok(1)
        );
        assert_eq!(*engine.view(), before);
    }

    #[test]
    fn test_claim_emits_notice() {
        let mut engine = loaded(vec![Card::new("1", test_grid(0))]);
        let intent = engine.reserve("1").unwrap();
        let granted = Card::new("1", test_grid(0)).with_owner(CardStatus::Sold, "me".into());
        engine
            .complete_reservation(intent, ReservationResponse::Granted(granted))
            .unwrap();
        engine
            .receive(topics::SESSION_STARTED, &json!({"sessionId": "S1"}))
            .unwrap();
        engine.drain_outbound();

        let claim_id = engine.submit_claim().unwrap();
        assert_eq!(
            engine.drain_outbound(),
            vec![Outbound::SubmitClaim {
                claim_id,
                card_id: "1".into()
            }]
        );
        let emitted = engine.drain_emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].topic, topics::CLAIM_SUBMITTED);
        assert_eq!(emitted[0].payload, json!({"cardId": "1"}));
        assert!(engine.view().claim.is_pending());
    }

    #[test]
    fn test_view_json_shape() {
        let engine = loaded(vec![Card::new("1", test_grid(0))]);
        let json = engine.view().to_json();
        assert_eq!(json["session"]["status"], "waiting");
        assert_eq!(json["cards"][0]["status"], "available");
        assert_eq!(json["phase"], "picking");
        assert_eq!(json["countdownSecs"], 30);
        assert_eq!(json["claim"]["status"], "idle");
        assert_eq!(json["connection"], "connected");
    }
}
