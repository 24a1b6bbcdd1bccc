//! Client state for a live bingo table.
//!
//! - `card` - Cards, ids and grid validation
//! - `user` - Local identity
//! - `events` - Push topics, payloads and apply outcomes
//! - `catalog` - Card table reconciled from snapshots and ownership events
//! - `reservation` - Optimistic reservation intents
//! - `session` - Game session state machine and draws
//! - `claim` - Win claims
//! - `countdown` - Board selection countdown
//! - `transport` - Push link: topics, outbox, reconnect backoff
//! - `engine` - Root component composing all of the above
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             SyncEngine                               │
//! │                                                                      │
//! │  push ──▶ TransportLink ──▶ inbox ──┬──▶ CatalogReconciler           │
//! │                                     │      card_id → Card            │
//! │           (held back while a        │      deferred events           │
//! │            resync is outstanding)   │      snapshot generation       │
//! │                                     ├──▶ GameStateMachine            │
//! │                                     │      Waiting ▶ Active ▶ Finished
//! │                                     └──▶ ClaimSubmitter              │
//! │                                                                      │
//! │  reserve() ──▶ ReservationCoordinator ── optimistic mark ──┐         │
//! │                                                            ▼         │
//! │                                  catalog + overlay ──▶ SyncView      │
//! │                                                                      │
//! │  Outbound queue ──▶ host (REST calls) ──▶ complete_*/load_snapshot   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use bingo_sync::state::{Outbound, SyncEngine};
//!
//! let mut engine = SyncEngine::new(config, identity)?;
//! engine.start();
//! for request in engine.drain_outbound() {
//!     match request {
//!         Outbound::FetchCatalog { generation, .. } => {
//!             let cards = http_get_catalog()?;
//!             engine.load_snapshot(generation, cards)?;
//!         }
//!         _ => {}
//!     }
//! }
//! engine.receive("number.drawn", &payload)?;
//! ```

pub mod card;
pub mod catalog;
pub mod claim;
pub mod countdown;
pub mod engine;
pub mod events;
pub mod reservation;
pub mod session;
pub mod transport;
pub mod user;

pub use card::{Card, CardError, CardId, CardStatus, Grid, UserId, FREE_CELL, GRID_SIZE, MAX_NUMBER};
pub use catalog::{CatalogError, CatalogReconciler, SnapshotGuard, SnapshotKind, SnapshotOutcome};
pub use claim::{ClaimError, ClaimId, ClaimOutcome, ClaimResponse, ClaimState, ClaimSubmitter};
pub use countdown::{Phase, SelectionCountdown};
pub use engine::{Outbound, SyncEngine, SyncView};
pub use events::{topics, Applied, PushEvent, StaleReason};
pub use reservation::{
    FailureReason, IntentId, LocalReservationIntent, ReservationCoordinator, ReservationError,
    ReservationResponse, Resolution,
};
pub use session::{GameSession, GameStateMachine, SessionError, SessionEvent, SessionId, SessionStatus};
pub use transport::{LinkStatus, OutgoingMessage, TransportError, TransportLink};
pub use user::{Identity, User};
