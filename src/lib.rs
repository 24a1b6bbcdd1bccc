//! Bingo Sync Library
//!
//! Client-side state for a live bingo game: the card catalog, board
//! reservations, the drawn-number session and win claims, kept consistent
//! while REST responses and push events arrive in any order.
//!
//! # Overview
//!
//! - **Catalog reconciliation** - One authoritative card table fed by
//!   snapshots and `ownership.changed` events, ordered by per-card tokens.
//!
//! - **Optimistic reservations** - A selected card shows as reserved at once
//!   and rolls back if the server refuses.
//!
//! - **Session state machine** - Waiting, Active, Finished, with append-only
//!   draws and stale-event rejection.
//!
//! - **Claims** - One claim per action; the server's ruling is final.
//!
//! # Design Principles
//!
//! 1. **Single writer** - Only [`SyncEngine`] mutates state; every public call
//!    ends with a fresh [`SyncView`].
//!
//! 2. **No networking** - HTTP and socket I/O belong to the host. The engine
//!    queues [`Outbound`] requests and takes results back by id.
//!
//! 3. **Stale input is an outcome, not an error** - Late or duplicated events
//!    report [`Applied::Stale`] and change nothing.
//!
//! 4. **Serialization-ready** - The view converts to JSON for any front end.
//!
//! # Example
//!
//! ```rust
//! use bingo_sync::{Card, CardStatus, Identity, Outbound, ReservationResponse, SyncConfig, SyncEngine};
//!
//! let mut grid = [[0u8; 5]; 5];
//! for row in 0..5 {
//!     for col in 0..5 {
//!         grid[row][col] = (col * 15 + row + 1) as u8;
//!     }
//! }
//! grid[2][2] = 0;
//!
//! let mut engine =
//!     SyncEngine::new(SyncConfig::default(), Some(Identity::new("alice", None))).unwrap();
//! engine.start();
//!
//! let generation = engine
//!     .drain_outbound()
//!     .into_iter()
//!     .find_map(|request| match request {
//!         Outbound::FetchCatalog { generation, .. } => Some(generation),
//!         _ => None,
//!     })
//!     .unwrap();
//! engine.load_snapshot(generation, vec![Card::new("1", grid)]).unwrap();
//!
//! let intent = engine.reserve("1").unwrap();
//! assert_eq!(engine.view().cards[0].status, CardStatus::Reserved);
//!
//! let granted = Card::new("1", grid).with_owner(CardStatus::Sold, "alice".into());
//! engine.complete_reservation(intent, ReservationResponse::Granted(granted)).unwrap();
//! assert!(engine.view().selected_card.is_some());
//! ```

pub mod config;
pub mod error;
pub mod state;

pub use config::{ConfigError, SyncConfig};
pub use error::{Result, SyncError};

// Re-export everything from state module at crate root
pub use state::*;
