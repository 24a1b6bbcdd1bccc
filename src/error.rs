//! Crate-level error type.

use thiserror::Error;

use crate::config::ConfigError;
use crate::state::{CardError, CatalogError, ClaimError, ReservationError, SessionError, TransportError};

pub type Result<T> = std::result::Result<T, SyncError>;

/// Any error surfaced by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Card(#[from] CardError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SyncError {
    /// Whether repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Reservation(err) => err.is_retryable(),
            Self::Claim(err) => err.is_retryable(),
            Self::Transport(TransportError::NotConnected) => true,
            _ => false,
        }
    }
}
