//! Board selection countdown.
//!
//! Players pick a board while the countdown runs; afterwards the client
//! shows the held board. Advisory only: reservations and claims follow the
//! session state, not the countdown.

use serde::Serialize;

/// Default length of the selection window in seconds.
pub const DEFAULT_SELECTION_WINDOW_SECS: u32 = 30;

/// What the presentation layer should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Board picker
    Picking,
    /// Held board and draws
    Playing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionCountdown {
    initial: u32,
    remaining: u32,
}

impl Default for SelectionCountdown {
    fn default() -> Self {
        Self::new(DEFAULT_SELECTION_WINDOW_SECS)
    }
}

impl SelectionCountdown {
    pub fn new(seconds: u32) -> Self {
        Self {
            initial: seconds,
            remaining: seconds,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_expired(&self) -> bool {
        self.remaining == 0
    }

    /// One second elapsed. Returns the seconds left.
    pub fn tick(&mut self) -> u32 {
        self.remaining = self.remaining.saturating_sub(1);
        self.remaining
    }

    pub fn reset(&mut self) {
        self.remaining = self.initial;
    }

    /// Phase given whether a session is running.
    pub fn phase(&self, session_active: bool) -> Phase {
        if session_active || self.is_expired() {
            Phase::Playing
        } else {
            Phase::Picking
        }
    }
}
