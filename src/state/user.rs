//! Local user identity.
//!
//! The identity provider is an opaque bootstrap: it yields a user id and
//! display name once at startup, or nothing for anonymous play.

use serde::{Deserialize, Serialize};

use super::card::UserId;

/// Label shown for anonymous players.
pub const GUEST_LABEL: &str = "Guest";

/// Output of the identity bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, display_name: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name,
        }
    }
}

/// The local session's user. Fixed for the lifetime of the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Option<UserId>,
    pub display_name: Option<String>,
}

impl User {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_none()
    }

    /// Display name, falling back to the id, then to "Guest".
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| self.id.as_ref().map(|id| id.as_str()))
            .unwrap_or(GUEST_LABEL)
    }
}

impl From<Option<Identity>> for User {
    fn from(identity: Option<Identity>) -> Self {
        match identity {
            Some(identity) => Self {
                id: Some(identity.user_id),
                display_name: identity.display_name,
            },
            None => Self::anonymous(),
        }
    }
}
