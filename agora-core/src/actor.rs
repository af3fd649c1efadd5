//! The identity attempting an operation.
//!
//! An actor is either authenticated by a public key, or a guest identified
//! only by a display name. Guest names are not backed by any credential:
//! two guests choosing the same name are indistinguishable here.

use serde::{Deserialize, Serialize};

use crate::record::{Record, UserType};

/// Identity placed on written records when nothing else is known.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Actor {
    pub is_authenticated: bool,
    #[serde(rename = "pub")]
    pub pub_key: Option<String>,
    pub guest_name: Option<String>,
}

impl Actor {
    pub fn authenticated(pub_key: impl Into<String>) -> Self {
        Self {
            is_authenticated: true,
            pub_key: Some(pub_key.into()),
            guest_name: None,
        }
    }

    pub fn guest(name: impl Into<String>) -> Self {
        Self {
            is_authenticated: false,
            pub_key: None,
            guest_name: Some(name.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_guest_name(mut self, name: impl Into<String>) -> Self {
        self.guest_name = Some(name.into());
        self
    }

    /// Public key, ignoring empty strings.
    pub fn pub_key(&self) -> Option<&str> {
        self.pub_key.as_deref().filter(|s| !s.is_empty())
    }

    /// Guest name, ignoring empty strings.
    pub fn guest_name(&self) -> Option<&str> {
        self.guest_name.as_deref().filter(|s| !s.is_empty())
    }

    /// `pub ?? guestName`
    pub fn identity(&self) -> Option<&str> {
        self.pub_key().or_else(|| self.guest_name())
    }

    /// `pub ?? guestName ?? "anonymous"`
    pub fn display_identity(&self) -> &str {
        self.identity().unwrap_or(ANONYMOUS)
    }

    pub fn user_type(&self) -> UserType {
        if self.is_authenticated {
            UserType::Shogun
        } else {
            UserType::Guest
        }
    }

    /// Whether this actor may remove `record`.
    ///
    /// A record carrying a `userPub` belongs to that key alone. Only records
    /// without one can be claimed by a guest whose name matches `user`.
    pub fn owns(&self, record: &Record) -> bool {
        let by_key = matches!(
            (self.pub_key(), record.user_pub()),
            (Some(mine), Some(theirs)) if mine == theirs
        );
        let by_guest_name = match self.guest_name() {
            Some(name) => record.user_pub().is_none() && record.user() == Some(name),
            None => false,
        };
        by_key || by_guest_name
    }
}
