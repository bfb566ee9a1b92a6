//! Inbound social events and the contact they come from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Platform;

/// An event delivered by the platform-integration layer: a comment, DM,
/// mention or hashtag use on a connected account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct SocialEvent {
    /// Identifier assigned by the integration layer, or a random UUID.
    #[serde(default = "new_event_id")]
    pub event_id: String,
    pub platform: Platform,
    /// Connected account that received the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub platform_user_id: String,
    #[serde(default)]
    pub platform_username: String,
    #[serde(default)]
    pub content: String,
    pub received_at: DateTime<Utc>,
}

fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl SocialEvent {
    pub fn new(
        platform: Platform,
        platform_user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            event_id: new_event_id(),
            platform,
            account_id: None,
            platform_user_id: platform_user_id.into(),
            platform_username: String::new(),
            content: content.into(),
            received_at: Utc::now(),
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.platform_username = username.into();
        self
    }

    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// The contact the flow's actions are addressed to.
    pub fn recipient(&self) -> Recipient {
        Recipient {
            platform: self.platform,
            platform_user_id: self.platform_user_id.clone(),
            platform_username: self.platform_username.clone(),
        }
    }

    /// Username when the platform supplied one, otherwise the user id.
    pub fn display_name(&self) -> &str {
        if self.platform_username.trim().is_empty() {
            &self.platform_user_id
        } else {
            &self.platform_username
        }
    }
}

/// A social-media contact addressed by an action adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub struct Recipient {
    pub platform: Platform,
    pub platform_user_id: String,
    #[serde(default)]
    pub platform_username: String,
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.platform, self.platform_user_id)
    }
}
