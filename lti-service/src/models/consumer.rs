//! Registered LMS consumers and their launch field mapping.

use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::collections::HashMap;

use super::ChannelKind;

/// An external LMS allowed to launch users into the service.
#[derive(Clone, Deserialize)]
pub struct Consumer {
    /// Human-readable name, used in logs only.
    pub name: String,
    pub consumer_key: String,
    pub shared_secret: Secret<String>,
    /// Enforce the timestamp window and nonce replay check.
    #[serde(default = "default_require_freshness")]
    pub require_freshness: bool,
    #[serde(default)]
    pub fields: FieldMapping,
}

fn default_require_freshness() -> bool {
    true
}

impl Consumer {
    pub fn new(
        name: impl Into<String>,
        consumer_key: impl Into<String>,
        shared_secret: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            consumer_key: consumer_key.into(),
            shared_secret: Secret::new(shared_secret.into()),
            require_freshness: true,
            fields: FieldMapping::default(),
        }
    }

    pub fn secret(&self) -> &str {
        self.shared_secret.expose_secret()
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("consumer_key", &self.consumer_key)
            .field("require_freshness", &self.require_freshness)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

/// Which launch parameters carry which piece of onboarding data.
///
/// Different LMS vendors use different parameter names; a new vendor is
/// onboarded by configuring this table, not by code. Defaults follow the
/// IMS LTI 1.1 basic launch parameter names.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    pub user_id: String,
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub team: TeamMapping,
    pub channels: Vec<ChannelTemplate>,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            user_id: "user_id".to_string(),
            email: "lis_person_contact_email_primary".to_string(),
            username: "lis_person_sourcedid".to_string(),
            first_name: "lis_person_name_given".to_string(),
            last_name: "lis_person_name_family".to_string(),
            team: TeamMapping::default(),
            channels: Vec::new(),
        }
    }
}

/// Course to team resolution. Values of `field` found in `teams` are mapped,
/// anything else is used as the team slug directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TeamMapping {
    pub field: String,
    pub teams: HashMap<String, String>,
}

impl Default for TeamMapping {
    fn default() -> Self {
        Self {
            field: "context_id".to_string(),
            teams: HashMap::new(),
        }
    }
}

/// A channel every launch of the consumer should land the user in.
///
/// `name` and `display_name` may reference launch parameters as `{param}`,
/// e.g. `{context_id}-general`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelTemplate {
    pub kind: ChannelKind,
    pub name: String,
    pub display_name: String,
}
