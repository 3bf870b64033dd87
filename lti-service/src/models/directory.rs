//! Teams, channels and memberships owned by the directory store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Open,
    Private,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Open => "open",
            ChannelKind::Private => "private",
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(ChannelKind::Open),
            "private" => Ok(ChannelKind::Private),
            _ => Err(format!("Invalid channel kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Team {
    pub id: Uuid,
    /// URL slug, unique across the directory.
    pub name: String,
    pub display_name: String,
}

impl Team {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            display_name: display_name.into(),
        }
    }
}

/// A channel. `(team_id, name)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub display_name: String,
    pub kind: ChannelKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChannel {
    pub team_id: Uuid,
    pub name: String,
    pub display_name: String,
    pub kind: ChannelKind,
}

impl NewChannel {
    pub fn into_channel(self) -> Channel {
        Channel {
            id: Uuid::new_v4(),
            team_id: self.team_id,
            name: self.name,
            display_name: self.display_name,
            kind: self.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamMember {
    pub team_id: Uuid,
    pub user_id: Uuid,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMember {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub created_utc: DateTime<Utc>,
}
