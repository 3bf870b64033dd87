//! Local user accounts and their LMS identity link.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Local user. `external_lti_id` is unique across users when set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub username: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub external_lti_id: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl User {
    pub fn new(email: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            email: email.into(),
            username: username.into(),
            first_name: None,
            last_name: None,
            external_lti_id: None,
            created_utc: Utc::now(),
        }
    }

    pub fn with_external_lti_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_lti_id = Some(external_id.into());
        self
    }
}

/// What the launch tells us about the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserHint {
    pub external_id: String,
    pub email: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl UserHint {
    /// Build a new account from the hint. The username falls back to the
    /// local part of the email address.
    pub fn to_new_user(&self) -> User {
        let username = self
            .username
            .clone()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| {
                self.email
                    .split('@')
                    .next()
                    .unwrap_or(&self.email)
                    .to_string()
            });

        let mut user = User::new(self.email.clone(), username)
            .with_external_lti_id(self.external_id.clone());
        user.first_name = self.first_name.clone();
        user.last_name = self.last_name.clone();
        user
    }
}
