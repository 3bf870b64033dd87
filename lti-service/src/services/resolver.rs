//! Maps an LMS identity onto a local user account.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use super::StoreError;
use crate::models::{User, UserHint};

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError>;

    /// Case-insensitive match.
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the external id belongs to
    /// another user.
    async fn update_user(&self, user: &User) -> Result<(), StoreError>;

    async fn create_user(&self, user: &User) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("user {user_id} is already linked to another LMS identity")]
    IdentityConflict { user_id: Uuid },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct UserResolver {
    store: Arc<dyn UserStore>,
    auto_provision: bool,
}

impl UserResolver {
    pub fn new(store: Arc<dyn UserStore>, auto_provision: bool) -> Self {
        Self {
            store,
            auto_provision,
        }
    }

    /// Find the local user for `hint`, linking the external id when the
    /// match was by email.
    ///
    /// `Ok(None)` means the user is unknown and must sign up first.
    #[instrument(skip(self, hint), fields(external_id = %hint.external_id))]
    pub async fn resolve(&self, hint: &UserHint) -> Result<Option<User>, ResolveError> {
        if let Some(user) = self.lookup(hint).await? {
            return Ok(Some(user));
        }

        if !self.auto_provision {
            tracing::info!("No local user for LTI identity; signup required");
            return Ok(None);
        }

        let user = hint.to_new_user();
        match self.store.create_user(&user).await {
            Ok(()) => {
                tracing::info!(user_id = %user.user_id, "Provisioned user from LTI launch");
                Ok(Some(user))
            }
            Err(StoreError::Conflict(reason)) => {
                // A concurrent launch created the account first.
                tracing::debug!(reason = %reason, "User creation lost a race, retrying lookup");
                self.lookup(hint).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup(&self, hint: &UserHint) -> Result<Option<User>, ResolveError> {
        if let Some(user) = self.store.get_user_by_external_id(&hint.external_id).await? {
            return Ok(Some(user));
        }

        let Some(mut user) = self.store.get_user_by_email(&hint.email).await? else {
            return Ok(None);
        };

        match user.external_lti_id.as_deref() {
            Some(linked) if linked == hint.external_id => return Ok(Some(user)),
            Some(_) => {
                tracing::warn!(user_id = %user.user_id, "Email matches a user linked to another LMS identity");
                return Err(ResolveError::IdentityConflict {
                    user_id: user.user_id,
                });
            }
            None => {}
        }

        user.external_lti_id = Some(hint.external_id.clone());
        match self.store.update_user(&user).await {
            Ok(()) => {
                tracing::info!(user_id = %user.user_id, "Linked existing user to LTI identity");
                Ok(Some(user))
            }
            Err(StoreError::Conflict(_)) => {
                // Someone else linked this external id in the meantime.
                match self.store.get_user_by_external_id(&hint.external_id).await? {
                    Some(linked) => Ok(Some(linked)),
                    None => Err(ResolveError::IdentityConflict {
                        user_id: user.user_id,
                    }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}
