//! Team, channel and membership store.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{StoreError, UserStore};
use crate::models::{Channel, ChannelMember, NewChannel, Team, TeamMember, User};

/// Store of teams, channels and memberships.
///
/// Lookups return `Ok(None)` for "not found"; `Err` is reserved for faults
/// and constraint violations.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_team_by_name(&self, name: &str) -> Result<Option<Team>, StoreError>;

    async fn get_team_member(
        &self,
        team_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TeamMember>, StoreError>;

    /// Adding an existing member returns the existing membership.
    async fn add_team_member(&self, team_id: Uuid, user_id: Uuid)
        -> Result<TeamMember, StoreError>;

    async fn get_channel_by_name(
        &self,
        team_id: Uuid,
        name: &str,
    ) -> Result<Option<Channel>, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the team already has a
    /// channel with this name.
    async fn create_channel(&self, channel: NewChannel) -> Result<Channel, StoreError>;

    async fn get_channel_member(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ChannelMember>, StoreError>;

    async fn add_channel_member(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<ChannelMember, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-process directory used in development and tests.
#[derive(Default)]
pub struct MemoryDirectory {
    teams: DashMap<String, Team>,
    team_members: DashMap<(Uuid, Uuid), TeamMember>,
    channels: DashMap<(Uuid, String), Channel>,
    channel_members: DashMap<(Uuid, Uuid), ChannelMember>,
    // Users need two unique indexes checked together, so one lock.
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_team(&self, team: Team) -> Team {
        self.teams
            .entry(team.name.clone())
            .or_insert(team)
            .value()
            .clone()
    }

    /// Seed a user, bypassing uniqueness checks.
    pub fn insert_user(&self, user: User) -> Result<(), StoreError> {
        self.lock_users()?.insert(user.user_id, user);
        Ok(())
    }

    pub fn team_count(&self) -> usize {
        self.teams.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn team_member_count(&self) -> usize {
        self.team_members.len()
    }

    pub fn channel_member_count(&self) -> usize {
        self.channel_members.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().map(|users| users.len()).unwrap_or(0)
    }

    pub fn is_team_member(&self, team_id: Uuid, user_id: Uuid) -> bool {
        self.team_members.contains_key(&(team_id, user_id))
    }

    pub fn is_channel_member(&self, channel_id: Uuid, user_id: Uuid) -> bool {
        self.channel_members.contains_key(&(channel_id, user_id))
    }

    pub fn channels_in_team(&self, team_id: Uuid) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .channels
            .iter()
            .filter(|c| c.team_id == team_id)
            .map(|c| c.value().clone())
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        channels
    }

    fn lock_users(&self) -> Result<MutexGuard<'_, HashMap<Uuid, User>>, StoreError> {
        self.users
            .lock()
            .map_err(|_| StoreError::Unavailable(anyhow::anyhow!("user store lock poisoned")))
    }

    fn team_exists(&self, team_id: Uuid) -> bool {
        self.teams.iter().any(|t| t.id == team_id)
    }

    pub fn channel_by_id(&self, channel_id: Uuid) -> Option<Channel> {
        self.channels
            .iter()
            .find(|c| c.id == channel_id)
            .map(|c| c.value().clone())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn get_team_by_name(&self, name: &str) -> Result<Option<Team>, StoreError> {
        Ok(self.teams.get(name).map(|t| t.value().clone()))
    }

    async fn get_team_member(
        &self,
        team_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TeamMember>, StoreError> {
        Ok(self
            .team_members
            .get(&(team_id, user_id))
            .map(|m| m.value().clone()))
    }

    async fn add_team_member(
        &self,
        team_id: Uuid,
        user_id: Uuid,
    ) -> Result<TeamMember, StoreError> {
        if !self.team_exists(team_id) {
            return Err(StoreError::Missing(format!("team {}", team_id)));
        }
        let member = self
            .team_members
            .entry((team_id, user_id))
            .or_insert_with(|| TeamMember {
                team_id,
                user_id,
                created_utc: Utc::now(),
            });
        Ok(member.value().clone())
    }

    async fn get_channel_by_name(
        &self,
        team_id: Uuid,
        name: &str,
    ) -> Result<Option<Channel>, StoreError> {
        Ok(self
            .channels
            .get(&(team_id, name.to_string()))
            .map(|c| c.value().clone()))
    }

    async fn create_channel(&self, channel: NewChannel) -> Result<Channel, StoreError> {
        match self.channels.entry((channel.team_id, channel.name.clone())) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "channel '{}' already exists",
                channel.name
            ))),
            Entry::Vacant(entry) => Ok(entry.insert(channel.into_channel()).value().clone()),
        }
    }

    async fn get_channel_member(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ChannelMember>, StoreError> {
        Ok(self
            .channel_members
            .get(&(channel_id, user_id))
            .map(|m| m.value().clone()))
    }

    async fn add_channel_member(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<ChannelMember, StoreError> {
        if self.channel_by_id(channel_id).is_none() {
            return Err(StoreError::Missing(format!("channel {}", channel_id)));
        }
        let member = self
            .channel_members
            .entry((channel_id, user_id))
            .or_insert_with(|| ChannelMember {
                channel_id,
                user_id,
                created_utc: Utc::now(),
            });
        Ok(member.value().clone())
    }
}

#[async_trait]
impl UserStore for MemoryDirectory {
    async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .lock_users()?
            .values()
            .find(|u| u.external_lti_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .lock_users()?
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn update_user(&self, user: &User) -> Result<(), StoreError> {
        let mut users = self.lock_users()?;
        if let Some(external_id) = user.external_lti_id.as_deref() {
            let taken = users.values().any(|u| {
                u.user_id != user.user_id && u.external_lti_id.as_deref() == Some(external_id)
            });
            if taken {
                return Err(StoreError::Conflict(format!(
                    "external id '{}' is linked to another user",
                    external_id
                )));
            }
        }
        match users.get_mut(&user.user_id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(StoreError::Missing(format!("user {}", user.user_id))),
        }
    }

    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let mut users = self.lock_users()?;
        let clash = users.values().any(|u| {
            u.email.eq_ignore_ascii_case(&user.email)
                || (user.external_lti_id.is_some() && u.external_lti_id == user.external_lti_id)
        });
        if clash || users.contains_key(&user.user_id) {
            return Err(StoreError::Conflict(format!(
                "user '{}' already exists",
                user.email
            )));
        }
        users.insert(user.user_id, user.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelKind;

    fn new_channel(team_id: Uuid, name: &str) -> NewChannel {
        NewChannel {
            team_id,
            name: name.to_string(),
            display_name: name.to_uppercase(),
            kind: ChannelKind::Open,
        }
    }

    #[tokio::test]
    async fn test_channel_names_are_unique_per_team() {
        let dir = MemoryDirectory::new();
        let a = dir.insert_team(Team::new("course-101", "Course 101"));
        let b = dir.insert_team(Team::new("course-102", "Course 102"));

        dir.create_channel(new_channel(a.id, "general")).await.unwrap();
        dir.create_channel(new_channel(b.id, "general")).await.unwrap();
        let err = dir
            .create_channel(new_channel(a.id, "general"))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(dir.channel_count(), 2);
        assert!(dir
            .get_channel_by_name(a.id, "general")
            .await
            .unwrap()
            .is_some());
        assert!(dir.get_channel_by_name(a.id, "random").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memberships_are_idempotent() {
        let dir = MemoryDirectory::new();
        let team = dir.insert_team(Team::new("course-101", "Course 101"));
        let user_id = Uuid::new_v4();

        let first = dir.add_team_member(team.id, user_id).await.unwrap();
        let second = dir.add_team_member(team.id, user_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(dir.team_member_count(), 1);

        let channel = dir
            .create_channel(new_channel(team.id, "general"))
            .await
            .unwrap();
        dir.add_channel_member(channel.id, user_id).await.unwrap();
        dir.add_channel_member(channel.id, user_id).await.unwrap();
        assert_eq!(dir.channel_member_count(), 1);
        assert!(dir.is_channel_member(channel.id, user_id));
    }

    #[tokio::test]
    async fn test_membership_requires_existing_entity() {
        let dir = MemoryDirectory::new();
        let err = dir
            .add_team_member(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Missing(_)));
    }

    #[tokio::test]
    async fn test_external_id_is_unique() {
        let dir = MemoryDirectory::new();
        let ada = User::new("ada@example.edu", "ada").with_external_lti_id("lms-1");
        let mut bob = User::new("bob@example.edu", "bob");
        dir.create_user(&ada).await.unwrap();
        dir.create_user(&bob).await.unwrap();

        bob.external_lti_id = Some("lms-1".to_string());
        let err = dir.update_user(&bob).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let found = dir.get_user_by_email("ADA@example.edu").await.unwrap();
        assert_eq!(found.map(|u| u.user_id), Some(ada.user_id));

        let dup = User::new("ada@example.edu", "ada2");
        assert!(matches!(
            dir.create_user(&dup).await.unwrap_err(),
            StoreError::Conflict(_)
        ));
    }
}
