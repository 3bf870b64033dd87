//! Idempotent team and channel provisioning for a launched user.
//!
//! Re-running [`OnboardingCoordinator::ensure_onboarded`] for a user who is
//! already fully onboarded only re-verifies: nothing is created twice.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use super::metrics::{record_onboarding, record_onboarding_warning};
use super::{Directory, StoreError};
use crate::models::{Channel, ChannelKind, LaunchPayload, NewChannel, User};

#[derive(Debug, Error)]
pub enum OnboardingError {
    #[error("team_not_found: {0}")]
    TeamNotFound(String),

    #[error("team lookup failed: {0}")]
    TeamLookup(#[source] StoreError),

    #[error("could not join team: {0}")]
    TeamJoin(#[source] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnboardingState {
    NotOnboarded,
    TeamJoined,
    ChannelsEnsured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStep {
    Lookup,
    Create,
    Join,
}

impl fmt::Display for ChannelStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelStep::Lookup => "lookup",
            ChannelStep::Create => "create",
            ChannelStep::Join => "join",
        })
    }
}

/// A channel that could not be fully provisioned. The next launch retries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelWarning {
    pub channel: String,
    pub step: ChannelStep,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct OnboardingReport {
    pub team_id: Uuid,
    pub state: OnboardingState,
    pub joined_team: bool,
    pub created_channels: Vec<String>,
    pub joined_channels: Vec<String>,
    pub warnings: Vec<ChannelWarning>,
}

impl OnboardingReport {
    fn new(team_id: Uuid) -> Self {
        Self {
            team_id,
            state: OnboardingState::TeamJoined,
            joined_team: false,
            created_channels: Vec::new(),
            joined_channels: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// True when this run created or joined nothing.
    pub fn is_noop(&self) -> bool {
        !self.joined_team && self.created_channels.is_empty() && self.joined_channels.is_empty()
    }

    fn warn(&mut self, channel: &str, step: ChannelStep, err: &StoreError) {
        tracing::warn!(channel = %channel, step = %step, error = %err, "Channel provisioning failed");
        record_onboarding_warning(step);
        self.warnings.push(ChannelWarning {
            channel: channel.to_string(),
            step,
            message: err.to_string(),
        });
    }
}

#[derive(Clone)]
pub struct OnboardingCoordinator {
    directory: Arc<dyn Directory>,
}

impl OnboardingCoordinator {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Bring `user` to the membership state described by `payload`.
    ///
    /// Only team resolution and team membership are fatal. Channel failures
    /// are collected in the report and never stop the remaining channels.
    #[instrument(skip(self, user, payload), fields(user_id = %user.user_id, team = %payload.team_slug()))]
    pub async fn ensure_onboarded(
        &self,
        user: &User,
        payload: &LaunchPayload,
    ) -> Result<OnboardingReport, OnboardingError> {
        let started = Instant::now();

        let team = self
            .directory
            .get_team_by_name(payload.team_slug())
            .await
            .map_err(OnboardingError::TeamLookup)?
            .ok_or_else(|| OnboardingError::TeamNotFound(payload.team_slug().to_string()))?;

        let mut report = OnboardingReport::new(team.id);

        let member = self
            .directory
            .get_team_member(team.id, user.user_id)
            .await
            .map_err(OnboardingError::TeamJoin)?;
        if member.is_none() {
            self.directory
                .add_team_member(team.id, user.user_id)
                .await
                .map_err(OnboardingError::TeamJoin)?;
            report.joined_team = true;
            tracing::info!(team_id = %team.id, "User joined team");
        }

        let wanted = payload
            .public_channels()
            .iter()
            .map(|(slug, name)| (slug, name, ChannelKind::Open))
            .chain(
                payload
                    .private_channels()
                    .iter()
                    .map(|(slug, name)| (slug, name, ChannelKind::Private)),
            );

        for (slug, display_name, kind) in wanted {
            let Some(channel) = self
                .ensure_channel(team.id, slug, display_name, kind, &mut report)
                .await
            else {
                continue;
            };

            match self
                .directory
                .get_channel_member(channel.id, user.user_id)
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => match self
                    .directory
                    .add_channel_member(channel.id, user.user_id)
                    .await
                {
                    Ok(_) => report.joined_channels.push(slug.clone()),
                    Err(e) => report.warn(slug, ChannelStep::Join, &e),
                },
                Err(e) => report.warn(slug, ChannelStep::Join, &e),
            }
        }

        if report.warnings.is_empty() {
            report.state = OnboardingState::ChannelsEnsured;
        }

        record_onboarding(started.elapsed(), report.warnings.is_empty());
        tracing::info!(
            joined_team = report.joined_team,
            created = report.created_channels.len(),
            joined = report.joined_channels.len(),
            warnings = report.warnings.len(),
            "Onboarding finished"
        );

        Ok(report)
    }

    async fn ensure_channel(
        &self,
        team_id: Uuid,
        slug: &str,
        display_name: &str,
        kind: ChannelKind,
        report: &mut OnboardingReport,
    ) -> Option<Channel> {
        match self.directory.get_channel_by_name(team_id, slug).await {
            Ok(Some(channel)) => return Some(channel),
            Ok(None) => {}
            Err(e) => {
                report.warn(slug, ChannelStep::Lookup, &e);
                return None;
            }
        }

        let new_channel = NewChannel {
            team_id,
            name: slug.to_string(),
            display_name: display_name.to_string(),
            kind,
        };

        match self.directory.create_channel(new_channel).await {
            Ok(channel) => {
                tracing::info!(channel = %slug, kind = kind.as_str(), "Created channel");
                report.created_channels.push(slug.to_string());
                Some(channel)
            }
            Err(StoreError::Conflict(_)) => {
                // Lost a creation race; the winner's channel is the one we want.
                match self.directory.get_channel_by_name(team_id, slug).await {
                    Ok(Some(channel)) => Some(channel),
                    Ok(None) => {
                        report.warn(
                            slug,
                            ChannelStep::Create,
                            &StoreError::Missing(format!("channel '{}' vanished after conflict", slug)),
                        );
                        None
                    }
                    Err(e) => {
                        report.warn(slug, ChannelStep::Create, &e);
                        None
                    }
                }
            }
            Err(e) => {
                report.warn(slug, ChannelStep::Create, &e);
                None
            }
        }
    }
}
