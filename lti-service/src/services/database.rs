//! PostgreSQL directory and user store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{Directory, StoreError, UserStore};
use crate::models::{Channel, ChannelKind, ChannelMember, NewChannel, Team, TeamMember, User};

const USER_COLUMNS: &str =
    "user_id, email, username, first_name, last_name, external_lti_id, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "lti-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Create a team unless one with the same name exists; returns the
    /// stored team either way.
    pub async fn upsert_team(&self, team: &Team) -> Result<Team, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO teams (team_id, name, display_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(team.id)
        .bind(&team.name)
        .bind(&team.display_name)
        .execute(&self.pool)
        .await?;

        self.get_team_by_name(&team.name)
            .await?
            .ok_or_else(|| StoreError::Missing(format!("team '{}'", team.name)))
    }
}

fn channel_from_row(row: (Uuid, Uuid, String, String, String)) -> Result<Channel, StoreError> {
    let (id, team_id, name, display_name, kind) = row;
    let kind = kind
        .parse::<ChannelKind>()
        .map_err(|e| StoreError::Unavailable(anyhow::anyhow!(e)))?;
    Ok(Channel {
        id,
        team_id,
        name,
        display_name,
        kind,
    })
}

#[async_trait]
impl Directory for Database {
    async fn get_team_by_name(&self, name: &str) -> Result<Option<Team>, StoreError> {
        let row: Option<(Uuid, String, String)> =
            sqlx::query_as("SELECT team_id, name, display_name FROM teams WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, name, display_name)| Team {
            id,
            name,
            display_name,
        }))
    }

    async fn get_team_member(
        &self,
        team_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<TeamMember>, StoreError> {
        let row: Option<(Uuid, Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT team_id, user_id, created_utc FROM team_members WHERE team_id = $1 AND user_id = $2",
        )
        .bind(team_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(team_id, user_id, created_utc)| TeamMember {
            team_id,
            user_id,
            created_utc,
        }))
    }

    #[instrument(skip(self))]
    async fn add_team_member(
        &self,
        team_id: Uuid,
        user_id: Uuid,
    ) -> Result<TeamMember, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO team_members (team_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (team_id, user_id) DO NOTHING
            "#,
        )
        .bind(team_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        self.get_team_member(team_id, user_id)
            .await?
            .ok_or_else(|| StoreError::Missing(format!("team member {}/{}", team_id, user_id)))
    }

    async fn get_channel_by_name(
        &self,
        team_id: Uuid,
        name: &str,
    ) -> Result<Option<Channel>, StoreError> {
        let row: Option<(Uuid, Uuid, String, String, String)> = sqlx::query_as(
            "SELECT channel_id, team_id, name, display_name, kind FROM channels WHERE team_id = $1 AND name = $2",
        )
        .bind(team_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(channel_from_row).transpose()
    }

    #[instrument(skip(self, channel), fields(team_id = %channel.team_id, name = %channel.name))]
    async fn create_channel(&self, channel: NewChannel) -> Result<Channel, StoreError> {
        let channel = channel.into_channel();
        // A unique violation on (team_id, name) surfaces as StoreError::Conflict.
        sqlx::query(
            r#"
            INSERT INTO channels (channel_id, team_id, name, display_name, kind)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(channel.id)
        .bind(channel.team_id)
        .bind(&channel.name)
        .bind(&channel.display_name)
        .bind(channel.kind.as_str())
        .execute(&self.pool)
        .await?;

        Ok(channel)
    }

    async fn get_channel_member(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<ChannelMember>, StoreError> {
        let row: Option<(Uuid, Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT channel_id, user_id, created_utc FROM channel_members WHERE channel_id = $1 AND user_id = $2",
        )
        .bind(channel_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(channel_id, user_id, created_utc)| ChannelMember {
            channel_id,
            user_id,
            created_utc,
        }))
    }

    #[instrument(skip(self))]
    async fn add_channel_member(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<ChannelMember, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO channel_members (channel_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (channel_id, user_id) DO NOTHING
            "#,
        )
        .bind(channel_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        self.get_channel_member(channel_id, user_id)
            .await?
            .ok_or_else(|| {
                StoreError::Missing(format!("channel member {}/{}", channel_id, user_id))
            })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                StoreError::Unavailable(anyhow::anyhow!("Database health check failed: {}", e))
            })?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for Database {
    async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        let query = format!("SELECT {} FROM users WHERE external_lti_id = $1", USER_COLUMNS);
        Ok(sqlx::query_as::<_, User>(&query)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let query = format!(
            "SELECT {} FROM users WHERE LOWER(email) = LOWER($1)",
            USER_COLUMNS
        );
        Ok(sqlx::query_as::<_, User>(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    async fn update_user(&self, user: &User) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET email = $2, username = $3, first_name = $4, last_name = $5, external_lti_id = $6
            WHERE user_id = $1
            "#,
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.external_lti_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(format!("user {}", user.user_id)));
        }
        Ok(())
    }

    #[instrument(skip(self, user), fields(user_id = %user.user_id))]
    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, email, username, first_name, last_name, external_lti_id, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(user.user_id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.external_lti_id)
        .bind(user.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
