//! Replay protection: remembers `(consumer, nonce)` pairs for the freshness
//! window.

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use redis::{aio::ConnectionManager, Client};
use service_core::utils::signature::percent_encode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NonceStoreError {
    #[error("nonce store unavailable: {0}")]
    Unavailable(anyhow::Error),

    #[error("nonce store is full ({0} live entries)")]
    CapacityExceeded(usize),
}

#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Insert `(consumer_key, nonce)` unless an unexpired entry exists.
    ///
    /// Returns `false` when the nonce was already recorded. Times are unix
    /// seconds; the entry is forgotten at `expires_at`.
    async fn record(
        &self,
        consumer_key: &str,
        nonce: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<bool, NonceStoreError>;

    async fn seen(&self, consumer_key: &str, nonce: &str, now: i64)
        -> Result<bool, NonceStoreError>;

    async fn health_check(&self) -> Result<(), NonceStoreError> {
        Ok(())
    }
}

/// Process-local nonce store with a hard entry limit.
///
/// Expired entries are purged lazily once the limit is reached and by the
/// sweeper task from [`crate::spawn_sweeper`].
pub struct MemoryNonceStore {
    entries: DashMap<(String, String), i64>,
    capacity: usize,
}

impl MemoryNonceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries expired at `now`; returns how many were removed.
    pub fn purge_expired(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn record(
        &self,
        consumer_key: &str,
        nonce: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<bool, NonceStoreError> {
        if self.entries.len() >= self.capacity {
            let purged = self.purge_expired(now);
            tracing::debug!(purged, "Purged expired nonces");
            if self.entries.len() >= self.capacity {
                return Err(NonceStoreError::CapacityExceeded(self.entries.len()));
            }
        }

        match self
            .entries
            .entry((consumer_key.to_string(), nonce.to_string()))
        {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    Ok(false)
                } else {
                    entry.insert(expires_at);
                    Ok(true)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn seen(
        &self,
        consumer_key: &str,
        nonce: &str,
        now: i64,
    ) -> Result<bool, NonceStoreError> {
        Ok(self
            .entries
            .get(&(consumer_key.to_string(), nonce.to_string()))
            .map(|expires_at| *expires_at > now)
            .unwrap_or(false))
    }
}

/// Nonce store shared by every replica through Redis (`SET NX EX`).
#[derive(Clone)]
pub struct RedisNonceStore {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisNonceStore {
    pub async fn new(url: &str) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis for nonce tracking");
        let client = Client::open(url)?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }

    /// Both parts are percent-encoded so `:` inside either cannot collide.
    fn key(consumer_key: &str, nonce: &str) -> String {
        format!(
            "lti:nonce:{}:{}",
            percent_encode(consumer_key),
            percent_encode(nonce)
        )
    }
}

#[async_trait]
impl NonceStore for RedisNonceStore {
    async fn record(
        &self,
        consumer_key: &str,
        nonce: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<bool, NonceStoreError> {
        let mut conn = self.manager.clone();
        let ttl = (expires_at - now).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(consumer_key, nonce))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                tracing::error!("Failed to record nonce in Redis: {}", e);
                NonceStoreError::Unavailable(anyhow::anyhow!("Failed to record nonce: {}", e))
            })?;

        Ok(reply.is_some())
    }

    async fn seen(
        &self,
        consumer_key: &str,
        nonce: &str,
        _now: i64,
    ) -> Result<bool, NonceStoreError> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(Self::key(consumer_key, nonce))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                NonceStoreError::Unavailable(anyhow::anyhow!("Failed to check nonce: {}", e))
            })?;
        Ok(exists)
    }

    async fn health_check(&self) -> Result<(), NonceStoreError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                NonceStoreError::Unavailable(anyhow::anyhow!("Redis health check failed: {}", e))
            })?;
        Ok(())
    }
}
