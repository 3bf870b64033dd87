//! Launch request authentication.
//!
//! A launch is accepted only when it names a registered consumer, carries a
//! valid OAuth 1.0 signature made with that consumer's secret and, for
//! consumers that require it, is fresh and has not been seen before.

use service_core::utils::signature::{base_string, verify, SignatureMethod, SIGNATURE_PARAM};
use std::fmt;
use std::sync::Arc;
use tracing::instrument;

use super::{ConsumerRegistry, NonceStore, NonceStoreError};
use crate::models::{
    AuthenticatedLaunch, LaunchRequest, NONCE_PARAM, SIGNATURE_METHOD_PARAM, TIMESTAMP_PARAM,
    VERSION_PARAM,
};

/// Default allowed clock skew and nonce retention, in seconds.
pub const DEFAULT_FRESHNESS_WINDOW_SECS: i64 = 300;

const MAX_NONCE_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    UnknownConsumer,
    MalformedRequest,
    BadSignature,
    StaleRequest,
    ReplayDetected,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::UnknownConsumer => "unknown_consumer",
            RejectReason::MalformedRequest => "malformed_request",
            RejectReason::BadSignature => "bad_signature",
            RejectReason::StaleRequest => "stale_request",
            RejectReason::ReplayDetected => "replay_detected",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub enum AuthOutcome {
    Accepted(AuthenticatedLaunch),
    Rejected(RejectReason),
}

impl AuthOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AuthOutcome::Accepted(_))
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            AuthOutcome::Accepted(_) => None,
            AuthOutcome::Rejected(reason) => Some(*reason),
        }
    }
}

#[derive(Clone)]
pub struct LaunchAuthenticator {
    registry: Arc<ConsumerRegistry>,
    nonces: Arc<dyn NonceStore>,
    freshness_window: i64,
}

impl LaunchAuthenticator {
    pub fn new(
        registry: Arc<ConsumerRegistry>,
        nonces: Arc<dyn NonceStore>,
        freshness_window_secs: i64,
    ) -> Self {
        Self {
            registry,
            nonces,
            freshness_window: freshness_window_secs.max(1),
        }
    }

    pub fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    pub async fn authenticate(
        &self,
        request: LaunchRequest,
    ) -> Result<AuthOutcome, NonceStoreError> {
        self.authenticate_at(request, chrono::Utc::now().timestamp())
            .await
    }

    /// Authenticate against an explicit clock (unix seconds).
    ///
    /// Only a nonce store failure is an `Err`; untrusted input never is.
    /// Nothing is written unless every other check has passed.
    #[instrument(skip(self, request), fields(consumer_key = request.consumer_key().unwrap_or("-")))]
    pub async fn authenticate_at(
        &self,
        request: LaunchRequest,
        now: i64,
    ) -> Result<AuthOutcome, NonceStoreError> {
        let Some(consumer) = request
            .consumer_key()
            .and_then(|key| self.registry.find_by_consumer_key(key))
        else {
            return Ok(reject(RejectReason::UnknownConsumer));
        };

        let Some(method) = request
            .param(SIGNATURE_METHOD_PARAM)
            .and_then(|m| m.parse::<SignatureMethod>().ok())
        else {
            return Ok(reject(RejectReason::MalformedRequest));
        };

        if request.param(VERSION_PARAM).is_some_and(|v| v != "1.0") {
            return Ok(reject(RejectReason::MalformedRequest));
        }

        let Some(signature) = request.param(SIGNATURE_PARAM) else {
            return Ok(reject(RejectReason::BadSignature));
        };

        let base = match base_string(&request.method, &request.url, &request.params) {
            Ok(base) => base,
            Err(e) => {
                tracing::debug!(error = %e, "Could not build signature base string");
                return Ok(reject(RejectReason::MalformedRequest));
            }
        };

        match verify(method, consumer.secret(), None, &base, signature) {
            Ok(true) => {}
            Ok(false) => return Ok(reject(RejectReason::BadSignature)),
            Err(e) => {
                tracing::warn!(error = %e, "Signature verification failed");
                return Ok(reject(RejectReason::BadSignature));
            }
        }

        if consumer.require_freshness {
            let Some(timestamp) = request
                .param(TIMESTAMP_PARAM)
                .and_then(|t| t.trim().parse::<i64>().ok())
            else {
                return Ok(reject(RejectReason::StaleRequest));
            };

            // Timestamps are attacker-chosen; compare without overflow.
            if now.abs_diff(timestamp) > self.freshness_window.unsigned_abs() {
                return Ok(reject(RejectReason::StaleRequest));
            }

            let Some(nonce) = request
                .param(NONCE_PARAM)
                .filter(|n| !n.is_empty() && n.len() <= MAX_NONCE_LEN)
            else {
                return Ok(reject(RejectReason::MalformedRequest));
            };

            // The nonce must outlive every instant at which this timestamp
            // still passes the window check.
            let expires_at = timestamp
                .saturating_add(self.freshness_window)
                .max(now.saturating_add(1));
            if !self
                .nonces
                .record(&consumer.consumer_key, nonce, expires_at, now)
                .await?
            {
                return Ok(reject(RejectReason::ReplayDetected));
            }
        }

        tracing::debug!(consumer = %consumer.name, "LTI launch authenticated");
        Ok(AuthOutcome::Accepted(AuthenticatedLaunch::new(
            consumer, request,
        )))
    }
}

fn reject(reason: RejectReason) -> AuthOutcome {
    tracing::warn!(reason = reason.as_str(), "LTI launch rejected");
    AuthOutcome::Rejected(reason)
}
