use service_core::error::AppError;
use std::time::Duration;
use thiserror::Error;

use super::{NonceStoreError, OnboardingError, RejectReason, ResolveError};
use crate::models::PayloadError;

/// Failure of a directory or user store call.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    Missing(String),

    #[error("store unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                StoreError::Conflict(db_err.message().to_string())
            }
            sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                StoreError::Missing(db_err.message().to_string())
            }
            sqlx::Error::RowNotFound => StoreError::Missing("row not found".to_string()),
            other => StoreError::Unavailable(anyhow::Error::new(other)),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(e) => AppError::ServiceUnavailable(e.to_string()),
            other => AppError::InternalError(anyhow::anyhow!(other)),
        }
    }
}

/// Everything that can end a launch early.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("LTI login is disabled")]
    Disabled,

    #[error("launch rejected: {0}")]
    Rejected(RejectReason),

    #[error(transparent)]
    NonceStore(#[from] NonceStoreError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Onboarding(#[from] OnboardingError),

    #[error("launch did not complete within {0:?}")]
    DeadlineExceeded(Duration),
}

const GENERIC_LAUNCH_ERROR: &str = "Invalid LTI launch request";

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Disabled => AppError::NotImplemented("LTI login is not enabled".to_string()),
            ServiceError::Rejected(_) => AppError::Unauthorized(anyhow::anyhow!(GENERIC_LAUNCH_ERROR)),
            ServiceError::Payload(_) => AppError::BadRequest(anyhow::anyhow!(GENERIC_LAUNCH_ERROR)),
            ServiceError::NonceStore(e) => AppError::ServiceUnavailable(e.to_string()),
            ServiceError::Resolve(ResolveError::Store(e)) => e.into(),
            ServiceError::Resolve(e @ ResolveError::IdentityConflict { .. }) => {
                tracing::warn!(error = %e, "LTI identity could not be linked");
                AppError::Conflict(anyhow::anyhow!("Unable to complete LTI login"))
            }
            ServiceError::Onboarding(OnboardingError::TeamLookup(e))
            | ServiceError::Onboarding(OnboardingError::TeamJoin(e)) => e.into(),
            ServiceError::Onboarding(e @ OnboardingError::TeamNotFound(_)) => {
                AppError::InternalError(anyhow::anyhow!(e))
            }
            ServiceError::DeadlineExceeded(limit) => {
                AppError::ServiceUnavailable(format!("launch exceeded deadline of {:?}", limit))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::http::StatusCode;

    #[test]
    fn test_rejections_map_to_unauthorized() {
        let app: AppError = ServiceError::Rejected(RejectReason::BadSignature).into();
        assert_eq!(app.status_code(), StatusCode::UNAUTHORIZED);
        assert!(!app.to_string().contains("bad_signature"));
    }

    #[test]
    fn test_infrastructure_faults_are_unavailable() {
        let app: AppError =
            ServiceError::NonceStore(NonceStoreError::Unavailable(anyhow::anyhow!("down"))).into();
        assert_eq!(app.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let app: AppError = ServiceError::DeadlineExceeded(Duration::from_secs(5)).into();
        assert_eq!(app.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_disabled_is_not_implemented() {
        let app: AppError = ServiceError::Disabled.into();
        assert_eq!(app.status_code(), StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn test_team_not_found_is_internal() {
        let app: AppError =
            ServiceError::Onboarding(OnboardingError::TeamNotFound("course-999".into())).into();
        assert_eq!(app.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
