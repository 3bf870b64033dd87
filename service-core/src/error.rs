use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Too many requests: {0}")]
    TooManyRequests(String, Option<u64>),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Service Unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::TooManyRequests(..) => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InternalError(_)
            | AppError::DatabaseError(_)
            | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
        }

        let status = self.status_code();

        // Server-side failures are logged in full and answered generically.
        let (error_message, retry_after) = match self {
            AppError::BadRequest(err)
            | AppError::Unauthorized(err)
            | AppError::Conflict(err) => (err.to_string(), None),
            AppError::TooManyRequests(msg, retry) => (msg, retry),
            AppError::NotImplemented(msg) => (msg, None),
            AppError::ServiceUnavailable(msg) => {
                tracing::error!(reason = %msg, "Service unavailable");
                ("Service unavailable".to_string(), None)
            }
            AppError::InternalError(err) => {
                tracing::error!(error = ?err, "Internal server error");
                ("Internal server error".to_string(), None)
            }
            AppError::DatabaseError(err) => {
                tracing::error!(error = %err, "Database error");
                ("Internal server error".to_string(), None)
            }
            AppError::ConfigError(err) => {
                tracing::error!(error = %err, "Configuration error");
                ("Internal server error".to_string(), None)
            }
        };

        let mut res = (
            status,
            Json(ErrorResponse {
                error: error_message,
            }),
        )
            .into_response();

        if let Some(retry) = retry_after {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, retry.into());
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_of(res: Response) -> serde_json::Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_internal_detail_is_not_exposed() {
        let res = AppError::DatabaseError(anyhow::anyhow!("relation \"teams\" does not exist"))
            .into_response();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_of(res).await;
        assert_eq!(body["error"], "Internal server error");
    }

    #[tokio::test]
    async fn test_retry_after_header() {
        let res = AppError::TooManyRequests("slow down".to_string(), Some(7)).into_response();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers()[axum::http::header::RETRY_AFTER], "7");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::NotImplemented("disabled".into()).status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            AppError::Unauthorized(anyhow::anyhow!("no")).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::ServiceUnavailable("timeout".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Conflict(anyhow::anyhow!("linked")).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn test_conflict_body_is_passed_through() {
        let res = AppError::Conflict(anyhow::anyhow!("Unable to complete LTI login")).into_response();
        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert_eq!(body_of(res).await["error"], "Unable to complete LTI login");
    }
}
