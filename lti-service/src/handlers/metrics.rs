use service_core::axum::{http::header, response::IntoResponse};

pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        crate::services::metrics::get_metrics(),
    )
}
