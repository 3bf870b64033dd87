//! Metrics collection and Prometheus export.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

use super::ChannelStep;

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls are no-ops.
pub fn init_metrics() -> Result<(), anyhow::Error> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;

    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

/// Current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized".to_string())
}

/// `outcome` is `onboarded`, `signup_required`, `disabled`, a rejection
/// reason, `timeout`, `invalid_payload` or `error`.
pub fn record_launch(outcome: &'static str) {
    counter!("lti_launches_total", "outcome" => outcome).increment(1);
}

pub fn record_onboarding(duration: Duration, complete: bool) {
    let state = if complete { "channels_ensured" } else { "team_joined" };
    histogram!("lti_onboarding_duration_seconds", "state" => state)
        .record(duration.as_secs_f64());
}

pub fn record_onboarding_warning(step: ChannelStep) {
    counter!("lti_onboarding_warnings_total", "step" => step.to_string()).increment(1);
}
