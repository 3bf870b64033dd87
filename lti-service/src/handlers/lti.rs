use axum_extra::extract::cookie::{Cookie, CookieJar};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use service_core::{
    axum::{
        extract::{OriginalUri, State},
        http::{header, StatusCode},
        response::{IntoResponse, Response},
        Form,
    },
    error::AppError,
    utils::signature::percent_encode,
};
use std::collections::BTreeMap;

use crate::models::{LaunchPayload, LaunchRequest};
use crate::services::metrics::record_launch;
use crate::services::{AuthOutcome, OnboardingReport, ServiceError};
use crate::AppState;

/// Cookie read by the signup page to finish an unknown user's launch.
pub const LAUNCH_DATA_COOKIE: &str = "LTI_LAUNCH_DATA";

const SIGNUP_PATH: &str = "/signup_lti";

enum LaunchOutcome {
    Onboarded {
        team_slug: String,
        report: OnboardingReport,
    },
    SignupRequired {
        form: BTreeMap<String, String>,
    },
}

/// `POST /login/lti`: authenticate a signed LMS launch, then either onboard
/// the user and redirect to their team or hand the launch data to signup.
pub async fn login_with_lti(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
    Form(params): Form<Vec<(String, String)>>,
) -> Result<(CookieJar, Response), AppError> {
    if !state.config.lti.enabled {
        record_launch("disabled");
        return Err(ServiceError::Disabled.into());
    }

    // The LMS signed the public URL, not whatever a proxy forwarded to us.
    // Query pairs are part of the signed parameter set.
    let url = match uri.query() {
        Some(query) => format!("{}{}?{}", state.config.site_url, uri.path(), query),
        None => format!("{}{}", state.config.site_url, uri.path()),
    };
    let request = LaunchRequest::new("POST", url, params);

    let deadline = state.config.launch_timeout();
    let outcome = match tokio::time::timeout(deadline, run_launch(&state, request)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(timeout_ms = deadline.as_millis() as u64, "LTI launch timed out");
            Err(ServiceError::DeadlineExceeded(deadline))
        }
    };

    match outcome {
        Ok(LaunchOutcome::Onboarded { team_slug, report }) => {
            record_launch("onboarded");
            if !report.warnings.is_empty() {
                tracing::warn!(
                    warnings = report.warnings.len(),
                    "LTI launch completed with channel warnings"
                );
            }
            let location = format!(
                "{}/{}",
                state.config.site_url,
                percent_encode(&team_slug)
            );
            Ok((jar, found(location)))
        }
        Ok(LaunchOutcome::SignupRequired { form }) => {
            record_launch("signup_required");
            let cookie = launch_data_cookie(&state, &form)?;
            let location = format!("{}{}", state.config.site_url, SIGNUP_PATH);
            Ok((jar.add(cookie), found(location)))
        }
        Err(e) => {
            record_launch(match &e {
                ServiceError::Rejected(reason) => reason.as_str(),
                ServiceError::DeadlineExceeded(_) => "timeout",
                ServiceError::Payload(_) => "invalid_payload",
                _ => "error",
            });
            Err(e.into())
        }
    }
}

async fn run_launch(state: &AppState, request: LaunchRequest) -> Result<LaunchOutcome, ServiceError> {
    let launch = match state.authenticator.authenticate(request).await? {
        AuthOutcome::Accepted(launch) => launch,
        AuthOutcome::Rejected(reason) => return Err(ServiceError::Rejected(reason)),
    };

    let payload = LaunchPayload::from_launch(&launch)?;

    let Some(user) = state.resolver.resolve(payload.user()).await? else {
        return Ok(LaunchOutcome::SignupRequired {
            form: launch.request().form().into_iter().collect(),
        });
    };

    let report = state.onboarding.ensure_onboarded(&user, &payload).await?;
    Ok(LaunchOutcome::Onboarded {
        team_slug: payload.team_slug().to_string(),
        report,
    })
}

fn launch_data_cookie(
    state: &AppState,
    form: &BTreeMap<String, String>,
) -> Result<Cookie<'static>, AppError> {
    let json = serde_json::to_vec(form)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to encode launch data: {}", e)))?;

    let mut cookie = Cookie::build((LAUNCH_DATA_COOKIE, URL_SAFE_NO_PAD.encode(json)))
        .path("/")
        .http_only(false)
        .secure(state.config.secure_cookies())
        .max_age(time::Duration::minutes(10));

    if let Some(domain) = &state.config.cookie_domain {
        cookie = cookie.domain(domain.clone());
    }

    Ok(cookie.build())
}

fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}
