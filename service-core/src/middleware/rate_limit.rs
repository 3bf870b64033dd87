use crate::error::AppError;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
};
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

/// Rate limiter keyed by client IP address
pub type IpRateLimiter = Arc<RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>>;

/// Allow `attempts` requests per `window_seconds` for each IP, with the whole
/// allowance available as a burst.
pub fn create_ip_rate_limiter(attempts: u32, window_seconds: u64) -> IpRateLimiter {
    let attempts = NonZeroU32::new(attempts).unwrap_or(NonZeroU32::MIN);
    let period = Duration::from_millis((window_seconds.max(1) * 1000) / attempts.get() as u64)
        .max(Duration::from_millis(1));
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(attempts))
        .allow_burst(attempts);

    Arc::new(RateLimiter::dashmap(quota))
}

/// Middleware state: the limiter and whether a fronting proxy's
/// `x-forwarded-for` names the client.
#[derive(Clone)]
pub struct IpRateLimit {
    pub limiter: IpRateLimiter,
    pub trust_forwarded_for: bool,
}

impl IpRateLimit {
    pub fn new(limiter: IpRateLimiter, trust_forwarded_for: bool) -> Self {
        Self {
            limiter,
            trust_forwarded_for,
        }
    }
}

/// Drop keys whose allowance has fully replenished. Returns the keys left.
pub fn prune_ip_rate_limiter(limiter: &IpRateLimiter) -> usize {
    limiter.retain_recent();
    limiter.shrink_to_fit();
    limiter.len()
}

/// Peer address, or the first `x-forwarded-for` hop when the proxy in front
/// is trusted. An untrusted header is client-controlled and ignored.
pub fn client_ip(request: &Request, trust_forwarded_for: bool) -> Option<IpAddr> {
    let forwarded_ip = trust_forwarded_for
        .then(|| {
            request
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split(',').next())
                .and_then(|s| s.trim().parse::<IpAddr>().ok())
        })
        .flatten();

    forwarded_ip.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    })
}

/// Middleware for IP-based rate limiting
pub async fn ip_rate_limit_middleware(
    State(IpRateLimit {
        limiter,
        trust_forwarded_for,
    }): State<IpRateLimit>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match client_ip(&request, trust_forwarded_for) {
        Some(ip) => match limiter.check_key(&ip) {
            Ok(_) => Ok(next.run(request).await),
            Err(negative) => {
                let wait_time = negative.wait_time_from(DefaultClock::default().now());
                tracing::warn!(ip = %ip, "Rate limit exceeded");
                Err(AppError::TooManyRequests(
                    "Too many requests from this IP. Please try again later.".to_string(),
                    Some(wait_time.as_secs()),
                ))
            }
        },
        None => {
            tracing::warn!("Could not determine IP for rate limiting");
            Ok(next.run(request).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router, body::Body, http::StatusCode, middleware::from_fn_with_state, routing::post,
    };
    use tower::ServiceExt;

    fn request() -> Request {
        Request::builder()
            .method("POST")
            .uri("/login/lti")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap()
    }

    fn from_peer(peer: &str, forwarded: &str) -> Request {
        let mut request = Request::builder()
            .method("POST")
            .uri("/login/lti")
            .header("x-forwarded-for", forwarded)
            .body(Body::empty())
            .unwrap();
        let addr: SocketAddr = format!("{}:40000", peer).parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    fn app(limiter: IpRateLimiter, trust_forwarded_for: bool) -> Router {
        Router::new()
            .route("/login/lti", post(|| async { "ok" }))
            .layer(from_fn_with_state(
                IpRateLimit::new(limiter, trust_forwarded_for),
                ip_rate_limit_middleware,
            ))
    }

    #[test]
    fn test_client_ip_uses_forwarded_header_only_when_trusted() {
        let request = from_peer("198.51.100.4", "203.0.113.9, 10.0.0.1");
        assert_eq!(client_ip(&request, true), Some("203.0.113.9".parse().unwrap()));
        assert_eq!(client_ip(&request, false), Some("198.51.100.4".parse().unwrap()));
        assert_eq!(client_ip(&self::request(), false), None);
    }

    #[tokio::test]
    async fn test_limit_exceeded() {
        let app = app(create_ip_rate_limiter(2, 60), true);

        for _ in 0..2 {
            let res = app.clone().oneshot(request()).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }
        let res = app.oneshot(request()).await.unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_rotating_forwarded_header_does_not_evade_limit() {
        let limiter = create_ip_rate_limiter(2, 60);
        let app = app(limiter.clone(), false);

        for i in 0..2 {
            let forwarded = format!("203.0.113.{}", i);
            let res = app.clone().oneshot(from_peer("198.51.100.4", &forwarded)).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }
        let res = app
            .oneshot(from_peer("198.51.100.4", "203.0.113.77"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_prune_keeps_keys_still_limited() {
        let limiter = create_ip_rate_limiter(2, 60);
        for i in 0..3u8 {
            let ip = IpAddr::from([198, 51, 100, i]);
            assert!(limiter.check_key(&ip).is_ok());
        }
        // Each key used part of its allowance within the last minute.
        assert_eq!(prune_ip_rate_limiter(&limiter), 3);
    }

    #[test]
    fn test_prune_drops_replenished_keys() {
        let limiter = create_ip_rate_limiter(1000, 1);
        let ip = IpAddr::from([198, 51, 100, 1]);
        assert!(limiter.check_key(&ip).is_ok());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(prune_ip_rate_limiter(&limiter), 0);
        assert!(limiter.is_empty());
    }
}
