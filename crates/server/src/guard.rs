// crates/server/src/guard.rs
//! Request-boundary access control: optional shared-token check and
//! fixed-window rate limiting.
//!
//! The token check is fail-open by design: with no token configured it is a
//! no-op. When configured, a request must present the token via the
//! `x-agentdeck-token` header, the `token` query parameter, or the
//! `agentdeck_token` cookie — checked in that precedence.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::state::AppState;

pub const TOKEN_HEADER: &str = "x-agentdeck-token";
pub const TOKEN_QUERY_PARAM: &str = "token";
pub const TOKEN_COOKIE: &str = "agentdeck_token";

/// Fixed-window rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 120,
            window: Duration::from_secs(60),
        }
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
}

struct Window {
    started_at: Instant,
    count: u32,
}

/// Fixed-window counter keyed by client identity.
///
/// Owned state inside the guard instance — independent test instances never
/// share counters.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request for `key`. Requests beyond the limit are rejected
    /// until the window rolls over.
    pub fn check(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");

        let window = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now.duration_since(window.started_at) >= self.config.window {
            window.started_at = now;
            window.count = 0;
        }

        window.count += 1;
        RateDecision {
            allowed: window.count <= self.config.max_requests,
            remaining: self.config.max_requests.saturating_sub(window.count),
        }
    }

    /// Drop windows that expired; bounds memory for churning clients.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        windows.retain(|_, w| now.duration_since(w.started_at) < self.config.window);
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().expect("rate limiter lock poisoned").len()
    }
}

/// Shared-token check plus rate limiting at the request boundary.
pub struct AccessGuard {
    token: Option<String>,
    pub limiter: RateLimiter,
}

impl AccessGuard {
    pub fn new(token: Option<String>, rate_limit: RateLimitConfig) -> Self {
        Self {
            token,
            limiter: RateLimiter::new(rate_limit),
        }
    }

    /// Spawn the periodic purge task for expired rate-limit windows.
    pub fn spawn_purge_task(state: Arc<AppState>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                state.guard.limiter.purge_expired();
            }
        });
    }

    /// Whether the request presents a valid token. No-op (true) when no
    /// token is configured.
    pub fn token_ok(&self, headers: &HeaderMap, query: Option<&str>) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        presented_token(headers, query).is_some_and(|presented| presented == *expected)
    }
}

/// Extract the client token: header, then query parameter, then cookie.
fn presented_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }

    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key == TOKEN_QUERY_PARAM {
                    return urlencoding::decode(value).ok().map(|v| v.into_owned());
                }
            }
        }
    }

    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for cookie in cookies.split(';') {
        if let Some((key, value)) = cookie.trim().split_once('=') {
            if key == TOKEN_COOKIE {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Axum middleware applying the token check and rate limit to every request.
pub async fn guard_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers();
    let query = request.uri().query();

    if !state.guard.token_ok(headers, query) {
        return Err(ApiError::Unauthorized);
    }

    let key = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let decision = state.guard.limiter.check(&key);
    if !decision.allowed {
        return Err(ApiError::RateLimited);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    fn guard(token: Option<&str>) -> AccessGuard {
        AccessGuard::new(token.map(String::from), RateLimitConfig::default())
    }

    #[test]
    fn test_no_token_configured_is_noop() {
        let guard = guard(None);
        assert!(guard.token_ok(&HeaderMap::new(), None));
    }

    #[test]
    fn test_header_token_accepted() {
        let guard = guard(Some("s3cret"));
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, "s3cret".parse().unwrap());
        assert!(guard.token_ok(&headers, None));

        headers.insert(TOKEN_HEADER, "wrong".parse().unwrap());
        assert!(!guard.token_ok(&headers, None));
    }

    #[test]
    fn test_query_token_accepted() {
        let guard = guard(Some("s3cret"));
        assert!(guard.token_ok(&HeaderMap::new(), Some("a=1&token=s3cret")));
        assert!(!guard.token_ok(&HeaderMap::new(), Some("token=nope")));
        assert!(!guard.token_ok(&HeaderMap::new(), None));
    }

    #[test]
    fn test_cookie_token_accepted() {
        let guard = guard(Some("s3cret"));
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "theme=dark; agentdeck_token=s3cret".parse().unwrap());
        assert!(guard.token_ok(&headers, None));
    }

    #[test]
    fn test_header_takes_precedence_over_query() {
        let guard = guard(Some("s3cret"));
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, "wrong".parse().unwrap());
        // Header is wrong; a correct query param must not rescue the request.
        assert!(!guard.token_ok(&headers, Some("token=s3cret")));
    }

    #[test]
    fn test_rate_limit_fixed_window() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 3,
            window: Duration::from_secs(60),
        });

        let decisions: Vec<RateDecision> =
            (0..4).map(|_| limiter.check("10.0.0.1")).collect();
        assert_eq!(
            decisions.iter().map(|d| d.allowed).collect::<Vec<_>>(),
            vec![true, true, true, false]
        );
        assert_eq!(
            decisions.iter().map(|d| d.remaining).collect::<Vec<_>>(),
            vec![2, 1, 0, 0]
        );

        // A different key has its own window.
        assert!(limiter.check("10.0.0.2").allowed);
    }

    #[test]
    fn test_rate_limit_window_rolls_over() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_millis(10),
        });
        assert!(limiter.check("k").allowed);
        assert!(!limiter.check("k").allowed);

        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.check("k").allowed);
    }

    #[test]
    fn test_purge_expired_bounds_memory() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 5,
            window: Duration::from_millis(10),
        });
        for i in 0..20 {
            limiter.check(&format!("client-{i}"));
        }
        assert_eq!(limiter.tracked_keys(), 20);

        std::thread::sleep(Duration::from_millis(15));
        limiter.purge_expired();
        assert_eq!(limiter.tracked_keys(), 0);
    }
}
