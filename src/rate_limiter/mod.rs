/*!
 * # Rate Limiting Module
 *
 * Fixed-window request throttling for the payment routes.
 *
 * Callers are keyed by the subject of a valid bearer token when one is
 * present, otherwise by client IP. Counters live in a [`DashMap`] in process
 * memory; a multi-instance deployment gets one budget per instance.
 *
 * ## Usage
 *
 * ```ignore
 * let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), Some(auth)));
 * let routes = Router::new()
 *     .route("/payments/verify", post(verify_payment))
 *     .layer(axum::middleware::from_fn_with_state(limiter, rate_limit_middleware));
 * ```
 */
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use metrics::counter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::auth::{bearer_token, AuthService};
use crate::config::AppConfig;
use crate::errors::ServiceError;

/// Numeric strings are always valid header values.
fn num_to_header_value<T: ToString>(n: T) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

impl RateLimitEntry {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn roll(&mut self, now: Instant, window_duration: Duration) {
        if now.duration_since(self.window_start) >= window_duration {
            self.count = 0;
            self.window_start = now;
        }
    }

    fn time_until_reset(&self, now: Instant, window_duration: Duration) -> Duration {
        window_duration.saturating_sub(now.duration_since(self.window_start))
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window_duration: Duration,
    pub enable_headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 30,
            window_duration: Duration::from_secs(60),
            enable_headers: true,
        }
    }
}

impl From<&AppConfig> for RateLimitConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            requests_per_window: config.rate_limit_requests_per_window,
            window_duration: Duration::from_secs(config.rate_limit_window_seconds),
            enable_headers: true,
        }
    }
}

#[derive(Debug)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: Duration,
}

impl RateLimitResult {
    fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("X-RateLimit-Limit", num_to_header_value(self.limit));
        headers.insert("X-RateLimit-Remaining", num_to_header_value(self.remaining));
        headers.insert(
            "X-RateLimit-Reset",
            num_to_header_value(self.reset_time.as_secs()),
        );
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    entries: DashMap<String, RateLimitEntry>,
    auth: Option<Arc<AuthService>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, auth: Option<Arc<AuthService>>) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            auth,
        }
    }

    /// Counts one request against `key`. Rejected requests are not counted.
    pub fn check_rate_limit(&self, key: &str) -> RateLimitResult {
        let now = Instant::now();
        let limit = self.config.requests_per_window;
        let window = self.config.window_duration;

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry::new(now));
        entry.roll(now, window);

        let allowed = entry.count < limit;
        if allowed {
            entry.count += 1;
        }

        RateLimitResult {
            allowed,
            limit,
            remaining: limit.saturating_sub(entry.count),
            reset_time: entry.time_until_reset(now, window),
        }
    }

    /// Drops windows that have fully elapsed.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let window = self.config.window_duration;
        self.entries
            .retain(|_, entry| now.duration_since(entry.window_start) < window);
    }

    fn key_for(&self, request: &Request) -> String {
        let authorization = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        if let (Some(auth), Some(token)) = (self.auth.as_ref(), bearer_token(authorization)) {
            if let Ok(claims) = auth.validate_token(token) {
                return format!("user:{}", claims.sub);
            }
        }

        let connect = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        match extract_client_ip(request.headers(), connect) {
            Some(ip) => format!("ip:{}", ip),
            None => "ip:unknown".to_string(),
        }
    }
}

/// Client address from proxy headers, falling back to the socket peer.
pub fn extract_client_ip(headers: &HeaderMap, connect: Option<SocketAddr>) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = forwarded.split(',').next().map(str::trim) {
            if !ip.is_empty() {
                return Some(ip.to_string());
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let ip = real_ip.trim();
        if !ip.is_empty() {
            return Some(ip.to_string());
        }
    }

    connect.map(|addr| addr.ip().to_string())
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = limiter.key_for(&request);
    let result = limiter.check_rate_limit(&key);

    if !result.allowed {
        warn!(%key, path = %request.uri().path(), "rate limit exceeded");
        counter!("storefront.rate_limited", 1);
        let mut response = ServiceError::RateLimitExceeded.into_response();
        if limiter.config.enable_headers {
            result.apply_headers(response.headers_mut());
        }
        return response;
    }

    debug!(%key, remaining = result.remaining, "rate limit check passed");
    let mut response = next.run(request).await;
    if limiter.config.enable_headers {
        result.apply_headers(response.headers_mut());
    }
    response
}
