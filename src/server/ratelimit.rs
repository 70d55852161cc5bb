//! Rate limiting middleware
//!
//! Per-client IP, per-namespace fixed-window counters.
//!
//! - Each namespace ("public", "upload", ...) has its own per-minute limit
//! - A request is allowed while `count < per_minute + burst` in the window
//! - A window resets on the first request after it expires
//! - A sweep evicts windows idle for more than twice the window length
//! - A per-minute limit of zero disables limiting for that namespace

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Namespace for public media reads
pub const NAMESPACE_PUBLIC: &str = "public";

/// Namespace for ingestion endpoints
pub const NAMESPACE_UPLOAD: &str = "upload";

/// Default limit for public reads (requests per minute)
pub const DEFAULT_PUBLIC_PER_MINUTE: u32 = 120;

/// Default limit for uploads (requests per minute)
pub const DEFAULT_UPLOAD_PER_MINUTE: u32 = 10;

/// Default burst allowance on top of the per-minute limit
pub const DEFAULT_BURST: u32 = 5;

/// Window length
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Rate limit errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Rate limit exceeded")]
    LimitExceeded { retry_after_secs: u64 },
}

/// Counter for one (IP, namespace) pair
#[derive(Debug, Clone)]
struct Window {
    started: Instant,
    count: u32,
    last_seen: Instant,
}

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Per-minute limit for each namespace; unknown namespaces are unlimited
    pub per_minute: HashMap<String, u32>,
    /// Extra requests allowed above the per-minute limit
    pub burst: u32,
    /// Window length
    pub window: Duration,
    /// Trusted proxy headers for client IP extraction
    pub trust_proxy_headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut per_minute = HashMap::new();
        per_minute.insert(NAMESPACE_PUBLIC.to_string(), DEFAULT_PUBLIC_PER_MINUTE);
        per_minute.insert(NAMESPACE_UPLOAD.to_string(), DEFAULT_UPLOAD_PER_MINUTE);
        RateLimitConfig {
            per_minute,
            burst: DEFAULT_BURST,
            window: DEFAULT_WINDOW,
            trust_proxy_headers: false,
        }
    }
}

impl RateLimitConfig {
    /// Set the per-minute limit for a namespace
    pub fn with_limit(mut self, namespace: impl Into<String>, per_minute: u32) -> Self {
        self.per_minute.insert(namespace.into(), per_minute);
        self
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Allowed requests per window for `namespace`; `None` means unlimited
    pub fn allowance(&self, namespace: &str) -> Option<u32> {
        match self.per_minute.get(namespace) {
            Some(0) | None => None,
            Some(limit) => Some(limit.saturating_add(self.burst)),
        }
    }
}

/// Rate limiter state
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<(IpAddr, String), Window>>>,
    config: Arc<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            windows: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    /// Check if a request from `client_ip` in `namespace` is allowed
    pub fn check(&self, client_ip: IpAddr, namespace: &str) -> Result<(), RateLimitError> {
        self.check_at(client_ip, namespace, Instant::now())
    }

    fn check_at(
        &self,
        client_ip: IpAddr,
        namespace: &str,
        now: Instant,
    ) -> Result<(), RateLimitError> {
        let Some(allowance) = self.config.allowance(namespace) else {
            return Ok(());
        };

        let mut windows = self.windows.lock();
        let window = windows
            .entry((client_ip, namespace.to_string()))
            .or_insert_with(|| Window {
                started: now,
                count: 0,
                last_seen: now,
            });

        if now.duration_since(window.started) >= self.config.window {
            window.started = now;
            window.count = 0;
        }
        window.last_seen = now;

        if window.count < allowance {
            window.count += 1;
            Ok(())
        } else {
            let elapsed = now.duration_since(window.started);
            let retry_after = self.config.window.saturating_sub(elapsed);
            Err(RateLimitError::LimitExceeded {
                retry_after_secs: retry_after.as_secs().max(1),
            })
        }
    }

    /// Evict windows idle for longer than twice the window length
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let idle_limit = self.config.window * 2;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.last_seen) <= idle_limit);
        let evicted = before - windows.len();
        debug!(
            evicted,
            remaining = windows.len(),
            "Rate limiter sweep"
        );
        evicted
    }

    /// Run [`sweep`](Self::sweep) once per window until `cancel` fires
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.config.window);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        limiter.sweep();
                    }
                }
            }
        })
    }

    /// Number of live windows
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

/// Middleware state: a limiter bound to one namespace
#[derive(Clone)]
pub struct NamespaceLimiter {
    pub limiter: RateLimiter,
    pub namespace: &'static str,
}

impl NamespaceLimiter {
    pub fn new(limiter: RateLimiter, namespace: &'static str) -> Self {
        Self { limiter, namespace }
    }
}

/// Extract client IP from request
fn extract_client_ip(
    remote_addr: Option<SocketAddr>,
    headers: &axum::http::HeaderMap,
    trust_proxy: bool,
) -> Option<IpAddr> {
    if trust_proxy {
        if let Some(xff) = headers.get("x-forwarded-for") {
            if let Ok(xff_str) = xff.to_str() {
                // Leftmost entry is the original client
                if let Some(ip_str) = xff_str.split(',').next() {
                    if let Ok(ip) = ip_str.trim().parse::<IpAddr>() {
                        return Some(ip);
                    }
                }
            }
        }

        if let Some(real_ip) = headers.get("x-real-ip") {
            if let Ok(ip_str) = real_ip.to_str() {
                if let Ok(ip) = ip_str.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    remote_addr.map(|addr| addr.ip())
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(state): State<NamespaceLimiter>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let config = state.limiter.config();
    let Some(allowance) = config.allowance(state.namespace) else {
        return next.run(request).await;
    };

    let remote_addr = connect_info.map(|ci| ci.0);
    let client_ip =
        match extract_client_ip(remote_addr, request.headers(), config.trust_proxy_headers) {
            Some(ip) => ip,
            None => {
                warn!(target: "http", "Rate limit: could not determine client IP");
                return next.run(request).await;
            }
        };

    match state.limiter.check(client_ip, state.namespace) {
        Ok(()) => {
            let mut response = next.run(request).await;
            if let Ok(value) = HeaderValue::from_str(&allowance.to_string()) {
                response.headers_mut().insert("x-ratelimit-limit", value);
            }
            response
        }
        Err(RateLimitError::LimitExceeded { retry_after_secs }) => {
            warn!(
                target: "http",
                client_ip = %client_ip,
                namespace = state.namespace,
                path = %request.uri().path(),
                "Rate limit exceeded"
            );
            rate_limit_exceeded_response(retry_after_secs)
        }
    }
}

/// Generate rate limit exceeded response
fn rate_limit_exceeded_response(retry_after_secs: u64) -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::CONTENT_TYPE, "application/json; charset=utf-8"),
            (header::RETRY_AFTER, &retry_after_secs.to_string()),
        ],
        format!(
            r#"{{"error":{{"code":"RATE_LIMIT_EXCEEDED","message":"Too many requests","retryAfter":{}}}}}"#,
            retry_after_secs
        ),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn limiter(per_minute: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig::default()
                .with_limit("test", per_minute)
                .with_burst(burst),
        )
    }

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));

    #[test]
    fn test_allows_limit_plus_burst() {
        let limiter = limiter(3, 2);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.check_at(IP, "test", now).is_ok());
        }
        assert!(matches!(
            limiter.check_at(IP, "test", now),
            Err(RateLimitError::LimitExceeded { .. })
        ));
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let limiter = limiter(1, 0);
        let start = Instant::now();
        assert!(limiter.check_at(IP, "test", start).is_ok());
        assert!(limiter.check_at(IP, "test", start + Duration::from_secs(59)).is_err());
        assert!(limiter.check_at(IP, "test", start + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn test_retry_after_counts_down() {
        let limiter = limiter(1, 0);
        let start = Instant::now();
        limiter.check_at(IP, "test", start).unwrap();
        let err = limiter
            .check_at(IP, "test", start + Duration::from_secs(45))
            .unwrap_err();
        assert_eq!(err, RateLimitError::LimitExceeded { retry_after_secs: 15 });
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let limiter = RateLimiter::new(
            RateLimitConfig::default()
                .with_limit("a", 1)
                .with_limit("b", 1)
                .with_burst(0),
        );
        let now = Instant::now();
        assert!(limiter.check_at(IP, "a", now).is_ok());
        assert!(limiter.check_at(IP, "a", now).is_err());
        assert!(limiter.check_at(IP, "b", now).is_ok());
    }

    #[test]
    fn test_per_ip() {
        let limiter = limiter(1, 0);
        let other = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2));
        let now = Instant::now();
        assert!(limiter.check_at(IP, "test", now).is_ok());
        assert!(limiter.check_at(IP, "test", now).is_err());
        assert!(limiter.check_at(other, "test", now).is_ok());
    }

    #[test]
    fn test_zero_limit_disables() {
        let limiter = limiter(0, 0);
        for _ in 0..1000 {
            assert!(limiter.check(IP, "test").is_ok());
        }
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn test_unknown_namespace_unlimited() {
        let limiter = limiter(1, 0);
        for _ in 0..10 {
            assert!(limiter.check(IP, "elsewhere").is_ok());
        }
    }

    #[test]
    fn test_sweep_evicts_idle_windows() {
        let limiter = limiter(10, 0);
        let start = Instant::now();
        let other = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        limiter.check_at(IP, "test", start).unwrap();
        limiter
            .check_at(other, "test", start + Duration::from_secs(100))
            .unwrap();

        assert_eq!(limiter.sweep_at(start + Duration::from_secs(120)), 0);
        assert_eq!(limiter.sweep_at(start + Duration::from_secs(121)), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn test_extract_client_ip_direct() {
        let headers = axum::http::HeaderMap::new();
        let addr = Some(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            12345,
        ));

        let ip = extract_client_ip(addr, &headers, false);
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
    }

    #[test]
    fn test_extract_client_ip_xff() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.50, 70.41.3.18".parse().unwrap(),
        );
        let addr = Some(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            12345,
        ));

        let ip = extract_client_ip(addr, &headers, false);
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));

        let ip = extract_client_ip(addr, &headers, true);
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 50))));
    }

    #[test]
    fn test_extract_client_ip_real_ip() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert("x-real-ip", "203.0.113.100".parse().unwrap());
        let addr = Some(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            12345,
        ));

        let ip = extract_client_ip(addr, &headers, true);
        assert_eq!(ip, Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 100))));
    }
}
