//! Media fetch with SSRF protection
//!
//! Each fetch runs `resolve -> validate -> connect (pinned) -> stream with cap`:
//! - HTTP/HTTPS only, literal hosts checked against the SSRF policy
//! - the hostname is resolved once and every answer is validated
//! - the connection is pinned to the first validated address through a
//!   custom resolver, so nothing re-resolves between check and connect
//! - redirects are disabled
//! - `Content-Length` above the cap is rejected before reading; the body is
//!   streamed under the same cap
//!
//! The underlying `reqwest::Client` is cached and rebuilt only when the proxy
//! or TLS-verification setting changes, so connection pooling survives across
//! requests and configuration reloads.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::Client;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::ssrf::{self, SsrfError};

/// Maximum URL length (2KB)
pub const MAX_URL_LENGTH: usize = 2048;

/// Default overall fetch timeout (30s)
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default TCP connect + TLS handshake timeout (10s)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed until response headers arrive (15s)
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(15);

/// Default maximum response size (50MB)
pub const DEFAULT_MAX_SIZE: u64 = 50 * 1024 * 1024;

/// Errors that can occur during media fetch
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("SSRF protection: {0}")]
    Ssrf(#[from] SsrfError),

    #[error("URL too long: {size} chars (max {max})")]
    UrlTooLong { size: usize, max: usize },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    #[error("HTTP request failed: {0}")]
    HttpRequest(String),

    #[error("Remote server returned status {0}")]
    Status(u16),

    #[error("Response too large: {size} bytes (max {max})")]
    ResponseTooLarge { size: u64, max: u64 },

    #[error("Stream read error: {0}")]
    StreamRead(String),

    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Fetch cancelled")]
    Cancelled,
}

/// Result of a successful media fetch
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub bytes: Vec<u8>,

    /// Content-Type from response headers, if present
    pub content_type: Option<String>,

    /// The address the connection was pinned to (None when proxied)
    pub pinned_ip: Option<IpAddr>,
}

/// Per-call fetch settings. Read from the live configuration on every call.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Maximum response size in bytes
    pub max_size: u64,
    /// Governs resolution, connect, and the full body read
    pub timeout: Duration,
    /// TCP connect + TLS handshake
    pub connect_timeout: Duration,
    /// Time until response headers arrive
    pub header_timeout: Duration,
    /// Outbound proxy URL
    pub proxy: Option<String>,
    /// Skip TLS certificate verification
    pub insecure_tls: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            timeout: DEFAULT_FETCH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            proxy: None,
            insecure_tls: false,
        }
    }
}

impl FetchConfig {
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }
}

/// Hostname lookup used by the fetcher.
pub trait HostLookup: Send + Sync {
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, String>>;
}

/// DNS lookup through hickory, using the system configuration when readable.
#[derive(Default)]
pub struct DnsLookup {
    resolver: OnceLock<TokioAsyncResolver>,
}

impl DnsLookup {
    fn resolver(&self) -> &TokioAsyncResolver {
        self.resolver.get_or_init(|| {
            TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            })
        })
    }
}

impl HostLookup for DnsLookup {
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, String>> {
        Box::pin(async move {
            let lookup = self
                .resolver()
                .lookup_ip(host)
                .await
                .map_err(|e| format!("{}: {}", host, e))?;
            Ok(lookup.iter().collect())
        })
    }
}

/// Host -> validated address pins shared with the client's resolver.
#[derive(Default)]
struct PinTable {
    pins: Mutex<HashMap<String, (IpAddr, usize)>>,
}

impl PinTable {
    fn pin(self: &Arc<Self>, host: &str, ip: IpAddr) -> PinGuard {
        let mut pins = self.pins.lock();
        let entry = pins.entry(host.to_string()).or_insert((ip, 0));
        entry.0 = ip;
        entry.1 += 1;
        PinGuard {
            table: Arc::clone(self),
            host: host.to_string(),
        }
    }

    fn get(&self, host: &str) -> Option<IpAddr> {
        self.pins.lock().get(host).map(|(ip, _)| *ip)
    }
}

struct PinGuard {
    table: Arc<PinTable>,
    host: String,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut pins = self.table.pins.lock();
        if let Some(entry) = pins.get_mut(&self.host) {
            entry.1 -= 1;
            if entry.1 == 0 {
                pins.remove(&self.host);
            }
        }
    }
}

/// Resolver installed into the cached client. It only hands out pinned
/// addresses; the configured proxy host is the one name it resolves itself.
struct PinnedResolver {
    pins: Arc<PinTable>,
    proxy_host: Option<String>,
}

impl Resolve for PinnedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        let pinned = self.pins.get(&host);
        let is_proxy = self.proxy_host.as_deref() == Some(host.as_str());

        Box::pin(async move {
            if let Some(ip) = pinned {
                let addrs: Addrs = Box::new(std::iter::once(SocketAddr::new(ip, 0)));
                return Ok(addrs);
            }
            if is_proxy {
                let resolved: Vec<SocketAddr> =
                    tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
                let addrs: Addrs = Box::new(resolved.into_iter());
                return Ok(addrs);
            }
            Err(format!("refusing to resolve unvalidated host {}", host).into())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TransportKey {
    proxy: Option<String>,
    insecure_tls: bool,
}

struct Transport {
    key: TransportKey,
    client: Client,
}

/// Media fetcher with SSRF protection
pub struct MediaFetcher {
    lookup: Arc<dyn HostLookup>,
    pins: Arc<PinTable>,
    transport: Mutex<Option<Transport>>,
    builds: AtomicUsize,
}

impl Default for MediaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MediaFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaFetcher")
            .field("transport_builds", &self.transport_builds())
            .finish()
    }
}

impl MediaFetcher {
    pub fn new() -> Self {
        Self::with_lookup(Arc::new(DnsLookup::default()))
    }

    pub fn with_lookup(lookup: Arc<dyn HostLookup>) -> Self {
        Self {
            lookup,
            pins: Arc::new(PinTable::default()),
            transport: Mutex::new(None),
            builds: AtomicUsize::new(0),
        }
    }

    /// Number of times the HTTP transport has been (re)built.
    pub fn transport_builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    /// Fetch `url` under `config`, aborting early if `cancel` fires.
    pub async fn fetch(
        &self,
        url: &str,
        config: &FetchConfig,
        cancel: &CancellationToken,
    ) -> Result<FetchResult, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = tokio::time::timeout(config.timeout, self.fetch_inner(url, config)) => {
                result.map_err(|_| FetchError::Timeout(config.timeout))?
            }
        }
    }

    async fn fetch_inner(&self, url: &str, config: &FetchConfig) -> Result<FetchResult, FetchError> {
        if url.len() > MAX_URL_LENGTH {
            return Err(FetchError::UrlTooLong {
                size: url.len(),
                max: MAX_URL_LENGTH,
            });
        }

        let parsed =
            url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", url, e)))?;
        ssrf::validate_url(&parsed)?;

        let host = parsed
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl("URL has no host".to_string()))?
            .to_string();

        // Literal IPs were already checked by validate_url.
        let pin = match parsed.host() {
            Some(url::Host::Domain(domain)) => {
                let ip = self.resolve_host(domain).await?;
                tracing::debug!(
                    target: "fetch",
                    host = %host,
                    resolved_ip = %ip,
                    "DNS resolved and validated"
                );
                Some((self.pins.pin(&host, ip), ip))
            }
            _ => None,
        };
        let pinned_ip = if config.proxy.is_some() {
            None
        } else {
            pin.as_ref().map(|(_, ip)| *ip)
        };

        let client = self.client(config)?;

        let response = tokio::time::timeout(config.header_timeout, client.get(parsed).send())
            .await
            .map_err(|_| FetchError::Timeout(config.header_timeout))?
            .map_err(|e| FetchError::HttpRequest(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        if let Some(content_length) = response.content_length() {
            if content_length > config.max_size {
                return Err(FetchError::ResponseTooLarge {
                    size: content_length,
                    max: config.max_size,
                });
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = read_body_with_limit(response.bytes_stream(), config.max_size).await?;

        Ok(FetchResult {
            bytes,
            content_type,
            pinned_ip,
        })
    }

    /// Resolve `host` and validate every answer. Returns the address to pin.
    async fn resolve_host(&self, host: &str) -> Result<IpAddr, FetchError> {
        let addrs = self
            .lookup
            .lookup(host)
            .await
            .map_err(FetchError::DnsResolution)?;

        ssrf::validate_resolved(host, &addrs).map_err(|e| {
            tracing::warn!(
                target: "security",
                host = %host,
                addrs = ?addrs,
                error = %e,
                "Blocked fetch target"
            );
            FetchError::from(e)
        })
    }

    /// Return the cached client, rebuilding it if proxy or TLS settings changed.
    fn client(&self, config: &FetchConfig) -> Result<Client, FetchError> {
        let key = TransportKey {
            proxy: config.proxy.clone(),
            insecure_tls: config.insecure_tls,
        };

        let mut transport = self.transport.lock();
        if let Some(existing) = transport.as_ref() {
            if existing.key == key {
                return Ok(existing.client.clone());
            }
        }

        let client = self.build_client(&key, config)?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            target: "fetch",
            proxy = ?key.proxy,
            insecure_tls = key.insecure_tls,
            "Built HTTP transport"
        );
        *transport = Some(Transport {
            key,
            client: client.clone(),
        });
        Ok(client)
    }

    fn build_client(&self, key: &TransportKey, config: &FetchConfig) -> Result<Client, FetchError> {
        let proxy_host = match &key.proxy {
            Some(proxy) => Some(
                url::Url::parse(proxy)
                    .ok()
                    .and_then(|u| u.host_str().map(|h| h.to_string()))
                    .ok_or_else(|| FetchError::InvalidUrl(format!("invalid proxy URL: {}", proxy)))?,
            ),
            None => None,
        };

        let resolver = PinnedResolver {
            pins: Arc::clone(&self.pins),
            proxy_host,
        };

        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(key.insecure_tls)
            .user_agent(concat!("linkwall/", env!("CARGO_PKG_VERSION")))
            .dns_resolver(Arc::new(resolver));

        builder = match &key.proxy {
            Some(proxy) => builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| FetchError::InvalidUrl(format!("invalid proxy URL: {}", e)))?,
            ),
            None => builder.no_proxy(),
        };

        builder
            .build()
            .map_err(|e| FetchError::HttpRequest(format!("Failed to create HTTP client: {}", e)))
    }
}

/// Read a body stream, failing as soon as it grows past `max_size`.
async fn read_body_with_limit<S, E>(stream: S, max_size: u64) -> Result<Vec<u8>, FetchError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut body = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::StreamRead(e.to_string()))?;

        let new_size = body.len() as u64 + chunk.len() as u64;
        if new_size > max_size {
            return Err(FetchError::ResponseTooLarge {
                size: new_size,
                max: max_size,
            });
        }

        body.extend_from_slice(&chunk);
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticLookup(HashMap<&'static str, Vec<IpAddr>>);

    impl HostLookup for StaticLookup {
        fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>, String>> {
            let result = self
                .0
                .get(host)
                .cloned()
                .ok_or_else(|| format!("{}: no record", host));
            Box::pin(async move { result })
        }
    }

    fn fetcher_with(records: &[(&'static str, &[&str])]) -> MediaFetcher {
        let map = records
            .iter()
            .map(|(host, ips)| (*host, ips.iter().map(|ip| ip.parse().unwrap()).collect()))
            .collect();
        MediaFetcher::with_lookup(Arc::new(StaticLookup(map)))
    }

    fn quick_config() -> FetchConfig {
        FetchConfig::default().with_timeout(Duration::from_secs(2))
    }

    #[test]
    fn test_fetch_config_defaults() {
        let config = FetchConfig::default();
        assert_eq!(config.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(config.timeout, DEFAULT_FETCH_TIMEOUT);
        assert!(config.connect_timeout < config.timeout);
        assert!(config.header_timeout < config.timeout);
        assert!(config.proxy.is_none());
        assert!(!config.insecure_tls);
    }

    #[tokio::test]
    async fn test_resolution_to_private_addresses_is_blocked() {
        let fetcher = fetcher_with(&[
            ("loop.test", &["127.0.0.1"]),
            ("ten.test", &["10.0.0.1"]),
            ("meta.test", &["169.254.169.254"]),
            ("v6loop.test", &["::1"]),
            ("mixed.test", &["93.184.216.34", "192.168.0.10"]),
        ]);
        let cancel = CancellationToken::new();

        for host in ["loop.test", "ten.test", "meta.test", "v6loop.test", "mixed.test"] {
            let result = fetcher
                .fetch(&format!("https://{}/a.png", host), &quick_config(), &cancel)
                .await;
            assert!(
                matches!(result, Err(FetchError::Ssrf(SsrfError::Blocked(_)))),
                "{} not blocked: {:?}",
                host,
                result
            );
        }
    }

    #[tokio::test]
    async fn test_unresolvable_host_fails_closed() {
        let fetcher = fetcher_with(&[("empty.test", &[])]);
        let cancel = CancellationToken::new();

        let result = fetcher
            .fetch("https://nowhere.test/a.png", &quick_config(), &cancel)
            .await;
        assert!(matches!(result, Err(FetchError::DnsResolution(_))));

        let result = fetcher
            .fetch("https://empty.test/a.png", &quick_config(), &cancel)
            .await;
        assert!(matches!(
            result,
            Err(FetchError::Ssrf(SsrfError::ResolutionFailed(_)))
        ));
    }

    #[tokio::test]
    async fn test_public_resolution_is_allowed() {
        let fetcher = fetcher_with(&[("public.test", &["93.184.216.34", "1.1.1.1"])]);
        let ip = fetcher.resolve_host("public.test").await.unwrap();
        assert_eq!(ip, "93.184.216.34".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_literal_private_targets_never_resolve() {
        let fetcher = fetcher_with(&[]);
        let cancel = CancellationToken::new();
        for url in [
            "http://127.0.0.1/a.png",
            "http://[::1]/a.png",
            "http://169.254.169.254/latest/meta-data/",
            "http://localhost/a.png",
        ] {
            let result = fetcher.fetch(url, &quick_config(), &cancel).await;
            assert!(matches!(result, Err(FetchError::Ssrf(_))), "{}", url);
        }
    }

    #[tokio::test]
    async fn test_url_too_long() {
        let fetcher = fetcher_with(&[]);
        let long_url = format!("https://example.com/{}", "x".repeat(MAX_URL_LENGTH));
        let result = fetcher
            .fetch(&long_url, &quick_config(), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(FetchError::UrlTooLong { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_fetch() {
        let fetcher = fetcher_with(&[]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        // The lookup fails at once too; cancellation must still win every time.
        for _ in 0..50 {
            let result = fetcher
                .fetch("https://example.com/a.png", &quick_config(), &cancel)
                .await;
            assert!(matches!(result, Err(FetchError::Cancelled)), "{:?}", result);
        }
    }

    #[test]
    fn test_transport_rebuilt_only_on_proxy_or_tls_change() {
        let fetcher = fetcher_with(&[]);
        let base = FetchConfig::default();

        fetcher.client(&base).unwrap();
        fetcher.client(&base.clone().with_timeout(Duration::from_secs(5))).unwrap();
        assert_eq!(fetcher.transport_builds(), 1);

        let proxied = base
            .clone()
            .with_proxy(Some("http://proxy.example:3128".to_string()));
        fetcher.client(&proxied).unwrap();
        fetcher.client(&proxied).unwrap();
        assert_eq!(fetcher.transport_builds(), 2);

        fetcher.client(&proxied.clone().with_insecure_tls(true)).unwrap();
        assert_eq!(fetcher.transport_builds(), 3);

        fetcher.client(&base).unwrap();
        assert_eq!(fetcher.transport_builds(), 4);
    }

    #[test]
    fn test_pin_table_refcounts() {
        let table = Arc::new(PinTable::default());
        let ip: IpAddr = "93.184.216.34".parse().unwrap();
        let a = table.pin("example.com", ip);
        let b = table.pin("example.com", ip);
        drop(a);
        assert_eq!(table.get("example.com"), Some(ip));
        drop(b);
        assert_eq!(table.get("example.com"), None);
    }

    #[tokio::test]
    async fn test_body_limit_enforced_while_streaming() {
        fn chunks() -> Vec<Result<Bytes, std::io::Error>> {
            vec![
                Ok(Bytes::from_static(b"12345")),
                Ok(Bytes::from_static(b"67890")),
            ]
        }
        let body = read_body_with_limit(futures_util::stream::iter(chunks()), 10)
            .await
            .unwrap();
        assert_eq!(body, b"1234567890");

        let result = read_body_with_limit(futures_util::stream::iter(chunks()), 9).await;
        assert!(matches!(
            result,
            Err(FetchError::ResponseTooLarge { size: 10, max: 9 })
        ));
    }

    #[tokio::test]
    async fn test_body_stream_error_surfaces() {
        let chunks = vec![
            Ok(Bytes::from_static(b"12345")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "reset")),
        ];
        let result = read_body_with_limit(futures_util::stream::iter(chunks), 100).await;
        assert!(matches!(result, Err(FetchError::StreamRead(_))));
    }
}
