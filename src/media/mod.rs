//! Media pipeline building blocks
//!
//! - **kind**: the closed set of accepted formats and their signatures
//! - **validate**: path, signature, slot-name and category checks
//! - **ssrf**: address policy for outbound fetches
//! - **fetch**: SSRF-safe HTTP fetch
//!   - DNS resolution with validation of every answer
//!   - connection pinned to the validated address (no DNS rebinding)
//!   - redirects disabled, size-capped streaming, layered timeouts
//!   - cached transport rebuilt only on proxy/TLS changes
//! - **transform**: dimension guard, canonical re-encode, JPEG previews
//!
//! # Example
//!
//! ```ignore
//! use linkwall::media::{FetchConfig, MediaFetcher, MediaKind, transform};
//!
//! let fetcher = MediaFetcher::new();
//! let result = fetcher.fetch("https://example.com/a.png", &FetchConfig::default(), &cancel).await?;
//! let kind = validate::validate_content_matches_extension(&result.bytes, "png")?;
//! let out = transform::transform(result.bytes, kind, &TransformConfig::default())?;
//! ```

pub mod fetch;
pub mod kind;
pub mod ssrf;
pub mod transform;
pub mod validate;

pub use fetch::{
    DnsLookup, FetchConfig, FetchError, FetchResult, HostLookup, MediaFetcher,
    DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_SIZE, MAX_URL_LENGTH,
};
pub use kind::{MediaKind, StoreStrategy};
pub use ssrf::SsrfError;
pub use transform::{TransformConfig, TransformError, TransformOutput, MAX_DIMENSION};
pub use validate::ValidationError;
