//! Server module
//!
//! HTTP surface plus the two admission controls in front of ingestion.

pub mod http;
pub mod ratelimit;
pub mod upload_gate;

pub use http::{create_router, serve, ApiError, AppState};
pub use ratelimit::{RateLimitConfig, RateLimitError, RateLimiter};
pub use upload_gate::{GateError, UploadGate, UploadPermit};
