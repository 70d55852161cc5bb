//! SSRF address policy
//!
//! Decides whether a URL or a resolved address may be contacted by the
//! fetcher. Blocks:
//! - IPv4 private ranges: 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
//! - IPv4 loopback 127.0.0.0/8, link-local 169.254.0.0/16, 0.0.0.0/8
//! - IPv4 CGNAT 100.64.0.0/10
//! - IPv4 documentation, multicast and reserved ranges
//! - IPv6 loopback, unspecified, ULA fc00::/7, link-local fe80::/10, multicast
//! - IPv4-mapped IPv6 addresses whose IPv4 part is blocked
//! - Cloud metadata hostnames
//!
//! URL checks alone are not enough: the fetcher must also resolve the host
//! and run [`validate_resolved`] on every answer before connecting.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// SSRF policy violations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SsrfError {
    #[error("blocked request to {0}")]
    Blocked(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("scheme not allowed: {0} (only http/https)")]
    SchemeNotAllowed(String),

    #[error("resolution failed for {0}")]
    ResolutionFailed(String),
}

/// Check a URL before any network activity: scheme, literal hosts, and
/// literal IP addresses.
pub fn validate_url(url: &url::Url) -> Result<(), SsrfError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(SsrfError::SchemeNotAllowed(scheme.to_string())),
    }

    let host = match url.host() {
        Some(host) => host,
        None => return Err(SsrfError::InvalidUrl("URL has no host".to_string())),
    };

    match host {
        url::Host::Domain(domain) => {
            if is_localhost_name(domain) || is_metadata_name(domain) {
                return Err(SsrfError::Blocked(domain.to_string()));
            }
        }
        url::Host::Ipv4(ip) => {
            if is_blocked_ip(&IpAddr::V4(ip)) {
                return Err(SsrfError::Blocked(ip.to_string()));
            }
        }
        url::Host::Ipv6(ip) => {
            if is_blocked_ip(&IpAddr::V6(ip)) {
                return Err(SsrfError::Blocked(ip.to_string()));
            }
        }
    }

    Ok(())
}

/// Validate every resolved address for `host` and return the one to pin.
///
/// An empty answer fails closed. A single blocked address among several
/// blocks the whole request.
pub fn validate_resolved(host: &str, addrs: &[IpAddr]) -> Result<IpAddr, SsrfError> {
    let first = *addrs
        .first()
        .ok_or_else(|| SsrfError::ResolutionFailed(host.to_string()))?;

    if let Some(bad) = addrs.iter().find(|ip| is_blocked_ip(ip)) {
        return Err(SsrfError::Blocked(format!("{} resolved to {}", host, bad)));
    }

    Ok(first)
}

fn is_localhost_name(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == "localhost" || host == "localhost.localdomain" || host.ends_with(".localhost")
}

fn is_metadata_name(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == "metadata"
        || host == "metadata.google.internal"
        || host == "instance-data"
        || host.ends_with(".internal")
}

/// Whether an address falls in any blocked range.
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();

    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        // 0.0.0.0/8
        || octets[0] == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (octets[0] == 100 && (64..=127).contains(&octets[1]))
        // 192.0.0.0/24 IETF protocol assignments
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // TEST-NET-1/2/3
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 2)
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100)
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)
        // 198.18.0.0/15 benchmarking
        || (octets[0] == 198 && (18..=19).contains(&octets[1]))
        // 240.0.0.0/4 reserved
        || octets[0] >= 240
}

fn is_blocked_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(&v4);
    }

    let segments = ip.segments();

    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fe80::/10 link-local
        || (segments[0] & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
}
