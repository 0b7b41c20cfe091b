//! Client IP extraction for the rate-limit key.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! `X-Forwarded-For` and `X-Real-IP` are client-controlled unless a reverse
//! proxy overwrites them. Configure `TRUSTED_PROXIES` with the proxy's CIDR
//! ranges: forwarding headers are then only honored when the TCP peer (from
//! axum's `ConnectInfo`) is inside one of those ranges, and the peer address is
//! used otherwise.
//!
//! With no trusted proxies configured the forwarding headers are ignored and
//! the peer address is the key. `TRUSTED_PROXIES=*` trusts every source, which
//! lets a client rotate spoofed IPs to escape its bucket. Only acceptable in
//! development.
//!
//! ## The "unknown" Fallback
//!
//! When neither a peer address nor a trusted header is available, all such
//! requests share the [`UNKNOWN_IP`] bucket.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Fallback key when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse a CIDR notation string (e.g., "10.0.0.0/8" or "::1/128").
    ///
    /// A bare address is treated as /32 (or /128). Returns `None` if invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(p) => p.parse().ok().filter(|p| *p <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    /// Check if an IP address is contained within this CIDR range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// `TRUSTED_PROXIES` entry that trusts forwarding headers from any source.
pub const TRUST_ALL_PROXIES: &str = "*";

/// Networks whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
    trust_all: bool,
}

impl TrustedProxyConfig {
    /// Invalid CIDR strings are logged as warnings and skipped. A
    /// [`TRUST_ALL_PROXIES`] entry trusts every source.
    pub fn new(cidrs: &[String]) -> Self {
        let trust_all = cidrs.iter().any(|c| c.trim() == TRUST_ALL_PROXIES);
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter(|c| c.trim() != TRUST_ALL_PROXIES)
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if trust_all {
            warn!("TRUSTED_PROXIES=* trusts forwarding headers from every source");
        } else if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges, trust_all }
    }

    /// Forwarding headers are believed without a known peer.
    pub fn trusts_all(&self) -> bool {
        self.trust_all
    }

    /// `true` if every source is trusted or `ip` is inside a configured range.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trust_all || self.ranges.iter().any(|range| range.contains(ip))
    }
}

// =============================================================================
// Extraction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp<'a> {
    FromXff(&'a str),
    FromRealIp(&'a str),
    NotFound,
}

/// First non-empty forwarding header value. No allocations.
#[inline]
fn extract_ip_from_headers<B>(req: &Request<B>) -> ExtractedIp<'_> {
    // Format: "client, proxy1, proxy2" - the first entry is the client
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return ExtractedIp::FromXff(first_ip);
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return ExtractedIp::FromRealIp(value.trim());
    }

    ExtractedIp::NotFound
}

fn peer_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Client IP used as the rate-limit key.
///
/// # Resolution Order
///
/// 1. `X-Forwarded-For` (first entry), then `X-Real-IP`, when the TCP peer is
///    a trusted proxy. Without a known peer only [`TRUST_ALL_PROXIES`] allows
///    the headers.
/// 2. The peer address, if known.
/// 3. [`UNKNOWN_IP`].
///
/// Returns `Cow::Borrowed` for the "unknown" case.
pub fn client_ip<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> Cow<'static, str> {
    let peer = peer_ip(req);
    let honor_headers = match peer {
        Some(peer) => trusted_proxies.is_trusted(&peer),
        None => trusted_proxies.trusts_all(),
    };

    match extract_ip_from_headers(req) {
        ExtractedIp::FromXff(ip) | ExtractedIp::FromRealIp(ip) if honor_headers => {
            return Cow::Owned(ip.to_string());
        }
        ExtractedIp::FromXff(_) | ExtractedIp::FromRealIp(_) => {
            debug!(peer = ?peer, "Ignoring forwarding headers from untrusted source");
        }
        ExtractedIp::NotFound => {}
    }

    match peer {
        Some(peer) => Cow::Owned(peer.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}
