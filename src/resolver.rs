use anyhow::Result;
use lru_time_cache::LruCache;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use trust_dns_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::proto::op::ResponseCode;
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::DnsConfig;

/// Failure classes for a lookup. Timeout and ServFail are worth a later
/// retry; NxDomain is terminal; Other covers transport and library
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsErrorKind {
    NxDomain,
    Timeout,
    ServFail,
    Other,
}

impl DnsErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, DnsErrorKind::Timeout | DnsErrorKind::ServFail)
    }
}

/// Outcome of resolving one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// First public address from the answer set.
    Public(IpAddr),
    /// The name resolved, but every address was private.
    PrivateOnly,
    Failed(DnsErrorKind),
}

pub struct Resolver {
    inner: TokioAsyncResolver,
    timeout: Duration,
    cache: Mutex<LruCache<String, Resolution>>,
}

impl Resolver {
    pub fn new(cfg: &DnsConfig) -> Result<Self> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(cfg.timeout);
        opts.attempts = 1; // retries are handled here, not inside the library
        opts.ip_strategy = if cfg.ipv6 {
            LookupIpStrategy::Ipv4AndIpv6
        } else {
            LookupIpStrategy::Ipv4Only
        };
        let inner = TokioAsyncResolver::tokio(ResolverConfig::default(), opts)?;
        Ok(Self {
            inner,
            timeout: Duration::from_secs(cfg.timeout),
            cache: Mutex::new(LruCache::with_capacity(cfg.cache_size.max(1))),
        })
    }

    /// Resolve with one retry on a retryable failure. Results (including
    /// failures) are cached by capacity; there is no TTL.
    pub async fn resolve(&self, host: &str) -> Resolution {
        if let Some(hit) = self.cache.lock().unwrap().get(host).cloned() {
            return hit;
        }
        let mut outcome = self.lookup_once(host).await;
        if let Resolution::Failed(kind) = outcome {
            if kind.is_retryable() {
                outcome = self.lookup_once(host).await;
            }
        }
        self.cache.lock().unwrap().insert(host.to_string(), outcome.clone());
        outcome
    }

    async fn lookup_once(&self, host: &str) -> Resolution {
        // Outer timeout guards against the library missing its own.
        let fut = self.inner.lookup_ip(host);
        match tokio::time::timeout(self.timeout + Duration::from_millis(500), fut).await {
            Ok(Ok(lookup)) => {
                let mut saw_any = false;
                for ip in lookup.iter() {
                    saw_any = true;
                    if !is_private(ip) {
                        return Resolution::Public(ip);
                    }
                }
                if saw_any {
                    Resolution::PrivateOnly
                } else {
                    Resolution::Failed(DnsErrorKind::NxDomain)
                }
            }
            Ok(Err(e)) => {
                let kind = classify(&e);
                debug!(host, ?kind, "dns lookup failed: {}", e);
                Resolution::Failed(kind)
            }
            Err(_) => Resolution::Failed(DnsErrorKind::Timeout),
        }
    }
}

fn classify(err: &ResolveError) -> DnsErrorKind {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => {
            classify_response_code(*response_code)
        }
        ResolveErrorKind::Timeout => DnsErrorKind::Timeout,
        _ => DnsErrorKind::Other,
    }
}

fn classify_response_code(rc: ResponseCode) -> DnsErrorKind {
    match rc {
        ResponseCode::ServFail => DnsErrorKind::ServFail,
        // NXDomain proper, and NoError-with-empty-answer: both terminal.
        _ => DnsErrorKind::NxDomain,
    }
}

/// RFC1918 + loopback, link-local, "this network" and their v6
/// equivalents. Anything we cannot classify counts as private.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || o[0] == 127
        || (o[0] == 169 && o[1] == 254)
        || o[0] == 0
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if ip == Ipv6Addr::LOCALHOST {
        return true;
    }
    let seg = ip.segments();
    // fe80::/10 link-local, fc00::/7 unique-local
    (seg[0] & 0xffc0) == 0xfe80 || (seg[0] & 0xfe00) == 0xfc00
}

/// String-level check for addresses read back from storage. Fail-closed:
/// an unparseable address is treated as private.
pub fn is_private_text(ip: &str) -> bool {
    match ip.parse::<IpAddr>() {
        Ok(addr) => is_private(addr),
        Err(_) => true,
    }
}
