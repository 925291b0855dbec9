//! Peer discovery sources. A source yields candidate addresses on demand;
//! a failing source is retried with capped exponential backoff but the
//! group keeps polling it indefinitely (discovery failure is never fatal).

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use thiserror::Error;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("dns resolution failed for {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: trust_dns_resolver::error::ResolveError,
    },
}

/// A single discovery source's backoff state: retried with a doubling
/// delay, capped, reset on success.
struct SourceBackoff {
    base: Duration,
    cap: Duration,
    current: Duration,
    next_attempt: Instant,
}

impl SourceBackoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
            next_attempt: Instant::now(),
        }
    }

    fn ready(&self) -> bool {
        Instant::now() >= self.next_attempt
    }

    fn on_success(&mut self) {
        self.current = self.base;
        self.next_attempt = Instant::now();
    }

    fn on_failure(&mut self) {
        self.current = (self.current * 2).min(self.cap);
        self.next_attempt = Instant::now() + self.current;
    }
}

/// A DNS-seed discovery source: resolves a hostname to a set of addresses
/// at the network's default port.
pub struct DnsSeedSource {
    host: String,
    default_port: u16,
    resolver: TokioAsyncResolver,
    backoff: SourceBackoff,
}

impl DnsSeedSource {
    pub fn new(host: String, default_port: u16) -> Self {
        Self {
            host,
            default_port,
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            backoff: SourceBackoff::new(Duration::from_secs(5), Duration::from_secs(300)),
        }
    }

    pub fn ready(&self) -> bool {
        self.backoff.ready()
    }

    pub async fn discover(&mut self) -> Result<Vec<SocketAddr>, DiscoveryError> {
        match self.resolver.lookup_ip(self.host.as_str()).await {
            Ok(lookup) => {
                self.backoff.on_success();
                let port = self.default_port;
                Ok(lookup.iter().map(|ip: IpAddr| SocketAddr::new(ip, port)).collect())
            }
            Err(source) => {
                self.backoff.on_failure();
                Err(DiscoveryError::Dns {
                    host: self.host.clone(),
                    source,
                })
            }
        }
    }
}

/// Poll every ready source, returning the union of addresses found. Sources
/// that fail are left to their own backoff and simply contribute nothing
/// this round; the caller keeps calling this on a timer until peers are
/// found.
pub async fn discover_all(sources: &mut [DnsSeedSource]) -> Vec<SocketAddr> {
    let mut found = Vec::new();
    for source in sources.iter_mut() {
        if !source.ready() {
            continue;
        }
        match source.discover().await {
            Ok(mut addrs) => found.append(&mut addrs),
            Err(_) => continue,
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = SourceBackoff::new(Duration::from_secs(1), Duration::from_secs(4));
        b.on_failure();
        assert_eq!(b.current, Duration::from_secs(2));
        b.on_failure();
        assert_eq!(b.current, Duration::from_secs(4));
        b.on_failure();
        assert_eq!(b.current, Duration::from_secs(4));
    }

    #[test]
    fn backoff_resets_on_success() {
        let mut b = SourceBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        b.on_failure();
        b.on_failure();
        assert!(b.current > Duration::from_secs(1));
        b.on_success();
        assert_eq!(b.current, Duration::from_secs(1));
    }
}
