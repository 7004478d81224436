// src/resolver.rs
//
// Round-robin rotation over the upload host's resolved addresses. Exists
// purely to route around a single bad edge or load-balancer node: a failed
// address is benched for a cooldown and the next one is used instead. When
// every address is benched the caller falls back to default resolution.

use crate::constants::{DEFAULT_ADDR_COOLDOWN_SECS, DEFAULT_RESOLVE_REFRESH_SECS};
use crate::error::{Result, UploadError};
use std::net::SocketAddr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct ResolvedAddr {
    addr: SocketAddr,
    bad_until: Option<Instant>,
}

#[derive(Debug)]
struct ResolverState {
    addrs: Vec<ResolvedAddr>,
    resolved_at: Instant,
}

/// Read-mostly shared address set with a rotation pointer
#[derive(Debug)]
pub struct HostResolver {
    host: String,
    port: u16,
    refresh_interval: Duration,
    cooldown: Duration,
    cursor: AtomicUsize,
    state: RwLock<ResolverState>,
}

impl HostResolver {
    /// Resolve `host:port` now and start rotating over the results
    pub async fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        let addrs = lookup(&host, port).await?;
        Ok(Self::build(host, port, addrs))
    }

    /// Build from a fixed address set (static configuration, tests)
    pub fn from_addrs(host: impl Into<String>, port: u16, addrs: Vec<SocketAddr>) -> Self {
        Self::build(host.into(), port, addrs)
    }

    fn build(host: String, port: u16, addrs: Vec<SocketAddr>) -> Self {
        Self {
            host,
            port,
            refresh_interval: Duration::from_secs(DEFAULT_RESOLVE_REFRESH_SECS),
            cooldown: Duration::from_secs(DEFAULT_ADDR_COOLDOWN_SECS),
            cursor: AtomicUsize::new(0),
            state: RwLock::new(ResolverState {
                addrs: addrs
                    .into_iter()
                    .map(|addr| ResolvedAddr {
                        addr,
                        bad_until: None,
                    })
                    .collect(),
                resolved_at: Instant::now(),
            }),
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next usable address, round-robin, skipping benched entries.
    /// `None` means every address is benched: use default resolution.
    pub async fn next_addr(&self) -> Option<SocketAddr> {
        self.refresh_if_stale().await;

        let state = self.state.read().unwrap();
        let n = state.addrs.len();
        if n == 0 {
            return None;
        }
        let now = Instant::now();
        for _ in 0..n {
            let i = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            let entry = &state.addrs[i];
            if entry.bad_until.is_none_or(|until| until <= now) {
                return Some(entry.addr);
            }
        }
        None
    }

    /// Bench an address after a connection failure
    pub fn mark_unusable(&self, addr: SocketAddr) {
        let mut state = self.state.write().unwrap();
        if let Some(entry) = state.addrs.iter_mut().find(|e| e.addr == addr) {
            entry.bad_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(%addr, cooldown_secs = self.cooldown.as_secs(), "benching upload address");
        }
    }

    /// Re-resolve the hostname, carrying bench state over for addresses
    /// that are still present. Resolution failure keeps the current set.
    pub async fn refresh(&self) {
        match lookup(&self.host, self.port).await {
            Ok(addrs) => {
                let mut state = self.state.write().unwrap();
                let old = std::mem::take(&mut state.addrs);
                state.addrs = addrs
                    .into_iter()
                    .map(|addr| ResolvedAddr {
                        addr,
                        bad_until: old
                            .iter()
                            .find(|e| e.addr == addr)
                            .and_then(|e| e.bad_until),
                    })
                    .collect();
                state.resolved_at = Instant::now();
                tracing::debug!(host = %self.host, count = state.addrs.len(), "refreshed resolved addresses");
            }
            Err(err) => {
                tracing::warn!(host = %self.host, error = %err, "re-resolution failed, keeping current set");
            }
        }
    }

    async fn refresh_if_stale(&self) {
        let stale = {
            let state = self.state.read().unwrap();
            state.resolved_at.elapsed() >= self.refresh_interval
        };
        if stale {
            self.refresh().await;
        }
    }
}

async fn lookup(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| UploadError::io(format!("resolving {}:{}", host, port), e))?
        .collect();
    if addrs.is_empty() {
        return Err(UploadError::transport(format!(
            "no addresses resolved for {}",
            host
        )));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{}:443", last).parse().unwrap()
    }

    fn resolver(n: u8) -> HostResolver {
        HostResolver::from_addrs(
            "upload.example.com",
            443,
            (1..=n).map(addr).collect(),
        )
        .with_cooldown(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn rotates_round_robin() {
        let r = resolver(3);
        assert_eq!(r.next_addr().await, Some(addr(1)));
        assert_eq!(r.next_addr().await, Some(addr(2)));
        assert_eq!(r.next_addr().await, Some(addr(3)));
        assert_eq!(r.next_addr().await, Some(addr(1)));
    }

    #[tokio::test]
    async fn benched_address_is_skipped() {
        let r = resolver(3);
        r.mark_unusable(addr(2));
        assert_eq!(r.next_addr().await, Some(addr(1)));
        assert_eq!(r.next_addr().await, Some(addr(3)));
        assert_eq!(r.next_addr().await, Some(addr(1)));
    }

    #[tokio::test]
    async fn all_benched_yields_none() {
        let r = resolver(2);
        r.mark_unusable(addr(1));
        r.mark_unusable(addr(2));
        assert_eq!(r.next_addr().await, None);
    }

    #[tokio::test]
    async fn bench_expires_after_cooldown() {
        let r = resolver(1);
        r.mark_unusable(addr(1));
        assert_eq!(r.next_addr().await, None);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(r.next_addr().await, Some(addr(1)));
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let r = HostResolver::new("localhost", 8080).await.unwrap();
        assert!(r.next_addr().await.is_some());
    }
}
