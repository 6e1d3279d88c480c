//! PLC address discovery with a local, TTL'd cache (spec §4.B; supplemented
//! from `discovery.py` per SPEC_FULL §10.7).
//!
//! Connection priority is hostname resolution first, then a subnet sweep,
//! falling back to a configured static IP. The original's sync/async split
//! (network scanning run via `loop.run_in_executor` because the rest of
//! the process was sync) collapses here to a single async path, since
//! everything downstream already runs on tokio.

use crate::error::{PlcError, PlcResult};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEndpoint {
    pub ip: IpAddr,
    pub port: u16,
    pub discovered_at_unix: u64,
}

impl CachedEndpoint {
    pub fn is_fresh(&self, now_unix: u64, ttl: Duration) -> bool {
        now_unix.saturating_sub(self.discovered_at_unix) < ttl.as_secs()
    }
}

pub struct DiscoveryCache {
    path: PathBuf,
    ttl: Duration,
}

impl DiscoveryCache {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        DiscoveryCache {
            path: path.into(),
            ttl,
        }
    }

    pub async fn load(&self, now_unix: u64) -> Option<CachedEndpoint> {
        let bytes = tokio::fs::read(&self.path).await.ok()?;
        let entry: CachedEndpoint = serde_json::from_slice(&bytes).ok()?;
        entry.is_fresh(now_unix, self.ttl).then_some(entry)
    }

    pub async fn store(&self, entry: &CachedEndpoint) -> PlcResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(entry)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    pub async fn clear(&self) -> PlcResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Probes `addr` by attempting a bare TCP connect within `timeout`. A
/// successful connect is treated as Modbus-capable, matching the
/// original's "even if the read fails, connection success indicates
/// Modbus capability" reasoning.
async fn probe(addr: SocketAddr, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

pub async fn resolve_hostname(
    hostname: &str,
    port: u16,
    timeout: Duration,
) -> PlcResult<Option<IpAddr>> {
    let addrs = tokio::net::lookup_host((hostname, port))
        .await
        .map_err(|e| PlcError::transport(format!("resolve {hostname}: {e}")))?;
    for addr in addrs {
        if probe(addr, timeout).await {
            return Ok(Some(addr.ip()));
        }
    }
    Ok(None)
}

/// Sweeps the /24 containing `local_ip` for a host answering on `port`.
/// Bounded concurrency mirrors the original's `asyncio.Semaphore(20)`.
pub async fn scan_subnet(local_ip: Ipv4Addr, port: u16, timeout: Duration) -> Vec<IpAddr> {
    const MAX_CONCURRENT: usize = 20;
    let octets = local_ip.octets();
    let candidates: Vec<Ipv4Addr> = (1u8..255)
        .map(|last| Ipv4Addr::new(octets[0], octets[1], octets[2], last))
        .filter(|&ip| ip != local_ip)
        .collect();

    let mut found = Vec::new();
    for chunk in candidates.chunks(MAX_CONCURRENT) {
        let mut tasks = Vec::with_capacity(chunk.len());
        for &ip in chunk {
            let addr = SocketAddr::new(IpAddr::V4(ip), port);
            tasks.push(tokio::spawn(async move {
                probe(addr, timeout).await.then_some(addr.ip())
            }));
        }
        for task in tasks {
            if let Ok(Some(ip)) = task.await {
                found.push(ip);
            }
        }
    }
    found
}

/// Full discovery sequence: cache, then hostname, then subnet sweep.
/// Returns the first responsive address and refreshes the cache on
/// success.
pub async fn discover(
    cache: &DiscoveryCache,
    hostname: Option<&str>,
    local_ip: Option<Ipv4Addr>,
    port: u16,
    timeout: Duration,
    now_unix: u64,
) -> PlcResult<Option<IpAddr>> {
    if let Some(cached) = cache.load(now_unix).await {
        return Ok(Some(cached.ip));
    }

    if let Some(hostname) = hostname {
        if let Some(ip) = resolve_hostname(hostname, port, timeout).await? {
            cache
                .store(&CachedEndpoint {
                    ip,
                    port,
                    discovered_at_unix: now_unix,
                })
                .await?;
            return Ok(Some(ip));
        }
    }

    if let Some(local_ip) = local_ip {
        let found = scan_subnet(local_ip, port, timeout).await;
        if let Some(&ip) = found.first() {
            cache
                .store(&CachedEndpoint {
                    ip,
                    port,
                    discovered_at_unix: now_unix,
                })
                .await?;
            return Ok(Some(ip));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_endpoint_freshness() {
        let entry = CachedEndpoint {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 502,
            discovered_at_unix: 1000,
        };
        assert!(entry.is_fresh(1299, Duration::from_secs(300)));
        assert!(!entry.is_fresh(1301, Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn cache_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("aldctl-discovery-test-{}", std::process::id()));
        let cache = DiscoveryCache::new(dir.join("plc_cache.json"), Duration::from_secs(300));
        let entry = CachedEndpoint {
            ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            port: 502,
            discovered_at_unix: 500,
        };
        cache.store(&entry).await.unwrap();
        let loaded = cache.load(600).await.unwrap();
        assert_eq!(loaded.ip, entry.ip);
        cache.clear().await.unwrap();
        assert!(cache.load(600).await.is_none());
    }
}
