//! Thread-safe cache of minted leaf certificates.
//!
//! Keyed by hostname with LRU eviction at a fixed capacity and a TTL per
//! entry. A dedicated background task sweeps expired entries periodically;
//! `get` also discards an expired entry on contact. All mutations (including
//! the LRU promotion done by `get`) happen under a single async mutex.

use crate::ca::leaf::LeafCertificate;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cache tuning knobs.
#[derive(Debug, Clone)]
pub struct CertCacheConfig {
    /// Hard cap on cached certificates; LRU eviction beyond this.
    pub max_size: usize,
    /// Age at which an entry becomes invalid.
    pub ttl: Duration,
    /// Cadence of the background expiry sweeper.
    pub cleanup_interval: Duration,
}

impl Default for CertCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Duration::from_secs(30 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

type Entries = Arc<Mutex<LruCache<String, Arc<LeafCertificate>>>>;

/// LRU + TTL certificate cache with a background sweeper task.
pub struct CertCache {
    entries: Entries,
    ttl: Duration,
    stop: CancellationToken,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CertCache {
    /// Create the cache and start its sweeper task.
    pub fn new(config: CertCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_size)
            .unwrap_or_else(|| NonZeroUsize::new(1000).expect("default capacity is nonzero"));
        let entries: Entries = Arc::new(Mutex::new(LruCache::new(capacity)));
        let stop = CancellationToken::new();

        let sweeper = tokio::spawn(run_sweeper(
            Arc::clone(&entries),
            config.ttl,
            config.cleanup_interval,
            stop.clone(),
        ));

        Self {
            entries,
            ttl: config.ttl,
            stop,
            sweeper: std::sync::Mutex::new(Some(sweeper)),
        }
    }

    /// Look up a certificate, refreshing its LRU position.
    ///
    /// Returns `None` for absent or expired entries; an expired entry is
    /// removed on contact.
    pub async fn get(&self, hostname: &str) -> Option<Arc<LeafCertificate>> {
        let mut entries = self.entries.lock().await;
        match entries.get(hostname) {
            Some(leaf) if leaf.age() > self.ttl => {
                entries.pop(hostname);
                None
            }
            Some(leaf) => Some(Arc::clone(leaf)),
            None => None,
        }
    }

    /// Insert or replace the certificate for a hostname.
    ///
    /// Idempotent per hostname: an existing entry is replaced in place and
    /// refreshed; a new entry may evict the least-recently-used one.
    pub async fn put(&self, hostname: String, leaf: Arc<LeafCertificate>) {
        let mut entries = self.entries.lock().await;
        if entries.len() == entries.cap().get() && !entries.contains(hostname.as_str()) {
            if let Some((evicted, _)) = entries.peek_lru() {
                debug!(hostname = %evicted, "evicting least recently used certificate");
            }
        }
        entries.put(hostname, leaf);
    }

    /// Number of cached certificates.
    pub async fn size(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Stop the sweeper task and wait for it to finish.
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.sweeper.lock().expect("sweeper handle lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for CertCache {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_sweeper(
    entries: Entries,
    ttl: Duration,
    cleanup_interval: Duration,
    stop: CancellationToken,
) {
    let start = tokio::time::Instant::now() + cleanup_interval;
    let mut ticker = tokio::time::interval_at(start, cleanup_interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("stopping certificate cache sweeper");
                return;
            }
            _ = ticker.tick() => {
                let removed = sweep(&entries, ttl).await;
                if removed > 0 {
                    debug!(removed, "removed expired certificates");
                }
            }
        }
    }
}

async fn sweep(entries: &Mutex<LruCache<String, Arc<LeafCertificate>>>, ttl: Duration) -> usize {
    let mut entries = entries.lock().await;
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, leaf)| leaf.age() > ttl)
        .map(|(hostname, _)| hostname.clone())
        .collect();
    for hostname in &expired {
        entries.pop(hostname);
    }
    expired.len()
}
