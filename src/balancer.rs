//! Latency-aware round-robin selection.
//!
//! The balancer walks the pool's latency-sorted snapshot, optionally filters
//! by a latency ceiling, and rotates over at most `max_active_backends`
//! candidates. Capping the active set keeps the fan-out footprint small: the
//! slower healthy backends are held in reserve instead of being touched on
//! every rotation. Client IPs can be pinned to their backend for a TTL
//! window (sticky sessions).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, Pool};
use crate::config::BalancerConfig;

/// How often expired sticky sessions are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct StickySession {
    backend: Arc<Backend>,
    expiry: Instant,
}

/// Distributes connections across the pool.
pub struct Balancer {
    pool: Arc<Pool>,
    counter: AtomicU32,
    max_latency: Duration,
    sticky_ttl: Duration,
    max_active: usize,
    sessions: Mutex<HashMap<String, StickySession>>,
}

impl Balancer {
    /// Create a balancer over `pool` with the given settings.
    pub fn new(pool: Arc<Pool>, config: &BalancerConfig) -> Self {
        Self {
            pool,
            counter: AtomicU32::new(0),
            max_latency: config.max_latency,
            sticky_ttl: config.sticky_session_ttl,
            max_active: config.max_active_backends,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The pool this balancer selects from.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Select a backend for a client connection.
    ///
    /// Returns `None` only when no backend is available at all; a latency
    /// ceiling that excludes every backend falls back to the unfiltered
    /// candidate list.
    pub fn select(&self, client_addr: &str) -> Option<Arc<Backend>> {
        let client_ip = extract_ip(client_addr);

        // Sticky fast-path.
        if !self.sticky_ttl.is_zero() && !client_ip.is_empty() {
            if let Some(backend) = self.sticky_lookup(&client_ip) {
                return Some(backend);
            }
        }

        let mut candidates = self.pool.sort_by_latency();
        if candidates.is_empty() {
            return None;
        }

        if !self.max_latency.is_zero() {
            let filtered: Vec<_> = candidates
                .iter()
                .filter(|b| b.latency() <= self.max_latency)
                .cloned()
                .collect();
            // Never come up empty just because everything is slow.
            if !filtered.is_empty() {
                candidates = filtered;
            }
        }

        if self.max_active > 0 && candidates.len() > self.max_active {
            candidates.truncate(self.max_active);
        }

        let idx = self.counter.fetch_add(1, Ordering::Relaxed) as usize % candidates.len();
        let selected = Arc::clone(&candidates[idx]);

        if !self.sticky_ttl.is_zero() && !client_ip.is_empty() {
            self.sessions.lock().insert(
                client_ip,
                StickySession {
                    backend: Arc::clone(&selected),
                    expiry: Instant::now() + self.sticky_ttl,
                },
            );
        }

        Some(selected)
    }

    /// Drop the sticky binding for a client, forcing the next select to pick
    /// fresh. Used by the forwarder retry loop so a failed backend is not
    /// handed straight back.
    pub fn evict(&self, client_addr: &str) {
        let client_ip = extract_ip(client_addr);
        if !client_ip.is_empty() {
            self.sessions.lock().remove(&client_ip);
        }
    }

    /// Number of live sticky sessions (monitoring).
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Remove expired sticky sessions. Returns how many were evicted.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.expiry > now);
        before - sessions.len()
    }

    /// Spawn the periodic sweep of expired sticky sessions.
    pub fn spawn_cleanup(self: Arc<Self>, token: &CancellationToken) {
        if self.sticky_ttl.is_zero() {
            return;
        }

        let this = self;
        let token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let evicted = this.cleanup_expired();
                if evicted > 0 {
                    tracing::debug!(evicted, "swept expired sticky sessions");
                }
            }
        });
    }

    // Returns the pinned backend if the entry is live and the backend still
    // qualifies; evicts the entry otherwise.
    fn sticky_lookup(&self, client_ip: &str) -> Option<Arc<Backend>> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(client_ip)?;

        if session.expiry > Instant::now()
            && session.backend.is_available()
            && (self.max_latency.is_zero() || session.backend.latency() <= self.max_latency)
        {
            session.expiry = Instant::now() + self.sticky_ttl;
            return Some(Arc::clone(&session.backend));
        }

        sessions.remove(client_ip);
        None
    }
}

/// Extract the host portion of a `host:port` client address. Unparseable
/// addresses are used whole so sticky sessions still key on something.
fn extract_ip(addr: &str) -> String {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return sock.ip().to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            host.trim_start_matches('[')
                .trim_end_matches(']')
                .to_string()
        }
        _ => addr.to_string(),
    }
}
