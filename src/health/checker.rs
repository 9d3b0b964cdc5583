//! Active health checker.
//!
//! Every `check_interval` the checker fans out one probe task per backend
//! and waits for the whole round before logging a summary. A probe first
//! verifies TCP reachability, then (if a test URL is configured) fetches it
//! through the backend as a SOCKS5 proxy and records the wall time as the
//! backend's latency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, Pool};
use crate::config::HealthConfig;
use crate::error::{Error, Result};
use crate::health::CircuitState;

/// Periodic concurrent prober for every backend in the pool.
pub struct HealthChecker {
    prober: Prober,
    check_interval: Duration,
    running: Mutex<Option<Running>>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthChecker {
    /// Create a health checker over `pool` with the given settings.
    pub fn new(pool: Arc<Pool>, config: &HealthConfig) -> Self {
        Self {
            prober: Prober {
                pool,
                test_url: config.test_url.clone(),
                connect_timeout: config.connect_timeout,
                request_timeout: config.request_timeout,
                failure_threshold: config.failure_threshold,
            },
            check_interval: config.check_interval,
            running: Mutex::new(None),
        }
    }

    /// Start periodic checking: one immediate round, then one per interval.
    ///
    /// Fails if the checker is already running.
    pub fn start(&self, parent: &CancellationToken) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(Error::State("health checker already running".into()));
        }

        let token = parent.child_token();
        let loop_token = token.clone();
        let prober = self.prober.clone();
        let check_interval = self.check_interval;

        let handle = tokio::spawn(async move {
            prober.check_all().await;

            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the interval fires immediately once

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                prober.check_all().await;
            }
        });

        tracing::info!(interval = ?self.check_interval, "health checker started");

        *running = Some(Running { token, handle });
        Ok(())
    }

    /// Stop the checker. Returns once in-flight probes have completed.
    pub async fn stop(&self) -> Result<()> {
        let Running { token, handle } = self
            .running
            .lock()
            .take()
            .ok_or_else(|| Error::State("health checker not running".into()))?;

        token.cancel();
        let _ = handle.await;

        tracing::info!("health checker stopped");
        Ok(())
    }

    /// Whether the checker is currently running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

// The probing half, cloned into the scheduling task and into each per-backend
// probe task.
#[derive(Clone)]
struct Prober {
    pool: Arc<Pool>,
    test_url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    failure_threshold: u32,
}

impl Prober {
    /// Probe every backend concurrently and wait for the round to finish.
    async fn check_all(&self) {
        let backends = self.pool.get_all();
        if backends.is_empty() {
            return;
        }

        tracing::debug!("running health checks on {} backend(s)", backends.len());

        let mut probes = JoinSet::new();
        for backend in backends.iter() {
            let prober = self.clone();
            let backend = Arc::clone(backend);
            probes.spawn(async move {
                prober.check_backend(&backend).await;
            });
        }
        while probes.join_next().await.is_some() {}

        tracing::info!(
            healthy = self.pool.count_healthy(),
            total = backends.len(),
            "health check round complete"
        );
    }

    async fn check_backend(&self, backend: &Backend) {
        // An open circuit whose back-off window has elapsed gets to half-open
        // here, so this probe's outcome decides recovery.
        if backend.circuit_state() == CircuitState::Open && backend.try_recovery() {
            tracing::debug!(backend = %backend.address(), "circuit half-open, probing for recovery");
        }

        if !self.test_reachable(backend.address()).await {
            tracing::warn!(backend = %backend.address(), "connection probe failed");
            backend.mark_failure(self.failure_threshold);
            return;
        }

        if self.test_url.is_empty() {
            backend.mark_success(Duration::ZERO);
            tracing::debug!(backend = %backend.address(), "healthy (connection probe only)");
            return;
        }

        match self.measure_latency(backend.address()).await {
            Ok(latency) => {
                backend.mark_success(latency);
                tracing::debug!(backend = %backend.address(), ?latency, "healthy");
            }
            Err(e) => {
                tracing::warn!(backend = %backend.address(), error = %e, "latency probe failed");
                backend.mark_failure(self.failure_threshold);
            }
        }
    }

    /// TCP reachability probe.
    async fn test_reachable(&self, address: &str) -> bool {
        matches!(
            timeout(self.connect_timeout, TcpStream::connect(address)).await,
            Ok(Ok(_))
        )
    }

    /// Fetch the test URL through the backend as a SOCKS5 proxy and measure
    /// the wall time until response headers arrive.
    async fn measure_latency(&self, proxy_addr: &str) -> Result<Duration> {
        let proxy = reqwest::Proxy::all(format!("socks5h://{proxy_addr}"))
            .map_err(|e| Error::probe(format!("invalid proxy address: {e}")))?;

        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| Error::probe(format!("failed to build probe client: {e}")))?;

        let start = Instant::now();
        let response = client
            .get(&self.test_url)
            .send()
            .await
            .map_err(|e| Error::probe(format!("request failed: {e}")))?;
        let latency = start.elapsed();

        let status = response.status().as_u16();
        if !(200..400).contains(&status) {
            return Err(Error::probe(format!("bad status code: {status}")));
        }

        Ok(latency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn checker(pool: Arc<Pool>, test_url: &str) -> HealthChecker {
        let config = HealthConfig {
            test_url: test_url.to_string(),
            check_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(1),
            failure_threshold: 3,
        };
        HealthChecker::new(pool, &config)
    }

    #[tokio::test]
    async fn test_round_marks_reachable_backend_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let pool = Arc::new(Pool::new());
        let backend = Arc::new(Backend::new(addr, "", 3));
        pool.add(Arc::clone(&backend));

        let checker = checker(Arc::clone(&pool), "");
        checker.prober.check_all().await;

        assert!(backend.is_available());
        assert_eq!(backend.consecutive_failures(), 0);
        assert!(backend.last_checked().is_some());
        drop(listener);
    }

    #[tokio::test]
    async fn test_unreachable_backend_flips_after_threshold() {
        let pool = Arc::new(Pool::new());
        let backend = Arc::new(Backend::new("127.0.0.1:1", "", 3));
        pool.add(Arc::clone(&backend));

        let checker = checker(Arc::clone(&pool), "");

        checker.prober.check_all().await;
        checker.prober.check_all().await;
        assert!(backend.is_available());

        checker.prober.check_all().await;
        assert!(!backend.is_available());
        assert_eq!(backend.consecutive_failures(), 3);
    }

    #[tokio::test]
    async fn test_probe_success_restores_health() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let pool = Arc::new(Pool::new());
        let backend = Arc::new(Backend::new(addr, "", 3));
        pool.add(Arc::clone(&backend));

        // Three straight failures take the backend out of rotation.
        for _ in 0..3 {
            backend.mark_failure(3);
        }
        assert!(!backend.is_available());
        assert_eq!(backend.circuit_state(), CircuitState::Open);

        // One successful probe round brings it back and clears the streak.
        let checker = checker(Arc::clone(&pool), "");
        checker.prober.check_all().await;

        assert!(backend.is_available());
        assert_eq!(backend.consecutive_failures(), 0);
        drop(listener);
    }

    #[tokio::test]
    async fn test_start_rejects_double_start() {
        let pool = Arc::new(Pool::new());
        let checker = checker(pool, "");
        let token = CancellationToken::new();

        checker.start(&token).unwrap();
        assert!(checker.is_running());
        assert!(checker.start(&token).is_err());

        checker.stop().await.unwrap();
        assert!(!checker.is_running());
        assert!(checker.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_empty_pool_round_is_noop() {
        let pool = Arc::new(Pool::new());
        let checker = checker(pool, "");
        checker.prober.check_all().await;
    }
}
