//! Monitoring endpoint.
//!
//! Serves the pool snapshot as JSON on `GET /stats`. This is a deliberately
//! tiny HTTP/1.1 responder: one request per connection, no keep-alive.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::backend::Pool;
use crate::error::{Error, Result};

/// Statistics for a single backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    /// Endpoint address
    pub address: String,
    /// Human label
    pub name: String,
    /// Whether the backend is currently selectable
    pub healthy: bool,
    /// Last measured latency in milliseconds
    pub latency_ms: u64,
    /// RFC 3339 wall time of the last probe, empty if never probed
    pub last_checked: String,
    /// Circuit breaker state
    pub circuit_state: String,
    /// Success rate over the recent connection window
    pub success_rate: f64,
}

/// Complete statistics response.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// RFC 3339 time the snapshot was taken
    pub timestamp: String,
    /// Backends in the pool
    pub total_backends: usize,
    /// Backends currently selectable
    pub healthy_backends: usize,
    /// Per-backend statistics, healthy and fastest first
    pub backends: Vec<BackendStats>,
}

/// Build the stats snapshot for the pool.
pub fn pool_snapshot(pool: &Pool) -> StatsResponse {
    let all = pool.get_all();
    let now = chrono::Utc::now();

    let mut healthy_count = 0;
    let mut backends: Vec<BackendStats> = all
        .iter()
        .map(|b| {
            let healthy = b.is_available();
            if healthy {
                healthy_count += 1;
            }

            let last_checked = match b.last_checked() {
                Some(instant) => {
                    let ago = chrono::Duration::from_std(instant.elapsed())
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    (now - ago).to_rfc3339()
                }
                None => String::new(),
            };

            BackendStats {
                address: b.address().to_string(),
                name: b.name().to_string(),
                healthy,
                latency_ms: b.latency().as_millis() as u64,
                last_checked,
                circuit_state: b.circuit_state().to_string(),
                success_rate: b.connection_metrics().success_rate,
            }
        })
        .collect();

    // Unhealthy backends sort last; within each group, fastest first.
    backends.sort_by(|a, b| {
        b.healthy
            .cmp(&a.healthy)
            .then(a.latency_ms.cmp(&b.latency_ms))
    });

    StatsResponse {
        timestamp: now.to_rfc3339(),
        total_backends: all.len(),
        healthy_backends: healthy_count,
        backends,
    }
}

/// Stats endpoint server.
pub struct StatsServer {
    address: String,
    pool: Arc<Pool>,
}

impl StatsServer {
    /// Create a stats server over `pool`.
    pub fn new(address: impl Into<String>, pool: Arc<Pool>) -> Self {
        Self {
            address: address.into(),
            pool,
        }
    }

    /// Bind the endpoint and serve it in the background until the token is
    /// cancelled. Returns the bound address.
    pub async fn start(self, token: &CancellationToken) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|e| Error::Bind {
                addr: self.address.clone(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;

        tracing::info!(listen = %local_addr, "stats endpoint listening");

        let token = token.child_token();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((stream, _)) => {
                        let pool = Arc::clone(&self.pool);
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(stream, &pool).await {
                                tracing::debug!(error = %e, "stats request error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stats accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(local_addr)
    }
}

async fn handle_request(mut stream: TcpStream, pool: &Pool) -> Result<()> {
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).await?;
    let head = String::from_utf8_lossy(&buf[..n]);

    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("");

    let (status, body) = match path {
        "/stats" => {
            let snapshot = pool_snapshot(pool);
            let body = serde_json::to_string(&snapshot)
                .map_err(|e| Error::Network(std::io::Error::other(e)))?;
            ("200 OK", body)
        }
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;

    fn sample_pool() -> Arc<Pool> {
        let pool = Arc::new(Pool::new());

        let fast = Arc::new(Backend::new("10.0.0.1:1080", "fast", 3));
        fast.mark_success(Duration::from_millis(10));
        pool.add(fast);

        let slow = Arc::new(Backend::new("10.0.0.2:1080", "slow", 3));
        slow.mark_success(Duration::from_millis(200));
        pool.add(Arc::clone(&slow));

        let dead = Arc::new(Backend::new("10.0.0.3:1080", "dead", 3));
        for _ in 0..3 {
            dead.mark_failure(3);
        }
        pool.add(dead);

        pool
    }

    #[test]
    fn test_snapshot_counts_and_order() {
        let pool = sample_pool();
        let snapshot = pool_snapshot(&pool);

        assert_eq!(snapshot.total_backends, 3);
        assert_eq!(snapshot.healthy_backends, 2);

        let names: Vec<_> = snapshot.backends.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["fast", "slow", "dead"]);
        assert!(!snapshot.backends[2].healthy);
        assert_eq!(snapshot.backends[2].circuit_state, "OPEN");
    }

    #[test]
    fn test_snapshot_serializes() {
        let pool = sample_pool();
        let json = serde_json::to_string(&pool_snapshot(&pool)).unwrap();
        assert!(json.contains("\"total_backends\":3"));
        assert!(json.contains("\"address\":\"10.0.0.1:1080\""));
    }

    #[tokio::test]
    async fn test_http_stats_endpoint() {
        let pool = sample_pool();
        let token = CancellationToken::new();

        let server = StatsServer::new("127.0.0.1:0", pool);
        let addr = server.start(&token).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /stats HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"healthy_backends\":2"));

        token.cancel();
    }

    #[tokio::test]
    async fn test_http_unknown_path_is_404() {
        let pool = sample_pool();
        let token = CancellationToken::new();

        let server = StatsServer::new("127.0.0.1:0", pool);
        let addr = server.start(&token).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /nope HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 404"));

        token.cancel();
    }
}
