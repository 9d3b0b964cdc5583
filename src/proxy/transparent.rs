//! Transparent forwarding mode.
//!
//! Pure byte splicing: the client is expected to speak SOCKS5 directly to
//! the upstream proxy, so nothing is decoded here. Each accepted connection
//! is assigned a backend by the balancer and spliced until both directions
//! finish.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::balancer::Balancer;
use crate::error::{Error, Result};
use crate::proxy::relay;

/// Transparent TCP forwarder.
pub struct TransparentServer {
    address: String,
    balancer: Arc<Balancer>,
    failure_threshold: u32,
    running: Mutex<Option<Running>>,
}

struct Running {
    local_addr: SocketAddr,
    token: CancellationToken,
    handle: JoinHandle<()>,
    tracker: TaskTracker,
}

impl TransparentServer {
    /// Create a transparent forwarder listening on `address`.
    pub fn new(address: impl Into<String>, balancer: Arc<Balancer>, failure_threshold: u32) -> Self {
        Self {
            address: address.into(),
            balancer,
            failure_threshold,
            running: Mutex::new(None),
        }
    }

    /// Bind the listen address and start accepting connections.
    ///
    /// Fails if the server is already running or the address cannot be bound.
    pub async fn start(&self, parent: &CancellationToken) -> Result<()> {
        if self.running.lock().is_some() {
            return Err(Error::State("server already running".into()));
        }

        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|e| Error::Bind {
                addr: self.address.clone(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;

        tracing::info!(listen = %local_addr, "transparent proxy listening");

        let token = parent.child_token();
        let tracker = TaskTracker::new();
        let handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.balancer),
            self.failure_threshold,
            token.clone(),
            tracker.clone(),
        ));

        *self.running.lock() = Some(Running {
            local_addr,
            token,
            handle,
            tracker,
        });
        Ok(())
    }

    /// Stop accepting and wait for in-flight connections to unwind.
    pub async fn stop(&self) -> Result<()> {
        let Running {
            token,
            handle,
            tracker,
            ..
        } = self
            .running
            .lock()
            .take()
            .ok_or_else(|| Error::State("server not running".into()))?;

        token.cancel();
        let _ = handle.await;
        tracker.close();
        tracker.wait().await;

        tracing::info!("transparent proxy stopped");
        Ok(())
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Whether the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

async fn accept_loop(
    listener: TcpListener,
    balancer: Arc<Balancer>,
    failure_threshold: u32,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((client, peer_addr)) => {
                let balancer = Arc::clone(&balancer);
                let token = token.clone();
                tracker.spawn(async move {
                    handle_connection(balancer, failure_threshold, client, peer_addr, token).await;
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    balancer: Arc<Balancer>,
    failure_threshold: u32,
    client: TcpStream,
    peer_addr: SocketAddr,
    token: CancellationToken,
) {
    let client_addr = peer_addr.to_string();

    let Some(backend) = balancer.select(&client_addr) else {
        tracing::warn!(client = %client_addr, "no backend available");
        return;
    };

    tracing::debug!(client = %client_addr, backend = %backend.address(), "forwarding");

    let upstream = match relay::dial(backend.address()).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(backend = %backend.address(), error = %e, "upstream dial failed");
            backend.mark_failure(failure_threshold);
            return;
        }
    };

    let (client_to_upstream, upstream_to_client) = relay::pipe(client, upstream, &token).await;

    tracing::debug!(
        client = %client_addr,
        backend = %backend.address(),
        sent = client_to_upstream.as_ref().copied().unwrap_or(0),
        received = upstream_to_client.as_ref().copied().unwrap_or(0),
        "connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, Pool};
    use crate::config::BalancerConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut data = Vec::new();
                    sock.read_to_end(&mut data).await.unwrap();
                    sock.write_all(&data).await.unwrap();
                });
            }
        });
        addr
    }

    fn balancer_for(addrs: &[String]) -> Arc<Balancer> {
        let pool = Arc::new(Pool::new());
        for addr in addrs {
            pool.add(Arc::new(Backend::new(addr.clone(), "", 3)));
        }
        let config = BalancerConfig {
            algorithm: "roundrobin".to_string(),
            max_latency: Duration::ZERO,
            sticky_session_ttl: Duration::ZERO,
            max_active_backends: 0,
        };
        Arc::new(Balancer::new(pool, &config))
    }

    #[tokio::test]
    async fn test_splices_bytes_end_to_end() {
        let upstream = echo_upstream().await;
        let balancer = balancer_for(&[upstream.to_string()]);

        let server = TransparentServer::new("127.0.0.1:0", balancer, 3);
        let token = CancellationToken::new();
        server.start(&token).await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"raw bytes through").await.unwrap();
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"raw bytes through");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_closes_client_when_no_backend() {
        let balancer = balancer_for(&[]);
        let server = TransparentServer::new("127.0.0.1:0", balancer, 3);
        let token = CancellationToken::new();
        server.start(&token).await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        // Server closes without writing anything.
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_marks_backend() {
        let balancer = balancer_for(&["127.0.0.1:1".to_string()]);
        let backend = balancer.pool().get_all()[0].clone();

        let server = TransparentServer::new("127.0.0.1:0", Arc::clone(&balancer), 3);
        let token = CancellationToken::new();
        server.start(&token).await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let _ = client.read(&mut buf).await;

        assert!(backend.consecutive_failures() >= 1);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let balancer = balancer_for(&[]);
        let server = TransparentServer::new("127.0.0.1:0", balancer, 3);
        let token = CancellationToken::new();

        server.start(&token).await.unwrap();
        assert!(server.is_running());
        assert!(server.start(&token).await.is_err());

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(server.stop().await.is_err());
    }
}
