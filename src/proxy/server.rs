//! SOCKS5 forwarding mode.
//!
//! Terminates the SOCKS5 handshake from the client, picks a backend, runs a
//! fresh handshake against it for the same target, and relays. Failed dials
//! and upstream handshakes retry on the next backend, up to three attempts
//! per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backend::Backend;
use crate::balancer::Balancer;
use crate::error::{Error, Result};
use crate::proxy::relay;
use crate::proxy::socks5::{self, Reply, TargetAddr};

/// Attempts across distinct backends before giving up on a connection.
const MAX_ATTEMPTS: usize = 3;

/// Pause between attempts, a small anti-thundering-herd measure.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// SOCKS5 terminating forwarder.
pub struct Socks5Server {
    address: String,
    balancer: Arc<Balancer>,
    running: Mutex<Option<Running>>,
}

struct Running {
    local_addr: SocketAddr,
    token: CancellationToken,
    handle: JoinHandle<()>,
    tracker: TaskTracker,
}

impl Socks5Server {
    /// Create a SOCKS5 forwarder listening on `address`.
    pub fn new(address: impl Into<String>, balancer: Arc<Balancer>) -> Self {
        Self {
            address: address.into(),
            balancer,
            running: Mutex::new(None),
        }
    }

    /// Bind the listen address and start accepting connections.
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

        tracing::info!(listen = %local_addr, "SOCKS5 proxy listening");

        let token = parent.child_token();
        let tracker = TaskTracker::new();
        let handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.balancer),
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

        tracing::info!("SOCKS5 proxy stopped");
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
                    if let Err(e) = handle_connection(balancer, client, peer_addr, token).await {
                        tracing::debug!(client = %peer_addr, error = %e, "connection error");
                    }
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
    mut client: TcpStream,
    peer_addr: SocketAddr,
    token: CancellationToken,
) -> Result<()> {
    let client_addr = peer_addr.to_string();

    let target = socks5::handshake_client(&mut client).await?;
    tracing::debug!(client = %client_addr, target = %target, "CONNECT request");

    let Some((upstream, backend)) = establish_upstream(&balancer, &client_addr, &target).await
    else {
        socks5::send_reply(&mut client, Reply::HostUnreachable).await?;
        return Err(Error::NoBackend);
    };

    socks5::send_reply(&mut client, Reply::Success).await?;

    let (client_to_upstream, upstream_to_client) = relay::pipe(client, upstream, &token).await;

    // A relay I/O error counts against the backend; a clean EOF does not.
    if client_to_upstream.is_err() || upstream_to_client.is_err() {
        backend.record_connection_failure(false);
    }

    tracing::debug!(
        client = %client_addr,
        backend = %backend.address(),
        sent = client_to_upstream.as_ref().copied().unwrap_or(0),
        received = upstream_to_client.as_ref().copied().unwrap_or(0),
        "connection closed"
    );

    Ok(())
}

/// Walk the balancer for up to [`MAX_ATTEMPTS`] backends, dialing each and
/// running the upstream handshake for `target`. The connection-setup time
/// (dial + handshake) of the winning backend feeds its moving average.
async fn establish_upstream(
    balancer: &Balancer,
    client_addr: &str,
    target: &TargetAddr,
) -> Option<(TcpStream, Arc<Backend>)> {
    for attempt in 1..=MAX_ATTEMPTS {
        let backend = balancer.select(client_addr)?;
        let start = Instant::now();

        match relay::dial(backend.address()).await {
            Ok(mut upstream) => match socks5::handshake_upstream(&mut upstream, target).await {
                Ok(()) => {
                    backend.record_connection_success(start.elapsed());
                    return Some((upstream, backend));
                }
                Err(e) => {
                    tracing::warn!(
                        backend = %backend.address(),
                        attempt,
                        error = %e,
                        "upstream handshake failed"
                    );
                    backend.record_connection_failure(false);
                }
            },
            Err(e) => {
                tracing::warn!(
                    backend = %backend.address(),
                    attempt,
                    error = %e,
                    "upstream dial failed"
                );
                backend.record_connection_failure(e.is_timeout());
            }
        }

        // Unpin the client so the next attempt rotates to a fresh backend.
        balancer.evict(client_addr);

        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }

    None
}
