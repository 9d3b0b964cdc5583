//! Upstream dialing and bidirectional byte pumping.
//!
//! The pipe runs one copy loop per direction. When a direction hits EOF the
//! peer's write side is shut down (half-close) so the opposite direction can
//! drain before the connection tears down. Cancellation drops both streams,
//! forcing them closed.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Upstream dial timeout. Deliberately independent of the health checker's
/// `connect_timeout`.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Copy buffer size per direction.
const COPY_BUF_SIZE: usize = 32 * 1024;

/// Dial an upstream backend with [`DIAL_TIMEOUT`].
pub async fn dial(addr: &str) -> Result<TcpStream> {
    match timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::Dial {
            addr: addr.to_string(),
            source: e,
        }),
        Err(_) => Err(Error::DialTimeout(addr.to_string())),
    }
}

/// Outcome of one relay direction.
pub type DirectionResult = std::io::Result<u64>;

/// Splice bytes in both directions until both sides finish or the token is
/// cancelled. Returns the per-direction results `(client_to_upstream,
/// upstream_to_client)`; cancellation yields `(Ok(0), Ok(0))` for whatever
/// had not finished.
pub async fn pipe(
    client: TcpStream,
    upstream: TcpStream,
    token: &CancellationToken,
) -> (DirectionResult, DirectionResult) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let client_to_upstream = copy_then_shutdown(&mut client_read, &mut upstream_write);
    let upstream_to_client = copy_then_shutdown(&mut upstream_read, &mut client_write);

    tokio::select! {
        results = async { tokio::join!(client_to_upstream, upstream_to_client) } => results,
        _ = token.cancelled() => (Ok(0), Ok(0)),
    }
}

// Copy src to dst until EOF or error, then shut down dst's write side so the
// peer sees EOF while its own sends keep flowing.
async fn copy_then_shutdown<R, W>(src: &mut R, dst: &mut W) -> DirectionResult
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    let result = loop {
        match src.read(&mut buf).await {
            Ok(0) => break Ok(total),
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };

    let _ = dst.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_refused() {
        let err = dial("127.0.0.1:1").await.unwrap_err();
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn test_pipe_relays_and_half_closes() {
        // Echo upstream: reads everything, writes it back, then closes.
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut data = Vec::new();
            sock.read_to_end(&mut data).await.unwrap();
            sock.write_all(&data).await.unwrap();
        });

        // Client side of the pipe.
        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();

        let pipe_task = tokio::spawn(async move {
            let (client, _) = client_listener.accept().await.unwrap();
            let upstream = dial(&upstream_addr.to_string()).await.unwrap();
            let token = CancellationToken::new();
            pipe(client, upstream, &token).await
        });

        let mut client = TcpStream::connect(client_addr).await.unwrap();
        client.write_all(b"HELLO").await.unwrap();
        // Half-close our write side; the echo must still come back.
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"HELLO");

        let (c2u, u2c) = pipe_task.await.unwrap();
        assert_eq!(c2u.unwrap(), 5);
        assert_eq!(u2c.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_pipe_cancellation_tears_down() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_sock, _) = upstream_listener.accept().await.unwrap();
            // Hold the connection open without reading.
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();

        let token = CancellationToken::new();
        let pipe_token = token.clone();
        let pipe_task = tokio::spawn(async move {
            let (client, _) = client_listener.accept().await.unwrap();
            let upstream = dial(&upstream_addr.to_string()).await.unwrap();
            pipe(client, upstream, &pipe_token).await
        });

        let _client = TcpStream::connect(client_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let (c2u, u2c) = tokio::time::timeout(Duration::from_secs(1), pipe_task)
            .await
            .expect("pipe must unwind on cancellation")
            .unwrap();
        assert_eq!(c2u.unwrap(), 0);
        assert_eq!(u2c.unwrap(), 0);
    }
}
