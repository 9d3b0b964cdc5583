//! SOCKS5 wire protocol (RFC 1928, CONNECT only, no authentication).
//!
//! Two halves: terminating the handshake of an inbound client, and
//! re-originating a CONNECT towards an upstream proxy. Both operate on any
//! async stream so tests can run over in-memory pipes.

use std::net::{IpAddr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Protocol version byte.
pub const SOCKS_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Request granted
    Success = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddrTypeNotSupported = 0x08,
}

/// Target address requested by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IP literal and port
    Ip(SocketAddr),
    /// Hostname and port, resolved by the upstream proxy
    Domain(String, u16),
}

impl TargetAddr {
    /// Build from a textual host and port, preferring the IP literal form
    /// when the host parses as one.
    pub fn from_host_port(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        }
    }

    /// The port the client asked for.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(sock) => sock.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Append the SOCKS5 encoding (ATYP + address + port) to `buf`.
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            TargetAddr::Ip(SocketAddr::V4(sock)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&sock.ip().octets());
                buf.extend_from_slice(&sock.port().to_be_bytes());
            }
            TargetAddr::Ip(SocketAddr::V6(sock)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&sock.ip().octets());
                buf.extend_from_slice(&sock.port().to_be_bytes());
            }
            TargetAddr::Domain(domain, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(sock) => write!(f, "{sock}"),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// Terminate the client side of the SOCKS5 handshake: method negotiation
/// plus the CONNECT request. Returns the requested target.
///
/// The final reply (success or failure) is NOT sent here — the caller sends
/// it once the upstream connection is settled, via [`send_reply`].
/// Unsupported commands and address types are answered with the matching
/// error reply before this returns an error.
pub async fn handshake_client<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // === Greeting ===
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    let version = header[0];
    let n_methods = header[1] as usize;

    if version != SOCKS_VERSION {
        return Err(Error::handshake(format!(
            "unsupported SOCKS version: {version}"
        )));
    }

    let mut methods = vec![0u8; n_methods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream
            .write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE])
            .await?;
        return Err(Error::handshake("no supported authentication method"));
    }

    stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;

    // === Request ===
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;

    if request[0] != SOCKS_VERSION {
        return Err(Error::handshake(format!(
            "invalid request version: {}",
            request[0]
        )));
    }

    let cmd = request[1];
    let addr_type = request[3];

    if cmd != CMD_CONNECT {
        send_reply(stream, Reply::CommandNotSupported).await?;
        return Err(Error::handshake(format!("unsupported command: {cmd}")));
    }

    let target = match addr_type {
        ATYP_IPV4 => {
            let mut raw = [0u8; 4];
            stream.read_exact(&mut raw).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::from(raw), port))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Error::handshake("domain is not valid UTF-8"))?;
            let port = read_port(stream).await?;
            TargetAddr::Domain(domain, port)
        }
        ATYP_IPV6 => {
            let mut raw = [0u8; 16];
            stream.read_exact(&mut raw).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::from(raw), port))
        }
        other => {
            send_reply(stream, Reply::AddrTypeNotSupported).await?;
            return Err(Error::handshake(format!(
                "unsupported address type: {other}"
            )));
        }
    };

    Ok(target)
}

/// Send a SOCKS5 reply with bind address `0.0.0.0:0`.
pub async fn send_reply<S>(stream: &mut S, reply: Reply) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = [
        SOCKS_VERSION,
        reply as u8,
        0x00, // reserved
        ATYP_IPV4,
        0, 0, 0, 0, // 0.0.0.0
        0, 0, // port 0
    ];
    stream.write_all(&response).await?;
    Ok(())
}

/// Run the client side of a SOCKS5 handshake against an upstream proxy:
/// negotiate no-auth, send CONNECT for `target`, and validate the reply.
pub async fn handshake_upstream<S>(stream: &mut S, target: &TargetAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method negotiation: offer no-auth only.
    stream
        .write_all(&[SOCKS_VERSION, 0x01, AUTH_NONE])
        .await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [SOCKS_VERSION, AUTH_NONE] {
        return Err(Error::handshake(format!(
            "upstream rejected no-auth: {:02x?}",
            choice
        )));
    }

    // CONNECT request.
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    target.encode(&mut request);
    stream.write_all(&request).await?;

    // Reply: header, then a bind address we discard.
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;

    if reply[0] != SOCKS_VERSION {
        return Err(Error::handshake(format!(
            "invalid upstream reply version: {}",
            reply[0]
        )));
    }
    if reply[1] != Reply::Success as u8 {
        return Err(Error::handshake(format!(
            "upstream CONNECT failed: reply 0x{:02x}",
            reply[1]
        )));
    }

    let bind_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(Error::handshake(format!(
                "invalid upstream bind address type: {other}"
            )));
        }
    };

    let mut discard = vec![0u8; bind_len + 2];
    stream.read_exact(&mut discard).await?;

    Ok(())
}

async fn read_port<S>(stream: &mut S) -> Result<u16>
where
    S: AsyncRead + Unpin,
{
    let mut raw = [0u8; 2];
    stream.read_exact(&mut raw).await?;
    Ok(u16::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_client_handshake_ipv4() {
        let (mut client, mut server) = duplex(256);

        let handshake = tokio::spawn(async move { handshake_client(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut auth = [0u8; 2];
        client.read_exact(&mut auth).await.unwrap();
        assert_eq!(auth, [0x05, 0x00]);

        // CONNECT 8.8.8.8:53
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 8, 8, 8, 8, 0x00, 0x35])
            .await
            .unwrap();

        let target = handshake.await.unwrap().unwrap();
        assert_eq!(target, TargetAddr::from_host_port("8.8.8.8", 53));
        assert_eq!(target.to_string(), "8.8.8.8:53");
    }

    #[tokio::test]
    async fn test_client_handshake_domain() {
        let (mut client, mut server) = duplex(256);

        let handshake = tokio::spawn(async move { handshake_client(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut auth = [0u8; 2];
        client.read_exact(&mut auth).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let target = handshake.await.unwrap().unwrap();
        assert_eq!(target.to_string(), "example.com:80");
    }

    #[tokio::test]
    async fn test_client_handshake_ipv6() {
        let (mut client, mut server) = duplex(256);

        let handshake = tokio::spawn(async move { handshake_client(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut auth = [0u8; 2];
        client.read_exact(&mut auth).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x04];
        request.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let target = handshake.await.unwrap().unwrap();
        assert_eq!(target.to_string(), "[2001:db8::1]:443");
    }

    #[tokio::test]
    async fn test_client_handshake_rejects_bad_version() {
        let (mut client, mut server) = duplex(256);
        let handshake = tokio::spawn(async move { handshake_client(&mut server).await });

        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        assert!(handshake.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_client_handshake_rejects_missing_noauth() {
        let (mut client, mut server) = duplex(256);
        let handshake = tokio::spawn(async move { handshake_client(&mut server).await });

        // Only GSSAPI (0x01) offered.
        client.write_all(&[0x05, 0x01, 0x01]).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
        assert!(handshake.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_client_handshake_rejects_bind_command() {
        let (mut client, mut server) = duplex(256);
        let handshake = tokio::spawn(async move { handshake_client(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut auth = [0u8; 2];
        client.read_exact(&mut auth).await.unwrap();

        // BIND (0x02) is not supported.
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::CommandNotSupported as u8);
        assert!(handshake.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_client_handshake_rejects_unknown_addr_type() {
        let (mut client, mut server) = duplex(256);
        let handshake = tokio::spawn(async move { handshake_client(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut auth = [0u8; 2];
        client.read_exact(&mut auth).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x00, 0x05]).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], Reply::AddrTypeNotSupported as u8);
        assert!(handshake.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_send_reply_format() {
        let (mut client, mut server) = duplex(64);
        send_reply(&mut server, Reply::HostUnreachable).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_upstream_handshake_ipv4() {
        let (mut ours, mut upstream) = duplex(256);

        let upstream_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            upstream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            upstream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            upstream.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x01]);
            assert_eq!(&request[4..8], &[8, 8, 8, 8]);
            assert_eq!(u16::from_be_bytes([request[8], request[9]]), 53);

            upstream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = TargetAddr::from_host_port("8.8.8.8", 53);
        handshake_upstream(&mut ours, &target).await.unwrap();
        upstream_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_handshake_domain_encoding() {
        let (mut ours, mut upstream) = duplex(256);

        let upstream_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            upstream.read_exact(&mut greeting).await.unwrap();
            upstream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut header = [0u8; 5];
            upstream.read_exact(&mut header).await.unwrap();
            assert_eq!(&header[..4], &[0x05, 0x01, 0x00, 0x03]);
            let len = header[4] as usize;
            assert_eq!(len, 11);

            let mut rest = vec![0u8; len + 2];
            upstream.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..len], b"example.com");
            assert_eq!(u16::from_be_bytes([rest[len], rest[len + 1]]), 80);

            // Reply with a domain-typed bind address to exercise the discard
            // path.
            let mut reply = vec![0x05, 0x00, 0x00, 0x03, 4];
            reply.extend_from_slice(b"none");
            reply.extend_from_slice(&0u16.to_be_bytes());
            upstream.write_all(&reply).await.unwrap();
        });

        let target = TargetAddr::from_host_port("example.com", 80);
        handshake_upstream(&mut ours, &target).await.unwrap();
        upstream_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_handshake_connect_refused() {
        let (mut ours, mut upstream) = duplex(256);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            upstream.read_exact(&mut greeting).await.unwrap();
            upstream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            upstream.read_exact(&mut request).await.unwrap();
            upstream
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let target = TargetAddr::from_host_port("8.8.8.8", 53);
        let err = handshake_upstream(&mut ours, &target).await.unwrap_err();
        assert!(err.to_string().contains("0x05"));
    }

    #[test]
    fn test_target_addr_prefers_ip_literal() {
        assert!(matches!(
            TargetAddr::from_host_port("192.0.2.1", 80),
            TargetAddr::Ip(_)
        ));
        assert!(matches!(
            TargetAddr::from_host_port("2001:db8::1", 80),
            TargetAddr::Ip(_)
        ));
        assert!(matches!(
            TargetAddr::from_host_port("example.com", 80),
            TargetAddr::Domain(_, _)
        ));
    }
}
