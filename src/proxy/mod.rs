//! Forwarding data planes.
//!
//! Transparent mode splices raw bytes between the client and an upstream
//! SOCKS5 proxy. SOCKS5 mode terminates the client handshake and
//! re-originates the CONNECT towards the chosen upstream.

pub mod relay;
mod server;
pub mod socks5;
mod transparent;

pub use server::Socks5Server;
pub use transparent::TransparentServer;
