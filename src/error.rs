//! Error types for the load balancer.

use thiserror::Error;

/// Result type alias for sockspool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading configuration, accepting clients,
/// selecting backends, or forwarding traffic.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file read, parse, or validation error
    #[error("configuration error: {0}")]
    Config(String),

    /// Listen socket could not be acquired
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that could not be bound
        addr: String,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// The balancer produced no candidate backend
    #[error("no backend available")]
    NoBackend,

    /// Upstream dial timed out
    #[error("dial {0} timed out")]
    DialTimeout(String),

    /// Upstream dial failed (refused, unreachable, ...)
    #[error("dial {addr} failed: {source}")]
    Dial {
        /// Backend address that was dialed
        addr: String,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// Malformed SOCKS5 exchange with client or upstream
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Health probe failure (per backend, never fatal)
    #[error("probe failed: {0}")]
    Probe(String),

    /// A component was started twice or stopped while not running
    #[error("{0}")]
    State(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new probe error
    pub fn probe(msg: impl Into<String>) -> Self {
        Error::Probe(msg.into())
    }

    /// Check if this error is a dial or I/O timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::DialTimeout(_) => true,
            Error::Dial { source, .. } | Error::Network(source) => {
                source.kind() == std::io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }

    /// Check if this error is a refused upstream connection
    pub fn is_refused(&self) -> bool {
        match self {
            Error::Dial { source, .. } | Error::Network(source) => {
                source.kind() == std::io::ErrorKind::ConnectionRefused
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NoBackend;
        assert_eq!(err.to_string(), "no backend available");

        let err = Error::DialTimeout("10.0.0.1:1080".into());
        assert_eq!(err.to_string(), "dial 10.0.0.1:1080 timed out");
    }

    #[test]
    fn test_error_timeout_classification() {
        assert!(Error::DialTimeout("x:1".into()).is_timeout());
        assert!(!Error::NoBackend.is_timeout());

        let refused = Error::Dial {
            addr: "x:1".into(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(refused.is_refused());
        assert!(!refused.is_timeout());
    }
}
