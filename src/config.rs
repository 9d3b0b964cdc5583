//! Runtime configuration.
//!
//! Loaded from a TOML file at startup and immutable afterwards. Backend
//! addresses may use port-range syntax (`host:1080-1100`), which is expanded
//! into individual backends before the pool is built.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Maximum number of ports a single range expression may expand to.
pub const MAX_PORT_RANGE: u16 = 1000;

/// Forwarding mode of the listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Raw byte splicing between client and upstream, no SOCKS5 decoding.
    #[default]
    Transparent,
    /// SOCKS5 termination towards the client, re-origination towards the upstream.
    Socks5,
}

impl Mode {
    /// Human-readable mode name, as written in the config file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Transparent => "transparent",
            Mode::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "transparent" => Ok(Mode::Transparent),
            "socks5" => Ok(Mode::Socks5),
            other => Err(Error::config(format!(
                "invalid mode: {other} (use 'transparent' or 'socks5')"
            ))),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// host:port the proxy listens on
    pub listen: String,
    /// Forwarding mode
    #[serde(default)]
    pub mode: Mode,
    /// Upstream SOCKS5 proxies (port ranges allowed)
    pub backends: Vec<BackendConfig>,
    /// Health check settings
    #[serde(default)]
    pub health: HealthConfig,
    /// Load balancer settings
    #[serde(default)]
    pub balancer: BalancerConfig,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
    /// Optional monitoring endpoint
    #[serde(default)]
    pub web: Option<WebConfig>,
}

/// A single upstream proxy, or a port range of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// `host:port` or `host:port_start-port_end`; IPv6 as `[addr]:port`
    pub address: String,
    /// Optional human label
    #[serde(default)]
    pub name: String,
}

/// Health checker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthConfig {
    /// URL fetched through each backend to measure latency; empty disables
    /// the URL probe (TCP reachability only)
    pub test_url: String,
    /// Period between probe rounds
    #[serde(deserialize_with = "duration_str")]
    pub check_interval: Duration,
    /// TCP reachability probe timeout
    #[serde(deserialize_with = "duration_str")]
    pub connect_timeout: Duration,
    /// Total timeout for the URL probe
    #[serde(deserialize_with = "duration_str")]
    pub request_timeout: Duration,
    /// Consecutive failures before a backend is marked unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            test_url: "https://www.google.com".to_string(),
            check_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }
}

/// Load balancer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BalancerConfig {
    /// Selection algorithm; only `roundrobin` is defined
    pub algorithm: String,
    /// Only select backends with latency at or below this value (0 disables)
    #[serde(deserialize_with = "duration_str")]
    pub max_latency: Duration,
    /// How long a client IP stays bound to its backend (0 disables)
    #[serde(deserialize_with = "duration_str")]
    pub sticky_session_ttl: Duration,
    /// Rotate over only the N fastest backends (0 = use all)
    pub max_active_backends: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: "roundrobin".to_string(),
            max_latency: Duration::ZERO,
            sticky_session_ttl: Duration::from_secs(300),
            max_active_backends: 0,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LogConfig {
    /// Minimum level: debug, info, warn, error
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Monitoring endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebConfig {
    /// host:port the stats endpoint listens on
    pub listen: String,
}

fn duration_str<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

impl Config {
    /// Read and parse the configuration file, then validate it.
    pub fn load(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {path}: {e}")))?;

        let cfg: Config = toml::from_str(&data)
            .map_err(|e| Error::config(format!("failed to parse {path}: {e}")))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Check that the configuration is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(Error::config("listen address is required"));
        }

        if self.backends.is_empty() {
            return Err(Error::config("at least one backend is required"));
        }

        for (i, b) in self.backends.iter().enumerate() {
            if b.address.is_empty() {
                return Err(Error::config(format!("backend {i}: address is required")));
            }
            parse_address(&b.address).map_err(|e| {
                Error::config(format!("backend {i} ({}): invalid address: {e}", b.name))
            })?;
        }

        if self.health.failure_threshold == 0 {
            return Err(Error::config("health.failure_threshold must be at least 1"));
        }

        if self.balancer.algorithm != "roundrobin" {
            return Err(Error::config(format!(
                "unsupported balancer algorithm: {}",
                self.balancer.algorithm
            )));
        }

        Ok(())
    }

    /// Expand port ranges into one entry per port. Named backends that expand
    /// to N > 1 entries get `#1` ... `#N` suffixed to their name.
    pub fn expand_backends(&self) -> Vec<BackendConfig> {
        let mut expanded = Vec::new();

        for backend in &self.backends {
            // Validation already ran, so parse_address cannot fail here.
            let Ok(addresses) = parse_address(&backend.address) else {
                continue;
            };

            if addresses.len() == 1 {
                expanded.push(backend.clone());
            } else {
                for (i, addr) in addresses.iter().enumerate() {
                    let name = if backend.name.is_empty() {
                        String::new()
                    } else {
                        format!("{}#{}", backend.name, i + 1)
                    };
                    expanded.push(BackendConfig {
                        address: addr.clone(),
                        name,
                    });
                }
            }
        }

        expanded
    }
}

/// Parse a backend address expression into individual `host:port` addresses.
///
/// Accepts `host:port`, `host:port_start-port_end`, and the bracketed IPv6
/// forms `[addr]:port` / `[addr]:port_start-port_end`. Ranges are inclusive,
/// ascending, and capped at [`MAX_PORT_RANGE`] ports.
pub fn parse_address(addr: &str) -> Result<Vec<String>> {
    let (host, port_part) = if let Some(rest) = addr.strip_prefix('[') {
        // IPv6: [host]:port or [host]:port-port
        let closing = rest
            .find(']')
            .ok_or_else(|| Error::config("invalid IPv6 format: missing closing bracket"))?;
        let host = &rest[..closing];
        let after = &rest[closing + 1..];
        let port = after
            .strip_prefix(':')
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::config("invalid IPv6 format: missing port"))?;
        (host, port)
    } else {
        // IPv4 or hostname: host:port or host:port-port
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::config("invalid address format: missing port"))?;
        (host, port)
    };

    if let Some((start_str, end_str)) = port_part.split_once('-') {
        let start: u16 = start_str
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid start port: {e}")))?;
        let end: u16 = end_str
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid end port: {e}")))?;

        if start == 0 {
            return Err(Error::config("start port out of range: 0"));
        }
        if end == 0 {
            return Err(Error::config("end port out of range: 0"));
        }
        if start > end {
            return Err(Error::config(format!(
                "start port ({start}) greater than end port ({end})"
            )));
        }
        if end - start > MAX_PORT_RANGE {
            return Err(Error::config(format!(
                "port range too large (max {MAX_PORT_RANGE}): {start}-{end}"
            )));
        }

        let addresses = (start..=end)
            .map(|port| {
                if host.contains(':') {
                    format!("[{host}]:{port}")
                } else {
                    format!("{host}:{port}")
                }
            })
            .collect();
        Ok(addresses)
    } else {
        let port: u16 = port_part
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("invalid port: {e}")))?;
        if port == 0 {
            return Err(Error::config("port out of range: 0"));
        }
        Ok(vec![addr.to_string()])
    }
}
