//! # sockspool
//!
//! A layer-7 reverse load balancer for pools of upstream SOCKS5 proxies.
//! Inbound TCP connections are spread across the fastest healthy upstreams,
//! with active health probing, per-backend circuit breaking, and sticky
//! client sessions.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Listener                            │
//! │     transparent splice        or        SOCKS5 terminate   │
//! ├────────────────────────────────────────────────────────────┤
//! │  Balancer (latency sort, max-active cap, sticky sessions)  │
//! ├────────────────────────────────────────────────────────────┤
//! │  Pool of Backends (health, latency, circuit, metrics)      │
//! ├────────────────────────────────────────────────────────────┤
//! │  Health Checker (TCP reach + URL probe through upstream)   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Latency first**: rotation happens over the fastest upstreams only
//! 2. **Containment**: a failing upstream trips its own circuit, nothing else
//! 3. **Small footprint**: `max_active_backends` caps the visible fan-out
//! 4. **Boring wire format**: plain RFC 1928 CONNECT, no authentication

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod backend;
pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod proxy;
pub mod web;

pub use error::{Error, Result};

/// Crate version, surfaced by the `--version` flag.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
