//! Loopback egress proxy for the Aegis sandbox.
//!
//! Every outbound connection from the sandboxed agent process funnels
//! through this proxy, which applies an ordered set of policies to the
//! destination and either forwards or rejects the connection:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ProxyServer                           │
//! │   plain HTTP ──┐                        ┌── CONNECT tunnel   │
//! │                ▼                        ▼                    │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                     PolicyEngine                       │  │
//! │  │  loopback → IP literal → blocklist → SSH → flag layer  │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │        │                    │                    │           │
//! │  BlocklistStore       DecisionCache         FlagClient       │
//! │  (live reload)        (per-domain TTL)      (remote REST)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The proxy binds to the IPv4 loopback only; the sandboxed process reaches
//! it through injected `HTTP_PROXY`/`HTTPS_PROXY` environment variables and
//! an SSH `ProxyCommand` helper. CONNECT tunnels are relayed as opaque byte
//! streams once authorized; TLS is never terminated or inspected.
//!
//! # Example
//!
//! ```rust,ignore
//! use aegis_network_proxy::{ProxyOptions, server};
//!
//! let options = ProxyOptions::builder()
//!     .blocklist_path("/etc/aegis/blocked-domains.txt")
//!     .block_loopback(true)
//!     .build();
//!
//! let handle = server::start(options).await?;
//! println!("egress proxy on 127.0.0.1:{}", handle.port());
//! handle.close();
//! ```

pub mod blocklist;
pub mod config;
pub mod flags;
pub mod host;
pub mod policy;
pub mod server;

pub use blocklist::{BlocklistStore, load_blocked};
pub use config::{DynamicFlagConfig, FailoverMode, ProxyOptions, ProxyOptionsBuilder};
pub use flags::{DecisionCache, EGRESS_FLAG_KEY, FlagClient, FlagOutcome};
pub use host::{ConnectTarget, is_ip_address, is_loopback, matches_blocked, normalize_domain};
pub use policy::{BlockDecision, BlockReason, DEFAULT_GIT_HOSTS, PolicyEngine, SSH_PORTS};
pub use server::{ProxyHandle, RequestMetrics, start};

use thiserror::Error;

/// Errors for the egress proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind the listener.
    #[error("proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error on a proxied connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
