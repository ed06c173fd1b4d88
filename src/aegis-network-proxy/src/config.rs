//! Egress proxy configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Behavior when the remote flag service cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    /// Allow the connection (default).
    #[default]
    Allow,

    /// Deny the connection.
    Deny,

    /// Fall back to the static blocklist.
    Blocklist,
}

impl std::fmt::Display for FailoverMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverMode::Allow => write!(f, "allow"),
            FailoverMode::Deny => write!(f, "deny"),
            FailoverMode::Blocklist => write!(f, "blocklist"),
        }
    }
}

impl std::str::FromStr for FailoverMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" | "open" => Ok(FailoverMode::Allow),
            "deny" | "closed" => Ok(FailoverMode::Deny),
            "blocklist" | "blocked-domains" => Ok(FailoverMode::Blocklist),
            _ => Err(format!("unknown failover mode: {}", s)),
        }
    }
}

/// Default evaluation endpoint of the hosted flag service.
pub const DEFAULT_EVALUATION_BASE_URL: &str = "https://clientsdk.launchdarkly.com";

/// Default events endpoint of the hosted flag service.
pub const DEFAULT_EVENTS_BASE_URL: &str = "https://events.launchdarkly.com";

fn default_cache_ttl() -> u64 {
    3600
}

fn default_evaluation_base_url() -> String {
    DEFAULT_EVALUATION_BASE_URL.to_string()
}

fn default_events_base_url() -> String {
    DEFAULT_EVENTS_BASE_URL.to_string()
}

/// Configuration for the dynamic flag layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicFlagConfig {
    /// Client identifier for the remote flag service.
    pub client_id: String,

    /// Subject identity reported with each evaluation. Defaults to the
    /// local username when absent.
    #[serde(default)]
    pub subject: Option<String>,

    /// Seconds a cached verdict stays live.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Behavior when the service is unreachable.
    #[serde(default)]
    pub failover: FailoverMode,

    /// Evaluation endpoint base URL (overridable for tests).
    #[serde(default = "default_evaluation_base_url")]
    pub evaluation_base_url: String,

    /// Events endpoint base URL (overridable for tests).
    #[serde(default = "default_events_base_url")]
    pub events_base_url: String,
}

impl DynamicFlagConfig {
    /// Create a config with defaults for the given client id.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            subject: None,
            cache_ttl_secs: default_cache_ttl(),
            failover: FailoverMode::default(),
            evaluation_base_url: default_evaluation_base_url(),
            events_base_url: default_events_base_url(),
        }
    }
}

/// Configuration for the egress proxy, immutable per proxy lifetime.
///
/// Defaults are security-maximal: IP literals denied, SSH restricted to the
/// known git hosts, loopback allowed (the proxy itself is reached via
/// loopback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyOptions {
    /// Listening port; 0 picks an ephemeral port.
    #[serde(default)]
    pub port: u16,

    /// Path to the newline-delimited blocked-domain file.
    #[serde(default)]
    pub blocklist_path: Option<PathBuf>,

    /// Dynamic flag layer; absent disables it.
    #[serde(default)]
    pub flag_config: Option<DynamicFlagConfig>,

    /// Permit raw IP-literal destinations.
    #[serde(default)]
    pub allow_ip_addresses: bool,

    /// Deny loopback destinations.
    #[serde(default)]
    pub block_loopback: bool,

    /// Permit SSH-port destinations at all.
    #[serde(default = "default_true")]
    pub allow_ssh: bool,

    /// Custom git-host allowlist for SSH; `None` uses the defaults.
    #[serde(default)]
    pub git_hosts: Option<Vec<String>>,

    /// Permit SSH to any host, bypassing the git-host allowlist.
    #[serde(default)]
    pub allow_ssh_to_all_hosts: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            port: 0,
            blocklist_path: None,
            flag_config: None,
            allow_ip_addresses: false,
            block_loopback: false,
            allow_ssh: true,
            git_hosts: None,
            allow_ssh_to_all_hosts: false,
        }
    }
}

impl ProxyOptions {
    /// Create options with security-maximal defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder.
    pub fn builder() -> ProxyOptionsBuilder {
        ProxyOptionsBuilder::new()
    }

    /// Read the host's environment-variable configuration surface.
    ///
    /// Recognized variables: `AEGIS_BLOCKLIST_PATH`,
    /// `AEGIS_ALLOW_IP_ADDRESSES`, `AEGIS_BLOCK_LOOPBACK`, `AEGIS_ALLOW_SSH`,
    /// `AEGIS_GIT_HOSTS` (comma-separated), `AEGIS_ALLOW_SSH_ALL_HOSTS`,
    /// `AEGIS_FLAG_CLIENT_ID`, `AEGIS_FLAG_FAILOVER`, `AEGIS_FLAG_TTL_SECS`.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(path) = std::env::var("AEGIS_BLOCKLIST_PATH")
            && !path.is_empty()
        {
            options.blocklist_path = Some(PathBuf::from(path));
        }
        if let Some(v) = env_flag("AEGIS_ALLOW_IP_ADDRESSES") {
            options.allow_ip_addresses = v;
        }
        if let Some(v) = env_flag("AEGIS_BLOCK_LOOPBACK") {
            options.block_loopback = v;
        }
        if let Some(v) = env_flag("AEGIS_ALLOW_SSH") {
            options.allow_ssh = v;
        }
        if let Some(v) = env_flag("AEGIS_ALLOW_SSH_ALL_HOSTS") {
            options.allow_ssh_to_all_hosts = v;
        }
        if let Ok(hosts) = std::env::var("AEGIS_GIT_HOSTS") {
            let hosts: Vec<String> = hosts
                .split(',')
                .map(|h| h.trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect();
            if !hosts.is_empty() {
                options.git_hosts = Some(hosts);
            }
        }

        if let Ok(client_id) = std::env::var("AEGIS_FLAG_CLIENT_ID")
            && !client_id.is_empty()
        {
            let mut flag_config = DynamicFlagConfig::new(client_id);
            if let Ok(mode) = std::env::var("AEGIS_FLAG_FAILOVER")
                && let Ok(mode) = mode.parse()
            {
                flag_config.failover = mode;
            }
            if let Ok(ttl) = std::env::var("AEGIS_FLAG_TTL_SECS")
                && let Ok(ttl) = ttl.parse()
            {
                flag_config.cache_ttl_secs = ttl;
            }
            options.flag_config = Some(flag_config);
        }

        options
    }
}

/// Parse a boolean environment variable loosely: `1`/`true`/`yes`/`on` are
/// true, `0`/`false`/`no`/`off` are false, anything else is absent.
fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Builder for [`ProxyOptions`].
#[derive(Debug, Default)]
pub struct ProxyOptionsBuilder {
    options: ProxyOptions,
}

impl ProxyOptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: ProxyOptions::new(),
        }
    }

    /// Set the listening port (0 = ephemeral).
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    /// Set the blocked-domain file path.
    pub fn blocklist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.blocklist_path = Some(path.into());
        self
    }

    /// Enable the dynamic flag layer.
    pub fn flag_config(mut self, config: DynamicFlagConfig) -> Self {
        self.options.flag_config = Some(config);
        self
    }

    /// Permit raw IP-literal destinations.
    pub fn allow_ip_addresses(mut self, allow: bool) -> Self {
        self.options.allow_ip_addresses = allow;
        self
    }

    /// Deny loopback destinations.
    pub fn block_loopback(mut self, block: bool) -> Self {
        self.options.block_loopback = block;
        self
    }

    /// Permit SSH-port destinations.
    pub fn allow_ssh(mut self, allow: bool) -> Self {
        self.options.allow_ssh = allow;
        self
    }

    /// Replace the git-host allowlist for SSH.
    pub fn git_hosts(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.options.git_hosts = Some(hosts.into_iter().map(Into::into).collect());
        self
    }

    /// Permit SSH to any host.
    pub fn allow_ssh_to_all_hosts(mut self, allow: bool) -> Self {
        self.options.allow_ssh_to_all_hosts = allow;
        self
    }

    /// Build the options.
    pub fn build(self) -> ProxyOptions {
        self.options
    }
}
