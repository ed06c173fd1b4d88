//! Ordered policy pipeline for outbound destinations.

use tracing::debug;

use crate::blocklist::BlocklistStore;
use crate::config::{FailoverMode, ProxyOptions};
use crate::flags::{FlagClient, FlagOutcome};
use crate::host::{is_ip_address, is_loopback, normalize_domain};
use crate::Result;

/// Ports treated as SSH-family destinations.
pub const SSH_PORTS: &[u16] = &[22, 2222, 7999];

/// Git hosts reachable over SSH when no custom allowlist is configured.
pub const DEFAULT_GIT_HOSTS: &[&str] = &[
    "github.com",
    "gitlab.com",
    "bitbucket.org",
    "ssh.dev.azure.com",
];

/// Decision for one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDecision {
    /// Destination is allowed.
    Allowed,

    /// Destination is blocked.
    Blocked(BlockReason),
}

impl BlockDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BlockDecision::Allowed)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, BlockDecision::Blocked(_))
    }

    /// The blocking reason, if blocked.
    pub fn reason(&self) -> Option<BlockReason> {
        match self {
            BlockDecision::Allowed => None,
            BlockDecision::Blocked(reason) => Some(*reason),
        }
    }
}

/// Why a destination was blocked. Exactly one reason applies per decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Destination is a loopback address and loopback is blocked.
    Loopback,

    /// Destination is a raw IP literal and those are not allowed.
    IpAddress,

    /// Destination matches the static blocklist.
    Blocklist,

    /// Destination is an SSH port and SSH is disabled.
    SshDisabled,

    /// Destination is an SSH port on a host outside the git-host allowlist.
    SshNonGitHost,

    /// The remote flag service denied the domain.
    DynamicFlag,

    /// A cached flag verdict denied the domain.
    DynamicFlagCached,

    /// The flag service was unreachable and failover is deny.
    DynamicFlagUnreachable,

    /// The flag service was unreachable and the blocklist fallback matched.
    BlocklistFallback,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockReason::Loopback => "loopback",
            BlockReason::IpAddress => "ip-address",
            BlockReason::Blocklist => "blocklist",
            BlockReason::SshDisabled => "ssh-disabled",
            BlockReason::SshNonGitHost => "ssh-non-git-host",
            BlockReason::DynamicFlag => "dynamic-flag",
            BlockReason::DynamicFlagCached => "dynamic-flag-cached",
            BlockReason::DynamicFlagUnreachable => "dynamic-flag-unreachable",
            BlockReason::BlocklistFallback => "blocklist-fallback",
        };
        write!(f, "{s}")
    }
}

/// The ordered evaluator shared by every connection-handling path.
pub struct PolicyEngine {
    options: ProxyOptions,
    blocklist: BlocklistStore,
    flags: Option<FlagClient>,
}

impl PolicyEngine {
    /// Build an engine from options and a (possibly live-reloading) store.
    pub fn new(options: ProxyOptions, blocklist: BlocklistStore) -> Result<Self> {
        let flags = match &options.flag_config {
            Some(config) => Some(FlagClient::new(config.clone())?),
            None => None,
        };
        Ok(Self {
            options,
            blocklist,
            flags,
        })
    }

    /// The blocklist store backing layers 3 and the failover fallback.
    pub fn blocklist(&self) -> &BlocklistStore {
        &self.blocklist
    }

    /// Evaluate a destination against the full pipeline.
    ///
    /// The layer order is a strict invariant: loopback and IP checks run
    /// before anything that could touch the network, the static blocklist
    /// takes precedence over the SSH rules (a blocklisted git host stays
    /// blocked), and the dynamic flag layer runs last.
    pub async fn check_blocked(&self, host: &str, port: u16) -> BlockDecision {
        let normalized = normalize_domain(host);

        // 1) Loopback
        if self.options.block_loopback && is_loopback(&normalized) {
            return BlockDecision::Blocked(BlockReason::Loopback);
        }

        // 2) Raw IP literals
        if !self.options.allow_ip_addresses && is_ip_address(&normalized) {
            return BlockDecision::Blocked(BlockReason::IpAddress);
        }

        // 3) Static blocklist
        if self.blocklist.contains(&normalized) {
            return BlockDecision::Blocked(BlockReason::Blocklist);
        }

        // 4) SSH rules
        if SSH_PORTS.contains(&port) {
            if !self.options.allow_ssh {
                return BlockDecision::Blocked(BlockReason::SshDisabled);
            }
            if !self.options.allow_ssh_to_all_hosts && !self.git_host_allowed(&normalized) {
                return BlockDecision::Blocked(BlockReason::SshNonGitHost);
            }
        }

        // 5) Dynamic flag layer
        match &self.flags {
            Some(client) => match client.evaluate(&normalized).await {
                FlagOutcome::Cached(true) | FlagOutcome::Fresh(true) => BlockDecision::Allowed,
                FlagOutcome::Cached(false) => {
                    BlockDecision::Blocked(BlockReason::DynamicFlagCached)
                }
                FlagOutcome::Fresh(false) => BlockDecision::Blocked(BlockReason::DynamicFlag),
                FlagOutcome::Unavailable => self.resolve_failover(&normalized, client.failover()),
            },
            None => BlockDecision::Allowed,
        }
    }

    /// Resolve an unreachable flag service according to the failover mode.
    fn resolve_failover(&self, normalized: &str, mode: FailoverMode) -> BlockDecision {
        match mode {
            FailoverMode::Deny => BlockDecision::Blocked(BlockReason::DynamicFlagUnreachable),
            FailoverMode::Blocklist => {
                if self.blocklist.contains(normalized) {
                    BlockDecision::Blocked(BlockReason::BlocklistFallback)
                } else {
                    debug!(domain = normalized, "flag service unreachable, blocklist fallback allows");
                    BlockDecision::Allowed
                }
            }
            FailoverMode::Allow => BlockDecision::Allowed,
        }
    }

    /// Exact or subdomain match against the configured git hosts.
    fn git_host_allowed(&self, normalized: &str) -> bool {
        let matches = |git_host: &str| {
            normalized == git_host || normalized.ends_with(&format!(".{git_host}"))
        };
        match &self.options.git_hosts {
            Some(hosts) => hosts.iter().any(|h| matches(&h.to_lowercase())),
            None => DEFAULT_GIT_HOSTS.iter().copied().any(matches),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DynamicFlagConfig;
    use std::collections::HashSet;

    fn blocked(domains: &[&str]) -> BlocklistStore {
        let set: HashSet<String> = domains.iter().map(|d| d.to_string()).collect();
        BlocklistStore::from_set(set)
    }

    fn engine(options: ProxyOptions, domains: &[&str]) -> PolicyEngine {
        PolicyEngine::new(options, blocked(domains)).unwrap()
    }

    #[tokio::test]
    async fn test_defaults_allow_plain_https() {
        let engine = engine(ProxyOptions::default(), &["evil.com"]);
        assert_eq!(
            engine.check_blocked("github.com", 443).await,
            BlockDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_blocklist_blocks_domain_and_subdomains() {
        let engine = engine(ProxyOptions::default(), &["evil.com"]);
        assert_eq!(
            engine.check_blocked("evil.com", 443).await,
            BlockDecision::Blocked(BlockReason::Blocklist)
        );
        assert_eq!(
            engine.check_blocked("api.evil.com", 443).await,
            BlockDecision::Blocked(BlockReason::Blocklist)
        );
    }

    #[tokio::test]
    async fn test_ip_literals_denied_by_default() {
        let engine = engine(ProxyOptions::default(), &[]);
        assert_eq!(
            engine.check_blocked("93.184.216.34", 443).await,
            BlockDecision::Blocked(BlockReason::IpAddress)
        );

        let permissive = self::engine(
            ProxyOptions::builder().allow_ip_addresses(true).build(),
            &[],
        );
        assert_eq!(
            permissive.check_blocked("93.184.216.34", 443).await,
            BlockDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_loopback_allowed_unless_blocked() {
        let engine = engine(ProxyOptions::default(), &[]);
        assert_eq!(
            engine.check_blocked("localhost", 8080).await,
            BlockDecision::Allowed
        );

        let blocking = self::engine(ProxyOptions::builder().block_loopback(true).build(), &[]);
        assert_eq!(
            blocking.check_blocked("localhost", 8080).await,
            BlockDecision::Blocked(BlockReason::Loopback)
        );
        assert_eq!(
            blocking.check_blocked("127.0.0.1", 8080).await,
            BlockDecision::Blocked(BlockReason::Loopback)
        );
    }

    #[tokio::test]
    async fn test_loopback_check_precedes_ip_check() {
        // 127.0.0.1 is both loopback and an IP literal; the loopback
        // reason must win when loopback blocking is on.
        let engine = engine(ProxyOptions::builder().block_loopback(true).build(), &[]);
        assert_eq!(
            engine.check_blocked("127.0.0.1", 443).await,
            BlockDecision::Blocked(BlockReason::Loopback)
        );
    }

    #[tokio::test]
    async fn test_ssh_allowed_to_git_hosts_only() {
        let engine = engine(ProxyOptions::default(), &[]);
        for port in [22, 2222, 7999] {
            assert_eq!(
                engine.check_blocked("github.com", port).await,
                BlockDecision::Allowed,
                "github.com:{port}"
            );
            assert_eq!(
                engine.check_blocked("random-server.com", port).await,
                BlockDecision::Blocked(BlockReason::SshNonGitHost),
                "random-server.com:{port}"
            );
        }
        // Subdomain of a git host is fine
        assert_eq!(
            engine.check_blocked("ssh.github.com", 22).await,
            BlockDecision::Allowed
        );
        // SSH rules do not apply off the SSH ports
        assert_eq!(
            engine.check_blocked("random-server.com", 443).await,
            BlockDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_ssh_disabled() {
        let engine = engine(ProxyOptions::builder().allow_ssh(false).build(), &[]);
        assert_eq!(
            engine.check_blocked("github.com", 22).await,
            BlockDecision::Blocked(BlockReason::SshDisabled)
        );
    }

    #[tokio::test]
    async fn test_ssh_to_all_hosts() {
        let engine = engine(
            ProxyOptions::builder().allow_ssh_to_all_hosts(true).build(),
            &[],
        );
        assert_eq!(
            engine.check_blocked("random-server.com", 22).await,
            BlockDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_custom_git_hosts_replace_defaults() {
        let engine = engine(
            ProxyOptions::builder().git_hosts(["git.corp.example"]).build(),
            &[],
        );
        assert_eq!(
            engine.check_blocked("git.corp.example", 22).await,
            BlockDecision::Allowed
        );
        assert_eq!(
            engine.check_blocked("mirror.git.corp.example", 22).await,
            BlockDecision::Allowed
        );
        assert_eq!(
            engine.check_blocked("github.com", 22).await,
            BlockDecision::Blocked(BlockReason::SshNonGitHost)
        );
    }

    #[tokio::test]
    async fn test_blocklist_precedes_ssh_rules() {
        let engine = engine(ProxyOptions::default(), &["github.com"]);
        assert_eq!(
            engine.check_blocked("github.com", 22).await,
            BlockDecision::Blocked(BlockReason::Blocklist)
        );
    }

    #[tokio::test]
    async fn test_failover_resolution() {
        let engine = engine(ProxyOptions::default(), &["evil.com"]);
        assert_eq!(
            engine.resolve_failover("example.com", FailoverMode::Deny),
            BlockDecision::Blocked(BlockReason::DynamicFlagUnreachable)
        );
        assert_eq!(
            engine.resolve_failover("evil.com", FailoverMode::Blocklist),
            BlockDecision::Blocked(BlockReason::BlocklistFallback)
        );
        assert_eq!(
            engine.resolve_failover("example.com", FailoverMode::Blocklist),
            BlockDecision::Allowed
        );
        assert_eq!(
            engine.resolve_failover("example.com", FailoverMode::Allow),
            BlockDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_dynamic_flag_denial_reasons() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sdk/evalx/client-abc/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "egress-allowlist": { "value": false }
            })))
            .mount(&server)
            .await;

        let mut flag_config = DynamicFlagConfig::new("client-abc");
        flag_config.evaluation_base_url = server.uri();
        flag_config.events_base_url = server.uri();

        let engine = engine(
            ProxyOptions::builder().flag_config(flag_config).build(),
            &[],
        );
        assert_eq!(
            engine.check_blocked("denied.example", 443).await,
            BlockDecision::Blocked(BlockReason::DynamicFlag)
        );
        // The verdict is now cached; the reason changes accordingly.
        assert_eq!(
            engine.check_blocked("denied.example", 443).await,
            BlockDecision::Blocked(BlockReason::DynamicFlagCached)
        );
    }

    #[tokio::test]
    async fn test_dynamic_flag_allows() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sdk/evalx/client-abc/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "egress-allowlist": { "value": true }
            })))
            .mount(&server)
            .await;

        let mut flag_config = DynamicFlagConfig::new("client-abc");
        flag_config.evaluation_base_url = server.uri();
        flag_config.events_base_url = server.uri();

        let engine = engine(
            ProxyOptions::builder().flag_config(flag_config).build(),
            &[],
        );
        assert_eq!(
            engine.check_blocked("allowed.example", 443).await,
            BlockDecision::Allowed
        );
    }

    #[tokio::test]
    async fn test_unreachable_flag_service_failover_deny() {
        let mut flag_config = DynamicFlagConfig::new("client-abc");
        flag_config.evaluation_base_url = "http://127.0.0.1:1".to_string();
        flag_config.events_base_url = "http://127.0.0.1:1".to_string();
        flag_config.failover = crate::config::FailoverMode::Deny;

        let engine = engine(
            ProxyOptions::builder().flag_config(flag_config).build(),
            &[],
        );
        assert_eq!(
            engine.check_blocked("example.com", 443).await,
            BlockDecision::Blocked(BlockReason::DynamicFlagUnreachable)
        );
    }

    #[tokio::test]
    async fn test_local_layers_hold_when_flag_service_unreachable() {
        // Loopback/IP/SSH/blocklist run before the network-bound layer, so
        // a dead flag service cannot weaken them.
        let mut flag_config = DynamicFlagConfig::new("client-abc");
        flag_config.evaluation_base_url = "http://127.0.0.1:1".to_string();
        flag_config.events_base_url = "http://127.0.0.1:1".to_string();

        let engine = engine(
            ProxyOptions::builder().flag_config(flag_config).build(),
            &["evil.com"],
        );
        assert_eq!(
            engine.check_blocked("evil.com", 443).await,
            BlockDecision::Blocked(BlockReason::Blocklist)
        );
        assert_eq!(
            engine.check_blocked("10.1.2.3", 443).await,
            BlockDecision::Blocked(BlockReason::IpAddress)
        );
    }
}
