//! Seatbelt (SBPL) isolation profile generation.
//!
//! The profile leaves general execution alone and denies the specific
//! capabilities that would let the agent bypass the egress proxy or tamper
//! with its own confinement: writes to the agent's configuration, all
//! networking except loopback/local IPC/DNS, raw sockets, well-known
//! tunneling binaries, and kernel-extension loading.

use std::path::{Path, PathBuf};

use crate::{Result, SandboxError};

/// Binaries denied execution when tunneling-tool blocking is on.
const TUNNELING_TOOLS: &[&str] = &["nc", "ncat", "netcat", "socat", "telnet"];

/// Prefixes searched for tunneling binaries.
const TOOL_PREFIXES: &[&str] = &["/usr/bin", "/bin", "/usr/local/bin", "/opt/homebrew/bin"];

/// Shell startup files protected alongside `~/.ssh`.
const SHELL_STARTUP_FILES: &[&str] = &[
    ".bashrc",
    ".bash_profile",
    ".zshrc",
    ".zprofile",
    ".profile",
];

/// Options for profile generation.
#[derive(Debug, Clone)]
pub struct ProfileOptions {
    /// The sandboxed user's home directory.
    pub home_dir: PathBuf,

    /// Deny writes to `~/.ssh` and shell startup files.
    pub protect_sensitive_files: bool,

    /// Deny raw-socket creation for AF_INET and AF_INET6.
    pub block_raw_sockets: bool,

    /// Deny execution of well-known tunneling binaries.
    pub block_tunneling_tools: bool,
}

impl ProfileOptions {
    /// Options with every protection enabled.
    pub fn new(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            protect_sensitive_files: true,
            block_raw_sockets: true,
            block_tunneling_tools: true,
        }
    }

    /// Options for the current user's home directory.
    pub fn for_current_user() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| SandboxError::InvalidPath("cannot determine home directory".into()))?;
        Ok(Self::new(home))
    }

    /// Read the toggles from the environment (`AEGIS_PROTECT_FILES`,
    /// `AEGIS_BLOCK_RAW_SOCKETS`, `AEGIS_BLOCK_TUNNELING_TOOLS`); every
    /// protection defaults to on.
    pub fn from_env(home_dir: impl Into<PathBuf>) -> Self {
        let mut options = Self::new(home_dir);
        if let Some(v) = env_flag("AEGIS_PROTECT_FILES") {
            options.protect_sensitive_files = v;
        }
        if let Some(v) = env_flag("AEGIS_BLOCK_RAW_SOCKETS") {
            options.block_raw_sockets = v;
        }
        if let Some(v) = env_flag("AEGIS_BLOCK_TUNNELING_TOOLS") {
            options.block_tunneling_tools = v;
        }
        options
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Escape a path for safe interpolation into SBPL.
///
/// SBPL is scheme-like; quotes, backslashes, parentheses, semicolons and
/// newlines in a path could otherwise terminate the string or inject
/// expressions.
fn escape_sbpl_path(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len() * 2);
    for ch in path.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '(' => escaped.push_str("\\("),
            ')' => escaped.push_str("\\)"),
            ';' => escaped.push_str("\\;"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\0' => continue,
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn escaped_join(base: &Path, rest: &str) -> Result<String> {
    let joined = base.join(rest);
    let s = joined
        .to_str()
        .ok_or_else(|| SandboxError::InvalidPath(joined.display().to_string()))?;
    Ok(escape_sbpl_path(s))
}

/// Generate the SBPL profile text for the given options.
pub fn build_profile(options: &ProfileOptions) -> Result<String> {
    let home = &options.home_dir;
    let config_dir = escaped_join(home, ".config/aegis")?;
    let config_file = escaped_join(home, ".config/aegis/config.yaml")?;

    let mut profile = String::with_capacity(4096);

    profile.push_str("(version 1)\n");
    profile.push_str("; Aegis agent isolation profile\n");
    profile.push_str("(allow default)\n\n");

    profile.push_str("; Agent configuration is read-only inside the sandbox\n");
    profile.push_str(&format!(
        "(deny file-write* (subpath \"{config_dir}\"))\n(deny file-write* (literal \"{config_file}\"))\n\n"
    ));

    if options.protect_sensitive_files {
        profile.push_str("; SSH material and shell startup files are read-only\n");
        let ssh_dir = escaped_join(home, ".ssh")?;
        profile.push_str(&format!("(deny file-write* (subpath \"{ssh_dir}\"))\n"));
        for file in SHELL_STARTUP_FILES {
            let path = escaped_join(home, file)?;
            profile.push_str(&format!("(deny file-write* (literal \"{path}\"))\n"));
        }
        profile.push('\n');
    }

    profile.push_str(
        r#"; Network: deny everything, then reopen loopback TCP, local IPC,
; and the system resolver so the proxy and DNS still work
(deny network*)
(allow network-outbound (remote tcp "localhost:*"))
(allow network-outbound (remote tcp "127.0.0.1:*"))
(allow network-inbound (local tcp "localhost:*"))
(allow network-inbound (local tcp "127.0.0.1:*"))
(allow network-outbound (remote unix-socket))
(allow network-inbound (local unix-socket))
(allow network-outbound (literal "/private/var/run/mDNSResponder"))

"#,
    );

    if options.block_raw_sockets {
        profile.push_str("; No raw sockets, either address family\n");
        profile.push_str("(deny system-socket (socket-domain AF_INET))\n");
        profile.push_str("(deny system-socket (socket-domain AF_INET6))\n\n");
    }

    if options.block_tunneling_tools {
        profile.push_str("; No well-known tunneling binaries\n");
        for prefix in TOOL_PREFIXES {
            for tool in TUNNELING_TOOLS {
                let escaped = escape_sbpl_path(&format!("{prefix}/{tool}"));
                profile.push_str(&format!("(deny process-exec (literal \"{escaped}\"))\n"));
            }
        }
        profile.push('\n');
    }

    profile.push_str("; No kernel extensions\n(deny system-kext*)\n");

    tracing::debug!(
        protect_sensitive_files = options.protect_sensitive_files,
        block_raw_sockets = options.block_raw_sockets,
        block_tunneling_tools = options.block_tunneling_tools,
        "isolation profile generated"
    );
    Ok(profile)
}
