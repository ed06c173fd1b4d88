//! Process isolation for the sandboxed agent runtime.
//!
//! This crate builds the declarative Seatbelt profile that constrains the
//! agent process's filesystem writes and raw networking, and composes the
//! spawn command and environment that force all of its traffic through the
//! egress proxy:
//!
//! - [`profile`]: SBPL profile text generation (config-write denial,
//!   deny-by-default networking with a loopback exception, raw-socket and
//!   tunneling-tool denial).
//! - [`spawn`]: proxy environment variables, the SSH `ProxyCommand`
//!   override, and the `sandbox-exec` command wrapper.
//!
//! Isolation being unavailable on the host is fatal: callers must refuse to
//! run rather than silently spawning unsandboxed.

pub mod profile;
pub mod spawn;

pub use profile::{ProfileOptions, build_profile};
pub use spawn::{PROXY_PORT_ENV, proxy_environment, sandboxed_command};

use std::path::Path;

/// Path to the Seatbelt wrapper binary.
const SANDBOX_EXEC: &str = "/usr/bin/sandbox-exec";

/// Errors when building or applying isolation.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The isolation mechanism is missing on this host. Fatal: never fall
    /// back to running the agent unsandboxed.
    #[error("sandbox isolation is unavailable on this host ({SANDBOX_EXEC} not found)")]
    NotAvailable,

    /// A path could not be used in the profile.
    #[error("invalid profile path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Whether the isolation mechanism exists on this host.
pub fn is_available() -> bool {
    Path::new(SANDBOX_EXEC).exists()
}

/// Fail fast when isolation is unavailable.
pub fn ensure_available() -> Result<()> {
    if is_available() {
        Ok(())
    } else {
        Err(SandboxError::NotAvailable)
    }
}
