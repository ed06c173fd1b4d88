//! Spawn composition: proxy environment and the sandbox-exec wrapper.

use std::path::Path;
use std::process::Command;

use crate::{Result, SANDBOX_EXEC, ensure_available};

/// Environment variable carrying the proxy's bound port; read by the SSH
/// tunnel helper.
pub const PROXY_PORT_ENV: &str = "SANDBOX_PROXY_PORT";

/// Compose the environment that points the sandboxed process at the proxy.
///
/// Both upper- and lowercase proxy variables are set (clients disagree on
/// which they read), loopback is exempted so the process can reach the
/// proxy itself, and `GIT_SSH_COMMAND` routes git-over-ssh through the
/// tunnel helper as a `ProxyCommand`.
pub fn proxy_environment(proxy_port: u16, tunnel_helper: &Path) -> Vec<(String, String)> {
    let proxy_url = format!("http://127.0.0.1:{proxy_port}");
    let no_proxy = "localhost,127.0.0.1,::1".to_string();
    let git_ssh = format!(
        "ssh -o ProxyCommand='{} %h %p'",
        tunnel_helper.display()
    );

    vec![
        ("HTTP_PROXY".to_string(), proxy_url.clone()),
        ("http_proxy".to_string(), proxy_url.clone()),
        ("HTTPS_PROXY".to_string(), proxy_url.clone()),
        ("https_proxy".to_string(), proxy_url),
        ("NO_PROXY".to_string(), no_proxy.clone()),
        ("no_proxy".to_string(), no_proxy),
        ("GIT_SSH_COMMAND".to_string(), git_ssh),
        (PROXY_PORT_ENV.to_string(), proxy_port.to_string()),
    ]
}

/// Wrap a command to run under the isolation profile with the proxy
/// environment applied.
///
/// Fails fast when the isolation mechanism is unavailable; the agent must
/// never run unsandboxed.
pub fn sandboxed_command(
    program: &str,
    args: &[String],
    profile: &str,
    env: &[(String, String)],
) -> Result<Command> {
    ensure_available()?;

    let mut cmd = Command::new(SANDBOX_EXEC);
    cmd.args(["-p", profile, "--"]);
    cmd.arg(program);
    cmd.args(args);
    for (name, value) in env {
        cmd.env(name, value);
    }
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_value<'a>(env: &'a [(String, String)], name: &str) -> Option<&'a str> {
        env.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_proxy_environment_variables() {
        let env = proxy_environment(8877, Path::new("/usr/local/bin/aegis-ssh-tunnel"));

        for name in ["HTTP_PROXY", "http_proxy", "HTTPS_PROXY", "https_proxy"] {
            assert_eq!(env_value(&env, name), Some("http://127.0.0.1:8877"));
        }
        for name in ["NO_PROXY", "no_proxy"] {
            assert_eq!(env_value(&env, name), Some("localhost,127.0.0.1,::1"));
        }
        assert_eq!(env_value(&env, PROXY_PORT_ENV), Some("8877"));
    }

    #[test]
    fn test_git_ssh_command_invokes_helper() {
        let env = proxy_environment(9000, Path::new("/opt/aegis/bin/aegis-ssh-tunnel"));
        let git_ssh = env_value(&env, "GIT_SSH_COMMAND").unwrap();
        assert!(git_ssh.starts_with("ssh -o ProxyCommand="));
        assert!(git_ssh.contains("/opt/aegis/bin/aegis-ssh-tunnel %h %p"));
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_sandboxed_command_wraps_with_sandbox_exec() {
        use std::ffi::OsStr;

        let env = proxy_environment(8877, Path::new("/usr/local/bin/aegis-ssh-tunnel"));
        let cmd = sandboxed_command("echo", &["hi".to_string()], "(version 1)", &env).unwrap();
        assert_eq!(cmd.get_program(), OsStr::new(SANDBOX_EXEC));
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args[0], OsStr::new("-p"));
        assert_eq!(args[2], OsStr::new("--"));
        assert_eq!(args[3], OsStr::new("echo"));
    }
}
