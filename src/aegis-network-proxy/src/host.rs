//! Host normalization, classification, and CONNECT target parsing.

use std::collections::HashSet;

use url::Url;

/// Normalize a host string into its canonical comparable form.
///
/// Lowercases, trims whitespace, strips one trailing dot and enclosing
/// IPv6 brackets, then re-parses through the URL parser so punycode and
/// internationalized forms compare equal. If the URL parser rejects the
/// host, the pre-parse value is returned unchanged; this function is
/// total and never fails.
pub fn normalize_domain(host: &str) -> String {
    let mut host = host.trim().to_lowercase();

    if let Some(stripped) = host.strip_suffix('.') {
        host = stripped.to_string();
    }

    if host.starts_with('[') && host.ends_with(']') && host.len() >= 2 {
        host = host[1..host.len() - 1].to_string();
    }

    match Url::parse(&format!("http://{host}")) {
        Ok(url) => match url.host_str() {
            Some(canonical) => canonical.to_string(),
            None => host,
        },
        Err(_) => host,
    }
}

/// Heuristic IP-literal detection: a dotted-quad, or anything containing a
/// colon. Deliberately coarse: a malformed host that trips the colon check
/// only earns an extra deny, never an allow.
pub fn is_ip_address(host: &str) -> bool {
    if host.contains(':') {
        return true;
    }

    let mut labels = 0usize;
    for label in host.split('.') {
        if label.is_empty() || !label.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        labels += 1;
    }
    labels == 4
}

/// True for `localhost`, any `127.x.x.x`, `::1`, or bracketed `::1`.
pub fn is_loopback(host: &str) -> bool {
    let host = host.trim().to_lowercase();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(&host);

    host == "localhost" || host == "::1" || (host.starts_with("127.") && is_ip_address(host))
}

/// Test a host against the blocked set: exact membership first, then each
/// parent suffix (`a.b.c` → `b.c` → `c`). Listing a domain blocks it and
/// every subdomain, but never a parent or sibling of the listed entry.
pub fn matches_blocked(host: &str, blocked: &HashSet<String>) -> bool {
    let normalized = normalize_domain(host);
    if blocked.contains(&normalized) {
        return true;
    }

    let mut rest = normalized.as_str();
    while let Some((_, parent)) = rest.split_once('.') {
        if blocked.contains(parent) {
            return true;
        }
        rest = parent;
    }
    false
}

/// A parsed CONNECT target (or proxied-request destination).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// Parse `host:port` from a CONNECT request line target.
    ///
    /// Bracketed IPv6 (`[2001:db8::1]:443`) is extracted directly; anything
    /// else splits at the *last* colon so a stray colon elsewhere in the
    /// host does not shift the port. Returns `None` for an empty host, a
    /// non-numeric port, or a port outside 1-65535; callers must reject
    /// such targets at the protocol layer, before any policy check.
    pub fn parse(target: &str) -> Option<Self> {
        let target = target.trim();

        if let Some(rest) = target.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = tail.strip_prefix(':')?;
            return Self::from_parts(host, port);
        }

        let (host, port) = target.rsplit_once(':')?;
        Self::from_parts(host, port)
    }

    fn from_parts(host: &str, port: &str) -> Option<Self> {
        if host.is_empty() {
            return None;
        }
        let port: u32 = port.parse().ok()?;
        if port == 0 || port > u32::from(u16::MAX) {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port: port as u16,
        })
    }
}

impl std::fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
