//! Proxy server: loopback listener, request dispatch, and tunneling.
//!
//! The server binds to the IPv4 loopback only, accepts TCP connections,
//! reads the request line to pick a mode, and dispatches:
//!
//! CONNECT method -> policy check, then opaque bidirectional tunnel
//! Other methods  -> policy check, then plain HTTP forwarding via reqwest
//!
//! The two paths share nothing but the [`PolicyEngine`] call.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::blocklist::BlocklistStore;
use crate::config::ProxyOptions;
use crate::host::ConnectTarget;
use crate::policy::{BlockDecision, PolicyEngine};
use crate::{ProxyError, Result};

/// Maximum total size of request headers (64 KiB).
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Maximum buffered plain-request body.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Maximum concurrent connections; excess connections are dropped.
const MAX_CONNECTIONS: usize = 64;

/// Bound on upstream TCP connect for CONNECT tunnels.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Targets are truncated to this many characters in log lines.
const MAX_LOG_TARGET_CHARS: usize = 120;

/// Counters for proxy activity.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    /// Total requests seen (plain + CONNECT).
    pub total_requests: AtomicU64,

    /// Requests denied by policy.
    pub blocked_requests: AtomicU64,

    /// CONNECT tunnels established.
    pub tunnels_opened: AtomicU64,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn blocked(&self) -> u64 {
        self.blocked_requests.load(Ordering::Relaxed)
    }

    pub fn tunnels(&self) -> u64 {
        self.tunnels_opened.load(Ordering::Relaxed)
    }
}

/// Shared state for connection handlers.
struct ProxyState {
    policy: PolicyEngine,
    upstream: reqwest::Client,
    metrics: RequestMetrics,
    active_connections: AtomicUsize,
}

/// Handle to a running proxy.
///
/// The handle is the only reference to the instance; "at most one active
/// proxy per host process" is the caller's invariant to keep, typically by
/// holding the handle in one supervising component.
pub struct ProxyHandle {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<ProxyState>,
}

impl ProxyHandle {
    /// The bound loopback port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Activity counters.
    pub fn metrics(&self) -> &RequestMetrics {
        &self.state.metrics
    }

    /// The blocklist store backing the policy pipeline.
    pub fn blocklist(&self) -> &BlocklistStore {
        self.state.policy.blocklist()
    }

    /// Stop accepting connections and cancel the blocklist watch.
    ///
    /// Established tunnels are not severed; they drain until either side
    /// closes.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.state.policy.blocklist().stop();
    }
}

/// Start the proxy on `127.0.0.1:options.port` (0 = ephemeral).
pub async fn start(options: ProxyOptions) -> Result<ProxyHandle> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, options.port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
    let port = listener
        .local_addr()
        .map_err(|e| ProxyError::Bind {
            addr: addr.to_string(),
            source: e,
        })?
        .port();

    // The forwarding client must not follow redirects (responses stream
    // back verbatim) and must ignore proxy env vars (it IS the proxy).
    let upstream = reqwest::Client::builder()
        .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .map_err(|e| ProxyError::Config(format!("upstream client: {e}")))?;

    let blocklist = BlocklistStore::new(options.blocklist_path.clone());
    let policy = PolicyEngine::new(options, blocklist)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(ProxyState {
        policy,
        upstream,
        metrics: RequestMetrics::new(),
        active_connections: AtomicUsize::new(0),
    });

    tokio::spawn(accept_loop(listener, Arc::clone(&state), shutdown_rx));
    info!(port, "egress proxy listening on 127.0.0.1");

    Ok(ProxyHandle {
        port,
        shutdown_tx,
        state,
    })
}

/// Accept loop: runs until shutdown is signalled.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let current = state.active_connections.load(Ordering::Relaxed);
                        if current >= MAX_CONNECTIONS {
                            warn!(current, "connection limit reached, dropping {addr}");
                            drop(stream);
                            continue;
                        }
                        state.active_connections.fetch_add(1, Ordering::Relaxed);

                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &state).await {
                                debug!(error = %e, "connection handler ended");
                            }
                            state.active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("egress proxy shutting down");
                    return;
                }
            }
        }
    }
}

/// Read the request head and dispatch by method.
async fn handle_connection(stream: TcpStream, state: &ProxyState) -> Result<()> {
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    if request_line.is_empty() {
        return Ok(()); // client disconnected
    }

    // Headers up to the blank line, with a size cap.
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut total = request_line.len();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        total += n;
        if total > MAX_HEADER_BYTES {
            send_response(
                reader.get_mut(),
                431,
                "Request Header Fields Too Large",
                "request headers too large",
            )
            .await?;
            return Ok(());
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let request_line = request_line.trim_end().to_string();
    state.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

    if request_line.starts_with("CONNECT ") {
        handle_connect(reader, &request_line, state).await
    } else {
        handle_plain(reader, &request_line, headers, state).await
    }
}

/// CONNECT path: validate, authorize, tunnel.
async fn handle_connect(
    mut reader: BufReader<TcpStream>,
    request_line: &str,
    state: &ProxyState,
) -> Result<()> {
    let raw_target = request_line.split_whitespace().nth(1).unwrap_or("");

    // A malformed target never reaches policy.
    let Some(target) = ConnectTarget::parse(raw_target) else {
        warn!(target = %truncate_for_log(raw_target), "malformed CONNECT target");
        send_response(reader.get_mut(), 400, "Bad Request", "malformed CONNECT target").await?;
        return Ok(());
    };

    let decision = state.policy.check_blocked(&target.host, target.port).await;
    if let BlockDecision::Blocked(reason) = decision {
        state.metrics.blocked_requests.fetch_add(1, Ordering::Relaxed);
        warn!(
            method = "CONNECT",
            target = %truncate_for_log(&target.to_string()),
            %reason,
            "connection blocked"
        );
        send_response(
            reader.get_mut(),
            403,
            "Forbidden",
            &format!("connection to {} blocked by proxy", target.host),
        )
        .await?;
        return Ok(());
    }

    info!(
        method = "CONNECT",
        target = %truncate_for_log(&target.to_string()),
        "tunnel allowed"
    );

    let upstream = match timeout(
        UPSTREAM_CONNECT_TIMEOUT,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(target = %target, error = %e, "upstream connect failed");
            send_response(
                reader.get_mut(),
                502,
                "Bad Gateway",
                &format!("cannot reach {}", target.host),
            )
            .await?;
            return Ok(());
        }
        Err(_) => {
            debug!(target = %target, "upstream connect timed out");
            send_response(
                reader.get_mut(),
                502,
                "Bad Gateway",
                &format!("connection to {} timed out", target.host),
            )
            .await?;
            return Ok(());
        }
    };

    send_response(reader.get_mut(), 200, "Connection Established", "").await?;
    state.metrics.tunnels_opened.fetch_add(1, Ordering::Relaxed);

    // Bytes the client pipelined behind its CONNECT (e.g. a TLS
    // ClientHello in the same segment) are sitting in the read buffer;
    // flush them upstream before handing both streams to the relay.
    let buffered = reader.buffer().to_vec();
    let mut client = reader.into_inner();
    let mut upstream = upstream;
    if !buffered.is_empty() {
        upstream.write_all(&buffered).await?;
    }

    let result = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    debug!(target = %truncate_for_log(&target.to_string()), ?result, "tunnel closed");
    Ok(())
}

/// Plain path: forward an absolute-form request upstream and stream the
/// response back verbatim.
async fn handle_plain(
    mut reader: BufReader<TcpStream>,
    request_line: &str,
    headers: Vec<(String, String)>,
    state: &ProxyState,
) -> Result<()> {
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        send_response(reader.get_mut(), 400, "Bad Request", "malformed request line").await?;
        return Ok(());
    };

    let Ok(url) = Url::parse(target) else {
        send_response(reader.get_mut(), 400, "Bad Request", "expected absolute-form URL").await?;
        return Ok(());
    };
    let Some(host) = url.host_str().map(str::to_string) else {
        send_response(reader.get_mut(), 400, "Bad Request", "request URL has no host").await?;
        return Ok(());
    };
    let port = url.port_or_known_default().unwrap_or(80);

    let Ok(method) = reqwest::Method::from_bytes(method.as_bytes()) else {
        send_response(reader.get_mut(), 400, "Bad Request", "invalid method").await?;
        return Ok(());
    };

    let decision = state.policy.check_blocked(&host, port).await;
    if let BlockDecision::Blocked(reason) = decision {
        state.metrics.blocked_requests.fetch_add(1, Ordering::Relaxed);
        warn!(
            method = %method,
            target = %truncate_for_log(url.as_str()),
            %reason,
            "request blocked"
        );
        send_response(
            reader.get_mut(),
            403,
            "Forbidden",
            &format!("connection to {host} blocked by proxy"),
        )
        .await?;
        return Ok(());
    }

    info!(method = %method, target = %truncate_for_log(url.as_str()), "request allowed");

    // Buffer the body when the client announced one.
    let mut body = Vec::new();
    if let Some(length) = header_value(&headers, "content-length").and_then(|v| v.parse().ok()) {
        if length > MAX_BODY_BYTES {
            send_response(reader.get_mut(), 413, "Payload Too Large", "request body too large")
                .await?;
            return Ok(());
        }
        body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
    }

    let mut request = state.upstream.request(method, url.clone());
    for (name, value) in &headers {
        if is_hop_by_hop(name) {
            continue;
        }
        request = request.header(name.as_str(), value.as_str());
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    match request.send().await {
        Ok(response) => stream_response(reader.get_mut(), response).await,
        Err(e) => {
            debug!(host = %host, error = %e, "upstream request failed");
            send_response(
                reader.get_mut(),
                502,
                "Bad Gateway",
                &format!("upstream request to {host} failed"),
            )
            .await?;
            Ok(())
        }
    }
}

/// Write the upstream status, headers, and body back to the client.
async fn stream_response(stream: &mut TcpStream, response: reqwest::Response) -> Result<()> {
    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    // Each client connection serves one request; EOF delimits the body.
    head.push_str("Connection: close\r\n\r\n");
    stream.write_all(head.as_bytes()).await?;

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => stream.write_all(&bytes).await?,
            Err(e) => {
                debug!(error = %e, "upstream body ended early");
                break;
            }
        }
    }
    stream.flush().await?;
    Ok(())
}

/// Headers that must not be forwarded in either direction.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Write a minimal HTTP/1.1 response. An empty body writes only the status
/// line (used for `200 Connection Established`).
async fn send_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = if body.is_empty() {
        format!("HTTP/1.1 {status} {reason}\r\n\r\n")
    } else {
        format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    };
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

/// Bound a target string for log lines.
fn truncate_for_log(target: &str) -> String {
    if target.chars().count() <= MAX_LOG_TARGET_CHARS {
        target.to_string()
    } else {
        let mut truncated: String = target.chars().take(MAX_LOG_TARGET_CHARS).collect();
        truncated.push_str("...");
        truncated
    }
}
