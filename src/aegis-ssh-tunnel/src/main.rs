//! SSH `ProxyCommand` helper.
//!
//! Invoked by the sandboxed process's `GIT_SSH_COMMAND` as
//! `aegis-ssh-tunnel %h %p`: it asks the egress proxy for a CONNECT tunnel
//! to the SSH server and then shuttles bytes between its own stdio and the
//! tunnel socket, so git-over-ssh transits the same policy choke point as
//! everything else. Any handshake failure exits non-zero with a clear
//! message, and SSH reports the connection as refused.

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use aegis_sandbox::PROXY_PORT_ENV;

/// Tunnel an SSH connection through the Aegis egress proxy.
#[derive(Debug, Parser)]
#[command(name = "aegis-ssh-tunnel", version)]
struct Args {
    /// SSH server host.
    host: String,

    /// SSH server port.
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let proxy_port: u16 = std::env::var(PROXY_PORT_ENV)
        .with_context(|| format!("{PROXY_PORT_ENV} is not set; was this helper spawned outside the sandbox environment?"))?
        .parse()
        .with_context(|| format!("{PROXY_PORT_ENV} is not a valid port"))?;

    let stream = TcpStream::connect(("127.0.0.1", proxy_port))
        .await
        .with_context(|| format!("cannot reach egress proxy on 127.0.0.1:{proxy_port}"))?;

    let (stream, leftover) = establish_tunnel(stream, &args.host, args.port).await?;
    debug!(host = %args.host, port = args.port, "tunnel established");

    relay_stdio(stream, leftover).await
}

/// Perform the CONNECT handshake: send the request, require a "200" status
/// line, discard headers through the blank line. Returns the stream plus
/// any tunnel bytes the reader already pulled past the header terminator.
async fn establish_tunnel(stream: TcpStream, host: &str, port: u16) -> Result<(TcpStream, Vec<u8>)> {
    let mut reader = BufReader::new(stream);

    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    reader.get_mut().write_all(request.as_bytes()).await?;
    reader.get_mut().flush().await?;

    let mut status = String::new();
    reader.read_line(&mut status).await?;
    if !status.contains("200") {
        bail!(
            "egress proxy refused tunnel to {host}:{port}: {}",
            status.trim()
        );
    }

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
    }

    let leftover = reader.buffer().to_vec();
    Ok((reader.into_inner(), leftover))
}

/// Relay bytes between the tunnel socket and this process's stdio until
/// either side closes.
async fn relay_stdio(stream: TcpStream, leftover: Vec<u8>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    if !leftover.is_empty() {
        stdout.write_all(&leftover).await?;
        stdout.flush().await?;
    }

    let (mut tunnel_rx, mut tunnel_tx) = stream.into_split();
    let mut stdin = tokio::io::stdin();

    let to_stdout = async move {
        let result = tokio::io::copy(&mut tunnel_rx, &mut stdout).await;
        debug!(?result, "tunnel -> stdout finished");
    };
    let to_tunnel = async move {
        let result = tokio::io::copy(&mut stdin, &mut tunnel_tx).await;
        let _ = tunnel_tx.shutdown().await;
        debug!(?result, "stdin -> tunnel finished");
    };

    tokio::select! {
        _ = to_stdout => {}
        _ = to_tunnel => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn fake_proxy(response: &'static [u8]) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Consume the CONNECT head
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(response).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_handshake_accepts_200() {
        let addr = fake_proxy(b"HTTP/1.1 200 Connection Established\r\n\r\n").await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (_stream, leftover) = establish_tunnel(stream, "github.com", 22).await.unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_preserves_pipelined_bytes() {
        let addr =
            fake_proxy(b"HTTP/1.1 200 Connection Established\r\nX-Tunnel: ok\r\n\r\nSSH-2.0-server\r\n")
                .await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut stream, leftover) = establish_tunnel(stream, "github.com", 22).await.unwrap();

        // The server banner may land in the handshake reader or still be in
        // flight; either way none of it is lost.
        let banner = b"SSH-2.0-server\r\n";
        let mut received = leftover;
        while received.len() < banner.len() {
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "tunnel closed early");
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, banner);
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_200() {
        let addr = fake_proxy(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let err = establish_tunnel(stream, "evil.com", 22).await.unwrap_err();
        assert!(err.to_string().contains("refused"), "got: {err}");
        assert!(err.to_string().contains("evil.com"), "got: {err}");
    }
}
