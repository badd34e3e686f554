//! SOCKS5 proxy server: CONNECT only, no authentication, one task per
//! accepted connection.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::networking::socks5::{
    encode_reply, Address, Socks5Error, AUTH_NONE, AUTH_NO_ACCEPT, CMD_CONNECT, REP_SUCCESS,
    SOCKS5_VERSION,
};

pub struct ProxyServer {
    listen_addr: String,
    listen_port: u16,
    handshake_timeout: Option<Duration>,
}

impl ProxyServer {
    pub fn new(listen_addr: impl Into<String>, listen_port: u16) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            listen_port,
            handshake_timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Bounds the greeting and request phases. `None` leaves a silent
    /// client holding its task forever; relay traffic is never timed
    /// out either way.
    pub fn with_handshake_timeout(mut self, limit: Option<Duration>) -> Self {
        self.handshake_timeout = limit;
        self
    }

    /// Binds the listener. Failure here is fatal to the whole server,
    /// unlike per-connection errors later.
    pub async fn bind(&self) -> Result<TcpListener, Socks5Error> {
        let addr = format!("{}:{}", self.listen_addr, self.listen_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("[SOCKS5] Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept loop. Each connection runs its own task to completion or
    /// failure, independently of all others. When `shutdown` resolves
    /// the loop stops accepting; in-flight relays are left to drain.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("[SOCKS5] New client connection from {}", peer);
                        let limit = self.handshake_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, limit).await {
                                error!("[SOCKS5] Client {} error: {}", peer, e);
                            }
                        });
                    }
                    // Transient: log and keep accepting.
                    Err(e) => error!("[SOCKS5] Accept error: {:?}", e),
                },
                _ = &mut shutdown => {
                    info!("[SOCKS5] Shutdown requested, no longer accepting connections");
                    return;
                }
            }
        }
    }

    /// Binds and serves until the surrounding task is dropped.
    pub async fn run(&self) -> Result<(), Socks5Error> {
        let listener = self.bind().await?;
        self.serve(listener, std::future::pending()).await;
        Ok(())
    }
}

async fn handle_client(
    mut stream: TcpStream,
    handshake_limit: Option<Duration>,
) -> Result<(), Socks5Error> {
    let handshake_result = match handshake_limit {
        Some(limit) => timeout(limit, handshake(&mut stream))
            .await
            .unwrap_or(Err(Socks5Error::HandshakeTimeout)),
        None => handshake(&mut stream).await,
    };
    let dest = match handshake_result {
        Ok(dest) => dest,
        Err(e) => {
            send_failure_reply(&mut stream, &e).await;
            return Err(e);
        }
    };

    info!("[SOCKS5] CONNECT to {}", dest);
    let remote = match TcpStream::connect(dest.to_string()).await {
        Ok(remote) => remote,
        Err(e) => {
            let e = Socks5Error::DestinationUnreachable(e);
            send_failure_reply(&mut stream, &e).await;
            return Err(e);
        }
    };

    let bind_addr = remote
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
    stream.write_all(&encode_reply(REP_SUCCESS, bind_addr)).await?;

    relay(stream, remote).await;
    Ok(())
}

/// Greeting and request phases of the per-connection state machine.
/// Returns the parsed destination once the connection is ready to dial.
async fn handshake<S>(stream: &mut S) -> Result<Address, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: version, method count, then the offered methods.
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Socks5Error::ProtocolVersionMismatch(head[0]));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    // An empty method list falls through here as well.
    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPT]).await?;
        return Err(Socks5Error::NoAcceptableAuthMethod);
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

    // Request: version, command, reserved, then the destination. The
    // command byte is judged only after the address parse, so a bad
    // address type wins over a bad command.
    let mut req = [0u8; 3];
    stream.read_exact(&mut req).await?;
    if req[0] != SOCKS5_VERSION {
        return Err(Socks5Error::ProtocolVersionMismatch(req[0]));
    }
    let dest = Address::read_from(stream).await?;
    if req[1] != CMD_CONNECT {
        return Err(Socks5Error::UnsupportedCommand(req[1]));
    }
    Ok(dest)
}

/// Sends the protocol-level failure reply where one is meaningful at
/// the point of failure. Write errors are ignored, the connection is
/// coming down either way.
async fn send_failure_reply<S>(stream: &mut S, err: &Socks5Error)
where
    S: AsyncWrite + Unpin,
{
    if let Some(code) = err.reply_code() {
        let zero = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let _ = stream.write_all(&encode_reply(code, zero)).await;
    }
}

/// Bidirectional relay. Each direction is its own task owning one half
/// of each connection; the first direction to finish tears down both
/// connections by aborting the other task.
async fn relay(client: TcpStream, remote: TcpStream) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut remote_read, mut remote_write) = remote.into_split();

    let mut client_to_remote = tokio::spawn(async move {
        tokio::io::copy(&mut client_read, &mut remote_write).await
    });
    let mut remote_to_client = tokio::spawn(async move {
        tokio::io::copy(&mut remote_read, &mut client_write).await
    });

    tokio::select! {
        done = &mut client_to_remote => {
            remote_to_client.abort();
            log_relay_end("client->destination", done);
        }
        done = &mut remote_to_client => {
            client_to_remote.abort();
            log_relay_end("destination->client", done);
        }
    }
}

fn log_relay_end(direction: &str, done: Result<std::io::Result<u64>, tokio::task::JoinError>) {
    match done {
        Ok(Ok(n)) => debug!("[SOCKS5] Relay closed after {} ({} bytes)", direction, n),
        Ok(Err(e)) => debug!("[SOCKS5] Relay {} ended with error: {}", direction, e),
        Err(_) => {}
    }
}
