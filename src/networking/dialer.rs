//! Client side of the CONNECT handshake: dial a target through a
//! SOCKS5 proxy, optionally wrapping the tunnel in TLS.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::encryption::insecure_client_config;
use crate::networking::socks5::{
    Address, Socks5Error, ADDR_TYPE_DOMAIN, ADDR_TYPE_IPV4, ADDR_TYPE_IPV6, AUTH_NONE,
    CMD_CONNECT, REP_SUCCESS, SOCKS5_VERSION,
};

/// Stream handed back to callers: the tunneled TCP stream as-is, or
/// the same stream under TLS. Reads and writes behave exactly like a
/// direct socket either way.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Dials `target_addr` (`host:port`) through the SOCKS5 proxy at
/// `proxy_addr` and returns a stream equivalent to a direct connection.
///
/// With `use_tls` set, a TLS client handshake runs over the tunnel;
/// `tls_config` of `None` then means "accept whatever certificate the
/// peer presents". Without `use_tls` the config is ignored. Failures at
/// any step close everything opened so far; no retries happen here.
pub async fn dial_through_socks5(
    proxy_addr: &str,
    target_addr: &str,
    tls_config: Option<Arc<ClientConfig>>,
    use_tls: bool,
) -> Result<ClientStream, Socks5Error> {
    let dest: Address = target_addr.parse()?;

    let mut stream = TcpStream::connect(proxy_addr)
        .await
        .map_err(|e| Socks5Error::ProxyHandshakeFailed(format!("connect {}: {}", proxy_addr, e)))?;
    socks5_connect(&mut stream, &dest).await?;
    debug!("[SOCKS5] Tunnel to {} open via {}", dest, proxy_addr);

    if !use_tls {
        return Ok(ClientStream::Plain(stream));
    }

    let config = tls_config.unwrap_or_else(insecure_client_config);
    tls_wrap(stream, &dest, config).await
}

/// Opens a connection to `target` (`host:port`): direct, or through
/// the SOCKS5 proxy when one is given, with optional TLS on top in
/// either case.
pub async fn dial(
    target: &str,
    use_tls: bool,
    proxy: Option<&str>,
) -> Result<ClientStream, Socks5Error> {
    if let Some(proxy) = proxy {
        return dial_through_socks5(proxy, target, None, use_tls).await;
    }
    let dest: Address = target.parse()?;
    let stream = TcpStream::connect(target).await?;
    if !use_tls {
        return Ok(ClientStream::Plain(stream));
    }
    tls_wrap(stream, &dest, insecure_client_config()).await
}

/// Runs a TLS client handshake over `stream`, using the destination
/// host for SNI. The raw stream is dropped on failure, which closes
/// the connection.
async fn tls_wrap(
    stream: TcpStream,
    dest: &Address,
    config: Arc<ClientConfig>,
) -> Result<ClientStream, Socks5Error> {
    let host = match dest {
        Address::Ipv4(ip, _) => ip.to_string(),
        Address::Domain(domain, _) => domain.clone(),
    };
    let server_name = ServerName::try_from(host.clone())
        .map_err(|_| Socks5Error::InvalidAddress(host))?;
    match TlsConnector::from(config).connect(server_name, stream).await {
        Ok(tls) => Ok(ClientStream::Tls(Box::new(tls))),
        Err(e) => Err(Socks5Error::TlsHandshakeFailed(e)),
    }
}

/// Runs the client half of the handshake on an established proxy
/// connection. On return the stream is positioned exactly at the start
/// of tunneled application data.
async fn socks5_connect<S>(stream: &mut S, dest: &Address) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting offering no-auth only.
    stream.write_all(&[SOCKS5_VERSION, 0x01, AUTH_NONE]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION || choice[1] != AUTH_NONE {
        return Err(Socks5Error::ProxyHandshakeFailed(format!(
            "method selection {:02x?}",
            choice
        )));
    }

    // CONNECT request for the destination.
    let mut req = Vec::with_capacity(3 + dest.serialized_len());
    req.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);
    dest.write_to_buf(&mut req)?;
    stream.write_all(&req).await?;

    // Reply header, then the bound-address field sized by its address
    // type. The field is consumed before the status is judged so a
    // still-open stream sits exactly at the tunneled data.
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(Socks5Error::ProtocolVersionMismatch(reply[0]));
    }
    let skip = match reply[3] {
        ADDR_TYPE_IPV4 => 4 + 2,
        ADDR_TYPE_IPV6 => 16 + 2,
        ADDR_TYPE_DOMAIN => stream.read_u8().await? as usize + 2,
        other => return Err(Socks5Error::UnsupportedAddressType(other)),
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;

    if reply[1] != REP_SUCCESS {
        return Err(Socks5Error::ProxyConnectRejected(reply[1]));
    }
    Ok(())
}
