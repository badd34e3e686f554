//! SOCKS5 wire format subset: no-auth negotiation and the CONNECT
//! request/reply exchange (RFC 1928).

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

// SOCKS5 Protocol Constants
pub const SOCKS5_VERSION: u8 = 0x05;

// Authentication Methods
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPT: u8 = 0xFF;

// Commands
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOC: u8 = 0x03;

// Address Types
pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_DOMAIN: u8 = 0x03;
pub const ADDR_TYPE_IPV6: u8 = 0x04;

// Reply Codes
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_SERVER_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACH: u8 = 0x03;
pub const REP_HOST_UNREACH: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("unsupported SOCKS version {0:#04x}")]
    ProtocolVersionMismatch(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableAuthMethod,
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("destination unreachable: {0}")]
    DestinationUnreachable(io::Error),
    #[error("proxy handshake failed: {0}")]
    ProxyHandshakeFailed(String),
    #[error("proxy rejected CONNECT with reply code {0:#04x}")]
    ProxyConnectRejected(u8),
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(io::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("domain name longer than 255 bytes")]
    DomainTooLong,
    #[error("domain name is not valid UTF-8")]
    InvalidDomainEncoding,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Socks5Error {
    /// Reply code for the request-phase failure reply, or `None` when
    /// the handshake never reached a point where a reply frame is
    /// meaningful (greeting failures, timeouts, broken connections).
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            Socks5Error::UnsupportedAddressType(_) => Some(REP_ADDR_NOT_SUPPORTED),
            Socks5Error::UnsupportedCommand(_) => Some(REP_CMD_NOT_SUPPORTED),
            Socks5Error::InvalidDomainEncoding | Socks5Error::DomainTooLong => {
                Some(REP_SERVER_FAILURE)
            }
            Socks5Error::DestinationUnreachable(e) => Some(match e.kind() {
                io::ErrorKind::ConnectionRefused => REP_CONN_REFUSED,
                io::ErrorKind::TimedOut => REP_HOST_UNREACH,
                _ => REP_SERVER_FAILURE,
            }),
            _ => None,
        }
    }
}

/// Destination carried in a CONNECT request: a literal IPv4 address, or
/// a domain name left for the proxy to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr, u16),
    Domain(String, u16),
}

impl Address {
    /// Reads the address-type byte, the address bytes it announces, and
    /// the trailing big-endian port. Consumes exactly the bytes the
    /// wire format prescribes for the tag, nothing more.
    pub async fn read_from<R>(r: &mut R) -> Result<Address, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = r.read_u8().await?;
        match atyp {
            ADDR_TYPE_IPV4 => {
                let mut ip = [0u8; 4];
                r.read_exact(&mut ip).await?;
                let port = r.read_u16().await?;
                Ok(Address::Ipv4(Ipv4Addr::from(ip), port))
            }
            ADDR_TYPE_DOMAIN => {
                let len = r.read_u8().await? as usize;
                let mut domain = vec![0u8; len];
                r.read_exact(&mut domain).await?;
                let port = r.read_u16().await?;
                let domain =
                    String::from_utf8(domain).map_err(|_| Socks5Error::InvalidDomainEncoding)?;
                Ok(Address::Domain(domain, port))
            }
            other => Err(Socks5Error::UnsupportedAddressType(other)),
        }
    }

    /// Appends the wire encoding (atyp, address bytes, port) to `buf`.
    pub fn write_to_buf(&self, buf: &mut Vec<u8>) -> Result<(), Socks5Error> {
        match self {
            Address::Ipv4(ip, port) => {
                buf.push(ADDR_TYPE_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                if domain.len() > 255 {
                    return Err(Socks5Error::DomainTooLong);
                }
                buf.push(ADDR_TYPE_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(())
    }

    pub fn serialized_len(&self) -> usize {
        match self {
            Address::Ipv4(..) => 1 + 4 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl FromStr for Address {
    type Err = Socks5Error;

    /// Parses `host:port`. A host that is a literal IPv4 address keeps
    /// its IPv4 encoding; anything else travels as a domain name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Socks5Error::InvalidAddress(s.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Socks5Error::InvalidAddress(s.to_string()))?;
        match host.parse::<Ipv4Addr>() {
            Ok(ip) => Ok(Address::Ipv4(ip, port)),
            Err(_) => Ok(Address::Domain(host.to_string(), port)),
        }
    }
}

/// Assembles the fixed 10-byte reply frame. The bind address is always
/// encoded as IPv4; a socket bound to an IPv6 local address reports
/// 0.0.0.0 with its real port.
pub fn encode_reply(code: u8, bind: SocketAddr) -> [u8; 10] {
    let mut frame = [0u8; 10];
    frame[0] = SOCKS5_VERSION;
    frame[1] = code;
    frame[2] = 0x00;
    frame[3] = ADDR_TYPE_IPV4;
    if let SocketAddr::V4(v4) = bind {
        frame[4..8].copy_from_slice(&v4.ip().octets());
    }
    frame[8..10].copy_from_slice(&bind.port().to_be_bytes());
    frame
}
