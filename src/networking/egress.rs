//! Egress interface discovery.

use std::io;
use std::net::{IpAddr, UdpSocket};

/// Returns the local address the OS would route traffic to `host`
/// from. Opens a UDP socket and "connects" it; no packet is sent.
pub fn egress_ip(host: &str) -> io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(format!("{}:80", host))?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_egress_ip_is_not_unspecified() {
        // Loopback target keeps the test off the network.
        let ip = egress_ip("127.0.0.1").unwrap();
        assert!(!ip.is_unspecified());
    }
}
