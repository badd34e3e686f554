//! End-to-end exercises against a real proxy on loopback: handshake
//! acceptance and rejection, relay integrity, concurrent sessions and
//! TLS tunneled through the proxy.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;

use burrow::encryption::{generate_server_identity, tls_acceptor};
use burrow::networking::dialer::dial_through_socks5;
use burrow::networking::server::ProxyServer;
use burrow::networking::socks5::Socks5Error;

async fn spawn_proxy() -> SocketAddr {
    let server = ProxyServer::new("127.0.0.1", 0);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server.serve(listener, std::future::pending()).await;
    });
    addr
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    tokio::spawn(async move {
                        let mut buf = [0u8; 2048];
                        loop {
                            match stream.read(&mut buf).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if stream.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

#[tokio::test]
async fn test_connect_ipv4_end_to_end() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_proxy().await;

    let mut stream =
        dial_through_socks5(&proxy.to_string(), &echo.to_string(), None, false)
            .await
            .unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping");
}

#[tokio::test]
async fn test_connect_domain_end_to_end() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_proxy().await;

    // A domain-typed destination makes the proxy resolve the name.
    let target = format!("localhost:{}", echo.port());
    let mut stream = dial_through_socks5(&proxy.to_string(), &target, None, false)
        .await
        .unwrap();
    stream.write_all(b"hello burrow").await.unwrap();
    let mut reply = [0u8; 12];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hello burrow");
}

#[tokio::test]
async fn test_greeting_without_no_auth_rejected() {
    let proxy = spawn_proxy().await;
    let mut stream = TcpStream::connect(proxy).await.unwrap();

    // Offer only username/password.
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0xFF]);
    assert_eq!(stream.read(&mut [0u8; 1]).await.unwrap(), 0, "closed");
}

#[tokio::test]
async fn test_empty_method_list_rejected() {
    let proxy = spawn_proxy().await;
    let mut stream = TcpStream::connect(proxy).await.unwrap();

    stream.write_all(&[0x05, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0xFF]);
    assert_eq!(stream.read(&mut [0u8; 1]).await.unwrap(), 0, "closed");
}

#[tokio::test]
async fn test_wrong_version_closed_without_reply() {
    let proxy = spawn_proxy().await;
    let mut stream = TcpStream::connect(proxy).await.unwrap();

    stream.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut [0u8; 16]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "no bytes before close");
}

#[tokio::test]
async fn test_bind_command_rejected_after_parse() {
    let proxy = spawn_proxy().await;
    let mut stream = TcpStream::connect(proxy).await.unwrap();

    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    stream
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x07, "command not supported");
    assert_eq!(&reply[2..8], &[0x00, 0x01, 0, 0, 0, 0]);
}

#[tokio::test]
async fn test_ipv6_address_type_rejected() {
    let proxy = spawn_proxy().await;
    let mut stream = TcpStream::connect(proxy).await.unwrap();

    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x04];
    request.extend_from_slice(&[0u8; 16]);
    request.extend_from_slice(&[0x00, 0x50]);
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x08, "address type not supported");
}

#[tokio::test]
async fn test_unreachable_destination_rejected() {
    let proxy = spawn_proxy().await;

    // Grab an ephemeral port and immediately free it again.
    let closed_port = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().port()
    };

    let target = format!("127.0.0.1:{}", closed_port);
    match dial_through_socks5(&proxy.to_string(), &target, None, false).await {
        Err(Socks5Error::ProxyConnectRejected(0x05)) => {}
        other => panic!("expected connection-refused reply, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_dialer_rejects_non_socks_peer() {
    // An echo server reflects the greeting; the selected method byte
    // comes back as 0x01, which no client asked for.
    let echo = spawn_echo_server().await;
    match dial_through_socks5(&echo.to_string(), "10.0.0.1:80", None, false).await {
        Err(Socks5Error::ProxyHandshakeFailed(_)) => {}
        other => panic!("expected ProxyHandshakeFailed, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_concurrent_sessions_stay_independent() {
    let echo = spawn_echo_server().await;
    let proxy = spawn_proxy().await;

    let mut sessions = Vec::new();
    for i in 0..8u32 {
        let proxy = proxy.to_string();
        let target = echo.to_string();
        sessions.push(tokio::spawn(async move {
            let payload: Vec<u8> = (0..512u32).map(|j| ((i * 31 + j) % 251) as u8).collect();
            let mut stream = dial_through_socks5(&proxy, &target, None, false)
                .await
                .unwrap();
            stream.write_all(&payload).await.unwrap();
            let mut reply = vec![0u8; payload.len()];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, payload, "session {} got someone else's bytes", i);
        }));
    }
    for session in sessions {
        session.await.unwrap();
    }
}

#[tokio::test]
async fn test_handshake_timeout_closes_stalled_client() {
    let server = ProxyServer::new("127.0.0.1", 0)
        .with_handshake_timeout(Some(Duration::from_millis(100)));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server.serve(listener, std::future::pending()).await;
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // Header only; the promised method byte never arrives.
    stream.write_all(&[0x05, 0x01]).await.unwrap();

    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut [0u8; 16]))
        .await
        .expect("server kept the stalled connection open")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_tls_session_through_proxy() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let identity = generate_server_identity().unwrap();
    let acceptor = tls_acceptor(&identity).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tls_echo = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Ok(mut tls) = acceptor.accept(stream).await {
                            let mut buf = [0u8; 1024];
                            loop {
                                match tls.read(&mut buf).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(n) => {
                                        if tls.write_all(&buf[..n]).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });

    let proxy = spawn_proxy().await;
    let target = format!("localhost:{}", tls_echo.port());
    let mut stream = dial_through_socks5(&proxy.to_string(), &target, None, true)
        .await
        .unwrap();
    stream.write_all(b"over tls").await.unwrap();
    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"over tls");
}
