//! Line-framed file transfer over TCP, plain or TLS.
//!
//! Wire contract, client to server:
//!   `DOWNLOAD\n<name>\n`              server answers `OK\n` plus the
//!                                     file bytes, or `ERROR: <reason>\n`
//!   `SEND\n<name>\n<file bytes>`      server stores the bytes under the
//!                                     base name inside its root

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::encryption::{generate_server_identity, tls_acceptor};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("transfer rejected: {0}")]
    Rejected(String),
    #[error("unusable file name: {0}")]
    BadFileName(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// File server half of the protocol. `SEND` uploads land inside
/// `root_dir`; `DOWNLOAD` names resolve against it as well.
pub struct TransferServer {
    listen_addr: String,
    listen_port: u16,
    tls: bool,
    root_dir: PathBuf,
}

impl TransferServer {
    pub fn new(listen_addr: impl Into<String>, listen_port: u16, tls: bool) -> Self {
        TransferServer {
            listen_addr: listen_addr.into(),
            listen_port,
            tls,
            root_dir: PathBuf::from("."),
        }
    }

    pub fn with_root(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    pub async fn bind(&self) -> Result<TcpListener, TransferError> {
        let listener =
            TcpListener::bind(format!("{}:{}", self.listen_addr, self.listen_port)).await?;
        info!(
            "[TRANSFER] Listening on {}:{} (tls: {})",
            self.listen_addr, self.listen_port, self.tls
        );
        Ok(listener)
    }

    /// Accept loop, one task per connection. Per-session errors are
    /// logged and do not stop the server.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransferError> {
        let acceptor = if self.tls {
            let identity =
                generate_server_identity().map_err(|e| io::Error::new(ErrorKind::Other, e))?;
            Some(tls_acceptor(&identity).map_err(|e| io::Error::new(ErrorKind::Other, e))?)
        } else {
            None
        };

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("[TRANSFER] Accept failed: {}", e);
                    continue;
                }
            };
            debug!("[TRANSFER] Connection from {}", peer);
            let root = self.root_dir.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => handle_connection(stream, &root).await,
                        Err(e) => {
                            warn!("[TRANSFER] TLS accept from {} failed: {}", peer, e);
                            return;
                        }
                    },
                    None => handle_connection(stream, &root).await,
                };
                if let Err(e) = result {
                    warn!("[TRANSFER] Session with {} failed: {}", peer, e);
                }
            });
        }
    }

    pub async fn run(&self) -> Result<(), TransferError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }
}

async fn handle_connection<S>(stream: S, root: &Path) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let mut command = String::new();
    reader.read_line(&mut command).await?;
    let mut file_name = String::new();
    reader.read_line(&mut file_name).await?;
    let command = command.trim();
    let file_name = file_name.trim();

    match command {
        "DOWNLOAD" => {
            // The server operator picked the root; names resolve
            // against it, absolute paths are served as given.
            let path = root.join(file_name);
            let mut file = match File::open(&path).await {
                Ok(file) => file,
                Err(_) => {
                    write_half.write_all(b"ERROR: File not found\n").await?;
                    return Ok(());
                }
            };
            write_half.write_all(b"OK\n").await?;
            let sent = tokio::io::copy(&mut file, &mut write_half).await?;
            write_half.shutdown().await?;
            info!("[TRANSFER] Served {} ({} bytes)", path.display(), sent);
        }
        "SEND" => {
            let base = match sanitize_file_name(file_name) {
                Ok(base) => base,
                Err(_) => {
                    write_half.write_all(b"ERROR: Bad file name\n").await?;
                    return Ok(());
                }
            };
            let path = root.join(&base);
            let mut file = match File::create(&path).await {
                Ok(file) => file,
                Err(_) => {
                    write_half.write_all(b"ERROR: Could not create file\n").await?;
                    return Ok(());
                }
            };
            // Remaining buffered bytes belong to the payload, so the
            // copy must drain the reader, not the raw half.
            let received = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            info!("[TRANSFER] Stored {} ({} bytes)", path.display(), received);
        }
        _ => {
            write_half.write_all(b"ERROR: Unknown command\n").await?;
        }
    }
    Ok(())
}

/// Requests `file_name` from the server on `stream` and writes it to
/// the current directory under its base name. Returns the path written
/// and the byte count.
pub async fn download_file<S>(stream: S, file_name: &str) -> Result<(PathBuf, u64), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(format!("DOWNLOAD\n{}\n", file_name).as_bytes())
        .await?;
    write_half.flush().await?;

    let mut status = String::new();
    if reader.read_line(&mut status).await? == 0 {
        return Err(TransferError::Rejected(
            "connection closed before status".to_string(),
        ));
    }
    if status.trim() != "OK" {
        return Err(TransferError::Rejected(status.trim().to_string()));
    }

    let local_name = sanitize_file_name(file_name)?;
    let mut file = File::create(&local_name).await?;
    let received = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    info!(
        "[TRANSFER] Downloaded {} ({} bytes)",
        local_name.display(),
        received
    );
    Ok((local_name, received))
}

/// Streams a local file to the server on `stream` under its base name.
pub async fn send_file<S>(mut stream: S, file_path: &str) -> Result<u64, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let base = sanitize_file_name(file_path)?;
    let mut file = File::open(file_path).await?;

    stream
        .write_all(format!("SEND\n{}\n", base.display()).as_bytes())
        .await?;
    let sent = tokio::io::copy(&mut file, &mut stream).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    info!("[TRANSFER] Sent {} ({} bytes)", file_path, sent);
    Ok(sent)
}

/// Reduces a client-supplied name to its final path component.
fn sanitize_file_name(name: &str) -> Result<PathBuf, TransferError> {
    Path::new(name)
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| TransferError::BadFileName(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(
            sanitize_file_name("../../etc/passwd").unwrap(),
            PathBuf::from("passwd")
        );
        assert_eq!(
            sanitize_file_name("notes.txt").unwrap(),
            PathBuf::from("notes.txt")
        );
        assert_eq!(
            sanitize_file_name("a/b/c.bin").unwrap(),
            PathBuf::from("c.bin")
        );
    }

    #[test]
    fn test_sanitize_rejects_bare_directories() {
        for name in ["", ".", "..", "/"] {
            assert!(
                matches!(sanitize_file_name(name), Err(TransferError::BadFileName(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_command_gets_error_line() {
        let (client, server) = tokio::io::duplex(1024);
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let session = tokio::spawn(async move { handle_connection(server, &root).await });

        let (rx, mut tx) = tokio::io::split(client);
        tx.write_all(b"DELETE\nwhatever\n").await.unwrap();

        let mut line = String::new();
        BufReader::new(rx).read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "ERROR: Unknown command");

        drop(tx);
        session.await.unwrap().unwrap();
    }
}
