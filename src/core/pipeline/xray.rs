//! External proxy subprocess fallback.
//!
//! Variations the native prober cannot carry (grpc, xhttp, vmess, ...) run
//! through a spawned xray process exposing a local SOCKS5 inbound. The
//! lifecycle contract is strict: start, block until the local port accepts
//! within 8 s, use, SIGTERM, wait 3 s, SIGKILL if needed. Config and stderr
//! files are removed on every exit path.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_socks::tcp::Socks5Stream;

use crate::config::{SPEED_HOST, XRAY_CONNECT_TIMEOUT, XRAY_TERM_GRACE};
use crate::core::debug_log::dbg_line;
use crate::core::pipeline::parsed::{ParsedConfig, Protocol, Security, Transport};
use crate::core::pipeline::variation::Variation;
use crate::core::speed::{connect_deadline, download_via};
use crate::core::types::{ErrorKind, SpeedResult};

const STDERR_TAIL_CHARS: usize = 400;

pub struct XrayRunner {
    pub binary: PathBuf,
    pub work_dir: PathBuf,
}

impl XrayRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            work_dir: std::env::temp_dir(),
        }
    }

    /// Spawn a subprocess for one variation and wait for its SOCKS5 port.
    pub async fn spawn(&self, variation: &Variation) -> Result<XrayChild, ErrorKind> {
        let tag = format!("cfscan-xray-{}-{}", variation.local_port, uuid::Uuid::new_v4());
        let config_path = self.work_dir.join(format!("{}.json", tag));
        let stderr_path = self.work_dir.join(format!("{}.log", tag));

        let config = build_config(&variation.config, variation.local_port, variation.fragment);
        std::fs::write(&config_path, config.to_string())
            .map_err(|e| ErrorKind::SubprocessStart(format!("config write: {}", e)))?;
        let stderr_file = std::fs::File::create(&stderr_path)
            .map_err(|e| ErrorKind::SubprocessStart(format!("stderr file: {}", e)))?;

        let spawned = tokio::process::Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::from(stderr_file))
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(c) => c,
            Err(e) => {
                let _ = std::fs::remove_file(&config_path);
                let _ = std::fs::remove_file(&stderr_path);
                return Err(if e.kind() == std::io::ErrorKind::NotFound {
                    ErrorKind::BinaryMissing(self.binary.display().to_string())
                } else {
                    ErrorKind::SubprocessStart(e.to_string())
                });
            }
        };
        let mut child = XrayChild {
            child,
            config_path,
            stderr_path,
        };

        // Block until the inbound accepts, the child dies, or 8 s pass.
        let deadline = Instant::now() + XRAY_CONNECT_TIMEOUT;
        loop {
            if let Ok(Some(status)) = child.child.try_wait() {
                let tail = child.stderr_tail();
                let code = status.code().unwrap_or(-1);
                child.cleanup_files();
                return Err(ErrorKind::SubprocessExit {
                    code,
                    stderr_tail: tail,
                });
            }
            let dial = TcpStream::connect(("127.0.0.1", variation.local_port));
            if let Ok(Ok(_)) = timeout(Duration::from_millis(250), dial).await {
                return Ok(child);
            }
            if Instant::now() >= deadline {
                child.shutdown().await;
                return Err(ErrorKind::SubprocessStart(
                    "socks port never accepted".to_string(),
                ));
            }
            sleep(Duration::from_millis(200)).await;
        }
    }

    /// Full fallback test: spawn, download through the SOCKS5 inbound
    /// against the primary endpoint, tear down.
    pub async fn test_variation(
        &self,
        variation: &Variation,
        size: usize,
        limit: Duration,
    ) -> SpeedResult {
        let child = match self.spawn(variation).await {
            Ok(c) => c,
            Err(e) => return SpeedResult::failed(e),
        };
        let result = socks_download(variation.local_port, size, limit, "", "").await;
        child.shutdown().await;
        result
    }
}

pub struct XrayChild {
    child: tokio::process::Child,
    config_path: PathBuf,
    stderr_path: PathBuf,
}

impl XrayChild {
    /// Terminate with SIGTERM, wait 3 s, escalate to SIGKILL; then remove
    /// the config and stderr files.
    pub async fn shutdown(mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
        if timeout(XRAY_TERM_GRACE, self.child.wait()).await.is_err() {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
        self.cleanup_files();
    }

    fn cleanup_files(&self) {
        let _ = std::fs::remove_file(&self.config_path);
        let _ = std::fs::remove_file(&self.stderr_path);
    }

    fn stderr_tail(&self) -> String {
        match std::fs::read_to_string(&self.stderr_path) {
            Ok(text) => {
                let trimmed = text.trim();
                let start = trimmed.len().saturating_sub(STDERR_TAIL_CHARS);
                trimmed
                    .char_indices()
                    .find(|(i, _)| *i >= start)
                    .map(|(i, _)| trimmed[i..].to_string())
                    .unwrap_or_default()
            }
            Err(_) => String::new(),
        }
    }
}

/// Download through the local SOCKS5 inbound, verify-first with one
/// insecure retry, mirroring the direct speed path.
pub async fn socks_download(
    local_port: u16,
    size: usize,
    limit: Duration,
    host: &str,
    path: &str,
) -> SpeedResult {
    let host = if host.is_empty() { SPEED_HOST } else { host };
    let owned_path;
    let path = if path.is_empty() {
        owned_path = format!("{}?bytes={}", crate::config::SPEED_PATH, size);
        &owned_path
    } else {
        path
    };

    let first = socks_attempt(local_port, false, size, limit, host, path).await;
    if let Some(ErrorKind::Tls(detail)) = &first.error {
        if detail.to_lowercase().contains("certificate") {
            return socks_attempt(local_port, true, size, limit, host, path).await;
        }
    }
    first
}

async fn socks_attempt(
    local_port: u16,
    insecure: bool,
    size: usize,
    limit: Duration,
    host: &str,
    path: &str,
) -> SpeedResult {
    let t_start = Instant::now();
    let dial = Socks5Stream::connect(("127.0.0.1", local_port), (host, 443));
    let stream = match timeout(connect_deadline(limit), dial).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            let detail = crate::core::types::clip(&e.to_string(), 40);
            return SpeedResult::failed(ErrorKind::Tcp(detail));
        }
        Err(_) => return SpeedResult::failed(ErrorKind::TcpTimeout),
    };
    download_via(stream, insecure, t_start, size, limit, host, path).await
}

/// Emit an xray client config: one SOCKS5 inbound, one outbound for the
/// variation, plus a fragmented freedom dialer when a fragment is set.
fn build_config(
    cfg: &ParsedConfig,
    local_port: u16,
    fragment: Option<crate::core::pipeline::variation::Fragment>,
) -> serde_json::Value {
    let mut stream = serde_json::json!({
        "network": cfg.transport.as_str(),
    });
    match cfg.security {
        Security::Tls => {
            stream["security"] = "tls".into();
            let mut tls = serde_json::json!({
                "serverName": cfg.sni,
                "allowInsecure": true,
            });
            if !cfg.fingerprint.is_empty() {
                tls["fingerprint"] = cfg.fingerprint.clone().into();
            }
            if !cfg.alpn.is_empty() {
                let alpn: Vec<&str> = cfg.alpn.split(',').collect();
                tls["alpn"] = serde_json::json!(alpn);
            }
            stream["tlsSettings"] = tls;
        }
        Security::Reality => {
            stream["security"] = "reality".into();
            stream["realitySettings"] = serde_json::json!({
                "serverName": cfg.sni,
                "publicKey": cfg.public_key,
                "shortId": cfg.short_id,
                "spiderX": cfg.spider_x,
                "fingerprint": if cfg.fingerprint.is_empty() { "chrome" } else { cfg.fingerprint.as_str() },
            });
        }
        Security::None => {}
    }
    match cfg.transport {
        Transport::Ws => {
            stream["wsSettings"] = serde_json::json!({
                "path": cfg.path,
                "headers": { "Host": cfg.host },
            });
        }
        Transport::Xhttp => {
            stream["xhttpSettings"] = serde_json::json!({
                "path": cfg.path,
                "host": cfg.host,
                "mode": cfg.mode,
            });
        }
        Transport::Grpc => {
            stream["grpcSettings"] = serde_json::json!({
                "serviceName": cfg.service_name,
            });
        }
        Transport::H2 => {
            stream["httpSettings"] = serde_json::json!({
                "path": cfg.path,
                "host": [cfg.host],
            });
        }
        Transport::Tcp => {}
    }

    let mut outbound = match cfg.protocol {
        Protocol::Vless => serde_json::json!({
            "tag": "proxy",
            "protocol": "vless",
            "settings": {
                "vnext": [{
                    "address": cfg.address,
                    "port": cfg.port,
                    "users": [{
                        "id": cfg.uuid.to_string(),
                        "encryption": "none",
                        "flow": cfg.flow,
                    }],
                }],
            },
            "streamSettings": stream,
        }),
        Protocol::Vmess => serde_json::json!({
            "tag": "proxy",
            "protocol": "vmess",
            "settings": {
                "vnext": [{
                    "address": cfg.address,
                    "port": cfg.port,
                    "users": [{
                        "id": cfg.uuid.to_string(),
                        "alterId": cfg.alter_id,
                        "security": if cfg.cipher.is_empty() { "auto" } else { cfg.cipher.as_str() },
                    }],
                }],
            },
            "streamSettings": stream,
        }),
    };

    let mut outbounds = Vec::new();
    if let Some(frag) = fragment {
        outbound["streamSettings"]["sockopt"] =
            serde_json::json!({ "dialerProxy": "fragment" });
        outbounds.push(outbound);
        outbounds.push(serde_json::json!({
            "tag": "fragment",
            "protocol": "freedom",
            "settings": {
                "fragment": {
                    "packets": frag.packets,
                    "length": frag.length,
                    "interval": frag.interval,
                },
            },
        }));
    } else {
        outbounds.push(outbound);
    }

    dbg_line("Xray", &format!("config built for port {}", local_port));
    serde_json::json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "tag": "socks-in",
            "listen": "127.0.0.1",
            "port": local_port,
            "protocol": "socks",
            "settings": { "udp": false },
        }],
        "outbounds": outbounds,
    })
}

/// Convenience used by tests and the CLI preflight: is a local TCP port
/// accepting connections?
pub async fn port_accepts(ip: Ipv4Addr, port: u16, limit: Duration) -> bool {
    matches!(
        timeout(limit, TcpStream::connect((ip, port))).await,
        Ok(Ok(_))
    )
}
