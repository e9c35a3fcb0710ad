//! Single-connection HTTPS throughput measurement.
//!
//! One TLS connection, one `GET`, and a streaming read loop that terminates
//! early once the per-interval rate stabilizes. Certificate verification is
//! attempted first and retried once without verification, because edge IPs
//! frequently serve a certificate for a different zone than the Host being
//! measured.

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use crate::config::{SPEED_HOST, SPEED_PATH};
use crate::core::debug_log::dbg_line;
use crate::core::tls::{insecure_connector, server_name, verifying_connector};
use crate::core::types::{ErrorKind, IoPhase, SpeedResult};

const HEADER_CAP: usize = 65_536;
const READ_BUF: usize = 65_536;
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) Chrome/120";

/// Stability window: stddev/mean of the last 4 per-interval rates.
const STABLE_WINDOW: usize = 4;
const STABLE_CV: f64 = 0.10;

/// Large downloads reduce the worker pool so a handful of streams is not
/// starved by dozens of competing sockets.
pub fn clamp_workers(size: usize, workers: usize) -> usize {
    if size >= 50_000_000 {
        workers.min(6)
    } else if size >= 10_000_000 {
        workers.min(8)
    } else {
        workers
    }
}

/// Overall deadline scales with the requested size.
pub fn overall_deadline(size: usize, limit: Duration) -> Duration {
    let scaled = Duration::from_secs_f64(30.0 + (size as f64 / 1_000_000.0) * 2.0);
    limit.max(scaled)
}

pub fn connect_deadline(limit: Duration) -> Duration {
    limit.min(Duration::from_secs(15))
}

/// Download `size` bytes from an edge IP, SNI/Host `host`, path `path`.
///
/// Empty `host`/`path` select the primary throughput endpoint. Returns a
/// partial result (with whatever bytes arrived) rather than a failure when
/// the body read times out midway.
pub async fn download(
    ip: Ipv4Addr,
    size: usize,
    limit: Duration,
    host: &str,
    path: &str,
) -> SpeedResult {
    let host = if host.is_empty() { SPEED_HOST } else { host };
    let owned_path;
    let path = if path.is_empty() {
        owned_path = format!("{}?bytes={}", SPEED_PATH, size);
        &owned_path
    } else {
        path
    };

    let first = dial_and_download(ip, false, size, limit, host, path).await;
    if let Some(ErrorKind::Tls(detail)) = &first.error {
        if detail.to_lowercase().contains("certificate") {
            return dial_and_download(ip, true, size, limit, host, path).await;
        }
    }
    first
}

async fn dial_and_download(
    ip: Ipv4Addr,
    insecure: bool,
    size: usize,
    limit: Duration,
    host: &str,
    path: &str,
) -> SpeedResult {
    let conn_limit = connect_deadline(limit);
    let t_start = Instant::now();
    let tcp = match timeout(conn_limit, TcpStream::connect((ip, 443))).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return SpeedResult::failed(ErrorKind::from_io(&e, IoPhase::Tcp)),
        Err(_) => return SpeedResult::failed(ErrorKind::TcpTimeout),
    };
    download_via(tcp, insecure, t_start, size, limit, host, path).await
}

/// Run the TLS handshake and download over an already-dialed transport.
/// Used directly by the SOCKS5 path, where the dial goes through a local
/// proxy subprocess instead of a plain TCP connect.
pub async fn download_via<S>(
    transport: S,
    insecure: bool,
    t_start: Instant,
    size: usize,
    limit: Duration,
    host: &str,
    path: &str,
) -> SpeedResult
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn_limit = connect_deadline(limit);
    let name = match server_name(host) {
        Ok(n) => n,
        Err(e) => return SpeedResult::failed(e),
    };
    let connector = if insecure {
        insecure_connector()
    } else {
        verifying_connector()
    };
    let stream = match timeout(conn_limit, connector.connect(name, transport)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return SpeedResult::failed(ErrorKind::from_io(&e, IoPhase::Tls)),
        Err(_) => return SpeedResult::failed(ErrorKind::TlsTimeout),
    };
    let connect_ms = t_start.elapsed().as_secs_f64() * 1000.0;

    stream_download(stream, connect_ms, t_start, size, limit, host, path).await
}

async fn stream_download<S>(
    mut stream: S,
    connect_ms: f64,
    t_start: Instant,
    size: usize,
    limit: Duration,
    host: &str,
    path: &str,
) -> SpeedResult
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let overall = overall_deadline(size, limit);
    let conn_limit = connect_deadline(limit);
    let fail = |error: ErrorKind| SpeedResult {
        connect_ms,
        ttfb_ms: -1.0,
        error: Some(error),
        ..Default::default()
    };

    let range_hdr = if path.contains("bytes=") {
        String::new()
    } else {
        format!("Range: bytes=0-{}\r\n", size.saturating_sub(1))
    };
    let req = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\n{}Connection: close\r\n\r\n",
        path, host, USER_AGENT, range_hdr
    );
    if let Err(e) = stream.write_all(req.as_bytes()).await {
        return fail(ErrorKind::from_io(&e, IoPhase::Http));
    }

    // Header phase: bounded read until the blank-line delimiter.
    let mut hbuf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&hbuf) {
            break pos;
        }
        if hbuf.len() > HEADER_CAP {
            dbg_line("Speed", &format!("DL {} {}: header too big", host, size));
            return fail(ErrorKind::HeaderTooBig);
        }
        let n = match timeout(conn_limit.min(Duration::from_secs(10)), stream.read(&mut chunk))
            .await
        {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return fail(ErrorKind::from_io(&e, IoPhase::Http)),
            Err(_) => return fail(ErrorKind::Timeout),
        };
        if n == 0 {
            dbg_line("Speed", &format!("DL {} {}: empty response", host, size));
            return fail(ErrorKind::EmptyResponse);
        }
        hbuf.extend_from_slice(&chunk[..n]);
    };

    let header_bytes = hbuf.split_to(header_end);
    let body0 = hbuf; // whatever arrived past the delimiter
    let htxt = String::from_utf8_lossy(&header_bytes).to_string();

    let status = match crate::core::probe::parse_status_code(&header_bytes) {
        Some(code) => code,
        None => return fail(ErrorKind::Http(first_line(&htxt))),
    };
    if status == 429 {
        let ra = parse_retry_after(&htxt).unwrap_or(60);
        dbg_line(
            "Speed",
            &format!("DL {} {}: 429 rate-limited (retry-after={})", host, size, ra),
        );
        return fail(ErrorKind::RateLimited(ra));
    }
    if status != 200 && status != 206 {
        dbg_line(
            "Speed",
            &format!("DL {} {}: HTTP error: {}", host, size, first_line(&htxt)),
        );
        return fail(ErrorKind::Http(first_line(&htxt)));
    }

    let colo = parse_colo(&htxt);
    let ttfb_ms = t_start.elapsed().as_secs_f64() * 1000.0 - connect_ms;

    // Body phase with streaming rate samples.
    let dl_start = Instant::now();
    let mut total: u64 = body0.len() as u64;

    let sample_interval: u64 = if size >= 5_000_000 {
        1_000_000
    } else {
        size as u64 + 1
    };
    let mut next_sample = sample_interval;
    let mut samples: Vec<(u64, f64)> = Vec::new();
    let min_for_stable: u64 = if size >= 5_000_000 {
        ((size / 2).min(20_000_000)) as u64
    } else {
        size as u64
    };
    let min_samples = if size >= 10_000_000 { 5 } else { 3 };

    let mut body_chunk = vec![0u8; READ_BUF];
    loop {
        let elapsed_total = t_start.elapsed();
        let left = overall
            .checked_sub(elapsed_total)
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_secs(1));
        let n = match timeout(left.min(Duration::from_secs(10)), stream.read(&mut body_chunk))
            .await
        {
            Ok(Ok(n)) => n,
            // Partial data beats a failure; whatever arrived still measures
            // the link.
            Ok(Err(_)) | Err(_) => break,
        };
        if n == 0 {
            break;
        }
        total += n as u64;
        if total >= next_sample {
            samples.push((total, dl_start.elapsed().as_secs_f64()));
            next_sample += sample_interval;
            if samples.len() >= min_samples
                && total >= min_for_stable
                && rate_is_stable(&samples)
            {
                break;
            }
        }
    }

    let dl_secs = dl_start.elapsed().as_secs_f64();
    let mbps = if dl_secs > 0.0 {
        (total as f64 / 1_000_000.0) / dl_secs
    } else {
        0.0
    };
    if total == 0 {
        return fail(ErrorKind::Timeout);
    }
    dbg_line(
        "Speed",
        &format!(
            "DL {} {}: OK {:.2}MB/s total={} dt={:.1}s",
            host, size, mbps, total, dl_secs
        ),
    );
    SpeedResult {
        connect_ms,
        ttfb_ms,
        bytes: total,
        duration_ms: dl_secs * 1000.0,
        mbps,
        colo,
        error: None,
    }
}

/// Sliding-window stability check over the last 4 samples: the download is
/// considered stable when stddev/mean of the per-interval rates drops
/// below 10%.
fn rate_is_stable(samples: &[(u64, f64)]) -> bool {
    let start = samples.len().saturating_sub(STABLE_WINDOW);
    let recent = &samples[start..];
    let mut rates = Vec::with_capacity(recent.len());
    for pair in recent.windows(2) {
        let db = (pair[1].0 - pair[0].0) as f64;
        let dt = pair[1].1 - pair[0].1;
        if dt > 0.0 {
            rates.push(db / dt);
        }
    }
    if rates.len() < 2 {
        return false;
    }
    let mean = rates.iter().sum::<f64>() / rates.len() as f64;
    if mean <= 0.0 {
        return false;
    }
    let var = rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (rates.len() - 1) as f64;
    var.sqrt() / mean < STABLE_CV
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn first_line(headers: &str) -> String {
    crate::core::types::clip(headers.lines().next().unwrap_or(""), 40)
}

fn parse_retry_after(headers: &str) -> Option<u64> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("retry-after") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Trailing `-XXX` token of the `cf-ray` header names the edge site.
fn parse_colo(headers: &str) -> String {
    for line in headers.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("cf-ray") {
                if let Some((_, colo)) = value.trim().rsplit_once('-') {
                    return colo.to_string();
                }
                return String::new();
            }
        }
    }
    String::new()
}

/// Seam for the funnel: production downloads over TLS, tests script results.
#[async_trait::async_trait]
pub trait SpeedClient: Send + Sync {
    async fn download(
        &self,
        ip: Ipv4Addr,
        size: usize,
        limit: Duration,
        host: &str,
        path: &str,
    ) -> SpeedResult;
}

#[derive(Debug, Default)]
pub struct TlsSpeedClient;

#[async_trait::async_trait]
impl SpeedClient for TlsSpeedClient {
    async fn download(
        &self,
        ip: Ipv4Addr,
        size: usize,
        limit: Duration,
        host: &str,
        path: &str,
    ) -> SpeedResult {
        download(ip, size, limit, host, path).await
    }
}
