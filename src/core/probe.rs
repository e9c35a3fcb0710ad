//! Probe workers: one TCP-only measurement or one TLS+HTTP validating probe
//! per call.
//!
//! Certificate verification is disabled throughout; edge IPs terminate TLS
//! for certificates that never match the probe SNI. Every exit path releases
//! its socket (streams are dropped before the outcome is returned).

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use crate::core::tls::{insecure_connector, server_name};
use crate::core::types::{Endpoint, ErrorKind, IoPhase};

/// Outcome of a two-step TCP then TCP+TLS measurement.
#[derive(Debug, Clone)]
pub struct TcpProbeOutcome {
    pub tcp_ms: f64,
    /// Full TCP+TLS handshake time; -1.0 when the TLS step failed.
    pub tls_ms: f64,
    pub error: Option<ErrorKind>,
}

/// Outcome of a single TLS probe with optional provider validation.
#[derive(Debug, Clone)]
pub struct TlsProbeOutcome {
    /// TLS connect latency; negative when the probe failed.
    pub latency_ms: f64,
    /// Whether the response headers carried a provider marker. Only
    /// meaningful when the probe succeeded and validation was requested.
    pub is_provider: bool,
    pub error: Option<ErrorKind>,
}

impl TlsProbeOutcome {
    fn failed(error: ErrorKind) -> Self {
        Self {
            latency_ms: -1.0,
            is_provider: false,
            error: Some(error),
        }
    }
}

/// What to do when a validated edge answers with an origin-side HTTP error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CfOriginPolicy {
    /// Report success but tag the outcome with `CfOrigin(status)`.
    #[default]
    Tag,
    /// Report success and ignore the origin status entirely.
    Ignore,
}

/// Measure TCP RTT and full TCP+TLS connection time separately.
///
/// The TCP connection is closed and a fresh one opened for the TLS step, so
/// `tls_ms` includes its own TCP handshake.
pub async fn tcp_probe(endpoint: Endpoint, sni: &str, limit: Duration) -> TcpProbeOutcome {
    let t0 = Instant::now();
    let tcp_ms = match timeout(limit, TcpStream::connect((endpoint.ip, endpoint.port))).await {
        Ok(Ok(stream)) => {
            let ms = t0.elapsed().as_secs_f64() * 1000.0;
            drop(stream);
            ms
        }
        Ok(Err(e)) => {
            return TcpProbeOutcome {
                tcp_ms: -1.0,
                tls_ms: -1.0,
                error: Some(ErrorKind::from_io(&e, IoPhase::Tcp)),
            }
        }
        Err(_) => {
            return TcpProbeOutcome {
                tcp_ms: -1.0,
                tls_ms: -1.0,
                error: Some(ErrorKind::TcpTimeout),
            }
        }
    };

    let name = match server_name(sni) {
        Ok(n) => n,
        Err(e) => {
            return TcpProbeOutcome {
                tcp_ms,
                tls_ms: -1.0,
                error: Some(e),
            }
        }
    };
    let t0 = Instant::now();
    let connect = async {
        let stream = TcpStream::connect((endpoint.ip, endpoint.port)).await?;
        insecure_connector().connect(name, stream).await
    };
    match timeout(limit, connect).await {
        Ok(Ok(stream)) => {
            let tls_ms = t0.elapsed().as_secs_f64() * 1000.0;
            drop(stream);
            TcpProbeOutcome {
                tcp_ms,
                tls_ms,
                error: None,
            }
        }
        Ok(Err(e)) => TcpProbeOutcome {
            tcp_ms,
            tls_ms: -1.0,
            error: Some(ErrorKind::from_io(&e, IoPhase::Tls)),
        },
        Err(_) => TcpProbeOutcome {
            tcp_ms,
            tls_ms: -1.0,
            error: Some(ErrorKind::TlsTimeout),
        },
    }
}

/// TLS probe with optional provider-origin validation.
///
/// When `validate` is set, a single `GET /` is written over the TLS stream
/// and up to 2 KiB of response headers are read; the endpoint counts as a
/// provider edge iff the headers carry `server: cloudflare` or `cf-ray:`.
/// A validated edge whose status line is 4xx/5xx still reports success; the
/// origin misbehaving is tagged per `policy` for diagnostics.
pub async fn tls_probe(
    endpoint: Endpoint,
    sni: &str,
    limit: Duration,
    validate: bool,
    policy: CfOriginPolicy,
) -> TlsProbeOutcome {
    let name = match server_name(sni) {
        Ok(n) => n,
        Err(e) => return TlsProbeOutcome::failed(e),
    };

    let t0 = Instant::now();
    let connect = async {
        let stream = TcpStream::connect((endpoint.ip, endpoint.port)).await?;
        insecure_connector().connect(name, stream).await
    };
    let mut stream = match timeout(limit, connect).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return TlsProbeOutcome::failed(ErrorKind::from_io(&e, IoPhase::Tls)),
        Err(_) => return TlsProbeOutcome::failed(ErrorKind::TlsTimeout),
    };
    let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;

    if !validate {
        return TlsProbeOutcome {
            latency_ms,
            is_provider: true,
            error: None,
        };
    }

    let mut is_provider = false;
    let mut error = None;
    let header_limit = limit.min(Duration::from_secs(3));
    let headers = match timeout(header_limit, read_header_chunk(&mut stream, sni)).await {
        Ok(read) => read,
        Err(_) => None,
    };
    if let Some(headers) = headers {
        let lower = String::from_utf8_lossy(&headers).to_lowercase();
        is_provider = lower.contains("server: cloudflare") || lower.contains("cf-ray:");
        if is_provider && policy == CfOriginPolicy::Tag {
            if let Some(code) = parse_status_code(&headers) {
                if code >= 400 {
                    error = Some(ErrorKind::CfOrigin(code));
                }
            }
        }
    }

    TlsProbeOutcome {
        latency_ms,
        is_provider,
        error,
    }
}

/// Issue `GET /` and read up to 2 KiB of response headers.
async fn read_header_chunk<S>(stream: &mut S, sni: &str) -> Option<Vec<u8>>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let req = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        sni
    );
    stream.write_all(req.as_bytes()).await.ok()?;

    let mut buf = Vec::with_capacity(2048);
    let mut chunk = [0u8; 512];
    while buf.len() < 2048 && !contains_header_end(&buf) {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    if buf.is_empty() {
        None
    } else {
        Some(buf)
    }
}

fn contains_header_end(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

/// Status code from a raw header block, if parseable.
pub(crate) fn parse_status_code(headers: &[u8]) -> Option<u16> {
    let mut parsed = [httparse::EMPTY_HEADER; 32];
    let mut resp = httparse::Response::new(&mut parsed);
    match resp.parse(headers) {
        Ok(_) => resp.code,
        Err(_) => None,
    }
}

/// Probe seam for the scanner. The production implementation issues real
/// TLS probes; tests script outcomes without opening sockets.
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        endpoint: Endpoint,
        sni: &str,
        limit: Duration,
        validate: bool,
    ) -> TlsProbeOutcome;
}

#[derive(Debug, Default)]
pub struct TlsProber {
    pub cf_origin_policy: CfOriginPolicy,
}

#[async_trait::async_trait]
impl Prober for TlsProber {
    async fn probe(
        &self,
        endpoint: Endpoint,
        sni: &str,
        limit: Duration,
        validate: bool,
    ) -> TlsProbeOutcome {
        tls_probe(endpoint, sni, limit, validate, self.cf_origin_policy).await
    }
}
