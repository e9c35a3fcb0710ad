// Core types shared across the scanner, funnel, and pipeline.
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// One probe target. Port 443 is the canonical form and is omitted from the
/// display form so exported address lists stay compatible with plain IP lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.port == 443 {
            write!(f, "{}", self.ip)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

/// Per-target error classification.
///
/// Transient kinds are recorded on the result and drive retry/fallback
/// decisions; operational kinds are surfaced once and never retried. A scan
/// is never a hard failure: dead targets carry one of these, alive targets
/// carry none.
#[derive(Debug, Clone, PartialEq, thiserror::Error, serde::Serialize)]
pub enum ErrorKind {
    #[error("tcp-timeout")]
    TcpTimeout,
    #[error("tcp:{0}")]
    Tcp(String),
    #[error("tls-timeout")]
    TlsTimeout,
    #[error("tls:{0}")]
    Tls(String),
    #[error("timeout")]
    Timeout,
    #[error("refused")]
    Refused,
    #[error("reset")]
    Reset,
    #[error("eof")]
    Eof,
    #[error("empty")]
    EmptyResponse,
    #[error("hdr-too-big")]
    HeaderTooBig,
    #[error("http:{0}")]
    Http(String),
    #[error("429:{0}")]
    RateLimited(u64),
    /// Validated edge answered but the origin returned 4xx/5xx. Counted as a
    /// confirmed edge AND as a diagnostic; the two sinks stay separate.
    #[error("cf-origin:{0}")]
    CfOrigin(u16),
    #[error("ws-status:{0}")]
    WsStatus(u16),
    #[error("ws-close:{0}")]
    WsClose(u16),
    #[error("ws-hdr-timeout")]
    WsHdrTimeout,
    #[error("vless-bad")]
    VlessBad,
    #[error("tunnel-timeout")]
    TunnelTimeout,
    #[error("tunnel-eof")]
    TunnelEof,
    #[error("probe-http:{0}")]
    ProbeHttpStatus(u16),
    #[error("binary-missing:{0}")]
    BinaryMissing(String),
    #[error("spawn:{0}")]
    SubprocessStart(String),
    #[error("exit:{code}:{stderr_tail}")]
    SubprocessExit { code: i32, stderr_tail: String },
    #[error("config-parse:{0}")]
    ConfigParse(String),
    #[error("interrupted")]
    Interrupted,
}

/// Clip a string to at most `max` characters (not bytes).
pub fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

impl ErrorKind {
    /// Human-short form for result tables, capped at 60 chars.
    pub fn short(&self) -> String {
        clip(&self.to_string(), 60)
    }

    /// Classify an I/O error from a connect or read path.
    pub fn from_io(err: &std::io::Error, phase: IoPhase) -> Self {
        use std::io::ErrorKind as K;
        match err.kind() {
            K::ConnectionRefused => ErrorKind::Refused,
            K::ConnectionReset | K::ConnectionAborted => ErrorKind::Reset,
            K::UnexpectedEof => ErrorKind::Eof,
            K::TimedOut => match phase {
                IoPhase::Tcp => ErrorKind::TcpTimeout,
                IoPhase::Tls => ErrorKind::TlsTimeout,
                IoPhase::Http => ErrorKind::Timeout,
            },
            _ => {
                let detail = clip(&err.to_string(), 40);
                match phase {
                    IoPhase::Tcp => ErrorKind::Tcp(detail),
                    IoPhase::Tls => ErrorKind::Tls(detail),
                    IoPhase::Http => ErrorKind::Http(detail),
                }
            }
        }
    }
}

/// Which phase an I/O error surfaced in, for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPhase {
    Tcp,
    Tls,
    Http,
}

/// Result of one throughput download against a single edge IP.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SpeedResult {
    pub connect_ms: f64,
    pub ttfb_ms: f64,
    pub bytes: u64,
    pub duration_ms: f64,
    pub mbps: f64,
    /// Trailing token of the `cf-ray` header, names the edge site.
    pub colo: String,
    pub error: Option<ErrorKind>,
}

impl SpeedResult {
    pub fn failed(error: ErrorKind) -> Self {
        Self {
            connect_ms: -1.0,
            ttfb_ms: -1.0,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_alive(&self) -> bool {
        self.mbps > 0.0
    }
}

/// Aggregated per-IP record built up across the latency phase and funnel
/// rounds. Created once per IP; each round merges its best observation in.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IpResult {
    pub ip: Ipv4Addr,
    /// Config domains that resolved to this IP.
    pub domains: Vec<String>,
    /// Original config URIs behind this IP.
    pub uris: Vec<String>,
    /// Ports this IP answered on during the scan.
    pub ports: Vec<u16>,
    pub tcp_ms: f64,
    pub tls_ms: f64,
    pub ttfb_ms: f64,
    /// One entry per funnel round (0.0 = round failed for this IP).
    pub speeds: Vec<f64>,
    pub best_mbps: f64,
    pub colo: String,
    pub score: f64,
    pub error: Option<ErrorKind>,
    pub alive: bool,
}

impl IpResult {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            domains: Vec::new(),
            uris: Vec::new(),
            ports: Vec::new(),
            tcp_ms: -1.0,
            tls_ms: -1.0,
            ttfb_ms: -1.0,
            speeds: Vec::new(),
            best_mbps: -1.0,
            colo: String::new(),
            score: 0.0,
            error: None,
            alive: false,
        }
    }
}

/// How many live endpoints the streaming snapshot keeps.
pub const TOP_SNAPSHOT_LEN: usize = 20;
/// Snapshot refresh cadence, in finds.
pub const TOP_SNAPSHOT_EVERY: usize = 10;

/// Shared progress state for one scan.
///
/// Counters are plain atomics; the top-N snapshot is appended under a lock.
/// The interrupt flag is best-effort and consulted at every natural
/// suspension point; workers observing it return without writing any
/// half-complete result.
#[derive(Debug, Default)]
pub struct ScanState {
    pub total: AtomicUsize,
    pub done: AtomicUsize,
    pub found: AtomicUsize,
    /// Probes that confirmed the edge but saw an origin-side HTTP error.
    pub cf_origin: AtomicUsize,
    interrupted: AtomicBool,
    top: Mutex<Vec<(Endpoint, f64)>>,
}

impl ScanState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        self.found.store(0, Ordering::Relaxed);
        self.cf_origin.store(0, Ordering::Relaxed);
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    /// Latest top-N live endpoints, sorted ascending by latency.
    pub fn top_snapshot(&self) -> Vec<(Endpoint, f64)> {
        self.top.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn store_top(&self, mut entries: Vec<(Endpoint, f64)>) {
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        entries.truncate(TOP_SNAPSHOT_LEN);
        if let Ok(mut top) = self.top.lock() {
            *top = entries;
        }
    }
}

/// Parse boolean environment variables (strict true/false only).
pub fn parse_env_bool(env_var: &str) -> bool {
    std::env::var(env_var)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true"))
        .unwrap_or(false)
}
