//! Bounded concurrent endpoint scanner.
//!
//! Fans the endpoint x port product out over a semaphore-bounded worker
//! pool, streaming progress and a rolling top-N snapshot into a shared
//! `ScanState`. Cancellation is cooperative: the interrupt flag is observed
//! at every chunk boundary and before each probe, and in-flight probes are
//! aborted; whatever completed is returned sorted.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::Semaphore;

use crate::core::debug_log::dbg_line;
use crate::core::probe::Prober;
use crate::core::types::{Endpoint, ErrorKind, ScanState, TOP_SNAPSHOT_EVERY, TOP_SNAPSHOT_LEN};

/// Probes are scheduled in chunks so cancellation latency stays bounded
/// even for multi-million-probe scans.
pub const SCAN_CHUNK: usize = 50_000;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub sni: String,
    pub timeout: Duration,
    pub validate: bool,
    pub ports: Vec<u16>,
    pub concurrency: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            sni: crate::config::SPEED_HOST.to_string(),
            timeout: Duration::from_secs(3),
            validate: true,
            ports: vec![443],
            concurrency: 500,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Minimum latency per responding IP, ascending.
    pub ranked: Vec<(Ipv4Addr, f64)>,
    /// Every port each IP answered on, for downstream port selection.
    pub ip_ports: HashMap<Ipv4Addr, Vec<u16>>,
}

/// Scan `ips x opts.ports`, returning live IPs sorted by latency.
///
/// The product is shuffled up front so port batches do not starve any
/// single IP group. An IP responding on several ports is deduplicated to
/// its minimum latency; the full working-port set is kept in `ip_ports`.
pub async fn scan<R: Rng>(
    prober: Arc<dyn Prober>,
    ips: &[Ipv4Addr],
    opts: &ScanOptions,
    state: Arc<ScanState>,
    rng: &mut R,
) -> ScanOutcome {
    let mut endpoints: Vec<Endpoint> = ips
        .iter()
        .flat_map(|ip| opts.ports.iter().map(|p| Endpoint::new(*ip, *p)))
        .collect();
    endpoints.shuffle(rng);

    let total = endpoints.len();
    state.begin(total);
    dbg_line(
        "Scanner",
        &format!(
            "scan start: {} probes ({} ips x {} ports), workers={}",
            total,
            ips.len(),
            opts.ports.len(),
            opts.concurrency
        ),
    );

    let sem = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let results: Arc<Mutex<Vec<(Endpoint, f64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sni: Arc<str> = Arc::from(opts.sni.as_str());

    for chunk in endpoints.chunks(SCAN_CHUNK) {
        if state.is_interrupted() {
            break;
        }
        let mut handles = Vec::with_capacity(chunk.len());
        for endpoint in chunk.iter().copied() {
            let prober = prober.clone();
            let state = state.clone();
            let results = results.clone();
            let sem = sem.clone();
            let sni = sni.clone();
            let timeout = opts.timeout;
            let validate = opts.validate;
            handles.push(tokio::spawn(async move {
                if state.is_interrupted() {
                    state.done.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let _permit = match sem.acquire().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                if state.is_interrupted() {
                    state.done.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let out = prober.probe(endpoint, &sni, timeout, validate).await;
                if matches!(out.error, Some(ErrorKind::CfOrigin(_))) {
                    state.cf_origin.fetch_add(1, Ordering::Relaxed);
                }
                if out.latency_ms > 0.0 && out.is_provider {
                    let snapshot = {
                        let mut r = results.lock().expect("scan results lock");
                        r.push((endpoint, out.latency_ms));
                        let found = state.found.fetch_add(1, Ordering::Relaxed) + 1;
                        if found % TOP_SNAPSHOT_EVERY == 0 || found <= TOP_SNAPSHOT_LEN {
                            Some(r.clone())
                        } else {
                            None
                        }
                    };
                    if let Some(entries) = snapshot {
                        state.store_top(entries);
                    }
                }
                state.done.fetch_add(1, Ordering::Relaxed);
            }));
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let joined = futures::future::join_all(handles);
        tokio::pin!(joined);
        let mut aborted = false;
        loop {
            tokio::select! {
                _ = &mut joined => break,
                _ = tokio::time::sleep(Duration::from_millis(100)), if !aborted => {
                    if state.is_interrupted() {
                        for a in &aborts {
                            a.abort();
                        }
                        aborted = true;
                    }
                }
            }
        }
    }

    if state.is_interrupted() {
        // Abandoned probes never report; close the books for observers.
        state.done.store(total, Ordering::Relaxed);
        dbg_line("Scanner", "scan interrupted, returning partial results");
    }

    let raw = results.lock().map(|r| r.clone()).unwrap_or_default();
    let mut best: HashMap<Ipv4Addr, f64> = HashMap::new();
    let mut ip_ports: HashMap<Ipv4Addr, Vec<u16>> = HashMap::new();
    for (endpoint, latency) in raw {
        let entry = best.entry(endpoint.ip).or_insert(latency);
        if latency < *entry {
            *entry = latency;
        }
        let ports = ip_ports.entry(endpoint.ip).or_default();
        if !ports.contains(&endpoint.port) {
            ports.push(endpoint.port);
        }
    }
    for ports in ip_ports.values_mut() {
        ports.sort_unstable();
    }

    let mut ranked: Vec<(Ipv4Addr, f64)> = best.into_iter().collect();
    ranked.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    dbg_line(
        "Scanner",
        &format!("scan done: {} live ips", ranked.len()),
    );
    ScanOutcome { ranked, ip_ports }
}
