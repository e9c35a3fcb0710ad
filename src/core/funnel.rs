//! Multi-round elimination funnel.
//!
//! Each round both narrows the candidate count and raises the download
//! size, so cheap rounds weed out slow edges before the expensive ones run.
//! Between rounds survivors are re-scored and re-sorted; within a round the
//! rate limiter steers workers to the fallback CDN once the primary budget
//! runs dry or the provider pushes back.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::config::{FunnelPreset, CDN_FALLBACK_HOST, CDN_FALLBACK_PATH, SPEED_HOST};
use crate::core::debug_log::dbg_line;
use crate::core::probe::tcp_probe;
use crate::core::rate_limiter::RateLimiter;
use crate::core::score::calc_scores;
use crate::core::speed::{clamp_workers, SpeedClient};
use crate::core::types::{Endpoint, ErrorKind, IpResult, ScanState};

/// One funnel round: download `size` bytes from the top `keep` candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundCfg {
    pub size: usize,
    pub keep: usize,
}

impl RoundCfg {
    pub fn label(&self) -> String {
        if self.size >= 1_000_000 {
            format!("{}MB", self.size / 1_000_000)
        } else {
            format!("{}KB", self.size / 1000)
        }
    }
}

/// Build round configs from a preset and the post-cut alive count.
///
/// Small sets (<= 50 IPs) skip the funnel entirely: every round tests every
/// survivor. Otherwise round `k` keeps `clamp(len * pct, min, max)` where a
/// zero max means unclamped.
pub fn build_rounds(preset: &FunnelPreset, alive_count: usize) -> Vec<RoundCfg> {
    let small_set = alive_count <= 50;
    let mut rounds = Vec::new();
    for (i, &size) in preset.round_sizes.iter().enumerate() {
        let pct = preset.round_pcts.get(i).copied().unwrap_or(100);
        let mn = preset.round_min.get(i).copied().unwrap_or(0);
        let mx = preset.round_max.get(i).copied().unwrap_or(0);
        let mut keep = if small_set {
            alive_count
        } else {
            let mut keep = if pct < 100 {
                alive_count * pct as usize / 100
            } else {
                alive_count
            };
            if mn > 0 {
                keep = keep.max(mn);
            }
            if mx > 0 {
                keep = keep.min(mx);
            }
            keep
        };
        keep = keep.min(alive_count);
        if keep > 0 {
            rounds.push(RoundCfg { size, keep });
        }
    }
    rounds
}

pub struct Funnel {
    pub client: Arc<dyn SpeedClient>,
    pub limiter: Arc<RateLimiter>,
    pub workers: usize,
    pub timeout: Duration,
}

impl Funnel {
    /// Measure TCP and TCP+TLS latency for every IP, filling the shared
    /// result map. An IP is alive once its TLS handshake completes.
    pub async fn latency_phase(
        &self,
        ips: &[Ipv4Addr],
        sni: &str,
        workers: usize,
        limit: Duration,
        results: &Arc<Mutex<HashMap<Ipv4Addr, IpResult>>>,
        state: &Arc<ScanState>,
    ) {
        state.begin(ips.len());
        let sem = Arc::new(Semaphore::new(workers.max(1)));
        let sni: Arc<str> = Arc::from(sni);
        let mut handles = Vec::with_capacity(ips.len());
        for ip in ips.iter().copied() {
            let sem = sem.clone();
            let sni = sni.clone();
            let results = results.clone();
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let _permit = match sem.acquire().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                if state.is_interrupted() {
                    state.done.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let out = tcp_probe(Endpoint::new(ip, 443), &sni, limit).await;
                let alive = out.tls_ms > 0.0;
                if let Ok(mut map) = results.lock() {
                    let entry = map.entry(ip).or_insert_with(|| IpResult::new(ip));
                    entry.tcp_ms = out.tcp_ms;
                    entry.tls_ms = out.tls_ms;
                    entry.error = out.error;
                    entry.alive = alive;
                }
                if alive {
                    state.found.fetch_add(1, Ordering::Relaxed);
                }
                state.done.fetch_add(1, Ordering::Relaxed);
            }));
        }
        futures::future::join_all(handles).await;
        if state.is_interrupted() {
            state.done.store(ips.len(), Ordering::Relaxed);
        }
    }

    /// Run the elimination rounds over the alive IPs in `results`.
    pub async fn run_rounds(
        &self,
        results: &Arc<Mutex<HashMap<Ipv4Addr, IpResult>>>,
        preset: &FunnelPreset,
        state: &Arc<ScanState>,
    ) {
        let mut alive: Vec<Ipv4Addr> = {
            let map = results.lock().expect("results lock");
            let mut alive: Vec<(Ipv4Addr, f64)> = map
                .values()
                .filter(|r| r.alive)
                .map(|r| (r.ip, r.tls_ms))
                .collect();
            alive.sort_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            alive.into_iter().map(|(ip, _)| ip).collect()
        };

        if preset.latency_cut > 0 && alive.len() >= 50 {
            let cut_n = (alive.len() * preset.latency_cut as usize / 100).max(1);
            alive.truncate(alive.len() - cut_n);
            dbg_line(
                "Funnel",
                &format!(
                    "latency cut: removed bottom {}% = {} IPs, {} remaining",
                    preset.latency_cut,
                    cut_n,
                    alive.len()
                ),
            );
        }

        let rounds = build_rounds(preset, alive.len());
        dbg_line(
            "Funnel",
            &format!(
                "rounds: {:?}",
                rounds.iter().map(|r| (r.label(), r.keep)).collect::<Vec<_>>()
            ),
        );

        let mut cands = alive;
        for (i, rc) in rounds.iter().enumerate() {
            if state.is_interrupted() {
                break;
            }
            if i > 0 {
                if let Ok(mut map) = results.lock() {
                    calc_scores(&mut map);
                }
                let map = results.lock().expect("results lock");
                cands.sort_by(|a, b| {
                    let sa = map.get(a).map(|r| r.score).unwrap_or(0.0);
                    let sb = map.get(b).map(|r| r.score).unwrap_or(0.0);
                    sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            cands.truncate(rc.keep);
            dbg_line(
                "Funnel",
                &format!(
                    "round {}: {} x {} IPs, budget {} left",
                    i + 1,
                    rc.label(),
                    cands.len(),
                    crate::core::rate_limiter::BUDGET
                        .saturating_sub(self.limiter.requests_in_window())
                ),
            );
            self.round(results, *rc, &cands, state).await;
            if let Ok(mut map) = results.lock() {
                calc_scores(&mut map);
            }
        }
    }

    async fn round(
        &self,
        results: &Arc<Mutex<HashMap<Ipv4Addr, IpResult>>>,
        rc: RoundCfg,
        candidates: &[Ipv4Addr],
        state: &Arc<ScanState>,
    ) {
        state.begin(candidates.len());
        let workers = clamp_workers(rc.size, self.workers);
        let sem = Arc::new(Semaphore::new(workers.max(1)));

        let mut handles = Vec::with_capacity(candidates.len());
        for ip in candidates.iter().copied() {
            let client = self.client.clone();
            let limiter = self.limiter.clone();
            let sem = sem.clone();
            let results = results.clone();
            let state = state.clone();
            let timeout = self.timeout;
            handles.push(tokio::spawn(async move {
                ip_round(
                    ip, rc.size, timeout, client, limiter, sem, results, state,
                )
                .await;
            }));
        }
        futures::future::join_all(handles).await;
    }
}

const MAX_RETRIES: usize = 2;

#[allow(clippy::too_many_arguments)]
async fn ip_round(
    ip: Ipv4Addr,
    size: usize,
    limit: Duration,
    client: Arc<dyn SpeedClient>,
    limiter: Arc<RateLimiter>,
    sem: Arc<Semaphore>,
    results: Arc<Mutex<HashMap<Ipv4Addr, IpResult>>>,
    state: Arc<ScanState>,
) {
    let mut best_mbps = 0.0_f64;
    let mut best_ttfb = -1.0_f64;
    let mut best_colo = String::new();
    let mut last_err: Option<ErrorKind> = None;
    // Sticky once the provider rejects (403/429); retries go to the CDN.
    let mut force_cdn = false;

    for _attempt in 0..MAX_RETRIES {
        if state.is_interrupted() {
            break;
        }

        let (use_host, use_path) = if force_cdn {
            dbg_line("Funnel", &format!("DL {}: forced fallback CDN", ip));
            (CDN_FALLBACK_HOST.to_string(), CDN_FALLBACK_PATH.to_string())
        } else if limiter.would_block() {
            dbg_line("Funnel", &format!("DL {}: using fallback CDN", ip));
            (CDN_FALLBACK_HOST.to_string(), CDN_FALLBACK_PATH.to_string())
        } else {
            limiter.acquire(Some(state.as_ref())).await;
            (String::new(), String::new())
        };
        let used_primary = use_host.is_empty();

        let outcome = {
            let _permit = match sem.acquire().await {
                Ok(p) => p,
                Err(_) => break,
            };
            if state.is_interrupted() {
                break;
            }
            client.download(ip, size, limit, &use_host, &use_path).await
        };

        if outcome.mbps > 0.0 {
            best_mbps = outcome.mbps;
            best_ttfb = outcome.ttfb_ms;
            best_colo = outcome.colo;
            break;
        }

        match outcome.error {
            Some(ErrorKind::RateLimited(ra)) if used_primary => {
                limiter.report_429(ra);
                dbg_line(
                    "Funnel",
                    &format!("DL {}: 429 reported to limiter (retry-after={})", ip, ra),
                );
                force_cdn = true;
                last_err = Some(ErrorKind::RateLimited(ra));
            }
            Some(ErrorKind::Http(line)) if used_primary => {
                dbg_line(
                    "Funnel",
                    &format!("DL {}: http error from {}, switching to CDN", ip, SPEED_HOST),
                );
                force_cdn = true;
                last_err = Some(ErrorKind::Http(line));
            }
            Some(err) => {
                last_err = Some(err);
            }
            None => {}
        }
    }

    if let Ok(mut map) = results.lock() {
        let entry = map.entry(ip).or_insert_with(|| IpResult::new(ip));
        entry.speeds.push(best_mbps);
        if best_mbps > 0.0 {
            if best_mbps > entry.best_mbps {
                entry.best_mbps = best_mbps;
            }
            if best_ttfb > 0.0 && (entry.ttfb_ms < 0.0 || best_ttfb < entry.ttfb_ms) {
                entry.ttfb_ms = best_ttfb;
            }
            if !best_colo.is_empty() && entry.colo.is_empty() {
                entry.colo = best_colo;
            }
        } else if let Some(err) = last_err {
            entry.error = Some(err);
        }
    }
    state.done.fetch_add(1, Ordering::Relaxed);
}
