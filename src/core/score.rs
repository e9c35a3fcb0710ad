//! Metric-to-score mapping, 0-100.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::core::types::IpResult;

/// What was actually measured for a target; picks the weighting branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreBasis {
    /// A throughput download ran.
    SpeedTested,
    /// Only the native tunnel probe ran (no meaningful throughput figure).
    NativeTunnel,
    /// Alive, but a speed phase ran elsewhere and skipped this target.
    AliveNoSpeed,
    /// No speed phase ran at all.
    LatencyOnly,
}

fn lat_score(connect_ms: f64) -> f64 {
    if connect_ms > 0.0 {
        (100.0 - connect_ms / 10.0).clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn ttfb_score(ttfb_ms: f64) -> f64 {
    if ttfb_ms > 0.0 {
        (100.0 - ttfb_ms / 5.0).clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn spd_score(mbps: f64) -> f64 {
    if mbps > 0.0 {
        (mbps * 20.0).min(100.0)
    } else {
        0.0
    }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Score one target. Dead targets must be scored 0 by the caller.
pub fn score(connect_ms: f64, ttfb_ms: f64, mbps: f64, basis: ScoreBasis) -> f64 {
    let lat = lat_score(connect_ms);
    match basis {
        ScoreBasis::SpeedTested => round1(
            lat * 0.35 + spd_score(mbps) * 0.50 + ttfb_score(ttfb_ms) * 0.15,
        ),
        ScoreBasis::NativeTunnel => round1(lat * 0.55 + ttfb_score(ttfb_ms) * 0.45),
        ScoreBasis::AliveNoSpeed => round1(lat * 0.35),
        ScoreBasis::LatencyOnly => round1(lat),
    }
}

/// Recompute scores across a scan's per-IP results.
///
/// IPs the speed rounds skipped rank below every speed-tested IP; when no
/// speed round ran at all, scores are latency-only.
pub fn calc_scores(results: &mut HashMap<Ipv4Addr, IpResult>) {
    let has_speed = results.values().any(|r| r.best_mbps > 0.0);
    for r in results.values_mut() {
        if !r.alive {
            r.score = 0.0;
            continue;
        }
        let basis = if r.best_mbps > 0.0 {
            ScoreBasis::SpeedTested
        } else if has_speed {
            ScoreBasis::AliveNoSpeed
        } else {
            ScoreBasis::LatencyOnly
        };
        r.score = score(r.tls_ms, r.ttfb_ms, r.best_mbps, basis);
    }
}

/// Alive results sorted for export.
pub fn sorted_alive(results: &HashMap<Ipv4Addr, IpResult>, key: SortKey) -> Vec<IpResult> {
    let mut alive: Vec<IpResult> = results.values().filter(|r| r.alive).cloned().collect();
    match key {
        SortKey::Score => alive.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        SortKey::Latency => alive.sort_by(|a, b| {
            a.tls_ms
                .partial_cmp(&b.tls_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        SortKey::Speed => alive.sort_by(|a, b| {
            b.best_mbps
                .partial_cmp(&a.best_mbps)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
    }
    alive
}

/// All results: alive sorted by `key`, dead at the bottom sorted by IP.
pub fn sorted_all(results: &HashMap<Ipv4Addr, IpResult>, key: SortKey) -> Vec<IpResult> {
    let mut all = sorted_alive(results, key);
    let mut dead: Vec<IpResult> = results.values().filter(|r| !r.alive).cloned().collect();
    dead.sort_by_key(|r| r.ip);
    all.extend(dead);
    all
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Score,
    Latency,
    Speed,
}
