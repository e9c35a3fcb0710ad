//! Funnel tests with a scripted speed client.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cfscan::config::funnel_preset;
use cfscan::core::rate_limiter::RateLimiter;
use cfscan::core::speed::SpeedClient;
use cfscan::core::types::{ErrorKind, IpResult, ScanState, SpeedResult};
use cfscan::core::Funnel;

/// Succeeds everywhere with a rate derived from the last octet, and logs
/// which host served each download.
struct ScriptedSpeed {
    hosts: Mutex<Vec<String>>,
    rate_limit_primary: bool,
}

#[async_trait::async_trait]
impl SpeedClient for ScriptedSpeed {
    async fn download(
        &self,
        ip: Ipv4Addr,
        _size: usize,
        _limit: Duration,
        host: &str,
        _path: &str,
    ) -> SpeedResult {
        self.hosts.lock().unwrap().push(host.to_string());
        if self.rate_limit_primary && host.is_empty() {
            return SpeedResult::failed(ErrorKind::RateLimited(60));
        }
        SpeedResult {
            connect_ms: 50.0,
            ttfb_ms: 120.0,
            bytes: 1_000_000,
            duration_ms: 500.0,
            mbps: 1.0 + ip.octets()[3] as f64 / 10.0,
            colo: "FRA".to_string(),
            error: None,
        }
    }
}

fn seed_results(count: u8, latency_base: f64) -> Arc<Mutex<HashMap<Ipv4Addr, IpResult>>> {
    let mut map = HashMap::new();
    for i in 1..=count {
        let ip = Ipv4Addr::new(104, 16, i / 250, i);
        let mut r = IpResult::new(ip);
        r.alive = true;
        r.tcp_ms = latency_base + i as f64;
        r.tls_ms = latency_base + i as f64 * 2.0;
        map.insert(ip, r);
    }
    Arc::new(Mutex::new(map))
}

fn funnel(client: Arc<dyn SpeedClient>) -> Funnel {
    Funnel {
        client,
        limiter: Arc::new(RateLimiter::new()),
        workers: 10,
        timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn small_sets_skip_the_funnel() {
    let results = seed_results(10, 5.0);
    let client = Arc::new(ScriptedSpeed {
        hosts: Mutex::new(Vec::new()),
        rate_limit_primary: false,
    });
    let f = funnel(client.clone());
    let state = Arc::new(ScanState::new());
    f.run_rounds(&results, funnel_preset("normal"), &state).await;

    // Normal preset has three rounds; every IP must carry three samples.
    let map = results.lock().unwrap();
    for r in map.values() {
        assert_eq!(r.speeds.len(), 3, "ip {} speeds {:?}", r.ip, r.speeds);
        assert!(r.best_mbps > 0.0);
        assert_eq!(r.colo, "FRA");
        assert!(r.score > 0.0);
    }
}

#[tokio::test]
async fn rounds_narrow_candidates_by_score() {
    // 250 alive IPs: 40% latency cut leaves 150, then 150/45/18... the
    // keep table is computed from the post-cut count.
    let results = seed_results(250, 1.0);
    let client = Arc::new(ScriptedSpeed {
        hosts: Mutex::new(Vec::new()),
        rate_limit_primary: false,
    });
    let f = funnel(client);
    let state = Arc::new(ScanState::new());
    f.run_rounds(&results, funnel_preset("normal"), &state).await;

    let map = results.lock().unwrap();
    let round1: usize = map.values().filter(|r| !r.speeds.is_empty()).count();
    let round2: usize = map.values().filter(|r| r.speeds.len() >= 2).count();
    let round3: usize = map.values().filter(|r| r.speeds.len() >= 3).count();
    // post-cut 150: round keeps are 150, clamp(150*25%, 20, 50)=37,
    // clamp(150*10%, 10, 20)=15.
    assert_eq!(round1, 150);
    assert_eq!(round2, 37);
    assert_eq!(round3, 15);
}

#[tokio::test]
async fn a_429_steers_retries_to_the_fallback_cdn() {
    let results = seed_results(4, 5.0);
    let client = Arc::new(ScriptedSpeed {
        hosts: Mutex::new(Vec::new()),
        rate_limit_primary: true,
    });
    let f = funnel(client.clone());
    let limiter = f.limiter.clone();
    let state = Arc::new(ScanState::new());
    f.run_rounds(&results, funnel_preset("quick"), &state).await;

    // The 429 fed the limiter and the retry succeeded via the CDN.
    assert!(limiter.blocked_for_secs().is_some());
    let map = results.lock().unwrap();
    assert!(map.values().all(|r| r.best_mbps > 0.0));
    let hosts = client.hosts.lock().unwrap();
    assert!(hosts.iter().any(|h| !h.is_empty()), "no fallback used");
}
