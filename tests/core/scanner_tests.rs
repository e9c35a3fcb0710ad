//! Scanner tests with a scripted prober: no sockets are opened.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use cfscan::core::expand::expand_cidrs;
use cfscan::core::probe::{Prober, TlsProbeOutcome};
use cfscan::core::scanner::{scan, ScanOptions};
use cfscan::core::types::{Endpoint, ErrorKind, ScanState};

/// Even fourth-octets answer in 10 ms as provider edges; odd ones time out.
struct EvenOctetProber;

#[async_trait::async_trait]
impl Prober for EvenOctetProber {
    async fn probe(
        &self,
        endpoint: Endpoint,
        _sni: &str,
        _limit: Duration,
        _validate: bool,
    ) -> TlsProbeOutcome {
        if endpoint.ip.octets()[3] % 2 == 0 {
            TlsProbeOutcome {
                latency_ms: 10.0,
                is_provider: true,
                error: None,
            }
        } else {
            TlsProbeOutcome {
                latency_ms: -1.0,
                is_provider: false,
                error: Some(ErrorKind::TlsTimeout),
            }
        }
    }
}

fn opts(ports: Vec<u16>) -> ScanOptions {
    ScanOptions {
        sni: "speed.cloudflare.com".to_string(),
        timeout: Duration::from_secs(1),
        validate: true,
        ports,
        concurrency: 64,
    }
}

#[tokio::test]
async fn clean_scan_dedups_ips_and_keeps_port_sets() {
    let mut rng = StdRng::seed_from_u64(1);
    let ips = expand_cidrs(&["104.16.0.0/24"], 0, &mut rng);
    assert_eq!(ips.len(), 254);

    let state = Arc::new(ScanState::new());
    let outcome = scan(
        Arc::new(EvenOctetProber),
        &ips,
        &opts(vec![443, 8443]),
        state.clone(),
        &mut rng,
    )
    .await;

    // Hosts 1..=254 hold 127 even fourth-octets; two ports dedup to one
    // entry per IP.
    assert_eq!(outcome.ranked.len(), 127);
    for (ip, latency) in &outcome.ranked {
        assert_eq!(ip.octets()[3] % 2, 0);
        assert_eq!(*latency, 10.0);
        assert_eq!(outcome.ip_ports[ip], vec![443, 8443]);
    }

    // Progress bookkeeping: every probe was accounted for, exactly once.
    assert_eq!(state.done.load(Ordering::Relaxed), 254 * 2);
    assert_eq!(state.total.load(Ordering::Relaxed), 254 * 2);
    assert_eq!(state.found.load(Ordering::Relaxed), 127 * 2);
}

#[tokio::test]
async fn results_rank_ascending_by_latency() {
    struct OctetLatencyProber;
    #[async_trait::async_trait]
    impl Prober for OctetLatencyProber {
        async fn probe(
            &self,
            endpoint: Endpoint,
            _sni: &str,
            _limit: Duration,
            _validate: bool,
        ) -> TlsProbeOutcome {
            TlsProbeOutcome {
                latency_ms: endpoint.ip.octets()[3] as f64,
                is_provider: true,
                error: None,
            }
        }
    }

    let ips: Vec<Ipv4Addr> = (1..=50).map(|i| Ipv4Addr::new(104, 16, 0, i)).collect();
    let mut rng = StdRng::seed_from_u64(2);
    let state = Arc::new(ScanState::new());
    let outcome = scan(
        Arc::new(OctetLatencyProber),
        &ips,
        &opts(vec![443]),
        state.clone(),
        &mut rng,
    )
    .await;

    let latencies: Vec<f64> = outcome.ranked.iter().map(|(_, l)| *l).collect();
    let mut sorted = latencies.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(latencies, sorted);

    let top = state.top_snapshot();
    assert!(top.len() <= 20);
    assert!(!top.is_empty());
}

#[tokio::test]
async fn cf_origin_errors_count_as_both_success_and_diagnostic() {
    // An edge that answers TLS but whose origin 4xxes is still a find;
    // the origin error feeds a separate advisory counter.
    struct CfOriginProber;
    #[async_trait::async_trait]
    impl Prober for CfOriginProber {
        async fn probe(
            &self,
            _endpoint: Endpoint,
            _sni: &str,
            _limit: Duration,
            _validate: bool,
        ) -> TlsProbeOutcome {
            TlsProbeOutcome {
                latency_ms: 25.0,
                is_provider: true,
                error: Some(ErrorKind::CfOrigin(530)),
            }
        }
    }

    let ips: Vec<Ipv4Addr> = (1..=10).map(|i| Ipv4Addr::new(104, 16, 0, i)).collect();
    let mut rng = StdRng::seed_from_u64(4);
    let state = Arc::new(ScanState::new());
    let outcome = scan(
        Arc::new(CfOriginProber),
        &ips,
        &opts(vec![443]),
        state.clone(),
        &mut rng,
    )
    .await;

    assert_eq!(outcome.ranked.len(), 10);
    assert_eq!(state.cf_origin.load(Ordering::Relaxed), 10);
}

#[tokio::test]
async fn interrupt_returns_partial_results_and_closes_the_books() {
    let ips: Vec<Ipv4Addr> = (1..=100).map(|i| Ipv4Addr::new(104, 16, 0, i)).collect();
    let mut rng = StdRng::seed_from_u64(3);
    let state = Arc::new(ScanState::new());
    state.interrupt();

    let outcome = scan(
        Arc::new(EvenOctetProber),
        &ips,
        &opts(vec![443]),
        state.clone(),
        &mut rng,
    )
    .await;

    assert!(outcome.ranked.is_empty());
    assert_eq!(
        state.done.load(Ordering::Relaxed),
        state.total.load(Ordering::Relaxed)
    );
}
