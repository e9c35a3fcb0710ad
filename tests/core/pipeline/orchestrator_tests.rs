//! Orchestrator stage-flow tests with a scripted prober.
//!
//! These avoid the network entirely: REALITY configs probe only their own
//! endpoint, and the subprocess path fails fast on a missing binary.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use cfscan::core::pipeline::{ParsedConfig, Pipeline, PipelineOptions, PipelineState, Stage};
use cfscan::core::probe::{Prober, TlsProbeOutcome};
use cfscan::core::types::{Endpoint, ErrorKind};

struct DeadProber;

#[async_trait::async_trait]
impl Prober for DeadProber {
    async fn probe(
        &self,
        _endpoint: Endpoint,
        _sni: &str,
        _limit: Duration,
        _validate: bool,
    ) -> TlsProbeOutcome {
        TlsProbeOutcome {
            latency_ms: -1.0,
            is_provider: false,
            error: Some(ErrorKind::TlsTimeout),
        }
    }
}

struct AliveProber;

#[async_trait::async_trait]
impl Prober for AliveProber {
    async fn probe(
        &self,
        _endpoint: Endpoint,
        _sni: &str,
        _limit: Duration,
        _validate: bool,
    ) -> TlsProbeOutcome {
        TlsProbeOutcome {
            latency_ms: 12.0,
            is_provider: true,
            error: None,
        }
    }
}

fn reality_config() -> ParsedConfig {
    ParsedConfig::parse(
        "vless://6ba7b810-9dad-11d1-80b4-00c04fd430c8@198.51.100.7:443?type=tcp&security=reality&sni=r.example.com&pbk=abc",
    )
    .unwrap()
}

fn opts() -> PipelineOptions {
    PipelineOptions {
        probe_timeout: Duration::from_millis(200),
        test_timeout: Duration::from_secs(1),
        xray_bin: "cfscan-test-binary-that-does-not-exist".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn dead_endpoint_short_circuits_the_pipeline() {
    let pipeline = Pipeline::new(Arc::new(DeadProber), opts());
    let state = Arc::new(PipelineState::new());
    let mut rng = StdRng::seed_from_u64(1);

    let outcome = pipeline
        .run(&reality_config(), state.clone(), &mut rng)
        .await;

    assert_eq!(state.stage(), Stage::Done);
    assert!(outcome.live_ips.is_empty());
    assert!(outcome.working_ips.is_empty());
    // Stage 2 still tested the original endpoint; the missing binary is an
    // operational error on the variation, never a crash.
    assert_eq!(outcome.variations.len(), 1);
    let v = &outcome.variations[0];
    assert!(!v.alive);
    assert!(matches!(v.error, Some(ErrorKind::BinaryMissing(_))));
    assert_eq!(v.score, 0.0);
}

#[tokio::test]
async fn reality_probes_only_its_own_endpoint() {
    let pipeline = Pipeline::new(Arc::new(AliveProber), opts());
    let state = Arc::new(PipelineState::new());
    let mut rng = StdRng::seed_from_u64(2);

    let outcome = pipeline
        .run(&reality_config(), state.clone(), &mut rng)
        .await;

    assert_eq!(outcome.live_ips.len(), 1);
    assert_eq!(
        outcome.live_ips[0].0,
        "198.51.100.7".parse::<std::net::Ipv4Addr>().unwrap()
    );
    // Every tested variation keeps the pinned SNI and carries a result URI.
    assert!(!outcome.variations.is_empty());
    for v in &outcome.variations {
        assert_eq!(v.config.sni, "r.example.com");
        assert!(v.result_uri.starts_with("vless://"));
    }
}

#[tokio::test]
async fn interrupted_state_skips_later_stages() {
    let pipeline = Pipeline::new(Arc::new(AliveProber), opts());
    let state = Arc::new(PipelineState::new());
    state.interrupt();
    let mut rng = StdRng::seed_from_u64(3);

    let outcome = pipeline
        .run(&reality_config(), state.clone(), &mut rng)
        .await;

    assert_eq!(state.stage(), Stage::Done);
    assert!(outcome.variations.is_empty());
}
