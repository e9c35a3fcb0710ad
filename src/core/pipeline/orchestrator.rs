//! Three-stage proxy pipeline: IP scan, base-config validation, variation
//! expansion.
//!
//! The stages run serially and are each cancellable; no expansion work
//! starts before the base tests finish. Variations flow through the same
//! `test_one` primitive in both later stages: native tunnel probing for
//! ws+vless configs, the external proxy subprocess for everything else.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;

use crate::config::{
    DEFAULT_MAX_SNIS_PER_IP, DEFAULT_MAX_VARIATIONS, DEFAULT_PIPELINE_IPS, FALLBACK_EXPANSION_IPS,
    FALLBACK_SNIS, BASE_LOCAL_PORT, MAX_STAGE2_IPS, SPEED_HOST, STAGE2_CONCURRENCY,
    STAGE3_CONCURRENCY, STAGE3_WAVE,
};
use crate::core::debug_log::dbg_line;
use crate::core::pipeline::parsed::{ParsedConfig, Protocol, Security, Transport};
use crate::core::pipeline::tunnel::{probe_tunnel, TunnelProbe};
use crate::core::pipeline::variation::{
    generate, FragPreset, GeneratorInput, Variation,
};
use crate::core::pipeline::xray::XrayRunner;
use crate::core::probe::Prober;
use crate::core::scanner::{scan, ScanOptions};
use crate::core::score::{score, ScoreBasis};
use crate::core::types::{Endpoint, ScanState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    IpScan,
    BaseTest,
    Expansion,
    Done,
}

/// Shared observable state for one pipeline run.
pub struct PipelineState {
    pub scan: Arc<ScanState>,
    stage: Mutex<Stage>,
    pub variations: Mutex<Vec<Variation>>,
    pub warnings: Mutex<Vec<String>>,
    pub tested: AtomicUsize,
    pub alive: AtomicUsize,
}

impl PipelineState {
    pub fn new() -> Self {
        Self {
            scan: Arc::new(ScanState::new()),
            stage: Mutex::new(Stage::Idle),
            variations: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
            tested: AtomicUsize::new(0),
            alive: AtomicUsize::new(0),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage.lock().map(|s| *s).unwrap_or(Stage::Idle)
    }

    fn set_stage(&self, stage: Stage) {
        if let Ok(mut s) = self.stage.lock() {
            *s = stage;
        }
    }

    pub fn interrupt(&self) {
        self.scan.interrupt();
    }

    pub fn is_interrupted(&self) -> bool {
        self.scan.is_interrupted()
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        dbg_line("Pipeline", &format!("warning: {}", message));
        if let Ok(mut w) = self.warnings.lock() {
            w.push(message);
        }
    }

    fn record(&self, variation: Variation) {
        self.tested.fetch_add(1, Ordering::Relaxed);
        if variation.alive {
            self.alive.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut v) = self.variations.lock() {
            v.push(variation);
        }
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Ports probed during the IP scan; the config port joins this set.
    pub ports: Vec<u16>,
    pub scan_concurrency: usize,
    pub probe_timeout: Duration,
    /// Per-variation test timeout.
    pub test_timeout: Duration,
    /// Download size for subprocess-tested variations.
    pub speed_size: usize,
    pub max_stage2_ips: usize,
    pub max_variations: usize,
    pub max_snis_per_ip: usize,
    pub sni_pool: Vec<String>,
    pub frag_preset: FragPreset,
    pub transport_variants: Vec<Transport>,
    pub base_port: u16,
    pub xray_bin: PathBuf,
    /// Extra candidate IPs merged into the stage-1 scan.
    pub extra_ips: Vec<Ipv4Addr>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            ports: vec![443],
            scan_concurrency: 200,
            probe_timeout: Duration::from_secs(3),
            test_timeout: Duration::from_secs(15),
            speed_size: 2_000_000,
            max_stage2_ips: MAX_STAGE2_IPS,
            max_variations: DEFAULT_MAX_VARIATIONS,
            max_snis_per_ip: DEFAULT_MAX_SNIS_PER_IP,
            sni_pool: Vec::new(),
            frag_preset: FragPreset::All,
            transport_variants: Vec::new(),
            base_port: BASE_LOCAL_PORT,
            xray_bin: PathBuf::from("xray"),
            extra_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub live_ips: Vec<(Ipv4Addr, f64)>,
    pub working_ips: Vec<Ipv4Addr>,
    /// All tested variations, best score first.
    pub variations: Vec<Variation>,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct Pipeline {
    pub prober: Arc<dyn Prober>,
    pub runner: Arc<XrayRunner>,
    pub opts: Arc<PipelineOptions>,
}

impl Pipeline {
    pub fn new(prober: Arc<dyn Prober>, opts: PipelineOptions) -> Self {
        let runner = Arc::new(XrayRunner::new(opts.xray_bin.clone()));
        Self {
            prober,
            runner,
            opts: Arc::new(opts),
        }
    }

    /// Run all three stages for one parsed config.
    pub async fn run<R: Rng>(
        &self,
        parsed: &ParsedConfig,
        state: Arc<PipelineState>,
        rng: &mut R,
    ) -> PipelineOutcome {
        state.set_stage(Stage::IpScan);
        let config_ip = resolve_ipv4(&parsed.address).await;
        let (live, ip_ports, server_reachable) =
            self.stage_ip_scan(parsed, config_ip, &state, rng).await;

        if state.is_interrupted() {
            state.set_stage(Stage::Done);
            return self.outcome(&state, live, Vec::new());
        }

        state.set_stage(Stage::BaseTest);
        let working = self
            .stage_base_test(parsed, config_ip, &live, &state, server_reachable)
            .await;

        if state.is_interrupted() {
            state.set_stage(Stage::Done);
            return self.outcome(&state, live, working);
        }

        state.set_stage(Stage::Expansion);
        let expansion_ips: Vec<Ipv4Addr> = if working.is_empty() {
            if server_reachable {
                // Base config failed everywhere, but the server answers:
                // let fragment/SNI variations try to prove connectivity.
                live.iter()
                    .take(FALLBACK_EXPANSION_IPS)
                    .map(|(ip, _)| *ip)
                    .collect()
            } else {
                Vec::new()
            }
        } else {
            working.clone()
        };
        if !expansion_ips.is_empty() {
            self.stage_expansion(parsed, &expansion_ips, &ip_ports, &state)
                .await;
        }

        state.set_stage(Stage::Done);
        self.outcome(&state, live, working)
    }

    fn outcome(
        &self,
        state: &PipelineState,
        live: Vec<(Ipv4Addr, f64)>,
        working: Vec<Ipv4Addr>,
    ) -> PipelineOutcome {
        let mut variations = state
            .variations
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default();
        variations.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let warnings = state.warnings.lock().map(|w| w.clone()).unwrap_or_default();
        PipelineOutcome {
            live_ips: live,
            working_ips: working,
            variations,
            warnings,
        }
    }

    /// Stage 1: find live edge IPs for this config.
    async fn stage_ip_scan<R: Rng>(
        &self,
        parsed: &ParsedConfig,
        config_ip: Option<Ipv4Addr>,
        state: &Arc<PipelineState>,
        rng: &mut R,
    ) -> (Vec<(Ipv4Addr, f64)>, HashMap<Ipv4Addr, Vec<u16>>, bool) {
        // REALITY: the SNI is pinned to the server key, so scanning other
        // edges is meaningless; probe only the configured endpoint.
        if parsed.security == Security::Reality {
            let Some(ip) = config_ip else {
                state.warn("config address did not resolve to an IPv4");
                return (Vec::new(), HashMap::new(), false);
            };
            let out = self
                .prober
                .probe(
                    Endpoint::new(ip, parsed.port),
                    &parsed.sni,
                    self.opts.probe_timeout,
                    false,
                )
                .await;
            if out.latency_ms > 0.0 {
                let mut ports = HashMap::new();
                ports.insert(ip, vec![parsed.port]);
                return (vec![(ip, out.latency_ms)], ports, true);
            }
            return (Vec::new(), HashMap::new(), false);
        }

        let mut ips: Vec<Ipv4Addr> = DEFAULT_PIPELINE_IPS
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        ips.extend(self.opts.extra_ips.iter().copied());
        if let Some(ip) = config_ip {
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }

        let mut ports = self.opts.ports.clone();
        if !ports.contains(&parsed.port) {
            ports.push(parsed.port);
        }
        let opts = ScanOptions {
            sni: SPEED_HOST.to_string(),
            timeout: self.opts.probe_timeout,
            validate: true,
            ports,
            concurrency: self.opts.scan_concurrency,
        };
        let outcome = scan(self.prober.clone(), &ips, &opts, state.scan.clone(), rng).await;

        let cf_origin = state.scan.cf_origin.load(Ordering::Relaxed);
        let live_n = outcome.ranked.len();
        if cf_origin >= 3 && cf_origin * 2 > live_n {
            state.warn(format!(
                "{} of {} validated edges answered with origin-side HTTP errors",
                cf_origin, live_n
            ));
        }

        let server_reachable = config_ip
            .map(|ip| outcome.ranked.iter().any(|(live_ip, _)| *live_ip == ip))
            .unwrap_or(false)
            || live_n > 0;
        (outcome.ranked, outcome.ip_ports, server_reachable)
    }

    /// Stage 2: validate the unmodified config against the best edges.
    async fn stage_base_test(
        &self,
        parsed: &ParsedConfig,
        config_ip: Option<Ipv4Addr>,
        live: &[(Ipv4Addr, f64)],
        state: &Arc<PipelineState>,
        server_reachable: bool,
    ) -> Vec<Ipv4Addr> {
        let mut candidates: Vec<Ipv4Addr> = Vec::new();
        if let Some(ip) = config_ip {
            candidates.push(ip);
        }
        for (ip, _) in live.iter().take(self.opts.max_stage2_ips) {
            if !candidates.contains(ip) {
                candidates.push(*ip);
            }
        }
        if candidates.is_empty() {
            return Vec::new();
        }

        dbg_line(
            "Pipeline",
            &format!("base test: {} candidate ips", candidates.len()),
        );
        let sni = parsed.infer_sni();
        let variations: Vec<Variation> = candidates
            .iter()
            .enumerate()
            .map(|(i, ip)| {
                let mut cfg = parsed.clone();
                cfg.address = ip.to_string();
                if parsed.security != Security::Reality {
                    cfg.sni = sni.clone();
                }
                Variation::new(
                    cfg,
                    *ip,
                    parsed.port,
                    sni.clone(),
                    None,
                    parsed.transport.as_str().to_string(),
                    self.opts.base_port.saturating_add(i as u16),
                )
            })
            .collect();

        let tested = self
            .test_batch(variations, STAGE2_CONCURRENCY, state)
            .await;
        let mut working: Vec<Ipv4Addr> = tested
            .iter()
            .filter(|v| v.alive)
            .map(|v| v.source_ip)
            .collect();
        working.dedup();

        // No base survivor but the server answers: walk the fallback SNI
        // ladder against the original endpoint. Never under REALITY, where
        // the SNI is bound to the server key.
        if working.is_empty() && server_reachable && parsed.security != Security::Reality {
            if let Some(ip) = config_ip {
                let mut ladder: Vec<String> = Vec::new();
                if !parsed.host.is_empty() {
                    ladder.push(parsed.host.clone());
                }
                for sni in FALLBACK_SNIS {
                    if !ladder.iter().any(|s| s == sni) {
                        ladder.push((*sni).to_string());
                    }
                }
                for (i, sni) in ladder.into_iter().enumerate() {
                    if state.is_interrupted() {
                        break;
                    }
                    dbg_line("Pipeline", &format!("fallback sni: {}", sni));
                    let mut cfg = parsed.clone();
                    cfg.address = ip.to_string();
                    cfg.sni = sni.clone();
                    let mut variation = Variation::new(
                        cfg,
                        ip,
                        parsed.port,
                        sni,
                        None,
                        parsed.transport.as_str().to_string(),
                        self.opts
                            .base_port
                            .saturating_add(MAX_STAGE2_IPS as u16 + 1 + i as u16),
                    );
                    self.test_one(&mut variation).await;
                    let alive = variation.alive;
                    state.record(variation);
                    if alive {
                        working.push(ip);
                        break;
                    }
                }
            }
        }
        working
    }

    /// Stage 3: explode variations over the proven IPs and test them in
    /// bounded waves.
    async fn stage_expansion(
        &self,
        parsed: &ParsedConfig,
        ips: &[Ipv4Addr],
        ip_ports: &HashMap<Ipv4Addr, Vec<u16>>,
        state: &Arc<PipelineState>,
    ) {
        let generated = generate(&GeneratorInput {
            parsed,
            working_ips: ips,
            ip_ports,
            sni_pool: &self.opts.sni_pool,
            frag_preset: self.opts.frag_preset,
            transport_variants: &self.opts.transport_variants,
            max_total: self.opts.max_variations,
            max_snis_per_ip: self.opts.max_snis_per_ip,
            base_port: self.opts.base_port.saturating_add(64),
        });

        // Drop anything stages 1-2 already measured.
        let seen: HashSet<String> = state
            .variations
            .lock()
            .map(|v| v.iter().map(|v| v.tag()).collect())
            .unwrap_or_default();
        let pending: Vec<Variation> = generated
            .into_iter()
            .filter(|v| !seen.contains(&v.tag()))
            .collect();
        dbg_line(
            "Pipeline",
            &format!("expansion: {} variations to test", pending.len()),
        );

        // Waves keep cancellation latency bounded.
        for wave in pending.chunks(STAGE3_WAVE) {
            if state.is_interrupted() {
                break;
            }
            self.test_batch(wave.to_vec(), STAGE3_CONCURRENCY, state)
                .await;
        }
    }

    async fn test_batch(
        &self,
        variations: Vec<Variation>,
        concurrency: usize,
        state: &Arc<PipelineState>,
    ) -> Vec<Variation> {
        let sem = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(variations.len());
        for mut variation in variations {
            let this = self.clone();
            let sem = sem.clone();
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let _permit = match sem.acquire().await {
                    Ok(p) => p,
                    Err(_) => return None,
                };
                if state.is_interrupted() {
                    return None;
                }
                this.test_one(&mut variation).await;
                state.record(variation.clone());
                Some(variation)
            }));
        }
        let mut tested = Vec::new();
        for handle in handles {
            if let Ok(Some(v)) = handle.await {
                tested.push(v);
            }
        }
        tested
    }

    /// Measure one variation. ws+vless configs go through the native
    /// tunnel prober, whose verdict is authoritative; everything else runs
    /// the external proxy subprocess with a SOCKS5-wrapped download.
    pub async fn test_one(&self, variation: &mut Variation) {
        let cfg = &variation.config;
        let native = cfg.transport == Transport::Ws
            && cfg.protocol == Protocol::Vless
            && !cfg.uuid.is_nil();

        if native {
            let probe = TunnelProbe {
                ip: cfg.address.clone(),
                port: cfg.port,
                sni: variation.sni.clone(),
                host: if cfg.host.is_empty() {
                    variation.sni.clone()
                } else {
                    cfg.host.clone()
                },
                ws_path: cfg.path.clone(),
                uuid: cfg.uuid,
                timeout: self.opts.test_timeout,
                security: cfg.security,
            };
            let out = probe_tunnel(&probe).await;
            variation.native_tested = true;
            variation.connect_ms = out.connect_ms;
            variation.ttfb_ms = out.ttfb_ms;
            variation.speed_mbps = out.mbps;
            variation.error = out.error;
            variation.alive = out.mbps > 0.0;
            variation.score = if variation.alive {
                score(out.connect_ms, out.ttfb_ms, 0.0, ScoreBasis::NativeTunnel)
            } else {
                0.0
            };
        } else {
            let result = self
                .runner
                .test_variation(variation, self.opts.speed_size, self.opts.test_timeout)
                .await;
            variation.native_tested = false;
            variation.connect_ms = result.connect_ms;
            variation.ttfb_ms = result.ttfb_ms;
            variation.speed_mbps = result.mbps;
            variation.error = result.error;
            variation.alive = result.mbps > 0.0;
            variation.score = if variation.alive {
                score(
                    result.connect_ms,
                    result.ttfb_ms,
                    result.mbps,
                    ScoreBasis::SpeedTested,
                )
            } else {
                0.0
            };
        }
        variation.result_uri = variation.config.to_uri();
    }
}

/// Resolve a config address to IPv4, accepting literals directly.
pub async fn resolve_ipv4(address: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = address.parse::<Ipv4Addr>() {
        return Some(ip);
    }
    let addrs = tokio::net::lookup_host((address, 443)).await.ok()?;
    addrs.filter_map(|a| match a.ip() {
        std::net::IpAddr::V4(v4) => Some(v4),
        _ => None,
    })
    .next()
}
