//! Budgeted variation generation: SNI x fragment x transport x port over a
//! proven set of working IPs.
//!
//! The fragment presets and budget-distribution rule are fixed tables; the
//! generator is fully deterministic so a re-run over identical inputs
//! yields the same variations in the same order.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::core::pipeline::parsed::{ParsedConfig, Security, Transport};
use crate::core::types::ErrorKind;

/// One TLS-hello fragmentation recipe, opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub packets: &'static str,
    pub length: &'static str,
    pub interval: &'static str,
}

pub const FRAG_A: Fragment = Fragment {
    packets: "tlshello",
    length: "100-200",
    interval: "10-20",
};
pub const FRAG_B: Fragment = Fragment {
    packets: "tlshello",
    length: "40-120",
    interval: "15-30",
};
pub const FRAG_C: Fragment = Fragment {
    packets: "1-3",
    length: "150-300",
    interval: "20-40",
};

pub fn fragment_label(fragment: &Option<Fragment>) -> String {
    match fragment {
        None => "none".to_string(),
        Some(f) => format!("{}:{}:{}", f.packets, f.length, f.interval),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragPreset {
    None,
    Light,
    Medium,
    Heavy,
    #[default]
    All,
}

impl FragPreset {
    pub fn parse(s: &str) -> Self {
        match s {
            "none" => FragPreset::None,
            "light" => FragPreset::Light,
            "medium" => FragPreset::Medium,
            "heavy" => FragPreset::Heavy,
            _ => FragPreset::All,
        }
    }

    /// Fragment records for this preset; `None` entries mean no
    /// fragmentation.
    pub fn entries(self) -> Vec<Option<Fragment>> {
        match self {
            FragPreset::None => vec![None],
            FragPreset::Light => vec![Some(FRAG_A)],
            FragPreset::Medium => vec![Some(FRAG_A), Some(FRAG_B)],
            FragPreset::Heavy => vec![Some(FRAG_A), Some(FRAG_B), Some(FRAG_C)],
            FragPreset::All => vec![None, Some(FRAG_A), Some(FRAG_B), Some(FRAG_C)],
        }
    }
}

/// One unit of pipeline work: a derived config snapshot plus its measured
/// outcome. Created in bulk by the generator, mutated exactly once by the
/// tester that measures it.
#[derive(Debug, Clone)]
pub struct Variation {
    pub source_ip: Ipv4Addr,
    pub source_port: u16,
    pub sni: String,
    pub fragment: Option<Fragment>,
    pub fragment_label: String,
    pub transport_label: String,
    pub config: ParsedConfig,
    /// Local SOCKS5 port assigned to the subprocess path.
    pub local_port: u16,
    pub alive: bool,
    pub connect_ms: f64,
    pub ttfb_ms: f64,
    pub speed_mbps: f64,
    pub score: f64,
    pub error: Option<ErrorKind>,
    pub result_uri: String,
    /// True when measured by the native tunnel prober instead of the
    /// external proxy subprocess.
    pub native_tested: bool,
}

impl Variation {
    pub(crate) fn new(
        config: ParsedConfig,
        source_ip: Ipv4Addr,
        source_port: u16,
        sni: String,
        fragment: Option<Fragment>,
        transport_label: String,
        local_port: u16,
    ) -> Self {
        Self {
            source_ip,
            source_port,
            fragment_label: fragment_label(&fragment),
            sni,
            fragment,
            transport_label,
            config,
            local_port,
            alive: false,
            connect_ms: -1.0,
            ttfb_ms: -1.0,
            speed_mbps: -1.0,
            score: 0.0,
            error: None,
            result_uri: String::new(),
            native_tested: false,
        }
    }

    /// Identity tag for cross-stage deduplication.
    pub fn tag(&self) -> String {
        format!(
            "{}:{}|{}|{}|{}",
            self.source_ip, self.source_port, self.sni, self.fragment_label, self.transport_label
        )
    }
}

/// Build the effective SNI pool for a config.
///
/// REALITY pins the SNI to the config's (it is bound to the public key);
/// `security=none` pins it to the inferred value. Otherwise the Host domain
/// leads the pool: zone matching makes it the only reliably same-zone SNI.
pub fn effective_sni_pool(parsed: &ParsedConfig, user_pool: &[String]) -> Vec<String> {
    match parsed.security {
        Security::Reality => vec![parsed.sni.clone()],
        Security::None => vec![parsed.infer_sni()],
        Security::Tls => {
            let mut pool = Vec::new();
            let mut push = |s: &str| {
                if !s.is_empty() && !pool.iter().any(|p: &String| p == s) {
                    pool.push(s.to_string());
                }
            };
            push(&parsed.host);
            push(&parsed.sni);
            for s in user_pool {
                push(s);
            }
            if pool.is_empty() {
                pool.push(parsed.infer_sni());
            }
            pool
        }
    }
}

/// Whether fragment rotation is disabled for this config.
/// XTLS vision manages its own packet flow; plaintext has no ClientHello.
pub fn fragments_pinned(parsed: &ParsedConfig) -> bool {
    parsed.security == Security::None || parsed.flow.starts_with("xtls-rprx-vision")
}

/// Rewrite a derived config for a transport variant.
pub fn apply_transport(cfg: &mut ParsedConfig, transport: Transport) {
    cfg.transport = transport;
    match transport {
        Transport::Ws => {
            if cfg.path.is_empty() {
                cfg.path = "/ws".to_string();
            }
        }
        Transport::Xhttp => {
            if cfg.path.is_empty() {
                cfg.path = "/xhttp".to_string();
            }
            if cfg.mode.is_empty() {
                cfg.mode = "auto".to_string();
            }
        }
        Transport::Grpc => {
            if cfg.service_name.is_empty() {
                cfg.service_name = "grpc".to_string();
            }
        }
        Transport::H2 | Transport::Tcp => {}
    }
    if transport != Transport::Tcp {
        cfg.flow.clear();
    } else if cfg.security == Security::Reality {
        cfg.flow = "xtls-rprx-vision".to_string();
    }
}

pub const XHTTP_MODES: &[&str] = &["auto", "packet-up", "stream-up", "stream-down"];

pub struct GeneratorInput<'a> {
    pub parsed: &'a ParsedConfig,
    pub working_ips: &'a [Ipv4Addr],
    /// Working ports per IP from the scan; IPs absent here fall back to the
    /// config port.
    pub ip_ports: &'a HashMap<Ipv4Addr, Vec<u16>>,
    pub sni_pool: &'a [String],
    pub frag_preset: FragPreset,
    pub transport_variants: &'a [Transport],
    pub max_total: usize,
    pub max_snis_per_ip: usize,
    pub base_port: u16,
}

/// Emit variations under a total budget.
///
/// The budget is distributed across dimensions deterministically:
/// ```text
/// per_ip    = max(1, max_total / n_ip)
/// per_port  = max(1, per_ip / n_port_avg)
/// snis      = min(max_snis_per_ip, per_port, |pool|)
/// frags_eff = max(1, per_port / max(1, snis))
/// t_eff     = max(1, per_port / max(1, snis * frags_eff))
/// ```
/// then the cartesian product is emitted nested IP > port > transport >
/// SNI > fragment, stopping at `max_total` or local-port exhaustion.
pub fn generate(input: &GeneratorInput) -> Vec<Variation> {
    let parsed = input.parsed;
    let mut snis = effective_sni_pool(parsed, input.sni_pool);
    let mut frags = if fragments_pinned(parsed) {
        vec![None]
    } else {
        input.frag_preset.entries()
    };

    let mut transports: Vec<Transport> = vec![parsed.transport];
    for t in input.transport_variants {
        if !transports.contains(t) {
            transports.push(*t);
        }
    }

    let n_ip = input.working_ips.len().max(1);
    let total_ports: usize = input
        .working_ips
        .iter()
        .map(|ip| input.ip_ports.get(ip).map(|p| p.len()).unwrap_or(1))
        .sum();
    let n_port_avg = (total_ports / n_ip).max(1);

    let per_ip = (input.max_total / n_ip).max(1);
    let per_port = (per_ip / n_port_avg).max(1);
    let sni_budget = input.max_snis_per_ip.min(per_port).min(snis.len()).max(1);
    let frags_eff = (per_port / sni_budget.max(1)).max(1);
    let t_eff = (per_port / (sni_budget * frags_eff).max(1)).max(1);

    snis.truncate(sni_budget);
    frags.truncate(frags_eff);
    transports.truncate(t_eff);

    let mut out = Vec::new();
    let mut idx: u32 = 0;
    let fallback_ports = vec![parsed.port];

    'all: for ip in input.working_ips {
        let ports = input
            .ip_ports
            .get(ip)
            .filter(|p| !p.is_empty())
            .unwrap_or(&fallback_ports);
        for port in ports {
            for transport in &transports {
                for sni in &snis {
                    for frag in &frags {
                        let mut cfg = parsed.clone();
                        cfg.address = ip.to_string();
                        cfg.port = *port;
                        if parsed.security != Security::Reality {
                            cfg.sni = sni.clone();
                        }
                        apply_transport(&mut cfg, *transport);

                        let modes: Vec<Option<&str>> =
                            if *transport == Transport::Xhttp && frag.is_none() {
                                XHTTP_MODES.iter().map(|m| Some(*m)).collect()
                            } else {
                                vec![None]
                            };
                        for mode in modes {
                            if out.len() >= input.max_total {
                                break 'all;
                            }
                            let local = input.base_port as u32 + idx;
                            if local > u16::MAX as u32 {
                                break 'all;
                            }
                            let mut cfg = cfg.clone();
                            let label = match mode {
                                Some(m) => {
                                    cfg.mode = m.to_string();
                                    format!("{}/{}", transport.as_str(), m)
                                }
                                None => transport.as_str().to_string(),
                            };
                            out.push(Variation::new(
                                cfg,
                                *ip,
                                *port,
                                sni.clone(),
                                *frag,
                                label,
                                local as u16,
                            ));
                            idx += 1;
                        }
                    }
                }
            }
        }
    }
    out
}
