//! Process-wide constants: published Cloudflare ranges, scan modes, funnel
//! presets, and the endpoints the speed and pipeline paths talk to.
//!
//! All tables are compile-time structures; nothing here is read from disk.

use std::time::Duration;

/// Primary throughput endpoint. `?bytes=N` returns exactly N bytes.
pub const SPEED_HOST: &str = "speed.cloudflare.com";
pub const SPEED_PATH: &str = "/__down";

/// Fallback CDN endpoint used when the primary is rate limited. Serves a
/// large static asset with Range support.
pub const CDN_FALLBACK_HOST: &str = "cloudflaremirrors.com";
pub const CDN_FALLBACK_PATH: &str = "/archlinux/iso/latest/archlinux-x86_64.iso";

/// Small origin reachable through any Cloudflare edge; the native tunnel
/// probe requests this through the proxy as a proof of connectivity.
pub const TRACE_HOST: &str = "cp.cloudflare.com";
pub const TRACE_PORT: u16 = 80;
pub const TRACE_PATH: &str = "/cdn-cgi/trace";

pub const LATENCY_WORKERS: usize = 50;
pub const SPEED_WORKERS: usize = 10;
pub const LATENCY_TIMEOUT: Duration = Duration::from_secs(5);
pub const SPEED_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloudflare published IPv4 ranges (https://www.cloudflare.com/ips-v4/)
pub const CF_SUBNETS: &[&str] = &[
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
];

/// HTTPS ports Cloudflare terminates TLS on.
pub const CF_HTTPS_PORTS: &[u16] = &[443, 8443, 2053, 2083, 2087, 2096];

/// A handful of anycast IPs known to serve the provider certificate; the
/// pipeline scans these when the config address is a domain.
pub const DEFAULT_PIPELINE_IPS: &[&str] = &[
    "104.16.132.229",
    "104.17.71.206",
    "104.18.26.46",
    "162.159.152.4",
    "172.64.152.241",
    "188.114.96.3",
];

/// SNIs tried against the original IP when no base variation survives.
/// The config host is always prepended at runtime.
pub const FALLBACK_SNIS: &[&str] = &[
    "speed.cloudflare.com",
    "dash.cloudflare.com",
    "cp.cloudflare.com",
];

/// Hard cap on addresses accepted from freeform input.
pub const FREEFORM_MAX_IPS: usize = 6_666;

/// Clean-IP scan mode.
#[derive(Debug, Clone, Copy)]
pub struct CleanMode {
    pub key: &'static str,
    pub label: &'static str,
    /// IPs sampled per /24 block; 0 = every host.
    pub sample: usize,
    pub workers: usize,
    pub validate: bool,
    pub ports: &'static [u16],
    pub desc: &'static str,
}

pub const CLEAN_MODES: &[CleanMode] = &[
    CleanMode {
        key: "quick",
        label: "Quick",
        sample: 1,
        workers: 500,
        validate: false,
        ports: &[443],
        desc: "1 random IP per /24 (~4K IPs, ~30s)",
    },
    CleanMode {
        key: "normal",
        label: "Normal",
        sample: 3,
        workers: 500,
        validate: true,
        ports: &[443],
        desc: "3 IPs per /24 + CF verify (~12K IPs, ~2 min)",
    },
    CleanMode {
        key: "full",
        label: "Full",
        sample: 0,
        workers: 1000,
        validate: true,
        ports: &[443],
        desc: "All IPs + CF verify (~1.5M IPs, 20+ min)",
    },
    CleanMode {
        key: "mega",
        label: "Mega",
        sample: 0,
        workers: 1500,
        validate: true,
        ports: &[443, 8443],
        desc: "All IPs x 2 ports (~3M probes, 30-60 min)",
    },
];

pub fn clean_mode(key: &str) -> Option<&'static CleanMode> {
    CLEAN_MODES.iter().find(|m| m.key == key)
}

/// Speed-test funnel preset.
#[derive(Debug, Clone, Copy)]
pub struct FunnelPreset {
    pub key: &'static str,
    pub label: &'static str,
    pub desc: &'static str,
    /// Percentage of the slowest alive IPs dropped before round 1.
    pub latency_cut: u32,
    pub round_sizes: &'static [usize],
    pub round_pcts: &'static [u32],
    pub round_min: &'static [usize],
    pub round_max: &'static [usize],
}

pub const FUNNEL_PRESETS: &[FunnelPreset] = &[
    FunnelPreset {
        key: "quick",
        label: "Quick",
        desc: "Latency sort -> 1MB top 100 -> 5MB top 20",
        latency_cut: 50,
        round_sizes: &[1_000_000, 5_000_000],
        round_pcts: &[100, 20],
        round_min: &[50, 10],
        round_max: &[100, 20],
    },
    FunnelPreset {
        key: "normal",
        label: "Normal",
        desc: "Latency sort -> 1MB top 200 -> 5MB top 50 -> 20MB top 20",
        latency_cut: 40,
        round_sizes: &[1_000_000, 5_000_000, 20_000_000],
        round_pcts: &[100, 25, 10],
        round_min: &[50, 20, 10],
        round_max: &[200, 50, 20],
    },
    FunnelPreset {
        key: "thorough",
        label: "Thorough",
        desc: "Deep funnel: 5MB / 25MB / 50MB",
        latency_cut: 15,
        round_sizes: &[5_000_000, 25_000_000, 50_000_000],
        round_pcts: &[100, 25, 10],
        round_min: &[0, 30, 15],
        round_max: &[0, 150, 50],
    },
];

pub fn funnel_preset(key: &str) -> &'static FunnelPreset {
    FUNNEL_PRESETS
        .iter()
        .find(|p| p.key == key)
        .unwrap_or(&FUNNEL_PRESETS[1])
}

// Pipeline stage tunables.
pub const MAX_STAGE2_IPS: usize = 10;
pub const STAGE2_CONCURRENCY: usize = 10;
pub const STAGE3_CONCURRENCY: usize = 20;
pub const STAGE3_WAVE: usize = 60;
pub const FALLBACK_EXPANSION_IPS: usize = 20;
pub const DEFAULT_MAX_VARIATIONS: usize = 1_500;
pub const DEFAULT_MAX_SNIS_PER_IP: usize = 6;
/// First local SOCKS5 port handed to spawned proxy subprocesses.
pub const BASE_LOCAL_PORT: u16 = 20_808;

pub const XRAY_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
pub const XRAY_TERM_GRACE: Duration = Duration::from_secs(3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn funnel_preset_falls_back_to_normal() {
        assert_eq!(funnel_preset("nope").key, "normal");
        assert_eq!(funnel_preset("thorough").round_sizes.len(), 3);
    }

    #[test]
    fn clean_modes_cover_all_keys() {
        for key in ["quick", "normal", "full", "mega"] {
            assert!(clean_mode(key).is_some());
        }
        assert!(clean_mode("mega").unwrap().ports.len() == 2);
    }
}
