//! Variation generator properties: budgets, uniqueness, preset laws.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use cfscan::core::pipeline::variation::{
    effective_sni_pool, fragments_pinned, FragPreset, GeneratorInput, XHTTP_MODES,
};
use cfscan::core::pipeline::{generate, ParsedConfig, Transport};

fn config(uri: &str) -> ParsedConfig {
    ParsedConfig::parse(uri).unwrap()
}

fn tls_ws_config() -> ParsedConfig {
    config("vless://6ba7b810-9dad-11d1-80b4-00c04fd430c8@example.com:443?type=ws&security=tls&sni=a.example.com&host=h.example.com&path=%2Fws")
}

fn input<'a>(
    parsed: &'a ParsedConfig,
    ips: &'a [Ipv4Addr],
    ip_ports: &'a HashMap<Ipv4Addr, Vec<u16>>,
    sni_pool: &'a [String],
    preset: FragPreset,
    transports: &'a [Transport],
    max_total: usize,
) -> GeneratorInput<'a> {
    GeneratorInput {
        parsed,
        working_ips: ips,
        ip_ports,
        sni_pool,
        frag_preset: preset,
        transport_variants: transports,
        max_total,
        max_snis_per_ip: 6,
        base_port: 20_808,
    }
}

#[test]
fn expansion_budget_scenario() {
    let cfg = tls_ws_config();
    let ips: Vec<Ipv4Addr> = (1..=5).map(|i| Ipv4Addr::new(104, 16, 0, i)).collect();
    let ip_ports = HashMap::new();
    let pool: Vec<String> = (0..20).map(|i| format!("s{}.example.com", i)).collect();
    let out = generate(&input(
        &cfg,
        &ips,
        &ip_ports,
        &pool,
        FragPreset::All,
        &[Transport::Ws, Transport::Xhttp],
        200,
    ));

    assert!(out.len() <= 200);
    let tags: HashSet<String> = out.iter().map(|v| v.tag()).collect();
    assert_eq!(tags.len(), out.len(), "duplicate variation tuples");
    for ip in &ips {
        let per_ip: Vec<_> = out.iter().filter(|v| v.source_ip == *ip).collect();
        assert!(!per_ip.is_empty(), "ip {} not covered", ip);
        assert!(per_ip.iter().any(|v| !v.sni.is_empty()));
    }
    assert!(out.iter().all(|v| v.local_port >= 20_808));
}

#[test]
fn all_preset_yields_at_least_as_many_fragment_rows() {
    let cfg = tls_ws_config();
    let ips = vec![Ipv4Addr::new(104, 16, 0, 1)];
    let ip_ports = HashMap::new();
    let pool = vec!["s.example.com".to_string()];

    let count_for = |preset: FragPreset| {
        generate(&input(&cfg, &ips, &ip_ports, &pool, preset, &[], 10_000)).len()
    };
    let all = count_for(FragPreset::All);
    for preset in [
        FragPreset::None,
        FragPreset::Light,
        FragPreset::Medium,
        FragPreset::Heavy,
    ] {
        assert!(all >= count_for(preset));
    }
}

#[test]
fn xhttp_modes_are_emitted_for_unfragmented_tuples() {
    let mut cfg = tls_ws_config();
    cfg.transport = Transport::Xhttp;
    cfg.path = "/xhttp".to_string();
    let ips = vec![Ipv4Addr::new(104, 16, 0, 1)];
    let ip_ports = HashMap::new();
    let pool = vec!["s.example.com".to_string()];
    let out = generate(&input(
        &cfg,
        &ips,
        &ip_ports,
        &pool,
        FragPreset::None,
        &[],
        10_000,
    ));

    let labels: HashSet<&str> = out.iter().map(|v| v.transport_label.as_str()).collect();
    for mode in XHTTP_MODES {
        assert!(
            labels.contains(format!("xhttp/{}", mode).as_str()),
            "missing mode {}",
            mode
        );
    }
    let modes: HashSet<&str> = out.iter().map(|v| v.config.mode.as_str()).collect();
    assert_eq!(modes.len(), XHTTP_MODES.len());
}

#[test]
fn working_ports_multiply_the_product() {
    let cfg = tls_ws_config();
    let ips = vec![Ipv4Addr::new(104, 16, 0, 1)];
    let mut ip_ports = HashMap::new();
    ip_ports.insert(ips[0], vec![443, 8443]);
    let pool = vec!["s.example.com".to_string()];
    let out = generate(&input(
        &cfg,
        &ips,
        &ip_ports,
        &pool,
        FragPreset::Light,
        &[],
        10_000,
    ));

    let ports: HashSet<u16> = out.iter().map(|v| v.source_port).collect();
    assert_eq!(ports, HashSet::from([443, 8443]));
}

#[test]
fn none_security_pins_sni_and_fragments() {
    let cfg = config(
        "vless://6ba7b810-9dad-11d1-80b4-00c04fd430c8@example.com:80?type=ws&security=none&host=h.example.com",
    );
    assert!(fragments_pinned(&cfg));
    let pool = effective_sni_pool(&cfg, &["x.example.com".to_string()]);
    assert_eq!(pool.len(), 1);

    let ips = vec![Ipv4Addr::new(104, 16, 0, 1)];
    let ip_ports = HashMap::new();
    let user_pool = vec!["x.example.com".to_string()];
    let out = generate(&input(
        &cfg,
        &ips,
        &ip_ports,
        &user_pool,
        FragPreset::All,
        &[],
        10_000,
    ));
    assert!(out.iter().all(|v| v.fragment.is_none()));
    assert!(out.iter().all(|v| v.sni == pool[0]));
}

#[test]
fn reality_never_rotates_the_sni() {
    let cfg = config(
        "vless://6ba7b810-9dad-11d1-80b4-00c04fd430c8@example.com:443?type=tcp&security=reality&sni=r.example.com&pbk=abc",
    );
    let ips = vec![Ipv4Addr::new(104, 16, 0, 1)];
    let ip_ports = HashMap::new();
    let user_pool = vec!["other.example.com".to_string()];
    let out = generate(&input(
        &cfg,
        &ips,
        &ip_ports,
        &user_pool,
        FragPreset::All,
        &[Transport::Ws],
        10_000,
    ));
    assert!(!out.is_empty());
    assert!(out.iter().all(|v| v.config.sni == "r.example.com"));
    // Switching back to tcp under REALITY forces the vision flow.
    assert!(out
        .iter()
        .filter(|v| v.transport_label == "tcp")
        .all(|v| v.config.flow == "xtls-rprx-vision"));
}
