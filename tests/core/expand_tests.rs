//! Tests for CIDR and freeform address expansion.

use std::io::Write;

use rand::rngs::StdRng;
use rand::SeedableRng;

use cfscan::core::expand::{expand_cidrs, expand_freeform};

fn rng() -> StdRng {
    StdRng::seed_from_u64(42)
}

#[test]
fn slash_24_yields_hosts_only() {
    let ips = expand_cidrs(&["10.0.0.0/24"], 0, &mut rng());
    assert_eq!(ips.len(), 254);
    assert!(!ips.contains(&"10.0.0.0".parse().unwrap()));
    assert!(!ips.contains(&"10.0.0.255".parse().unwrap()));
}

#[test]
fn wide_blocks_split_into_24s_and_sample() {
    // /22 = 4 blocks of /24, 3 samples each.
    let ips = expand_cidrs(&["10.1.0.0/22"], 3, &mut rng());
    assert_eq!(ips.len(), 12);
    let unique: std::collections::HashSet<_> = ips.iter().collect();
    assert_eq!(unique.len(), 12);
}

#[test]
fn narrow_blocks_are_kept_whole() {
    let ips = expand_cidrs(&["192.168.1.0/30"], 0, &mut rng());
    assert_eq!(ips.len(), 2);
}

#[test]
fn overlapping_subnets_deduplicate() {
    let once = expand_cidrs(&["10.0.0.0/24"], 0, &mut rng());
    let twice = expand_cidrs(&["10.0.0.0/24", "10.0.0.0/24"], 0, &mut rng());
    assert_eq!(once.len(), twice.len());
}

#[test]
fn identical_seeds_expand_identically() {
    let mut a = StdRng::seed_from_u64(7);
    let mut b = StdRng::seed_from_u64(7);
    assert_eq!(
        expand_cidrs(&["172.64.0.0/20"], 2, &mut a),
        expand_cidrs(&["172.64.0.0/20"], 2, &mut b)
    );
}

#[test]
fn freeform_accepts_mixed_tokens() {
    let out = expand_freeform("1.1.1.1, 8.8.8.8:8443\n10.0.0.0/30 not-an-ip").unwrap();
    assert_eq!(out.len(), 4);
    assert_eq!(out[0], "1.1.1.1".parse::<std::net::Ipv4Addr>().unwrap());
    assert_eq!(out[1], "8.8.8.8".parse::<std::net::Ipv4Addr>().unwrap());
}

#[test]
fn freeform_preserves_first_seen_order_and_dedups() {
    let out = expand_freeform("2.2.2.2\n1.1.1.1\n2.2.2.2").unwrap();
    assert_eq!(
        out,
        vec![
            "2.2.2.2".parse::<std::net::Ipv4Addr>().unwrap(),
            "1.1.1.1".parse().unwrap()
        ]
    );
}

#[test]
fn freeform_caps_at_6666_addresses() {
    // /18 holds 16K hosts; the cap must bite first.
    let out = expand_freeform("10.0.0.0/18").unwrap();
    assert_eq!(out.len(), 6_666);
}

#[test]
fn freeform_reads_files_and_json_lists() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{}", r#"{"ips": ["3.3.3.3", "4.4.4.4"]}"#).unwrap();
    let out = expand_freeform(file.path().to_str().unwrap()).unwrap();
    assert_eq!(out.len(), 2);
}
