//! Address expansion: CIDR ranges and freeform IP lists into deduplicated
//! IPv4 sequences.
//!
//! Large ranges are split into /24 blocks first so sampling and shuffling
//! spread probes across the whole range instead of walking it linearly.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::FREEFORM_MAX_IPS;

/// Split CIDR subnets into /24 blocks, deduplicated by network address.
/// Blocks smaller than /24 are kept as-is.
fn split_to_24s(subnets: &[&str]) -> Vec<Ipv4Net> {
    let mut seen: HashSet<u32> = HashSet::new();
    let mut blocks = Vec::new();
    for sub in subnets {
        let net: Ipv4Net = match sub.trim().parse() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let net = net.trunc();
        if net.prefix_len() <= 24 {
            if let Ok(subs) = net.subnets(24) {
                for block in subs {
                    if seen.insert(u32::from(block.network())) {
                        blocks.push(block);
                    }
                }
            }
        } else if seen.insert(u32::from(net.network())) {
            blocks.push(net);
        }
    }
    blocks
}

/// Expand CIDR subnets into host addresses.
///
/// The /24 blocks are shuffled uniformly, then either every host is emitted
/// (`sample_per_24 = 0`) or exactly `min(sample, hosts)` hosts are drawn
/// uniformly without replacement from each block. Deterministic for a seeded
/// RNG; never touches the network.
pub fn expand_cidrs<R: Rng>(
    subnets: &[&str],
    sample_per_24: usize,
    rng: &mut R,
) -> Vec<Ipv4Addr> {
    let mut blocks = split_to_24s(subnets);
    blocks.shuffle(rng);

    let mut ips = Vec::new();
    for net in blocks {
        let hosts: Vec<Ipv4Addr> = net.hosts().collect();
        if sample_per_24 > 0 && sample_per_24 < hosts.len() {
            ips.extend(hosts.choose_multiple(rng, sample_per_24).copied());
        } else {
            ips.extend(hosts);
        }
    }
    ips
}

/// Expand freeform input: single IPs, CIDRs, `ip:port` tokens, comma- or
/// newline-separated mixes, or a path to a file containing the same.
///
/// JSON inputs are accepted too: a plain array of strings or an object with
/// an `addresses` / `domains` / `ips` / `data` list. Output is deduplicated
/// in first-seen order and capped at 6,666 addresses.
pub fn expand_freeform(input: &str) -> std::io::Result<Vec<Ipv4Addr>> {
    let text = if Path::new(input).is_file() {
        std::fs::read_to_string(input)?
    } else {
        input.to_string()
    };

    let tokens = tokenize(&text);

    let mut seen: HashSet<Ipv4Addr> = HashSet::new();
    let mut out = Vec::new();
    'outer: for token in tokens {
        for ip in token_ips(&token) {
            if seen.insert(ip) {
                out.push(ip);
                if out.len() >= FREEFORM_MAX_IPS {
                    break 'outer;
                }
            }
        }
    }
    Ok(out)
}

fn tokenize(text: &str) -> Vec<String> {
    // JSON array / object shapes first, then plain token splitting.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        if let Some(list) = json_string_list(&value) {
            return list;
        }
    }
    text.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn json_string_list(value: &serde_json::Value) -> Option<Vec<String>> {
    let arr = match value {
        serde_json::Value::Array(a) => a,
        serde_json::Value::Object(map) => ["addresses", "domains", "ips", "data"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_array()))?,
        _ => return None,
    };
    Some(
        arr.iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
    )
}

/// Addresses named by one token: a bare IP, `ip:port`, or a CIDR block.
fn token_ips(token: &str) -> Vec<Ipv4Addr> {
    if let Ok(ip) = token.parse::<Ipv4Addr>() {
        return vec![ip];
    }
    if let Some((ip_part, port_part)) = token.rsplit_once(':') {
        if port_part.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(ip) = ip_part.parse::<Ipv4Addr>() {
                return vec![ip];
            }
        }
    }
    if let Ok(net) = token.parse::<Ipv4Net>() {
        return net.trunc().hosts().collect();
    }
    Vec::new()
}
