//! Config intake: URI line streams, subscription fetches, and template
//! generation over scanned addresses.
//!
//! Malformed URIs are logged and skipped; intake never fails a whole batch
//! because one line is broken.

use std::sync::OnceLock;

use base64::Engine;
use regex::Regex;

use crate::core::debug_log::dbg_line;
use crate::core::pipeline::parsed::ParsedConfig;
use crate::core::types::ErrorKind;

/// Parse every config URI in a line-oriented blob.
pub fn parse_lines(raw: &str) -> Vec<ParsedConfig> {
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match ParsedConfig::parse(line) {
            Ok(cfg) => out.push(cfg),
            Err(e) => {
                if line.starts_with("vless://") || line.starts_with("vmess://") {
                    dbg_line("Intake", &format!("skipping config: {}", e.short()));
                }
            }
        }
    }
    out
}

/// Load configs from a file of URI lines.
pub fn load_configs_from_file(path: &str) -> std::io::Result<Vec<ParsedConfig>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(parse_lines(&raw))
}

/// Fetch configs from a subscription URL. The body may be plain URI lines
/// or the whole blob base64-encoded; both are accepted.
pub fn fetch_subscription(url: &str) -> Result<Vec<ParsedConfig>, ErrorKind> {
    if !url.to_lowercase().starts_with("http://") && !url.to_lowercase().starts_with("https://") {
        return Err(ErrorKind::ConfigParse(
            "subscription must be http(s)".to_string(),
        ));
    }
    dbg_line("Intake", &format!("fetching subscription: {}", url));
    let mut response = ureq::get(url)
        .header("User-Agent", "Mozilla/5.0")
        .call()
        .map_err(|e| ErrorKind::Http(crate::core::types::clip(&e.to_string(), 40)))?;
    let mut raw = response
        .body_mut()
        .read_to_string()
        .map_err(|e| ErrorKind::Http(e.to_string()))?;

    // Subscription bodies are frequently base64(uri-lines).
    if let Some(decoded) = decode_if_base64(raw.trim()) {
        if decoded.contains("://") {
            raw = decoded;
        }
    }
    let configs = parse_lines(&raw);
    dbg_line(
        "Intake",
        &format!("subscription loaded: {} configs", configs.len()),
    );
    Ok(configs)
}

fn decode_if_base64(raw: &str) -> Option<String> {
    let padded = format!("{}{}", raw, "=".repeat((4 - raw.len() % 4) % 4));
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&padded)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(&padded))
        .ok()?;
    String::from_utf8(bytes).ok()
}

fn host_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(@)(\[[^\]]+\]|[^:/?#]+)").expect("host regex"))
}

fn port_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(@[^:/?#]+:)\d+").expect("port regex"))
}

fn port_insert_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(@[^/?#]+)([?/#])").expect("port insert regex"))
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#.*$").expect("name regex"))
}

/// Generate configs by substituting scanned addresses into a template URI.
///
/// The substitution is textual so query parameters the engine does not
/// model survive untouched. Addresses may carry a port (`ip:port` from a
/// multi-port clean scan), which then overrides the template's port.
pub fn generate_from_template(template: &str, addresses: &[String]) -> Vec<ParsedConfig> {
    if ParsedConfig::parse(template).is_err() {
        return Vec::new();
    }
    let mut out = Vec::new();
    for (i, addr) in addresses.iter().enumerate() {
        let addr = addr.trim();
        if addr.is_empty() {
            continue;
        }
        let (addr_ip, addr_port) = match addr.rsplit_once(':') {
            Some((ip, port))
                if !addr.starts_with('[') && port.chars().all(|c| c.is_ascii_digit()) =>
            {
                (ip, Some(port))
            }
            _ => (addr, None),
        };

        let mut uri = host_re()
            .replace(template, |caps: &regex::Captures| {
                format!("{}{}", &caps[1], addr_ip)
            })
            .into_owned();
        if let Some(port) = addr_port {
            if port_re().is_match(&uri) {
                uri = port_re()
                    .replace(&uri, |caps: &regex::Captures| {
                        format!("{}{}", &caps[1], port)
                    })
                    .into_owned();
            } else {
                uri = port_insert_re()
                    .replace(&uri, |caps: &regex::Captures| {
                        format!("{}:{}{}", &caps[1], port, &caps[2])
                    })
                    .into_owned();
            }
        }
        let ip_tag: String = addr_ip.chars().take(20).collect();
        uri = name_re()
            .replace(&uri, format!("#cfg-{}-{}", i + 1, ip_tag).as_str())
            .into_owned();
        if !uri.contains('#') {
            uri.push_str(&format!("#cfg-{}-{}", i + 1, ip_tag));
        }

        if let Ok(cfg) = ParsedConfig::parse(&uri) {
            out.push(cfg);
        }
    }
    out
}

/// Load an address list from a JSON array, a JSON object with a known list
/// key, or plain text (one address per line).
pub fn load_addresses(path: &str) -> std::io::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)?;
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) {
        let arr = match &value {
            serde_json::Value::Array(a) => Some(a),
            serde_json::Value::Object(map) => ["addresses", "domains", "ips", "data"]
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_array())),
            _ => None,
        };
        if let Some(arr) = arr {
            return Ok(arr
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect());
        }
    }
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
