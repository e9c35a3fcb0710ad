//! URI codec tests beyond the unit coverage in `parsed.rs`.

use base64::Engine;

use cfscan::core::pipeline::{ParsedConfig, Protocol, Security, Transport};
use cfscan::core::types::ErrorKind;

#[test]
fn reality_fields_survive_a_round_trip() {
    let uri = "vless://6ba7b810-9dad-11d1-80b4-00c04fd430c8@example.com:443?type=tcp&security=reality&sni=r.example.com&pbk=abcdef0123&sid=42ab&spx=%2F&flow=xtls-rprx-vision&fp=chrome#r";
    let cfg = ParsedConfig::parse(uri).unwrap();
    assert_eq!(cfg.security, Security::Reality);
    assert_eq!(cfg.public_key, "abcdef0123");
    assert_eq!(cfg.short_id, "42ab");
    assert_eq!(cfg.flow, "xtls-rprx-vision");

    let round = ParsedConfig::parse(&cfg.to_uri()).unwrap();
    assert_eq!(round.security, Security::Reality);
    assert_eq!(round.public_key, cfg.public_key);
    assert_eq!(round.sni, cfg.sni);
    assert_eq!(round.flow, cfg.flow);
}

#[test]
fn reality_without_sni_is_a_parse_error() {
    let uri = "vless://6ba7b810-9dad-11d1-80b4-00c04fd430c8@example.com:443?type=tcp&security=reality&pbk=abc";
    assert!(matches!(
        ParsedConfig::parse(uri),
        Err(ErrorKind::ConfigParse(_))
    ));
}

#[test]
fn sni_inference_prefers_sni_then_host_then_address() {
    let base = "vless://6ba7b810-9dad-11d1-80b4-00c04fd430c8@addr.example.com:443?type=ws&security=tls";
    let with_both = format!("{}&sni=s.example.com&host=h.example.com", base);
    assert_eq!(
        ParsedConfig::parse(&with_both).unwrap().infer_sni(),
        "s.example.com"
    );
    let with_host = format!("{}&host=h.example.com", base);
    assert_eq!(
        ParsedConfig::parse(&with_host).unwrap().infer_sni(),
        "h.example.com"
    );
    assert_eq!(
        ParsedConfig::parse(base).unwrap().infer_sni(),
        "addr.example.com"
    );
}

#[test]
fn transport_aliases_normalize() {
    for (alias, expected) in [
        ("ws", Transport::Ws),
        ("websocket", Transport::Ws),
        ("grpc", Transport::Grpc),
        ("gun", Transport::Grpc),
        ("h2", Transport::H2),
        ("http", Transport::H2),
        ("xhttp", Transport::Xhttp),
        ("splithttp", Transport::Xhttp),
        ("tcp", Transport::Tcp),
        ("", Transport::Tcp),
    ] {
        assert_eq!(Transport::parse(alias), expected, "alias {}", alias);
    }
}

#[test]
fn vmess_round_trip_preserves_identity() {
    let obj = serde_json::json!({
        "v": "2", "ps": "edge", "add": "104.16.1.1", "port": 2053,
        "id": "6ba7b810-9dad-11d1-80b4-00c04fd430c8", "aid": 0,
        "scy": "auto", "net": "ws", "host": "h.example.com",
        "path": "/dl", "tls": "tls", "sni": "s.example.com",
    });
    let uri = format!(
        "vmess://{}",
        base64::engine::general_purpose::STANDARD.encode(obj.to_string())
    );
    let cfg = ParsedConfig::parse(&uri).unwrap();
    assert_eq!(cfg.protocol, Protocol::Vmess);
    assert_eq!(cfg.port, 2053);

    let round = ParsedConfig::parse(&cfg.to_uri()).unwrap();
    assert_eq!(round.address, cfg.address);
    assert_eq!(round.port, cfg.port);
    assert_eq!(round.uuid, cfg.uuid);
    assert_eq!(round.sni, cfg.sni);
    assert_eq!(round.transport, Transport::Ws);
}

#[test]
fn garbage_uris_fail_without_panicking() {
    for uri in [
        "",
        "http://example.com",
        "vless://not-a-uuid@example.com:443",
        "vmess://%%%%",
        "vmess://aGVsbG8=", // valid base64, not json
    ] {
        assert!(ParsedConfig::parse(uri).is_err(), "accepted: {}", uri);
    }
}
