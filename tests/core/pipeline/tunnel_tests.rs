//! Native tunnel prober tests against scripted local servers.
//!
//! The servers speak plain TCP (`security=none` path), which exercises the
//! whole WebSocket + VLESS framing stack without certificates.

use std::time::Duration;

use uuid::Uuid;

use cfscan::core::pipeline::parsed::Security;
use cfscan::core::pipeline::{probe_tunnel, TunnelProbe};
use cfscan::core::types::ErrorKind;

use crate::common::{spawn_ws_server, ws_binary_frame, ws_close_frame};

fn probe_for(addr: std::net::SocketAddr) -> TunnelProbe {
    TunnelProbe {
        ip: addr.ip().to_string(),
        port: addr.port(),
        sni: "edge.example.com".to_string(),
        host: "edge.example.com".to_string(),
        ws_path: "/ws".to_string(),
        uuid: Uuid::parse_str("6ba7b810-9dad-11d1-80b4-00c04fd430c8").unwrap(),
        timeout: Duration::from_secs(5),
        security: Security::None,
    }
}

#[tokio::test]
async fn happy_path_measures_the_tunnel() {
    // One binary frame: VLESS response header (00 00) + inner HTTP 200.
    let mut payload = vec![0x00, 0x00];
    payload.extend_from_slice(b"HTTP/1.1 200 OK\r\n\r\nabc");
    let addr = spawn_ws_server(101, ws_binary_frame(&payload)).await;

    let out = probe_tunnel(&probe_for(addr)).await;
    assert!(out.error.is_none(), "error: {:?}", out.error);
    assert!(out.connect_ms > 0.0);
    assert!(out.ttfb_ms > 0.0);
    assert!(out.mbps > 0.0);
}

#[tokio::test]
async fn server_close_frame_reports_the_code() {
    let addr = spawn_ws_server(101, ws_close_frame(1002)).await;

    let out = probe_tunnel(&probe_for(addr)).await;
    assert_eq!(out.error, Some(ErrorKind::WsClose(1002)));
    assert_eq!(out.mbps, 0.0);
}

#[tokio::test]
async fn non_101_upgrade_fails_with_ws_status() {
    let addr = spawn_ws_server(403, Vec::new()).await;

    let out = probe_tunnel(&probe_for(addr)).await;
    assert_eq!(out.error, Some(ErrorKind::WsStatus(403)));
}

#[tokio::test]
async fn bad_vless_version_is_rejected() {
    let mut payload = vec![0x05, 0x00];
    payload.extend_from_slice(b"HTTP/1.1 200 OK\r\n\r\n");
    let addr = spawn_ws_server(101, ws_binary_frame(&payload)).await;

    let out = probe_tunnel(&probe_for(addr)).await;
    assert_eq!(out.error, Some(ErrorKind::VlessBad));
}

#[tokio::test]
async fn origin_error_status_is_surfaced() {
    let mut payload = vec![0x00, 0x00];
    payload.extend_from_slice(b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
    let addr = spawn_ws_server(101, ws_binary_frame(&payload)).await;

    let out = probe_tunnel(&probe_for(addr)).await;
    assert_eq!(out.error, Some(ErrorKind::ProbeHttpStatus(502)));
}

#[tokio::test]
async fn response_split_across_frames_reassembles() {
    // VLESS header in one frame, HTTP response in a continuation frame.
    let mut bytes = ws_binary_frame(&[0x00, 0x00]);
    let mut second = ws_binary_frame(b"HTTP/1.1 204 No Content\r\n\r\n");
    second[0] = 0x80; // continuation opcode
    bytes.extend_from_slice(&second);
    let addr = spawn_ws_server(101, bytes).await;

    let out = probe_tunnel(&probe_for(addr)).await;
    assert!(out.error.is_none(), "error: {:?}", out.error);
    assert!(out.ttfb_ms > 0.0);
}
