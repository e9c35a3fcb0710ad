//! Native VLESS-over-WebSocket tunnel prober.
//!
//! Measures a proxy's effective connectivity without an external process:
//! outer TCP/TLS connect, WebSocket upgrade, one masked binary frame
//! carrying the VLESS v0 request plus a small inner HTTP request, then an
//! incremental frame parse of the response. The probe is a reachability
//! proof, not a throughput test; any successful tunnel reports a non-zero
//! rate.

use std::time::Duration;

use base64::Engine;
use bytes::{Buf, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use crate::config::{TRACE_HOST, TRACE_PATH, TRACE_PORT};
use crate::core::debug_log::dbg_line;
use crate::core::pipeline::parsed::Security;
use crate::core::tls::{insecure_connector, server_name};
use crate::core::types::{ErrorKind, IoPhase};

const VLESS_VERSION: u8 = 0x00;
const CMD_TCP: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x02;

const OP_CONTINUATION: u8 = 0x00;
const OP_BINARY: u8 = 0x02;
const OP_CLOSE: u8 = 0x08;

/// Body bytes that prove the tunnel carries origin traffic.
const PROOF_BYTES: u64 = 50;

#[derive(Debug, Clone)]
pub struct TunnelProbe {
    /// Dial target; a literal IP in the pipeline path.
    pub ip: String,
    pub port: u16,
    /// Outer TLS SNI (unused when `security` is none).
    pub sni: String,
    /// WebSocket Host header.
    pub host: String,
    pub ws_path: String,
    pub uuid: Uuid,
    pub timeout: Duration,
    pub security: Security,
}

#[derive(Debug, Clone, Default)]
pub struct TunnelOutcome {
    pub connect_ms: f64,
    pub ttfb_ms: f64,
    pub mbps: f64,
    pub error: Option<ErrorKind>,
}

impl TunnelOutcome {
    fn failed(connect_ms: f64, error: ErrorKind) -> Self {
        Self {
            connect_ms,
            ttfb_ms: -1.0,
            mbps: 0.0,
            error: Some(error),
        }
    }
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Open the tunnel and push one inner HTTP request through it.
pub async fn probe_tunnel(probe: &TunnelProbe) -> TunnelOutcome {
    let t0 = Instant::now();
    let deadline = t0 + probe.timeout;

    // Outer connect: TCP, plus TLS when the config secures the outer hop.
    let tcp = match timeout(probe.timeout, TcpStream::connect((probe.ip.as_str(), probe.port)))
        .await
    {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return TunnelOutcome::failed(-1.0, ErrorKind::from_io(&e, IoPhase::Tcp))
        }
        Err(_) => return TunnelOutcome::failed(-1.0, ErrorKind::TcpTimeout),
    };
    let mut stream: Box<dyn Io> = match probe.security {
        Security::Tls | Security::Reality => {
            let name = match server_name(&probe.sni) {
                Ok(n) => n,
                Err(e) => return TunnelOutcome::failed(-1.0, e),
            };
            match timeout(probe.timeout, insecure_connector().connect(name, tcp)).await {
                Ok(Ok(s)) => Box::new(s),
                Ok(Err(e)) => {
                    return TunnelOutcome::failed(-1.0, ErrorKind::from_io(&e, IoPhase::Tls))
                }
                Err(_) => return TunnelOutcome::failed(-1.0, ErrorKind::TlsTimeout),
            }
        }
        Security::None => Box::new(tcp),
    };
    let connect_ms = t0.elapsed().as_secs_f64() * 1000.0;

    // WebSocket upgrade.
    let mut key_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    let ws_key = base64::engine::general_purpose::STANDARD.encode(key_bytes);
    let ws_path = if probe.ws_path.is_empty() {
        "/"
    } else {
        probe.ws_path.as_str()
    };
    let upgrade = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        ws_path, probe.host, ws_key
    );
    if let Err(e) = stream.write_all(upgrade.as_bytes()).await {
        return TunnelOutcome::failed(connect_ms, ErrorKind::from_io(&e, IoPhase::Http));
    }

    let (status, leftover) = match read_upgrade_response(&mut stream, deadline).await {
        Ok(parts) => parts,
        Err(e) => return TunnelOutcome::failed(connect_ms, e),
    };
    if status != 101 {
        return TunnelOutcome::failed(connect_ms, ErrorKind::WsStatus(status));
    }

    // VLESS v0 request wrapping the inner trace request, one masked frame.
    let inner = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: cfscan/1.0\r\nConnection: close\r\n\r\n",
        TRACE_PATH, TRACE_HOST
    );
    let payload = vless_request(&probe.uuid, TRACE_HOST, TRACE_PORT, inner.as_bytes());
    let mut mask = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut mask);
    let frame = masked_binary_frame(&payload, mask);
    if let Err(e) = stream.write_all(&frame).await {
        return TunnelOutcome::failed(connect_ms, ErrorKind::from_io(&e, IoPhase::Http));
    }

    // Read loop: frames -> tunnel bytes -> VLESS strip -> inner HTTP.
    let mut parser = WsFrameParser::new();
    parser.feed(&leftover);
    let mut tunnel = BytesMut::new();
    let mut phase = TunnelPhase::VlessHeader;
    let mut ttfb_ms = -1.0_f64;
    let mut body_bytes: u64 = 0;
    let mut read_buf = [0u8; 16 * 1024];

    'read: loop {
        // Drain everything parseable before touching the socket again.
        loop {
            match parser.next_frame() {
                Some(WsFrame::Data(data)) => {
                    if !data.is_empty() {
                        tunnel.extend_from_slice(&data);
                    }
                }
                Some(WsFrame::Close(code)) => {
                    // A close after the inner response is a normal end of
                    // stream; before it, the tunnel failed.
                    if phase == TunnelPhase::Body {
                        break 'read;
                    }
                    return TunnelOutcome::failed(connect_ms, ErrorKind::WsClose(code));
                }
                Some(WsFrame::Other(_)) => {}
                None => break,
            }

            match advance_tunnel(&mut tunnel, &mut phase) {
                Ok(Some(status)) => {
                    if status != 200 && status != 204 {
                        return TunnelOutcome::failed(
                            connect_ms,
                            ErrorKind::ProbeHttpStatus(status),
                        );
                    }
                    ttfb_ms = t0.elapsed().as_secs_f64() * 1000.0 - connect_ms;
                }
                Ok(None) => {}
                Err(e) => return TunnelOutcome::failed(connect_ms, e),
            }
            if phase == TunnelPhase::Body {
                body_bytes += tunnel.len() as u64;
                tunnel.clear();
                if body_bytes > PROOF_BYTES {
                    break 'read;
                }
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return TunnelOutcome::failed(connect_ms, ErrorKind::TunnelTimeout);
        }
        let n = match timeout(deadline - now, stream.read(&mut read_buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                return TunnelOutcome::failed(connect_ms, ErrorKind::from_io(&e, IoPhase::Http))
            }
            Err(_) => return TunnelOutcome::failed(connect_ms, ErrorKind::TunnelTimeout),
        };
        if n == 0 {
            if phase == TunnelPhase::Body {
                break;
            }
            return TunnelOutcome::failed(connect_ms, ErrorKind::TunnelEof);
        }
        parser.feed(&read_buf[..n]);
    }

    let elapsed_s = (t0.elapsed().as_secs_f64() - connect_ms / 1000.0).max(1e-6);
    let mbps = ((body_bytes as f64 / 1_000_000.0) / elapsed_s).max(0.001);
    dbg_line(
        "Tunnel",
        &format!(
            "{}:{} OK connect={:.0}ms ttfb={:.0}ms bytes={}",
            probe.ip, probe.port, connect_ms, ttfb_ms, body_bytes
        ),
    );
    TunnelOutcome {
        connect_ms,
        ttfb_ms,
        mbps,
        error: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelPhase {
    VlessHeader,
    HttpHeaders,
    Body,
}

/// Advance the tunnel byte stream through its framing layers. Returns the
/// inner HTTP status once the header phase completes.
fn advance_tunnel(
    tunnel: &mut BytesMut,
    phase: &mut TunnelPhase,
) -> Result<Option<u16>, ErrorKind> {
    if *phase == TunnelPhase::VlessHeader {
        if tunnel.len() < 2 {
            return Ok(None);
        }
        if tunnel[0] != VLESS_VERSION {
            return Err(ErrorKind::VlessBad);
        }
        let addon_len = tunnel[1] as usize;
        if tunnel.len() < 2 + addon_len {
            return Ok(None);
        }
        tunnel.advance(2 + addon_len);
        *phase = TunnelPhase::HttpHeaders;
    }
    if *phase == TunnelPhase::HttpHeaders {
        let end = match tunnel.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => pos + 4,
            None => return Ok(None),
        };
        let headers = tunnel.split_to(end);
        let status =
            crate::core::probe::parse_status_code(&headers).ok_or(ErrorKind::VlessBad)?;
        *phase = TunnelPhase::Body;
        return Ok(Some(status));
    }
    Ok(None)
}

async fn read_upgrade_response(
    stream: &mut Box<dyn Io>,
    deadline: Instant,
) -> Result<(u16, Vec<u8>), ErrorKind> {
    let mut buf = BytesMut::with_capacity(2048);
    let mut chunk = [0u8; 2048];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let end = pos + 4;
            let headers = &buf[..end];
            let status = crate::core::probe::parse_status_code(headers)
                .ok_or(ErrorKind::WsStatus(0))?;
            let leftover = buf[end..].to_vec();
            return Ok((status, leftover));
        }
        if buf.len() > 16 * 1024 {
            return Err(ErrorKind::HeaderTooBig);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ErrorKind::WsHdrTimeout);
        }
        let n = match timeout(deadline - now, stream.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ErrorKind::from_io(&e, IoPhase::Http)),
            Err(_) => return Err(ErrorKind::WsHdrTimeout),
        };
        if n == 0 {
            return Err(ErrorKind::TunnelEof);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// VLESS v0 request header followed by the first payload bytes:
/// `0x00 | uuid(16) | addon_len=0 | cmd | port(2 BE) | atyp | addr | inner`.
pub(crate) fn vless_request(uuid: &Uuid, host: &str, port: u16, inner: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(24 + host.len() + inner.len());
    request.push(VLESS_VERSION);
    request.extend_from_slice(uuid.as_bytes());
    request.push(0); // addons length
    request.push(CMD_TCP);
    request.extend_from_slice(&port.to_be_bytes());
    request.push(ATYP_DOMAIN);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(inner);
    request
}

/// One FIN binary frame, client-masked as the protocol mandates.
pub(crate) fn masked_binary_frame(payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(0x80 | OP_BINARY);
    let len = payload.len();
    if len < 126 {
        frame.push(0x80 | len as u8);
    } else if len <= u16::MAX as usize {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    frame
}

#[derive(Debug)]
pub(crate) enum WsFrame {
    /// Continuation or binary payload, unmasked.
    Data(Vec<u8>),
    /// Close with the status code from the first two payload bytes.
    Close(u16),
    /// Any other opcode (ping, pong, text); ignored by the probe.
    Other(u8),
}

/// Incremental server-to-client frame parser.
#[derive(Debug, Default)]
pub(crate) struct WsFrameParser {
    buf: BytesMut,
}

impl WsFrameParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, or None if more bytes are needed.
    pub(crate) fn next_frame(&mut self) -> Option<WsFrame> {
        if self.buf.len() < 2 {
            return None;
        }
        let opcode = self.buf[0] & 0x0f;
        let masked = self.buf[1] & 0x80 != 0;
        let len7 = (self.buf[1] & 0x7f) as usize;

        let mut offset = 2;
        let payload_len = match len7 {
            126 => {
                if self.buf.len() < offset + 2 {
                    return None;
                }
                let len = u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]]) as usize;
                offset += 2;
                len
            }
            127 => {
                if self.buf.len() < offset + 8 {
                    return None;
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.buf[offset..offset + 8]);
                offset += 8;
                u64::from_be_bytes(bytes) as usize
            }
            n => n,
        };
        let mask_len = if masked { 4 } else { 0 };
        if self.buf.len() < offset + mask_len + payload_len {
            return None;
        }

        let mask: Option<[u8; 4]> = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&self.buf[offset..offset + 4]);
            Some(key)
        } else {
            None
        };
        offset += mask_len;

        let mut payload = self.buf[offset..offset + payload_len].to_vec();
        if let Some(key) = mask {
            for (i, b) in payload.iter_mut().enumerate() {
                *b ^= key[i % 4];
            }
        }
        self.buf.advance(offset + payload_len);

        match opcode {
            OP_CONTINUATION | OP_BINARY => Some(WsFrame::Data(payload)),
            OP_CLOSE => {
                let code = if payload.len() >= 2 {
                    u16::from_be_bytes([payload[0], payload[1]])
                } else {
                    1005
                };
                Some(WsFrame::Close(code))
            }
            other => Some(WsFrame::Other(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vless_request_layout() {
        let uuid = Uuid::parse_str("6ba7b810-9dad-11d1-80b4-00c04fd430c8").unwrap();
        let req = vless_request(&uuid, "cp.cloudflare.com", 80, b"GET /");
        assert_eq!(req[0], 0x00);
        assert_eq!(&req[1..17], uuid.as_bytes());
        assert_eq!(req[17], 0x00); // addons
        assert_eq!(req[18], 0x01); // tcp
        assert_eq!(&req[19..21], &80u16.to_be_bytes());
        assert_eq!(req[21], 0x02); // domain atyp
        assert_eq!(req[22] as usize, "cp.cloudflare.com".len());
    }

    #[test]
    fn masked_frame_round_trips_through_parser() {
        let payload = b"hello tunnel".to_vec();
        let frame = masked_binary_frame(&payload, [1, 2, 3, 4]);
        let mut parser = WsFrameParser::new();
        parser.feed(&frame);
        match parser.next_frame() {
            Some(WsFrame::Data(data)) => assert_eq!(data, payload),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn parser_handles_split_and_extended_frames() {
        let payload = vec![0xAA; 300];
        let mut frame = Vec::new();
        frame.push(0x82);
        frame.push(126);
        frame.extend_from_slice(&300u16.to_be_bytes());
        frame.extend_from_slice(&payload);

        let mut parser = WsFrameParser::new();
        parser.feed(&frame[..5]);
        assert!(parser.next_frame().is_none());
        parser.feed(&frame[5..]);
        match parser.next_frame() {
            Some(WsFrame::Data(data)) => assert_eq!(data.len(), 300),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn close_frame_carries_status_code() {
        let mut parser = WsFrameParser::new();
        parser.feed(&[0x88, 0x02, 0x03, 0xEA]); // close, code 1002
        match parser.next_frame() {
            Some(WsFrame::Close(code)) => assert_eq!(code, 1002),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn vless_header_strip_rejects_bad_version() {
        let mut tunnel = BytesMut::from(&[0x05, 0x00][..]);
        let mut phase = TunnelPhase::VlessHeader;
        assert_eq!(
            advance_tunnel(&mut tunnel, &mut phase),
            Err(ErrorKind::VlessBad)
        );
    }

    #[test]
    fn vless_header_strip_skips_addons() {
        let mut data = vec![0x00, 0x02, 0xFF, 0xFF];
        data.extend_from_slice(b"HTTP/1.1 200 OK\r\n\r\nabc");
        let mut tunnel = BytesMut::from(&data[..]);
        let mut phase = TunnelPhase::VlessHeader;
        let status = advance_tunnel(&mut tunnel, &mut phase).unwrap();
        assert_eq!(status, Some(200));
        assert_eq!(phase, TunnelPhase::Body);
        assert_eq!(&tunnel[..], b"abc");
    }
}
