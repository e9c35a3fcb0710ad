//! Common test utilities: scripted TCP servers standing in for edges and
//! proxy endpoints, plus WebSocket frame builders for the tunnel tests.

#![allow(dead_code)]

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// An unmasked server-to-client binary WebSocket frame.
pub fn ws_binary_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(0x82);
    let len = payload.len();
    if len < 126 {
        frame.push(len as u8);
    } else {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    }
    frame.extend_from_slice(payload);
    frame
}

/// A close frame carrying a status code.
pub fn ws_close_frame(code: u16) -> Vec<u8> {
    let mut frame = vec![0x88, 0x02];
    frame.extend_from_slice(&code.to_be_bytes());
    frame
}

/// Spawn a one-shot server that answers a WebSocket upgrade with
/// `upgrade_status`, reads the client's first frame, and replies with
/// `post_upgrade` raw bytes before closing.
pub async fn spawn_ws_server(upgrade_status: u16, post_upgrade: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let (mut stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        // Consume the upgrade request headers.
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let reason = match upgrade_status {
            101 => "Switching Protocols",
            403 => "Forbidden",
            _ => "OK",
        };
        let response = format!(
            "HTTP/1.1 {} {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            upgrade_status, reason
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
        if upgrade_status != 101 {
            return;
        }
        // Read the client's masked frame (best effort), then reply.
        let _ = stream.read(&mut chunk).await;
        let _ = stream.write_all(&post_upgrade).await;
        let _ = stream.shutdown().await;
    });
    addr
}
