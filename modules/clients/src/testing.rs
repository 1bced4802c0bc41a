//! Canned-response servers and a locator pinned to one local port.

use async_trait::async_trait;
use discovery_cache::DiscoveryCache;
use locator::{HealthProbe, Locator};
use signance_core::{CandidateConfig, LocatorConfig, NetworkConfig, PageContext, PortRange};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub struct AlwaysUp;

#[async_trait]
impl HealthProbe for AlwaysUp {
    async fn probe(&self, _host: &str, _port: u16) -> bool {
        true
    }
}

pub struct AlwaysDown;

#[async_trait]
impl HealthProbe for AlwaysDown {
    async fn probe(&self, _host: &str, _port: u16) -> bool {
        false
    }
}

fn pinned_config(port: u16) -> LocatorConfig {
    LocatorConfig {
        network: NetworkConfig {
            preferred_port: port,
            port_range: PortRange::new(port, port).unwrap(),
            ..NetworkConfig::default()
        },
        candidates: CandidateConfig::fixed(),
    }
}

/// Resolves to `http://127.0.0.1:{port}` on the first probe.
pub fn fixed_locator(port: u16) -> Locator {
    let ctx = PageContext::new("127.0.0.1");
    let cache = DiscoveryCache::in_memory(ctx.origin_key());
    Locator::new(ctx, pinned_config(port), Arc::new(AlwaysUp), cache).unwrap()
}

pub fn unreachable_locator() -> Locator {
    let ctx = PageContext::new("127.0.0.1");
    let cache = DiscoveryCache::in_memory(ctx.origin_key());
    Locator::new(ctx, pinned_config(9), Arc::new(AlwaysDown), cache).unwrap()
}

pub fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// Serve `response` to every connection and forward each full request text.
pub async fn serve_capture(response: String) -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { break };
            let response = response.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let req = read_request(&mut sock).await;
                let _ = tx.send(req);
                let _ = sock.write_all(response.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    (port, rx)
}

async fn read_request(sock: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let Ok(n) = sock.read(&mut chunk).await else { break };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let want = text[..head_end]
                .lines()
                .find_map(|l| {
                    let (k, v) = l.split_once(':')?;
                    k.trim().eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + want {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
