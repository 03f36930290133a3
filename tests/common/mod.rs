//! Shared end-to-end test harness: spins up a real dispatcher loop and
//! throwaway upstream servers on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;

use duoproxy::admission::AdmissionPolicy;
use duoproxy::broadcast::BroadcastFabric;
use duoproxy::dispatcher;
use duoproxy::monitor::{self, AppState};
use duoproxy::registry::ConnectionRegistry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub struct ProxyHandle {
    pub addr: SocketAddr,
    pub registry: Arc<ConnectionRegistry>,
}

/// Bind the dual-protocol listener on an ephemeral port and run the
/// dispatcher against it in the background for the life of the test.
pub async fn spawn_proxy(policy: AdmissionPolicy) -> ProxyHandle {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broadcast = BroadcastFabric::spawn();
    let registry = ConnectionRegistry::new(broadcast);
    let policy = Arc::new(policy);
    tokio::spawn(dispatcher::run(listener, Arc::clone(&registry), policy));
    ProxyHandle { addr, registry }
}

pub struct MonitorHandle {
    pub addr: SocketAddr,
}

/// Bind the monitoring HTTP/WS router on an ephemeral port backed by a fresh
/// registry/broadcast pair, and run it in the background for the test.
pub async fn spawn_monitor() -> MonitorHandle {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broadcast = BroadcastFabric::spawn();
    let registry = ConnectionRegistry::new(Arc::clone(&broadcast));
    let state = AppState { registry, broadcast };
    let router = monitor::build_router(state, None);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    MonitorHandle { addr }
}

/// A plain TCP echo server: whatever bytes arrive are written straight back.
pub async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// An HTTP/1.1 server that answers every request with a fixed 200 OK body,
/// regardless of what was sent.
pub async fn spawn_http_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let body = b"hello from upstream";
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.write_all(body).await;
            });
        }
    });
    addr
}

pub fn loopback_v4_policy() -> AdmissionPolicy {
    AdmissionPolicy::Cidr {
        ipv4: vec!["127.0.0.0/8".parse().unwrap()],
        ipv6: vec![],
    }
}
