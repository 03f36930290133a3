//! Dispatcher & Relay: accepts client connections on the dual-protocol
//! listening port, admits by source IP, peeks the first byte to pick a
//! protocol engine, dials the requested upstream, and relays.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::admission::AdmissionPolicy;
use crate::error::{DuoproxyError, Result};
use crate::protocol::http::{self, HttpRequestKind};
use crate::protocol::socks5;
use crate::registry::{ConnectionRegistry, Direction, Protocol};
use crate::relay;

/// First byte of a SOCKS5 method-negotiation message.
const SOCKS5_VERSION_BYTE: u8 = 0x05;

/// Accept connections on `listener` forever, spawning one task per
/// connection. Never returns under normal operation; a per-accept error is
/// logged and the loop continues.
pub async fn run(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    policy: Arc<AdmissionPolicy>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let registry = Arc::clone(&registry);
                let policy = Arc::clone(&policy);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, registry, policy).await {
                        tracing::debug!(%peer, error = %e, "connection ended with an error");
                    }
                });
            }
            Err(e) => {
                tracing::debug!(error = %e, "accept failed");
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    policy: Arc<AdmissionPolicy>,
) -> Result<()> {
    if !policy.allows(peer.ip()) {
        return Err(DuoproxyError::AdmissionDenied(peer.ip()));
    }

    let mut reader = BufReader::new(stream);
    // `fill_buf` pulls bytes into the reader's internal buffer without
    // consuming them, so the protocol engine below re-reads the same bytes
    // from the start.
    let first_byte = *reader
        .fill_buf()
        .await?
        .first()
        .ok_or_else(|| DuoproxyError::ProtocolFramingError("client closed before any byte was sent".to_owned()))?;

    let protocol = if first_byte == SOCKS5_VERSION_BYTE {
        Protocol::Socks5
    } else {
        Protocol::Http
    };

    match protocol {
        Protocol::Socks5 => handle_socks5(reader, peer, registry).await,
        Protocol::Http => handle_http(reader, peer, registry).await,
    }
}

async fn handle_socks5(
    mut client: BufReader<TcpStream>,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
) -> Result<()> {
    let request = socks5::negotiate(&mut client).await?;

    let id = registry
        .admit(peer.to_string(), Protocol::Socks5, request.destination.clone())
        .await;

    let dial = TcpStream::connect(&request.destination).await;
    match dial {
        Ok(upstream) => {
            socks5::write_reply(&mut client, true).await?;
            let (client_read, client_write) = tokio::io::split(client);
            let (upstream_read, upstream_write) = tokio::io::split(upstream);
            relay::run(
                client_read,
                client_write,
                upstream_read,
                upstream_write,
                Arc::clone(&registry),
                id,
            )
            .await;
            registry.release(id).await;
            Ok(())
        }
        Err(e) => {
            let _ = socks5::write_reply(&mut client, false).await;
            registry.release(id).await;
            Err(DuoproxyError::UpstreamDialFailure(request.destination, e))
        }
    }
}

async fn handle_http(
    mut client: BufReader<TcpStream>,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
) -> Result<()> {
    let request = http::parse_request(&mut client).await?;

    match request {
        HttpRequestKind::Connect { destination } => {
            let id = registry
                .admit(peer.to_string(), Protocol::Http, destination.clone())
                .await;
            match TcpStream::connect(&destination).await {
                Ok(upstream) => {
                    http::write_connect_established(&mut client).await?;
                    let (client_read, client_write) = tokio::io::split(client);
                    let (upstream_read, upstream_write) = tokio::io::split(upstream);
                    relay::run(
                        client_read,
                        client_write,
                        upstream_read,
                        upstream_write,
                        Arc::clone(&registry),
                        id,
                    )
                    .await;
                    registry.release(id).await;
                    Ok(())
                }
                Err(e) => {
                    let _ = http::write_bad_gateway(&mut client).await;
                    registry.release(id).await;
                    Err(DuoproxyError::UpstreamDialFailure(destination, e))
                }
            }
        }
        HttpRequestKind::Forward { destination, preamble } => {
            let id = registry
                .admit(peer.to_string(), Protocol::Http, destination.clone())
                .await;
            match TcpStream::connect(&destination).await {
                Ok(mut upstream) => {
                    upstream.write_all(&preamble).await?;
                    registry.account(id, Direction::Out, preamble.len() as u64).await;
                    let (client_read, client_write) = tokio::io::split(client);
                    let (upstream_read, upstream_write) = tokio::io::split(upstream);
                    relay::run(
                        client_read,
                        client_write,
                        upstream_read,
                        upstream_write,
                        Arc::clone(&registry),
                        id,
                    )
                    .await;
                    registry.release(id).await;
                    Ok(())
                }
                Err(e) => {
                    let _ = http::write_bad_gateway(&mut client).await;
                    registry.release(id).await;
                    Err(DuoproxyError::UpstreamDialFailure(destination, e))
                }
            }
        }
    }
}
