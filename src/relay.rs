//! Bidirectional relay: two independent copy loops between a client and an
//! upstream socket, each reporting the bytes it moves to the Connection
//! Registry as they're copied.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::registry::{ConnId, ConnectionRegistry, Direction};

const BUFFER_SIZE: usize = 32 * 1024;

/// Copy from `reader` to `writer` until EOF or an I/O error, accounting
/// every chunk against `id` in `direction` as it's moved. Shuts down the
/// write half of `writer` once the source is exhausted so a peer blocked on
/// read sees EOF promptly, rather than waiting on the other loop or kernel
/// teardown alone.
async fn copy_loop<R, W>(
    mut reader: R,
    mut writer: W,
    registry: &Arc<ConnectionRegistry>,
    id: ConnId,
    direction: Direction,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        registry.account(id, direction, n as u64).await;
        total += n as u64;
    }
    let _ = writer.shutdown().await;
    Ok(total)
}

/// Run both copy directions for one established connection concurrently,
/// returning once both have finished. Errors from either loop are logged by
/// the caller; `release` is the caller's responsibility and happens exactly
/// once regardless of how this returns.
pub async fn run<CR, CW, UR, UW>(
    client_reader: CR,
    client_writer: CW,
    upstream_reader: UR,
    upstream_writer: UW,
    registry: Arc<ConnectionRegistry>,
    id: ConnId,
) where
    CR: AsyncRead + Unpin + Send + 'static,
    CW: AsyncWrite + Unpin + Send + 'static,
    UR: AsyncRead + Unpin + Send + 'static,
    UW: AsyncWrite + Unpin + Send + 'static,
{
    let inbound_registry = Arc::clone(&registry);
    let outbound_registry = Arc::clone(&registry);

    let inbound = tokio::spawn(async move {
        copy_loop(client_reader, upstream_writer, &inbound_registry, id, Direction::Out).await
    });
    let outbound = tokio::spawn(async move {
        copy_loop(upstream_reader, client_writer, &outbound_registry, id, Direction::In).await
    });

    let (inbound_result, outbound_result) = tokio::join!(inbound, outbound);

    if let Ok(Err(e)) = inbound_result {
        tracing::debug!(%id, error = %e, direction = "client->upstream", "relay loop ended");
    }
    if let Ok(Err(e)) = outbound_result {
        tracing::debug!(%id, error = %e, direction = "upstream->client", "relay loop ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastFabric;
    use crate::registry::Protocol;

    #[tokio::test]
    async fn relays_both_directions_and_accounts_bytes() {
        let bf = BroadcastFabric::spawn();
        let registry = ConnectionRegistry::new(bf);
        let id = registry
            .admit("127.0.0.1:1".into(), Protocol::Http, "example.com:80".into())
            .await;

        let (client_a, client_b) = tokio::io::duplex(4096);
        let (upstream_a, upstream_b) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_a);
        let (upstream_read, upstream_write) = tokio::io::split(upstream_a);

        let (mut peer_read, mut peer_write) = tokio::io::split(client_b);
        let (mut server_read, mut server_write) = tokio::io::split(upstream_b);

        peer_write.write_all(b"client says hi").await.unwrap();
        drop(peer_write);
        server_write.write_all(b"server says hi").await.unwrap();
        drop(server_write);

        let relay_task = tokio::spawn(run(
            client_read,
            client_write,
            upstream_read,
            upstream_write,
            Arc::clone(&registry),
            id,
        ));

        let mut from_client = Vec::new();
        server_read.read_to_end(&mut from_client).await.unwrap();
        assert_eq!(from_client, b"client says hi");

        let mut from_server = Vec::new();
        peer_read.read_to_end(&mut from_server).await.unwrap();
        assert_eq!(from_server, b"server says hi");

        relay_task.await.unwrap();

        let snap = registry.snapshot().await;
        assert_eq!(snap.active[0].bytes_out, "client says hi".len() as u64);
        assert_eq!(snap.active[0].bytes_in, "server says hi".len() as u64);
    }
}
