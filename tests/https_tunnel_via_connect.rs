mod common;

use common::{loopback_v4_policy, spawn_echo_upstream, spawn_proxy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn http_connect_establishes_an_opaque_tunnel() {
    // A plain TCP echo server stands in for a TLS server here — the CONNECT
    // tunnel never looks at the bytes it relays once established.
    let upstream_addr = spawn_echo_upstream().await;
    let proxy = spawn_proxy(loopback_v4_policy()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let connect_req = format!("CONNECT {upstream_addr} HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n");
    client.write_all(connect_req.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 256];
    let n = client.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]);
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");

    client.write_all(b"opaque-tls-bytes").await.unwrap();
    let mut echoed = [0u8; 16];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"opaque-tls-bytes");
}
