mod common;

use common::spawn_monitor;
use futures_util::StreamExt;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn websocket_is_seeded_immediately_and_stays_quiet_with_no_updates() {
    let monitor = spawn_monitor().await;
    let url = format!("ws://{}/ws", monitor.addr);

    let (mut ws, _response) = connect_async(url).await.expect("websocket handshake failed");

    let first = tokio::time::timeout(Duration::from_millis(500), ws.next())
        .await
        .expect("expected an immediate seed snapshot")
        .expect("stream ended before a message arrived")
        .expect("websocket error");

    let Message::Text(text) = first else {
        panic!("expected a text frame, got {first:?}");
    };
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["total_connections"], 0);
    assert!(parsed["active_connections"].as_object().unwrap().is_empty());

    // Nothing changed in the registry after the seed, so the coalescing
    // broadcaster should have nothing to push.
    let second = tokio::time::timeout(Duration::from_millis(1200), ws.next()).await;
    assert!(second.is_err(), "expected no further push with no registry activity");
}
