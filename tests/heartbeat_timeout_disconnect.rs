//! Scenario 5 (spec §8): an Exchange that stops answering `HEARTBEAT`
//! trips the timeout path, closing the transport with code 4000.

use std::time::Duration;

use exchange_client::testing::InMemoryExchange;
use exchange_client::{EngineOptions, RegisterOptions, SessionEngine};

#[tokio::test]
async fn heartbeat_timeout_disconnect() {
    let exchange = InMemoryExchange::new();
    exchange.set_drop_heartbeats(true);

    let options = EngineOptions {
        heartbeat_interval_ms: 5,
        heartbeat_timeout_ms: 10,
        auto_reconnect: false,
        ..EngineOptions::default()
    };
    let engine = SessionEngine::new(vec!["memory://exchange".into()], exchange.factory(), options);
    engine.register("silent@example.com", RegisterOptions::default()).await.unwrap();

    let (disc_tx, disc_rx) = tokio::sync::oneshot::channel();
    let disc_tx = std::sync::Mutex::new(Some(disc_tx));
    let _disposer = engine.on_disconnected(move |code, reason| {
        if let Some(tx) = disc_tx.lock().unwrap().take() {
            let _ = tx.send((code, reason.map(str::to_string)));
        }
    });

    let (code, reason) = tokio::time::timeout(Duration::from_millis(200), disc_rx)
        .await
        .expect("disconnected event within timeout")
        .unwrap();
    assert_eq!(code, Some(4000));
    assert_eq!(reason.as_deref(), Some("heartbeat_timeout"));
}
