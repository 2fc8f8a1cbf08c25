//! Scenario 6 (spec §8): a dropped connection triggers the backoff
//! reconnect loop, which re-sends the pinned `REGISTER` and resolves
//! `registered` a second time.

use std::time::Duration;

use exchange_client::testing::InMemoryExchange;
use exchange_client::{EngineOptions, RegisterOptions, SessionEngine};

#[tokio::test]
async fn auto_reconnect_with_reregister() {
    let exchange = InMemoryExchange::new();
    let options = EngineOptions {
        reconnect_backoff_ms: 10,
        max_reconnect_backoff_ms: 10,
        ..EngineOptions::default()
    };
    let engine = SessionEngine::new(vec!["memory://exchange".into()], exchange.factory(), options);
    engine.register("reconnect@example.com", RegisterOptions::default()).await.unwrap();

    let (registered_tx, mut registered_rx) = tokio::sync::mpsc::unbounded_channel();
    let _disposer = engine.on_registered(move |address| {
        let _ = registered_tx.send(address.to_string());
    });

    exchange.force_disconnect("reconnect@example.com", Some(1006), Some("network".to_string()));

    let second_registration = tokio::time::timeout(Duration::from_millis(500), registered_rx.recv())
        .await
        .expect("re-registered within backoff window")
        .unwrap();
    assert_eq!(second_registration, "reconnect@example.com");
}
