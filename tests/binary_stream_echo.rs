//! Scenario 3 (spec §8): once a call is active, its `TunnelStream` carries
//! raw bytes end to end without going through `on_message`.

use exchange_client::testing::InMemoryExchange;
use exchange_client::{DialOptions, EngineOptions, RegisterOptions, SessionEngine};

#[tokio::test]
async fn binary_stream_echo() {
    let exchange = InMemoryExchange::new();
    let e1 = SessionEngine::new(vec!["memory://exchange".into()], exchange.factory(), EngineOptions::default());
    let e2 = SessionEngine::new(vec!["memory://exchange".into()], exchange.factory(), EngineOptions::default());

    e1.register("alice@example.com", RegisterOptions::default()).await.unwrap();
    e2.register("bob@example.com", RegisterOptions::default()).await.unwrap();

    let (ring_tx, ring_rx) = tokio::sync::oneshot::channel();
    let ring_tx = std::sync::Mutex::new(Some(ring_tx));
    let _ring_disposer = e1.on_ring(move |call| {
        if let Some(tx) = ring_tx.lock().unwrap().take() {
            let _ = tx.send(call.clone());
        }
    });

    let dial = e2.dial("alice@example.com", DialOptions::default());
    let inbound_call = ring_rx.await.unwrap();
    inbound_call.answer().await.unwrap();
    let outbound_call = dial.await.unwrap();

    let inbound_stream = inbound_call.get_stream();
    let outbound_stream = outbound_call.get_stream();

    let echo_task = tokio::spawn(async move {
        let chunk = inbound_stream.read().await.unwrap();
        inbound_stream.write(chunk).await.unwrap();
    });

    outbound_stream.write(vec![1, 2, 3, 4, 5]).await.unwrap();
    let echoed = outbound_stream.read().await.unwrap();
    assert_eq!(echoed, vec![1, 2, 3, 4, 5]);

    echo_task.await.unwrap();
}
