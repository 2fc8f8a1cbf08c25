//! Scenario 2 (spec §8): dialing an address nobody registered comes back
//! as a `BUSY` rejection rather than hanging.

use exchange_client::testing::InMemoryExchange;
use exchange_client::{DialOptions, EngineError, EngineOptions, SessionEngine};

#[tokio::test]
async fn busy_rejection() {
    let exchange = InMemoryExchange::new();
    let e2 = SessionEngine::new(vec!["memory://exchange".into()], exchange.factory(), EngineOptions::default());

    let err = e2.dial("ghost@example.com", DialOptions::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::CallFailed(reason) if reason == "offline"));
}
