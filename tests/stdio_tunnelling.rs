//! Scenario 4 (spec §8): `Call::tunnel` pipes a process's stdio through
//! the call's byte stream, independent of the call's own message events.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use exchange_client::testing::InMemoryExchange;
use exchange_client::{DialOptions, EngineOptions, Process, RegisterOptions, SessionEngine, TunnelOptions};

struct UppercaseProcess {
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

impl UppercaseProcess {
    fn spawn() -> Self {
        let (stdin, mut worker_read) = tokio::io::duplex(4096);
        let (mut worker_write, stdout) = tokio::io::duplex(4096);
        let (_unused_err_write, stderr) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match worker_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if worker_write.write_all(&buf[..n].to_ascii_uppercase()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { stdin, stdout, stderr }
    }
}

#[async_trait]
impl Process for UppercaseProcess {
    type Stdin = DuplexStream;
    type Stdout = DuplexStream;
    type Stderr = DuplexStream;

    fn stdio_mut(&mut self) -> (&mut Self::Stdin, &mut Self::Stdout, Option<&mut Self::Stderr>) {
        (&mut self.stdin, &mut self.stdout, Some(&mut self.stderr))
    }
}

#[tokio::test]
async fn stdio_tunnelling() {
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

    let handle = inbound_call
        .tunnel(UppercaseProcess::spawn(), TunnelOptions::default())
        .await
        .unwrap();

    let outbound_stream = outbound_call.get_stream();
    outbound_stream.write(b"hello shells\n".to_vec()).await.unwrap();
    let echoed = outbound_stream.read().await.unwrap();
    assert_eq!(echoed, b"HELLO SHELLS\n");

    handle.close(None).await;
    assert!(handle.is_closed());
}
