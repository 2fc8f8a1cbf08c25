//! An in-memory fake of the Exchange's routing behavior.
//!
//! The real Exchange (the server side of this protocol) is explicitly out
//! of scope for this crate (spec.md §2, Non-goals: "does not route or
//! broker calls; routing is the Exchange's job"). Exercising `register`,
//! `dial`, `answer`, `send`, `hangup`, and reconnect end-to-end still needs
//! *something* on the other end of the wire, so this module plays that
//! role: a minimal in-process router over the same JSON frame schema
//! (spec.md §4.2), wired through the crate's own [`Transport`] trait rather
//! than a real socket. This mirrors the teacher's approach of testing its
//! transports against an in-process loopback rather than a live peer
//! (`tests/integration_tcp_round_trip.rs` spins up its own listener in the
//! same process).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::transport::{Frame, Transport, TransportEvent, TransportFactory, TransportState};

type ConnectionId = u64;

struct CallRecord {
    caller_conn: ConnectionId,
    callee_conn: ConnectionId,
    to_address: String,
}

struct ExchangeState {
    next_connection_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<TransportEvent>>>,
    registrations: Mutex<HashMap<String, ConnectionId>>,
    calls: Mutex<HashMap<String, CallRecord>>,
    drop_heartbeats: AtomicBool,
}

impl ExchangeState {
    fn deliver(&self, conn: ConnectionId, frame: Value) {
        if let Some(tx) = self.connections.lock().unwrap().get(&conn) {
            let _ = tx.send(TransportEvent::Message(frame.to_string()));
        }
    }

    fn route_outbound(&self, conn: ConnectionId, frame: Value) {
        let Some(frame_type) = frame.get("type").and_then(Value::as_str) else {
            return;
        };
        match frame_type {
            "REGISTER" => self.handle_register(conn, frame),
            "UNREGISTER" => self.handle_unregister(conn),
            "HEARTBEAT" => self.handle_heartbeat(conn),
            "DIAL" => self.handle_dial(conn, frame),
            "ANSWER" => self.handle_answer(conn, frame),
            "HANGUP" => self.handle_hangup(conn, frame),
            "MSG" => self.handle_msg(conn, frame),
            _ => {}
        }
    }

    fn handle_register(&self, conn: ConnectionId, frame: Value) {
        let Some(address) = frame.get("address").and_then(Value::as_str) else {
            return;
        };
        let mut registrations = self.registrations.lock().unwrap();
        if let Some(&existing) = registrations.get(address) {
            if existing != conn {
                self.deliver(
                    conn,
                    json!({"type": "REGISTER_FAILED", "reason": "address_in_use"}),
                );
                return;
            }
        }
        registrations.insert(address.to_string(), conn);
        drop(registrations);
        self.deliver(conn, json!({"type": "REGISTERED"}));
    }

    fn handle_unregister(&self, conn: ConnectionId) {
        self.registrations.lock().unwrap().retain(|_, &mut c| c != conn);
    }

    fn handle_heartbeat(&self, conn: ConnectionId) {
        if self.drop_heartbeats.load(Ordering::SeqCst) {
            return;
        }
        self.deliver(conn, json!({"type": "HEARTBEAT_ACK"}));
    }

    fn address_of(&self, conn: ConnectionId) -> Option<String> {
        self.registrations
            .lock()
            .unwrap()
            .iter()
            .find(|(_, &c)| c == conn)
            .map(|(addr, _)| addr.clone())
    }

    fn handle_dial(&self, conn: ConnectionId, frame: Value) {
        let Some(to) = frame.get("to").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let metadata = frame.get("metadata").cloned();
        let callee_conn = self.registrations.lock().unwrap().get(&to).copied();
        let Some(callee_conn) = callee_conn else {
            self.deliver(conn, json!({"type": "BUSY", "to": to, "reason": "offline"}));
            return;
        };
        let from = self.address_of(conn).unwrap_or_default();
        let call_id = Uuid::new_v4().to_string();
        self.calls.lock().unwrap().insert(
            call_id.clone(),
            CallRecord {
                caller_conn: conn,
                callee_conn,
                to_address: to,
            },
        );
        let mut ring = json!({"type": "RING", "call_id": call_id, "from": from});
        if let Some(metadata) = metadata {
            ring["metadata"] = metadata;
        }
        self.deliver(callee_conn, ring);
    }

    fn handle_answer(&self, conn: ConnectionId, frame: Value) {
        let Some(call_id) = frame.get("call_id").and_then(Value::as_str) else {
            return;
        };
        let calls = self.calls.lock().unwrap();
        let Some(record) = calls.get(call_id) else {
            return;
        };
        if record.callee_conn != conn {
            return;
        }
        let caller_conn = record.caller_conn;
        let to_address = record.to_address.clone();
        drop(calls);
        self.deliver(
            caller_conn,
            json!({"type": "CONNECTED", "call_id": call_id, "to": to_address}),
        );
    }

    fn other_party(&self, conn: ConnectionId, call_id: &str) -> Option<ConnectionId> {
        let calls = self.calls.lock().unwrap();
        let record = calls.get(call_id)?;
        if record.caller_conn == conn {
            Some(record.callee_conn)
        } else if record.callee_conn == conn {
            Some(record.caller_conn)
        } else {
            None
        }
    }

    fn handle_hangup(&self, conn: ConnectionId, frame: Value) {
        let Some(call_id) = frame.get("call_id").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let reason = frame.get("reason").cloned();
        if let Some(peer) = self.other_party(conn, &call_id) {
            let mut msg = json!({"type": "HANGUP", "call_id": call_id});
            if let Some(reason) = reason {
                msg["reason"] = reason;
            }
            self.deliver(peer, msg);
        }
        self.calls.lock().unwrap().remove(&call_id);
    }

    fn handle_msg(&self, conn: ConnectionId, frame: Value) {
        let Some(call_id) = frame.get("call_id").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        if let Some(peer) = self.other_party(conn, &call_id) {
            let mut msg = json!({"type": "MSG", "call_id": call_id});
            if let Some(data) = frame.get("data").cloned() {
                msg["data"] = data;
            }
            if let Some(content_type) = frame.get("content_type").cloned() {
                msg["content_type"] = content_type;
            }
            self.deliver(peer, msg);
        }
    }

    fn disconnect_connection(&self, conn: ConnectionId) {
        self.connections.lock().unwrap().remove(&conn);
        self.registrations.lock().unwrap().retain(|_, &mut c| c != conn);
    }
}

/// A fake Exchange server. Each [`InMemoryTransport::connect`] call
/// registers a new logical connection against the same shared state;
/// [`InMemoryExchange::force_disconnect`] lets tests simulate a dropped
/// connection to exercise the engine's reconnect path.
#[derive(Clone)]
pub struct InMemoryExchange {
    state: Arc<ExchangeState>,
}

impl InMemoryExchange {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ExchangeState {
                next_connection_id: AtomicU64::new(0),
                connections: Mutex::new(HashMap::new()),
                registrations: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                drop_heartbeats: AtomicBool::new(false),
            }),
        }
    }

    /// A transport factory bound to this exchange. Hand to
    /// [`crate::engine::SessionEngine::new`]; every engine built from the
    /// same factory instance (or clones of it) can reach every other.
    pub fn factory(&self) -> Arc<dyn TransportFactory> {
        Arc::new(InMemoryTransportFactory {
            state: self.state.clone(),
        })
    }

    /// Stop acknowledging `HEARTBEAT` frames, to exercise heartbeat-timeout
    /// disconnects.
    pub fn set_drop_heartbeats(&self, drop: bool) {
        self.state.drop_heartbeats.store(drop, Ordering::SeqCst);
    }

    /// Forces the connection currently registered at `address` to observe
    /// a transport close, as if the network had dropped it.
    pub fn force_disconnect(&self, address: &str, code: Option<u16>, reason: Option<String>) {
        let conn = self.state.registrations.lock().unwrap().get(address).copied();
        let Some(conn) = conn else {
            return;
        };
        if let Some(tx) = self.state.connections.lock().unwrap().get(&conn) {
            let _ = tx.send(TransportEvent::Closed { code, reason });
        }
        self.state.disconnect_connection(conn);
    }
}

impl Default for InMemoryExchange {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemoryTransportFactory {
    state: Arc<ExchangeState>,
}

impl TransportFactory for InMemoryTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(InMemoryTransport {
            state: self.state.clone(),
            conn_id: None,
            transport_state: TransportState::Uninitialized,
        })
    }
}

/// One logical connection to an [`InMemoryExchange`].
pub struct InMemoryTransport {
    state: Arc<ExchangeState>,
    conn_id: Option<ConnectionId>,
    transport_state: TransportState,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&mut self, _url: &str) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        let conn_id = self.state.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.connections.lock().unwrap().insert(conn_id, tx);
        self.conn_id = Some(conn_id);
        self.transport_state = TransportState::Open;
        Ok(rx)
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        let Some(conn_id) = self.conn_id else {
            return Err(EngineError::Disconnected);
        };
        let value: Value = serde_json::from_str(&frame).map_err(|e| EngineError::Decode(e.to_string()))?;
        self.state.route_outbound(conn_id, value);
        Ok(())
    }

    async fn close(&mut self, _code: Option<u16>, _reason: Option<String>) -> Result<()> {
        if let Some(conn_id) = self.conn_id.take() {
            self.state.disconnect_connection(conn_id);
        }
        self.transport_state = TransportState::Closed;
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.transport_state
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_heartbeat_ack() {
        let exchange = InMemoryExchange::new();
        let mut transport = exchange.factory().create();
        let mut rx = transport.connect("memory://x").await.unwrap();

        transport
            .send(json!({"type": "REGISTER", "address": "alice@example.com"}).to_string())
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, TransportEvent::Message(m) if m.contains("REGISTERED")));

        transport.send(json!({"type": "HEARTBEAT"}).to_string()).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, TransportEvent::Message(m) if m.contains("HEARTBEAT_ACK")));
    }

    #[tokio::test]
    async fn dial_unregistered_address_yields_busy() {
        let exchange = InMemoryExchange::new();
        let mut transport = exchange.factory().create();
        let mut rx = transport.connect("memory://x").await.unwrap();

        transport
            .send(json!({"type": "DIAL", "to": "nobody@example.com"}).to_string())
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, TransportEvent::Message(m) if m.contains("BUSY") && m.contains("offline")));
    }

    #[tokio::test]
    async fn force_disconnect_closes_the_registered_connection() {
        let exchange = InMemoryExchange::new();
        let mut transport = exchange.factory().create();
        let mut rx = transport.connect("memory://x").await.unwrap();
        transport
            .send(json!({"type": "REGISTER", "address": "alice@example.com"}).to_string())
            .await
            .unwrap();
        rx.recv().await.unwrap();

        exchange.force_disconnect("alice@example.com", Some(1006), Some("network".to_string()));
        let msg = rx.recv().await.unwrap();
        assert!(matches!(
            msg,
            TransportEvent::Closed {
                code: Some(1006),
                ..
            }
        ));
    }
}
