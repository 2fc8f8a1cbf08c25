//! Per-call state machine and user-facing call handle (spec §4.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::address::Address;
use crate::codec::MessagePayload;
use crate::engine::EngineCommand;
use crate::error::{EngineError, Result};
use crate::process_tunnel::{tunnel as start_tunnel, Process, TunnelHandle, TunnelOptions};
use crate::tunnel::TunnelStream;

/// Which side originated a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// A call's position in its state machine (spec §3, the transition table
/// in §4.4). Transitions out of `Ended` never happen — every mutation site
/// in this crate treats that as an invariant, not a condition to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Ringing,
    Active,
    Ended,
}

/// Events a [`Call`] publishes to its listeners.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Connected,
    Message(MessagePayload),
    Hangup(Option<String>),
    Error(String),
}

/// The capability a [`Call`] uses to ask the engine to act on its behalf.
///
/// Holding this instead of the engine itself is what lets `Call` avoid a
/// cyclic `Arc<Engine>` reference (design note 9): the controller is just a
/// command sender plus a shared "the engine is gone" flag. Once that flag
/// is set, every operation fails fast with `IllegalState` instead of
/// hanging on a channel nobody is reading anymore.
#[derive(Clone)]
pub struct CallController {
    call_id: String,
    tx: mpsc::UnboundedSender<EngineCommand>,
    inert: Arc<AtomicBool>,
}

impl CallController {
    pub(crate) fn new(call_id: String, tx: mpsc::UnboundedSender<EngineCommand>) -> Self {
        Self {
            call_id,
            tx,
            inert: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_inert_flag(
        call_id: String,
        tx: mpsc::UnboundedSender<EngineCommand>,
        inert: Arc<AtomicBool>,
    ) -> Self {
        Self { call_id, tx, inert }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    async fn round_trip<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> EngineCommand,
    {
        if self.inert.load(Ordering::SeqCst) {
            return Err(EngineError::IllegalState("engine closed".into()));
        }
        let (respond, recv) = oneshot::channel();
        self.tx
            .send(build(respond))
            .map_err(|_| EngineError::Disconnected)?;
        recv.await.map_err(|_| EngineError::Disconnected)?
    }

    pub async fn answer(&self) -> Result<()> {
        let call_id = self.call_id.clone();
        self.round_trip(|respond| EngineCommand::Answer { call_id, respond })
            .await
    }

    pub async fn send(&self, payload: MessagePayload) -> Result<()> {
        let call_id = self.call_id.clone();
        self.round_trip(|respond| EngineCommand::SendMessage {
            call_id,
            payload,
            respond,
        })
        .await
    }

    pub async fn hangup(&self, reason: Option<String>) -> Result<()> {
        let call_id = self.call_id.clone();
        self.round_trip(|respond| EngineCommand::Hangup {
            call_id,
            reason,
            respond,
        })
        .await
    }

    pub(crate) async fn tunnel_write(&self, call_id: String, bytes: Vec<u8>) -> Result<()> {
        self.round_trip(|respond| EngineCommand::TunnelWrite {
            call_id,
            bytes,
            respond,
        })
        .await
    }
}

struct Inner {
    id: String,
    direction: CallDirection,
    peer: Address,
    metadata: Option<Value>,
    state: Mutex<CallState>,
    listeners: crate::listener::Registry<CallEvent>,
    controller: CallController,
    tunnel: Mutex<Option<TunnelStream>>,
}

/// A handle to one call between this endpoint and a peer.
///
/// Cheap to clone: every clone shares the same underlying state, listener
/// registry, and controller. The engine holds one clone internally (its
/// call table entry); user code holds whatever clones it keeps around.
#[derive(Clone)]
pub struct Call {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("id", &self.inner.id).finish()
    }
}

impl Call {
    pub(crate) fn new_outbound(
        id: String,
        peer: Address,
        metadata: Option<Value>,
        controller: CallController,
    ) -> Self {
        Self::new(id, CallDirection::Outbound, peer, metadata, CallState::Pending, controller)
    }

    pub(crate) fn new_inbound(
        id: String,
        peer: Address,
        metadata: Option<Value>,
        controller: CallController,
    ) -> Self {
        Self::new(id, CallDirection::Inbound, peer, metadata, CallState::Ringing, controller)
    }

    fn new(
        id: String,
        direction: CallDirection,
        peer: Address,
        metadata: Option<Value>,
        initial_state: CallState,
        controller: CallController,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                direction,
                peer,
                metadata,
                state: Mutex::new(initial_state),
                listeners: crate::listener::Registry::new(),
                controller,
                tunnel: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn direction(&self) -> CallDirection {
        self.inner.direction
    }

    pub fn peer_address(&self) -> &Address {
        &self.inner.peer
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.inner.metadata.as_ref()
    }

    /// Snapshot of the current state. Does not itself race a concurrent
    /// transition any differently than reading any other shared field
    /// would — callers that need linearizable state-plus-action should
    /// drive that through the relevant operation instead (e.g. `send`
    /// fails with `IllegalState` rather than requiring a caller to check
    /// `state()` first).
    pub fn state(&self) -> CallState {
        *self.inner.state.lock().unwrap()
    }

    /// Valid only for inbound calls in `Ringing`; sends `ANSWER` and
    /// transitions to `Active`.
    pub async fn answer(&self) -> Result<()> {
        if self.inner.direction != CallDirection::Inbound || self.state() != CallState::Ringing {
            return Err(EngineError::IllegalState(
                "answer() requires an inbound call in ringing state".into(),
            ));
        }
        self.inner.controller.answer().await
    }

    /// Send text. Valid only in `Active`.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(MessagePayload::Text(text.into())).await
    }

    /// Send a JSON value. Valid only in `Active`.
    pub async fn send_structured(&self, value: Value) -> Result<()> {
        self.send(MessagePayload::Structured(value)).await
    }

    /// Send raw bytes. Valid only in `Active`.
    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<()> {
        self.send(MessagePayload::Binary(bytes)).await
    }

    async fn send(&self, payload: MessagePayload) -> Result<()> {
        if self.state() != CallState::Active {
            return Err(EngineError::IllegalState(
                "send() requires an active call".into(),
            ));
        }
        self.inner.controller.send(payload).await
    }

    /// No-op if already `Ended`; otherwise sends `HANGUP`. The engine
    /// transitions this call's shared state to `Ended` and emits
    /// `Hangup` as part of processing the command (spec §4.4: "transitions
    /// locally to `ended` on observation of local action") — by the time
    /// this call resolves, `self.state()` already reads `Ended`, since the
    /// engine and this handle share the same underlying state. Idempotent.
    pub async fn hangup(&self, reason: Option<String>) -> Result<()> {
        if self.state() == CallState::Ended {
            return Ok(());
        }
        self.inner.controller.hangup(reason).await
    }

    /// Lazily creates the call's tunnel stream on first invocation;
    /// subsequent calls return the same stream (spec §4.5).
    pub fn get_stream(&self) -> TunnelStream {
        let mut guard = self.inner.tunnel.lock().unwrap();
        if let Some(existing) = guard.as_ref() {
            return existing.clone();
        }
        let stream = TunnelStream::new(self.inner.id.clone(), self.inner.controller.clone());
        *guard = Some(stream.clone());
        stream
    }

    /// Starts `process`, then bidirectionally pipes its stdio through this
    /// call's tunnel stream. Valid only in `Active`.
    pub async fn tunnel<P: Process + 'static>(
        &self,
        process: P,
        options: TunnelOptions,
    ) -> Result<TunnelHandle> {
        if self.state() != CallState::Active {
            return Err(EngineError::IllegalState(
                "tunnel() requires an active call".into(),
            ));
        }
        let stream = self.get_stream();
        let close_on_hangup = options.close_on_hangup;
        let handle = start_tunnel(process, stream, options).await?;
        if close_on_hangup {
            let handle_for_hangup = handle.clone();
            let disposer = self.on_hangup(move |_| {
                let handle_for_hangup = handle_for_hangup.clone();
                tokio::spawn(async move {
                    handle_for_hangup.close(None).await;
                });
            });
            // Kept alive inside the handle itself so the listener stays
            // registered until the handle (and therefore this wiring) is
            // no longer needed, rather than being removed the instant this
            // function returns.
            handle.attach_hangup_disposer(disposer);
        }
        Ok(handle)
    }

    /// Register a listener for every event this call publishes.
    pub fn on_event<F>(&self, f: F) -> crate::listener::Disposer<CallEvent>
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(f)
    }

    pub fn on_connected<F>(&self, f: F) -> crate::listener::Disposer<CallEvent>
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.on_event(move |e| {
            if matches!(e, CallEvent::Connected) {
                f(e);
            }
        })
    }

    pub fn on_message<F>(&self, f: F) -> crate::listener::Disposer<CallEvent>
    where
        F: Fn(&MessagePayload) + Send + Sync + 'static,
    {
        self.on_event(move |e| {
            if let CallEvent::Message(payload) = e {
                f(payload);
            }
        })
    }

    pub fn on_hangup<F>(&self, f: F) -> crate::listener::Disposer<CallEvent>
    where
        F: Fn(&CallEvent) + Send + Sync + 'static,
    {
        self.on_event(move |e| {
            if matches!(e, CallEvent::Hangup(_)) {
                f(e);
            }
        })
    }

    // --- Engine-facing mutation surface (pub(crate)) ---

    pub(crate) fn set_state(&self, state: CallState) {
        *self.inner.state.lock().unwrap() = state;
    }

    pub(crate) fn emit(&self, event: CallEvent) {
        self.inner.listeners.emit(&event);
    }

    pub(crate) fn tunnel_push_inbound(&self, bytes: Vec<u8>) {
        if let Some(stream) = self.inner.tunnel.lock().unwrap().as_ref() {
            stream.push_inbound(bytes);
        }
    }

    pub(crate) fn tunnel_end_from_remote(&self) {
        if let Some(stream) = self.inner.tunnel.lock().unwrap().as_ref() {
            stream.end_from_remote();
        }
    }

    pub(crate) fn tunnel_destroy(&self) {
        if let Some(stream) = self.inner.tunnel.lock().unwrap().as_ref() {
            stream.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (CallController, mpsc::UnboundedReceiver<EngineCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CallController::new("call-1".to_string(), tx), rx)
    }

    #[tokio::test]
    async fn answer_fails_on_outbound_call() {
        let (controller, _rx) = controller();
        let call = Call::new_outbound(
            "call-1".to_string(),
            Address::parse("bob@example.com").unwrap(),
            None,
            controller,
        );
        assert!(matches!(
            call.answer().await,
            Err(EngineError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn send_fails_before_active() {
        let (controller, _rx) = controller();
        let call = Call::new_inbound(
            "call-1".to_string(),
            Address::parse("bob@example.com").unwrap(),
            None,
            controller,
        );
        assert!(matches!(
            call.send_text("hi").await,
            Err(EngineError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn hangup_sends_a_command_and_is_idempotent() {
        let (controller, mut rx) = controller();
        let call = Call::new_inbound(
            "call-1".to_string(),
            Address::parse("bob@example.com").unwrap(),
            None,
            controller,
        );
        call.set_state(CallState::Active);

        let respond_task = tokio::spawn(async move {
            if let Some(EngineCommand::Hangup { respond, .. }) = rx.recv().await {
                // The engine transitions shared state to Ended as part of
                // processing the command, mirroring handle_hangup.
                let _ = respond.send(Ok(()));
            }
        });

        call.hangup(Some("bye".to_string())).await.unwrap();
        respond_task.await.unwrap();
        // This handle's local early-return for Ended only triggers once the
        // engine has actually flipped the shared state; simulate that here.
        call.set_state(CallState::Ended);

        // Second hangup is a no-op and does not require a responder.
        call.hangup(None).await.unwrap();
    }

    #[tokio::test]
    async fn get_stream_is_idempotent() {
        let (controller, _rx) = controller();
        let call = Call::new_inbound(
            "call-1".to_string(),
            Address::parse("bob@example.com").unwrap(),
            None,
            controller,
        );
        let a = call.get_stream();
        let b = call.get_stream();
        assert_eq!(a.call_id(), b.call_id());
    }
}
