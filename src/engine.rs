//! The session engine: connection lifecycle, registration, heartbeat,
//! reconnect/backoff, and the per-call demultiplexer (spec §4.5).
//!
//! A single actor task (spawned from [`SessionEngine::new`]) owns every
//! piece of mutable engine state. Public handles — [`SessionEngine`],
//! [`crate::call::Call`], [`crate::tunnel::TunnelStream`] — are cheap
//! `Clone` structs that only ever talk to that task through a command
//! channel; none of them touch engine state directly. This mirrors the
//! teacher's per-connection background task that forwards
//! `(ConnectionId, Message)` over an `mpsc` channel to a single consumer,
//! scaled up to own the whole engine instead of one socket.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::address::Address;
use crate::call::{Call, CallController, CallEvent, CallState};
use crate::codec::{InboundFrame, MessagePayload, OutboundFrame};
use crate::error::{EngineError, Result};
use crate::listener::{Disposer, Registry};
use crate::transport::{Transport, TransportEvent, TransportFactory};

/// Forwarding cadence and deadlines, registration policy, and debug
/// logging (spec §6, "Public engine surface").
///
/// The transport factory is deliberately not a field here: it has no
/// sensible default (the concrete transport is an external collaborator
/// this crate never constructs on its own), so it stays a separate
/// argument to [`SessionEngine::new`] and this struct stays plain-`Default`
/// in the teacher's `TransportConfig::default()` style — callers reach for
/// `EngineOptions { heartbeat_interval_ms: 0, ..Default::default() }`
/// rather than a builder.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
    pub register_on_connect: bool,
    pub debug: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 60_000,
            auto_reconnect: true,
            reconnect_backoff_ms: 1_000,
            max_reconnect_backoff_ms: 30_000,
            register_on_connect: true,
            debug: false,
        }
    }
}

/// Opaque to the engine; forwarded to the Exchange in registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyMode {
    Single,
    Broadcast,
    Parallel,
}

impl ConcurrencyMode {
    fn as_wire(self) -> &'static str {
        match self {
            ConcurrencyMode::Single => "single",
            ConcurrencyMode::Broadcast => "broadcast",
            ConcurrencyMode::Parallel => "parallel",
        }
    }
}

/// Per-call `register()` overrides (spec §3, `RegistrationRequest`).
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub metadata: Option<Value>,
    pub concurrency_mode: Option<ConcurrencyMode>,
    pub max_listeners: Option<u32>,
    pub max_sessions: Option<u32>,
    pub pool_size: Option<u32>,
}

/// Per-call `dial()` overrides.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    pub metadata: Option<Value>,
    /// Rejects the dial with [`EngineError::Timeout`] if neither
    /// `CONNECTED` nor `BUSY` matches within this many milliseconds.
    pub timeout_ms: Option<u64>,
}

/// Retained on the engine across reconnects so it can re-assert a
/// registration without the caller doing anything (spec §3).
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub address: Address,
    pub metadata: Option<Value>,
    pub concurrency_mode: Option<ConcurrencyMode>,
    pub max_listeners: Option<u32>,
    pub max_sessions: Option<u32>,
    pub pool_size: Option<u32>,
    pub(crate) created_at: Instant,
}

/// Events the engine publishes to its listeners (spec §6).
#[derive(Clone)]
pub enum EngineEvent {
    Connected,
    Disconnected {
        code: Option<u16>,
        reason: Option<String>,
    },
    Registered(Address),
    RegistrationFailed(String),
    Ring(Call),
    Error(EngineError),
    HeartbeatAck(SystemTime),
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::Connected => f.write_str("Connected"),
            EngineEvent::Disconnected { code, reason } => {
                f.debug_struct("Disconnected").field("code", code).field("reason", reason).finish()
            }
            EngineEvent::Registered(address) => f.debug_tuple("Registered").field(address).finish(),
            EngineEvent::RegistrationFailed(reason) => f.debug_tuple("RegistrationFailed").field(reason).finish(),
            EngineEvent::Ring(call) => f.debug_tuple("Ring").field(&call.id()).finish(),
            EngineEvent::Error(err) => f.debug_tuple("Error").field(err).finish(),
            EngineEvent::HeartbeatAck(ts) => f.debug_tuple("HeartbeatAck").field(ts).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Commands the public handles send to the actor task.
pub(crate) enum EngineCommand {
    Register {
        address: Address,
        options: RegisterOptions,
        respond: oneshot::Sender<Result<()>>,
    },
    Dial {
        to: Address,
        options: DialOptions,
        respond: oneshot::Sender<Result<Call>>,
    },
    Close {
        code: Option<u16>,
        reason: Option<String>,
        respond: oneshot::Sender<()>,
    },
    Heartbeat {
        respond: oneshot::Sender<Result<()>>,
    },
    Reconnect {
        respond: oneshot::Sender<Result<()>>,
    },
    Answer {
        call_id: String,
        respond: oneshot::Sender<Result<()>>,
    },
    SendMessage {
        call_id: String,
        payload: MessagePayload,
        respond: oneshot::Sender<Result<()>>,
    },
    Hangup {
        call_id: String,
        reason: Option<String>,
        respond: oneshot::Sender<Result<()>>,
    },
    TunnelWrite {
        call_id: String,
        bytes: Vec<u8>,
        respond: oneshot::Sender<Result<()>>,
    },
}

/// Internal inputs multiplexed onto the actor's single select loop:
/// transport events (tagged with a connection generation so a stale
/// transport can never be observed after it's been superseded) and timer
/// fires (tagged with their own generations for the same reason).
enum ActorInput {
    Transport(u64, TransportEvent),
    HeartbeatTick(u64),
    HeartbeatTimeout(u64),
    ReconnectTick(u64),
    DialTimeout(String),
}

struct PendingDialEntry {
    id: String,
    to: Address,
    respond: oneshot::Sender<Result<Call>>,
}

/// A handle to a running session engine. Cheap to clone; every clone
/// shares the same actor task and event registry.
#[derive(Clone)]
pub struct SessionEngine {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    events: Registry<EngineEvent>,
}

impl SessionEngine {
    /// Construct an engine. The engine stays `Disconnected` until the
    /// first operation that needs wire I/O (`register` or `dial`).
    pub fn new(urls: Vec<String>, transport_factory: Arc<dyn TransportFactory>, options: EngineOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let events = Registry::new();
        let actor = EngineActor::new(
            urls,
            transport_factory,
            options,
            cmd_tx.clone(),
            internal_tx,
            events.clone(),
        );
        tokio::spawn(actor.run(cmd_rx, internal_rx));
        Self { cmd_tx, events }
    }

    pub async fn register(&self, address: impl Into<String>, options: RegisterOptions) -> Result<()> {
        let address = Address::parse(address.into())?;
        let (respond, recv) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::Register {
                address,
                options,
                respond,
            })
            .map_err(|_| EngineError::Disconnected)?;
        recv.await.map_err(|_| EngineError::Disconnected)?
    }

    pub async fn dial(&self, to: impl Into<String>, options: DialOptions) -> Result<Call> {
        let to = Address::parse(to.into())?;
        let (respond, recv) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::Dial { to, options, respond })
            .map_err(|_| EngineError::Disconnected)?;
        recv.await.map_err(|_| EngineError::Disconnected)?
    }

    /// Disables reconnect, clears timers, and closes the transport.
    /// Idempotent and safe from any engine state.
    pub async fn close(&self, code: Option<u16>, reason: Option<String>) {
        let (respond, recv) = oneshot::channel();
        if self
            .cmd_tx
            .send(EngineCommand::Close {
                code,
                reason,
                respond,
            })
            .is_ok()
        {
            let _ = recv.await;
        }
    }

    /// Sends a `HEARTBEAT` frame immediately, outside the regular cadence.
    pub async fn heartbeat(&self) -> Result<()> {
        let (respond, recv) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::Heartbeat { respond })
            .map_err(|_| EngineError::Disconnected)?;
        recv.await.map_err(|_| EngineError::Disconnected)?
    }

    /// Forces a fresh connection attempt, tearing down any current one.
    pub async fn reconnect(&self) -> Result<()> {
        let (respond, recv) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::Reconnect { respond })
            .map_err(|_| EngineError::Disconnected)?;
        recv.await.map_err(|_| EngineError::Disconnected)?
    }

    fn on_filtered<F>(&self, f: F) -> Disposer<EngineEvent>
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.events.add(f)
    }

    pub fn on_connected<F>(&self, f: F) -> Disposer<EngineEvent>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_filtered(move |e| {
            if matches!(e, EngineEvent::Connected) {
                f();
            }
        })
    }

    pub fn on_disconnected<F>(&self, f: F) -> Disposer<EngineEvent>
    where
        F: Fn(Option<u16>, Option<&str>) + Send + Sync + 'static,
    {
        self.on_filtered(move |e| {
            if let EngineEvent::Disconnected { code, reason } = e {
                f(*code, reason.as_deref());
            }
        })
    }

    pub fn on_registered<F>(&self, f: F) -> Disposer<EngineEvent>
    where
        F: Fn(&Address) + Send + Sync + 'static,
    {
        self.on_filtered(move |e| {
            if let EngineEvent::Registered(address) = e {
                f(address);
            }
        })
    }

    pub fn on_registration_failed<F>(&self, f: F) -> Disposer<EngineEvent>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_filtered(move |e| {
            if let EngineEvent::RegistrationFailed(reason) = e {
                f(reason);
            }
        })
    }

    pub fn on_ring<F>(&self, f: F) -> Disposer<EngineEvent>
    where
        F: Fn(&Call) + Send + Sync + 'static,
    {
        self.on_filtered(move |e| {
            if let EngineEvent::Ring(call) = e {
                f(call);
            }
        })
    }

    pub fn on_error<F>(&self, f: F) -> Disposer<EngineEvent>
    where
        F: Fn(&EngineError) + Send + Sync + 'static,
    {
        self.on_filtered(move |e| {
            if let EngineEvent::Error(err) = e {
                f(err);
            }
        })
    }

    pub fn on_heartbeat_ack<F>(&self, f: F) -> Disposer<EngineEvent>
    where
        F: Fn(SystemTime) + Send + Sync + 'static,
    {
        self.on_filtered(move |e| {
            if let EngineEvent::HeartbeatAck(ts) = e {
                f(*ts);
            }
        })
    }
}

/// Owns every mutable piece of engine state; lives entirely inside the
/// task spawned by [`SessionEngine::new`].
struct EngineActor {
    urls: Vec<String>,
    transport_factory: Arc<dyn TransportFactory>,
    options: EngineOptions,
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    internal_tx: mpsc::UnboundedSender<ActorInput>,
    events: Registry<EngineEvent>,
    inert: Arc<AtomicBool>,

    state: SessionState,
    transport: Option<Box<dyn Transport>>,
    forwarder: Option<JoinHandle<()>>,
    connection_generation: u64,

    pinned_registration: Option<RegistrationRequest>,
    registered: bool,
    registration_inflight: Vec<oneshot::Sender<Result<()>>>,

    pending_dials: VecDeque<PendingDialEntry>,
    calls: std::collections::HashMap<String, Call>,

    current_reconnect_delay: u64,
    reconnect_generation: u64,
    closed: bool,

    heartbeat_task: Option<JoinHandle<()>>,
    heartbeat_generation: u64,
    last_heartbeat_ack: Instant,
}

impl EngineActor {
    fn new(
        urls: Vec<String>,
        transport_factory: Arc<dyn TransportFactory>,
        options: EngineOptions,
        cmd_tx: mpsc::UnboundedSender<EngineCommand>,
        internal_tx: mpsc::UnboundedSender<ActorInput>,
        events: Registry<EngineEvent>,
    ) -> Self {
        let current_reconnect_delay = options.reconnect_backoff_ms;
        Self {
            urls,
            transport_factory,
            options,
            cmd_tx,
            internal_tx,
            events,
            inert: Arc::new(AtomicBool::new(false)),
            state: SessionState::Disconnected,
            transport: None,
            forwarder: None,
            connection_generation: 0,
            pinned_registration: None,
            registered: false,
            registration_inflight: Vec::new(),
            pending_dials: VecDeque::new(),
            calls: std::collections::HashMap::new(),
            current_reconnect_delay,
            reconnect_generation: 0,
            closed: false,
            heartbeat_task: None,
            heartbeat_generation: 0,
            last_heartbeat_ack: Instant::now(),
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
        mut internal_rx: mpsc::UnboundedReceiver<ActorInput>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                input = internal_rx.recv() => {
                    match input {
                        Some(input) => self.handle_internal(input).await,
                        None => break,
                    }
                }
            }
        }
        self.disconnect_cascade(None, None).await;
    }

    // ---- command handling ----

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Register {
                address,
                options,
                respond,
            } => self.handle_register(address, options, respond).await,
            EngineCommand::Dial { to, options, respond } => self.handle_dial(to, options, respond).await,
            EngineCommand::Close {
                code,
                reason,
                respond,
            } => {
                self.closed = true;
                self.inert.store(true, Ordering::SeqCst);
                self.disconnect_cascade(code, reason).await;
                let _ = respond.send(());
            }
            EngineCommand::Heartbeat { respond } => {
                let result = self.send_frame(OutboundFrame::Heartbeat).await;
                let _ = respond.send(result);
            }
            EngineCommand::Reconnect { respond } => {
                let was_closed = self.closed;
                self.closed = true;
                self.disconnect_cascade(None, Some("reconnect requested".to_string())).await;
                self.closed = was_closed;
                let result = self.ensure_connected().await;
                let _ = respond.send(result);
            }
            EngineCommand::Answer { call_id, respond } => self.handle_answer(call_id, respond).await,
            EngineCommand::SendMessage {
                call_id,
                payload,
                respond,
            } => self.handle_send_message(call_id, payload, respond).await,
            EngineCommand::Hangup {
                call_id,
                reason,
                respond,
            } => self.handle_hangup(call_id, reason, respond).await,
            EngineCommand::TunnelWrite {
                call_id,
                bytes,
                respond,
            } => {
                self.handle_send_message(call_id, MessagePayload::Binary(bytes), respond).await
            }
        }
    }

    async fn handle_register(
        &mut self,
        address: Address,
        options: RegisterOptions,
        respond: oneshot::Sender<Result<()>>,
    ) {
        if let Some(existing) = &self.pinned_registration {
            if existing.address == address && self.registered {
                let _ = respond.send(Ok(()));
                return;
            }
        }
        if let Err(e) = self.ensure_connected().await {
            let _ = respond.send(Err(e));
            return;
        }
        let request = RegistrationRequest {
            address,
            metadata: options.metadata,
            concurrency_mode: options.concurrency_mode,
            max_listeners: options.max_listeners,
            max_sessions: options.max_sessions,
            pool_size: options.pool_size,
            created_at: Instant::now(),
        };
        self.pinned_registration = Some(request.clone());
        if self.registration_inflight.is_empty() {
            let _ = self.send_register_frame(&request).await;
        }
        self.registration_inflight.push(respond);
    }

    async fn send_register_frame(&mut self, request: &RegistrationRequest) -> Result<()> {
        tracing::debug!(address = %request.address, "sending REGISTER");
        self.send_frame(OutboundFrame::Register {
            address: request.address.to_string(),
            metadata: request.metadata.clone(),
            concurrency_mode: request.concurrency_mode.map(ConcurrencyMode::as_wire).map(str::to_string),
            max_listeners: request.max_listeners,
            max_sessions: request.max_sessions,
            pool_size: request.pool_size,
        })
        .await
    }

    async fn handle_dial(&mut self, to: Address, options: DialOptions, respond: oneshot::Sender<Result<Call>>) {
        if let Err(e) = self.ensure_connected().await {
            let _ = respond.send(Err(e));
            return;
        }
        let dial_id = Uuid::new_v4().to_string();
        tracing::debug!(to = %to, dial_id = %dial_id, "dial queued");
        self.pending_dials.push_back(PendingDialEntry {
            id: dial_id.clone(),
            to: to.clone(),
            respond,
        });
        if let Err(e) = self
            .send_frame(OutboundFrame::Dial {
                to: to.to_string(),
                metadata: options.metadata.clone(),
            })
            .await
        {
            self.reject_pending_dial(&dial_id, e);
            return;
        }
        if let Some(ms) = options.timeout_ms {
            let tx = self.internal_tx.clone();
            let id = dial_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let _ = tx.send(ActorInput::DialTimeout(id));
            });
        }
    }

    fn reject_pending_dial(&mut self, dial_id: &str, err: EngineError) {
        if let Some(pos) = self.pending_dials.iter().position(|e| e.id == dial_id) {
            let entry = self.pending_dials.remove(pos).unwrap();
            let _ = entry.respond.send(Err(err));
        }
    }

    async fn handle_answer(&mut self, call_id: String, respond: oneshot::Sender<Result<()>>) {
        let Some(call) = self.calls.get(&call_id).cloned() else {
            let _ = respond.send(Err(EngineError::IllegalState("unknown call".into())));
            return;
        };
        match self
            .send_frame(OutboundFrame::Answer {
                call_id: call_id.clone(),
            })
            .await
        {
            Ok(()) => {
                call.set_state(CallState::Active);
                call.emit(CallEvent::Connected);
                let _ = respond.send(Ok(()));
            }
            Err(e) => {
                let _ = respond.send(Err(e));
            }
        }
    }

    async fn handle_send_message(
        &mut self,
        call_id: String,
        payload: MessagePayload,
        respond: oneshot::Sender<Result<()>>,
    ) {
        let Some(call) = self.calls.get(&call_id).cloned() else {
            let _ = respond.send(Err(EngineError::Disconnected));
            return;
        };
        if call.state() != CallState::Active {
            let _ = respond.send(Err(EngineError::IllegalState("call is not active".into())));
            return;
        }
        let wire = match payload.to_wire() {
            Ok(w) => w,
            Err(e) => {
                let _ = respond.send(Err(e));
                return;
            }
        };
        let result = self
            .send_frame(OutboundFrame::Msg {
                call_id,
                data: wire.data,
                content_type: wire.content_type,
            })
            .await;
        let _ = respond.send(result);
    }

    async fn handle_hangup(&mut self, call_id: String, reason: Option<String>, respond: oneshot::Sender<Result<()>>) {
        let Some(call) = self.calls.get(&call_id).cloned() else {
            let _ = respond.send(Ok(()));
            return;
        };
        if call.state() == CallState::Ended {
            let _ = respond.send(Ok(()));
            return;
        }
        match self
            .send_frame(OutboundFrame::Hangup {
                call_id: call_id.clone(),
                reason: reason.clone(),
            })
            .await
        {
            Ok(()) => {
                call.set_state(CallState::Ended);
                call.emit(CallEvent::Hangup(reason));
                call.tunnel_destroy();
                self.calls.remove(&call_id);
                let _ = respond.send(Ok(()));
            }
            Err(e) => {
                let _ = respond.send(Err(e));
            }
        }
    }

    // ---- internal (transport / timer) inputs ----

    async fn handle_internal(&mut self, input: ActorInput) {
        match input {
            ActorInput::Transport(generation, event) => {
                if generation != self.connection_generation {
                    return;
                }
                self.handle_transport_event(event).await;
            }
            ActorInput::HeartbeatTick(generation) => self.handle_heartbeat_tick(generation).await,
            ActorInput::HeartbeatTimeout(generation) => self.handle_heartbeat_timeout(generation).await,
            ActorInput::ReconnectTick(generation) => self.handle_reconnect_tick(generation).await,
            ActorInput::DialTimeout(id) => self.reject_pending_dial(&id, EngineError::Timeout),
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(frame) => self.handle_inbound_frame(&frame).await,
            TransportEvent::Error(err) => {
                tracing::error!(error = %err, "transport error");
                self.events.emit(&EngineEvent::Error(EngineError::Transport(err)));
            }
            TransportEvent::Closed { code, reason } => {
                tracing::info!(?code, ?reason, "transport closed");
                self.disconnect_cascade(code, reason).await;
            }
        }
    }

    async fn handle_inbound_frame(&mut self, raw: &str) {
        let frame = match InboundFrame::from_json(raw) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "failed to decode inbound frame");
                self.events.emit(&EngineEvent::Error(e));
                return;
            }
        };
        match frame {
            InboundFrame::Registered => {
                self.registered = true;
                let address = self.pinned_registration.as_ref().map(|r| r.address.clone());
                for respond in self.registration_inflight.drain(..) {
                    let _ = respond.send(Ok(()));
                }
                if let Some(address) = address {
                    tracing::info!(%address, "registered");
                    self.events.emit(&EngineEvent::Registered(address));
                }
            }
            InboundFrame::RegisterFailed { reason } => {
                let reason = reason.unwrap_or_else(|| "unknown".to_string());
                for respond in self.registration_inflight.drain(..) {
                    let _ = respond.send(Err(EngineError::RegistrationFailed(reason.clone())));
                }
                self.events.emit(&EngineEvent::RegistrationFailed(reason));
            }
            InboundFrame::Ring { call_id, from, metadata } => {
                let Ok(peer) = Address::parse(from) else {
                    tracing::error!("RING frame carried an invalid peer address");
                    return;
                };
                let controller = self.new_controller(call_id.clone());
                let call = Call::new_inbound(call_id.clone(), peer, metadata, controller);
                self.calls.insert(call_id, call.clone());
                self.events.emit(&EngineEvent::Ring(call));
            }
            InboundFrame::Connected { call_id, to } => {
                if let Some(call) = self.calls.get(&call_id).cloned() {
                    call.set_state(CallState::Active);
                    call.emit(CallEvent::Connected);
                    return;
                }
                let entry = match to.as_deref() {
                    Some(to) => self.take_pending_dial_by_to(to),
                    None => self.pending_dials.pop_front(),
                };
                let Some(entry) = entry else {
                    tracing::warn!(call_id = %call_id, "CONNECTED with no matching pending dial");
                    return;
                };
                let controller = self.new_controller(call_id.clone());
                let call = Call::new_outbound(call_id.clone(), entry.to.clone(), None, controller);
                self.calls.insert(call_id, call.clone());
                let _ = entry.respond.send(Ok(call.clone()));
                call.set_state(CallState::Active);
                call.emit(CallEvent::Connected);
            }
            InboundFrame::Busy { to, reason } => {
                let reason = reason.unwrap_or_else(|| "busy".to_string());
                if let Some(entry) = self.take_pending_dial_by_to(&to) {
                    let _ = entry.respond.send(Err(EngineError::CallFailed(reason)));
                } else {
                    tracing::warn!(%to, "BUSY with no pending dial to match");
                }
            }
            InboundFrame::Msg { call_id, payload } => {
                let Some(call) = self.calls.get(&call_id).cloned() else {
                    tracing::debug!(call_id = %call_id, "MSG for unknown call, dropped");
                    return;
                };
                match MessagePayload::from_wire(payload) {
                    Ok(payload) => {
                        if let MessagePayload::Binary(bytes) = &payload {
                            call.tunnel_push_inbound(bytes.clone());
                        }
                        call.emit(CallEvent::Message(payload));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to decode MSG payload");
                        self.events.emit(&EngineEvent::Error(e));
                    }
                }
            }
            InboundFrame::Hangup { call_id, reason } => {
                if let Some(call) = self.calls.remove(&call_id) {
                    call.set_state(CallState::Ended);
                    call.tunnel_end_from_remote();
                    call.emit(CallEvent::Hangup(reason));
                }
            }
            InboundFrame::HeartbeatAck => {
                self.last_heartbeat_ack = Instant::now();
                tracing::debug!("heartbeat acked");
                self.events.emit(&EngineEvent::HeartbeatAck(SystemTime::now()));
            }
            InboundFrame::Unknown => {
                tracing::debug!("ignoring unknown inbound frame type");
            }
        }
    }

    fn take_pending_dial_by_to(&mut self, to: &str) -> Option<PendingDialEntry> {
        if let Some(pos) = self.pending_dials.iter().position(|e| e.to.as_str() == to) {
            self.pending_dials.remove(pos)
        } else {
            self.pending_dials.pop_front()
        }
    }

    fn new_controller(&self, call_id: String) -> CallController {
        CallController::with_inert_flag(call_id, self.cmd_tx.clone(), self.inert.clone())
    }

    // ---- connection lifecycle ----

    async fn ensure_connected(&mut self) -> Result<()> {
        match self.state {
            SessionState::Connected => return Ok(()),
            SessionState::Connecting => {
                return Err(EngineError::Transport("connection attempt already in flight".into()));
            }
            SessionState::Disconnected => {}
        }
        let url = self
            .urls
            .first()
            .cloned()
            .ok_or_else(|| EngineError::Transport("no urls configured".into()))?;
        self.state = SessionState::Connecting;
        let mut transport = self.transport_factory.create();
        match transport.connect(&url).await {
            Ok(rx) => {
                self.state = SessionState::Connected;
                self.transport = Some(transport);
                self.spawn_forwarder(rx);
                self.current_reconnect_delay = self.options.reconnect_backoff_ms;
                self.start_heartbeat();
                if self.options.register_on_connect {
                    if let Some(request) = self.pinned_registration.clone() {
                        let _ = self.send_register_frame(&request).await;
                    }
                }
                tracing::info!(%url, "transport connected");
                self.events.emit(&EngineEvent::Connected);
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                tracing::warn!(error = %e, "connect attempt failed");
                Err(e)
            }
        }
    }

    fn spawn_forwarder(&mut self, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
        self.connection_generation += 1;
        let generation = self.connection_generation;
        let tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if tx.send(ActorInput::Transport(generation, event)).is_err() {
                    break;
                }
            }
        });
        self.forwarder = Some(handle);
    }

    async fn send_frame(&mut self, frame: OutboundFrame) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(EngineError::Disconnected);
        };
        let json = frame.to_json()?;
        tracing::debug!(frame = ?std::mem::discriminant(&frame), "sending frame");
        transport.send(json).await
    }

    /// Tears down the current transport (if any), stops heartbeat timers,
    /// drains pending registration/dials/calls with a disconnected error,
    /// emits `disconnected`, and schedules a reconnect if policy allows.
    async fn disconnect_cascade(&mut self, code: Option<u16>, reason: Option<String>) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close(code, reason.clone()).await;
        }
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
        self.stop_heartbeat();
        let was_live = self.state != SessionState::Disconnected || !self.calls.is_empty() || !self.pending_dials.is_empty();
        self.state = SessionState::Disconnected;

        for respond in self.registration_inflight.drain(..) {
            let _ = respond.send(Err(EngineError::Disconnected));
        }
        self.registered = false;

        while let Some(entry) = self.pending_dials.pop_front() {
            let _ = entry.respond.send(Err(EngineError::Disconnected));
        }

        for (_, call) in self.calls.drain() {
            if call.state() != CallState::Ended {
                call.set_state(CallState::Ended);
                call.emit(CallEvent::Hangup(Some("disconnected".to_string())));
            }
            call.tunnel_destroy();
        }

        if was_live {
            self.events.emit(&EngineEvent::Disconnected { code, reason });
        }

        if !self.closed && self.options.auto_reconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_generation += 1;
        let generation = self.reconnect_generation;
        let delay = self.current_reconnect_delay;
        let tx = self.internal_tx.clone();
        tracing::info!(delay_ms = delay, "scheduling reconnect");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = tx.send(ActorInput::ReconnectTick(generation));
        });
    }

    async fn handle_reconnect_tick(&mut self, generation: u64) {
        if self.closed || generation != self.reconnect_generation {
            return;
        }
        match self.ensure_connected().await {
            Ok(()) => {}
            Err(_) => {
                self.current_reconnect_delay =
                    (self.current_reconnect_delay.saturating_mul(2)).min(self.options.max_reconnect_backoff_ms);
                self.schedule_reconnect();
            }
        }
    }

    // ---- heartbeat ----

    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();
        if self.options.heartbeat_interval_ms == 0 {
            return;
        }
        self.heartbeat_generation += 1;
        let generation = self.heartbeat_generation;
        let interval_ms = self.options.heartbeat_interval_ms;
        let tx = self.internal_tx.clone();
        self.last_heartbeat_ack = Instant::now();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                interval.tick().await;
                if tx.send(ActorInput::HeartbeatTick(generation)).is_err() {
                    break;
                }
            }
        });
        self.heartbeat_task = Some(handle);
    }

    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat_task.take() {
            handle.abort();
        }
        self.heartbeat_generation += 1;
    }

    async fn handle_heartbeat_tick(&mut self, generation: u64) {
        if generation != self.heartbeat_generation || self.transport.is_none() {
            return;
        }
        if self.send_frame(OutboundFrame::Heartbeat).await.is_err() {
            return;
        }
        tracing::debug!("heartbeat sent");
        let timeout_ms = self.options.heartbeat_timeout_ms;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let _ = tx.send(ActorInput::HeartbeatTimeout(generation));
        });
    }

    async fn handle_heartbeat_timeout(&mut self, generation: u64) {
        if generation != self.heartbeat_generation {
            return;
        }
        let timeout = Duration::from_millis(self.options.heartbeat_timeout_ms);
        if self.last_heartbeat_ack.elapsed() >= timeout {
            tracing::warn!("heartbeat timeout, closing transport");
            self.disconnect_cascade(Some(4000), Some("heartbeat_timeout".to_string())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryExchange;

    fn test_exchange() -> InMemoryExchange {
        InMemoryExchange::new()
    }

    #[tokio::test]
    async fn echo_text_round_trip() {
        let exchange = test_exchange();
        let e1 = SessionEngine::new(
            vec!["memory://exchange".into()],
            exchange.factory(),
            EngineOptions::default(),
        );
        let e2 = SessionEngine::new(
            vec!["memory://exchange".into()],
            exchange.factory(),
            EngineOptions::default(),
        );

        e1.register("alice@example.com", RegisterOptions::default())
            .await
            .unwrap();
        e2.register("bob@example.com", RegisterOptions::default())
            .await
            .unwrap();

        let (ring_tx, ring_rx) = oneshot::channel();
        let ring_tx = std::sync::Mutex::new(Some(ring_tx));
        let _disposer = e1.on_ring(move |call| {
            if let Some(tx) = ring_tx.lock().unwrap().take() {
                let _ = tx.send(call.clone());
            }
        });

        let dial = e2.dial("alice@example.com", DialOptions::default());
        let inbound_call = ring_rx.await.unwrap();
        inbound_call.answer().await.unwrap();
        let outbound_call = dial.await.unwrap();

        let (msg_tx, msg_rx) = oneshot::channel();
        let msg_tx = std::sync::Mutex::new(Some(msg_tx));
        let _msg_disposer = outbound_call.on_message(move |payload| {
            if let MessagePayload::Text(text) = payload {
                if let Some(tx) = msg_tx.lock().unwrap().take() {
                    let _ = tx.send(text.clone());
                }
            }
        });

        let _inbound_msg_disposer = inbound_call.on_message({
            let inbound_call = inbound_call.clone();
            move |payload| {
                if let MessagePayload::Text(text) = payload {
                    let reply = format!("Echo: {text}");
                    let inbound_call = inbound_call.clone();
                    tokio::spawn(async move {
                        let _ = inbound_call.send_text(reply).await;
                    });
                }
            }
        });

        outbound_call.send_text("Hello SystemX").await.unwrap();
        let echoed = msg_rx.await.unwrap();
        assert_eq!(echoed, "Echo: Hello SystemX");

        let (hangup_tx, hangup_rx) = oneshot::channel();
        let hangup_tx = std::sync::Mutex::new(Some(hangup_tx));
        let _hangup_disposer = inbound_call.on_hangup(move |_| {
            if let Some(tx) = hangup_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        });
        outbound_call.hangup(None).await.unwrap();
        hangup_rx.await.unwrap();

        let _ = exchange;
    }

    #[tokio::test]
    async fn busy_rejects_dial() {
        let exchange = test_exchange();
        let e2 = SessionEngine::new(
            vec!["memory://exchange".into()],
            exchange.factory(),
            EngineOptions::default(),
        );
        let err = e2
            .dial("nobody@example.com", DialOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CallFailed(reason) if reason == "offline"));
    }
}
