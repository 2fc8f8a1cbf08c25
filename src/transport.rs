//! The transport abstraction seam (spec §3).
//!
//! A [`Transport`] is a single duplex connection to an Exchange endpoint.
//! The engine never speaks WebSocket, TCP, or any other wire protocol
//! directly — it drives whatever implements this trait. The default
//! production implementation (WebSocket) lives outside this crate's test
//! surface; this module defines only the contract and the event types the
//! engine demultiplexes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// A single frame of text received from the far end of a transport.
///
/// The Exchange wire protocol is JSON-over-text; a `Frame` is one complete
/// JSON document, already stripped of whatever framing the underlying
/// transport uses (WebSocket message boundaries, length-prefixing, etc).
pub type Frame = String;

/// Lifecycle and data events a [`Transport`] reports back to its owner.
///
/// The engine owns a single `mpsc::UnboundedReceiver<TransportEvent>` at a
/// time; on reconnect the old receiver (and the half-open transport behind
/// it) is dropped wholesale and replaced, so a stale event can never be
/// observed after its transport has been superseded.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete frame arrived.
    Message(Frame),
    /// The transport reported an error but has not necessarily closed.
    Error(String),
    /// The transport closed, cleanly or otherwise.
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// The state a [`Transport`] reports itself to be in.
///
/// Mirrors the connection's own understanding of its lifecycle; the engine
/// keeps its own, richer [`crate::engine::EngineState`] independently and
/// does not infer engine state from this alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Connecting,
    Open,
    Closed,
}

/// A duplex connection to an Exchange endpoint.
///
/// Implementations drive their own background I/O (e.g. a read loop
/// spawned in [`Transport::connect`]) and report everything that happens
/// on that connection through the returned event channel; [`Transport::send`]
/// and [`Transport::close`] are the only calls made back into the
/// implementation from the engine's actor loop.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection and begin streaming events.
    ///
    /// Returns a receiver that yields every [`TransportEvent`] for this
    /// connection attempt, including its eventual [`TransportEvent::Closed`].
    /// A failed connection attempt should return `Err` rather than a
    /// receiver that immediately yields `Closed`.
    async fn connect(&mut self, url: &str) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Send one complete frame.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Close the connection, releasing any underlying resources.
    ///
    /// Idempotent: closing an already-closed transport is not an error.
    /// `code`/`reason` are advisory close metadata (e.g. a WebSocket close
    /// frame); implementations that cannot carry them may ignore both.
    async fn close(&mut self, code: Option<u16>, reason: Option<String>) -> Result<()>;

    /// Current reported state, for diagnostics.
    fn state(&self) -> TransportState;

    /// Human-readable name for logging (e.g. `"websocket"`).
    fn name(&self) -> &'static str;
}

/// Constructs a fresh [`Transport`] instance for each connection attempt.
///
/// The engine calls [`TransportFactory::create`] once per connect/reconnect
/// cycle rather than reusing a single `Transport` object, so a transport
/// implementation never needs to support being reconnected in place.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}

/// Adapts a plain closure into a [`TransportFactory`].
///
/// Lets callers supply `EngineOptions::transport_factory` as
/// `Box::new(FnTransportFactory::new(|| Box::new(MyTransport::new())))`
/// instead of defining a one-off unit struct.
pub struct FnTransportFactory<F>(F)
where
    F: Fn() -> Box<dyn Transport> + Send + Sync;

impl<F> FnTransportFactory<F>
where
    F: Fn() -> Box<dyn Transport> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> TransportFactory for FnTransportFactory<F>
where
    F: Fn() -> Box<dyn Transport> + Send + Sync,
{
    fn create(&self) -> Box<dyn Transport> {
        (self.0)()
    }
}
