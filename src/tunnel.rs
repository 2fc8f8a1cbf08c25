//! Byte-oriented duplex stream layered on top of a call (spec §4.3).
//!
//! A `TunnelStream` is the one byte-duplex contract this crate provides —
//! the host-native/web-stream split of the source system collapses here
//! into a single implementation, consistent with design note 9's directive
//! to pick one contract rather than carry the split forward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};

use crate::call::CallController;
use crate::error::{EngineError, Result};

/// Outstanding inbound buffer capacity before a pushed chunk is dropped
/// with a logged warning rather than grown without bound.
const INBOUND_HIGH_WATERMARK: usize = 256;

/// Outstanding unacknowledged writes before `write()` stalls.
const WRITE_HIGH_WATERMARK: usize = 32;

enum InboundSignal {
    Data(Vec<u8>),
    End,
}

struct Shared {
    call_id: String,
    controller: CallController,
    write_permits: Arc<Semaphore>,
    inbound_tx: mpsc::UnboundedSender<InboundSignal>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<InboundSignal>>,
    inbound_depth: std::sync::atomic::AtomicUsize,
    ended_local: AtomicBool,
    ended_remote: AtomicBool,
    /// Set once `read()` has actually drained the terminal signal, so every
    /// subsequent call returns `None` immediately instead of waiting on a
    /// channel nothing will ever send on again.
    read_ended: AtomicBool,
    destroyed: AtomicBool,
}

/// A byte-duplex handle anchored to one call id.
///
/// Cloning shares the same underlying buffers and write-permit pool; this
/// is what lets [`crate::call::Call::get_stream`] be called more than once
/// and still observe the one lazily-created stream (spec §4.5: "created
/// lazily on first getStream").
#[derive(Clone)]
pub struct TunnelStream {
    shared: Arc<Shared>,
}

impl TunnelStream {
    pub(crate) fn new(call_id: String, controller: CallController) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                call_id,
                controller,
                write_permits: Arc::new(Semaphore::new(WRITE_HIGH_WATERMARK)),
                inbound_tx,
                inbound_rx: AsyncMutex::new(inbound_rx),
                inbound_depth: std::sync::atomic::AtomicUsize::new(0),
                ended_local: AtomicBool::new(false),
                ended_remote: AtomicBool::new(false),
                read_ended: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Write a chunk, framed and sent as a binary `MSG` by the engine.
    ///
    /// Suspends while `WRITE_HIGH_WATERMARK` writes are outstanding
    /// (backpressure); fails immediately with
    /// [`EngineError::Disconnected`] once the stream has been destroyed.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(EngineError::Disconnected);
        }
        let permit = self
            .shared
            .write_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Disconnected)?;
        let result = self
            .shared
            .controller
            .tunnel_write(self.shared.call_id.clone(), bytes)
            .await;
        drop(permit);
        result
    }

    /// Read the next chunk, or `None` once end-of-stream has been signaled.
    ///
    /// Only meant to be driven by a single reader at a time (the process
    /// tunnel adapter, or direct user code) — concurrent readers would
    /// race for chunks rather than each seeing every byte.
    pub async fn read(&self) -> Option<Vec<u8>> {
        if self.shared.read_ended.load(Ordering::SeqCst) {
            return None;
        }
        let mut rx = self.shared.inbound_rx.lock().await;
        match rx.recv().await {
            Some(InboundSignal::Data(bytes)) => {
                self.shared.inbound_depth.fetch_sub(1, Ordering::SeqCst);
                Some(bytes)
            }
            Some(InboundSignal::End) | None => {
                self.shared.read_ended.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    pub fn call_id(&self) -> &str {
        &self.shared.call_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Invoked by the engine when an inbound binary `MSG` arrives for this
    /// call. Enqueues unconditionally below the watermark; beyond it, the
    /// chunk is dropped (advisory backpressure per spec §4.3 — the
    /// transport itself is not per-call flow-controlled).
    pub(crate) fn push_inbound(&self, bytes: Vec<u8>) {
        if self.shared.destroyed.load(Ordering::SeqCst) || self.shared.ended_remote.load(Ordering::SeqCst) {
            return;
        }
        let depth = self.shared.inbound_depth.fetch_add(1, Ordering::SeqCst);
        if depth >= INBOUND_HIGH_WATERMARK {
            tracing::warn!(call_id = %self.shared.call_id, "tunnel inbound backpressure, dropping chunk");
            self.shared.inbound_depth.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        let _ = self.shared.inbound_tx.send(InboundSignal::Data(bytes));
    }

    /// Signal end-of-stream on the readable side. Idempotent.
    pub(crate) fn end_from_remote(&self) {
        if self.shared.ended_remote.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.inbound_tx.send(InboundSignal::End);
    }

    /// Terminate both halves. Idempotent.
    pub(crate) fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.end_from_remote();
    }
}
