//! # Exchange Client
//!
//! A client session engine for an address-addressed call-routing service
//! (the "Exchange"): named endpoints register at an address, dial other
//! addresses, accept inbound calls, exchange typed messages, and tunnel
//! byte-oriented streams through a call.
//!
//! The engine never speaks a wire protocol directly; it drives whatever
//! [`transport::Transport`] implementation it is given. [`testing`]
//! provides an in-memory Exchange double for exercising the full engine
//! without a real server.

pub mod address;
pub mod call;
pub mod codec;
pub mod engine;
pub mod error;
pub mod listener;
pub mod process_tunnel;
pub mod testing;
pub mod transport;
pub mod tunnel;

pub use address::Address;
pub use call::{Call, CallDirection, CallEvent, CallState};
pub use codec::MessagePayload;
pub use engine::{
    ConcurrencyMode, DialOptions, EngineEvent, EngineOptions, RegisterOptions, RegistrationRequest, SessionEngine,
};
pub use error::{EngineError, Result};
pub use listener::Disposer;
pub use process_tunnel::{Process, TunnelHandle, TunnelOptions};
pub use transport::{Transport, TransportEvent, TransportFactory, TransportState};
pub use tunnel::TunnelStream;

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
