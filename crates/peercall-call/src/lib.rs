//! # peercall-call
//!
//! Two-party call core for peercall.
//!
//! Architecture:
//! - [`signaling`] encodes and validates the relay wire messages
//! - [`machine::CallMachine`] is the only owner of call state, the negotiation
//!   session and the early-candidate buffer
//! - [`controller`] runs the machine on one task; user commands, relay frames,
//!   engine events and media completions are handled strictly in turn
//! - [`engine::TransportEngine`] is the seam to the real WebRTC stack,
//!   implemented over str0m in [`rtc`]
//! - [`relay`] is the WebSocket link to the signaling relay

pub mod candidate;
pub mod controller;
pub mod engine;
pub mod machine;
pub mod media;
pub mod relay;
pub mod rtc;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use controller::{CallCommand, CallHandle, RelayInput};
pub use engine::{EngineFactory, TransportEngine};
pub use machine::{CallEvent, CallMachine, CallState, MachineIo};
pub use media::{DeclaredMedia, MediaSource};
pub use signaling::SignalMessage;
