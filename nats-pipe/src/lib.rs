//! Chunked request/reply protocol over NATS.
//!
//! `nats-pipe` carries logical request/reply operations whose payloads may
//! exceed the bus's per-message cap:
//!
//! - **Message**: framing with stable `X-RNS-*` headers (transaction id,
//!   operation, chunk count, transfer subject, chunk sequence)
//! - **Chunk engine**: split oversized payloads into a negotiated
//!   side-channel of acknowledged chunk messages and reassemble them in
//!   order under a cancellable wait
//! - **Commands**: typed request/reply schemas for the seven repository
//!   operations, paired at compile time
//! - **Bus**: the transport seam, with a NATS implementation for
//!   production and an in-process implementation for tests

pub mod bus;
pub mod chunk;
pub mod command;
pub mod message;

pub use bus::{Bus, BusError, MemoryBus, NatsBus, PendingLimits, Subscription};
pub use chunk::{read_message, send_reply, send_request, ProtocolError, MAX_CHUNK_SIZE, MIN_MAX_PAYLOAD};
pub use command::{command_subject, Command};
pub use message::{copy_protocol_headers, new_id, Headers, Message};
