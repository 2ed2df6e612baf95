//! Wire format for the Tether delivery protocol.
//!
//! Each directional message between a client and the relay is one
//! JSON-typed record, discriminated by a `type` field. The payload a
//! record carries is opaque ciphertext produced by the cryptographic
//! engine; this crate never looks inside it.
//!
//! Every wire record is modeled as one variant of [`WireMessage`] so the
//! dispatch boundary can match exhaustively instead of sniffing dynamic
//! fields.

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod wire;

pub use envelope::{IncomingEnvelope, MsgKind, OutgoingEnvelope, QueuedMessage};
pub use errors::ProtocolError;
pub use ids::{DeviceId, GroupId, UserId};
pub use wire::{ErrorContext, WireMessage};
