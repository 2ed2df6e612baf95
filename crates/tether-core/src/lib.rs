//! Tether delivery-layer core logic
//!
//! Pure state machine logic for keeping a group-messaging session alive
//! and consistent over an unreliable network, completely decoupled from
//! I/O. The cryptographic engine that owns confidentiality and integrity
//! is consumed as an opaque capability behind a trait.
//!
//! # Architecture
//!
//! State machines in this crate are deterministic and isolated from
//! time, randomness, and scheduling. Time is passed as a parameter;
//! jitter is supplied by the caller through the [`env::Environment`]
//! abstraction.
//!
//! State transitions produce declarative actions that describe intended
//! effects rather than executing them directly. A runtime (the
//! `tether-client` crate) or a test executes these actions, which keeps
//! protocol correctness independent of execution concerns.
//!
//! # Components
//!
//! - [`connection`]: Connection state machine (dial, heartbeat, backoff)
//! - [`delivery`]: Acknowledged send, dedup, subscription replay
//! - [`queue`]: Durable offline queue abstraction
//! - [`session`]: Per-group cryptographic epoch bookkeeping
//! - [`invite`]: Two-party invite/join handshake over a mediating store
//! - [`mod@env`]: Environment abstraction (time, jitter)
//! - [`error`]: Error taxonomy

pub mod connection;
pub mod delivery;
pub mod env;
pub mod error;
pub mod invite;
pub mod queue;
pub mod session;
