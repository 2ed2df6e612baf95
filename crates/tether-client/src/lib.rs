//! Tokio runtime layer for the Tether delivery protocol.
//!
//! The `tether-core` machines are pure; this crate gives them a life:
//! tasks, timers, sockets, and files. The split keeps every protocol
//! decision testable without I/O while this crate stays a thin driver.
//!
//! # Components
//!
//! - [`client`]: The constructed [`client::TetherClient`]
//! - [`manager`]: Supervisor task around the connection machine
//! - [`coordinator`]: Suspension points over the delivery machine
//! - [`transport`]: Connector traits and the line-JSON channel codec
//! - [`store`]: File-backed queue and handled-invite markers
//! - [`invite`]: Inviter and joiner handshake flows
//! - [`mod@env`]: Production clock and randomness

pub mod client;
pub mod coordinator;
pub mod env;
pub mod invite;
pub mod manager;
pub mod store;
pub mod transport;

pub use client::{ClientConfig, ClientDeps, ClientError, ClientIdentity, TetherClient};
pub use manager::ClientEvent;
