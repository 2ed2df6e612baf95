//! Simulation harness for Tether protocol testing.
//!
//! In-process implementations of every capability the client is built
//! over: a relay behind the transport traits, a fake cryptographic
//! engine, an in-memory mediating store, and a seeded environment.
//! Tests assemble a whole multi-client world without a network and with
//! reproducible randomness.

pub mod engine;
pub mod mediator;
pub mod relay;
pub mod sim_env;
pub mod world;

pub use engine::FakeEngine;
pub use mediator::{MemoryMediator, MemoryMembership};
pub use relay::SimRelay;
pub use sim_env::SimEnv;
pub use world::{SimWorld, fast_config};
