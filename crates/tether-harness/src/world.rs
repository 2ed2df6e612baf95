//! One simulated world: a relay, a mediating store, and clients.

use std::sync::Arc;
use std::time::Duration;

use tether_client::{ClientConfig, ClientDeps, ClientIdentity, TetherClient};
use tether_client::store::MemoryHandled;
use tether_core::connection::ConnectionConfig;
use tether_core::delivery::DeliveryConfig;
use tether_core::queue::{MemoryQueue, OfflineQueue};
use tether_proto::{DeviceId, UserId};

use crate::engine::FakeEngine;
use crate::mediator::{MemoryMediator, MemoryMembership};
use crate::relay::SimRelay;
use crate::sim_env::SimEnv;

/// Timeouts shrunk so protocol corners are reachable in milliseconds.
#[must_use]
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        connection: ConnectionConfig {
            connect_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            base_reconnect_delay: Duration::from_millis(50),
            max_reconnect_delay: Duration::from_millis(400),
            max_reconnect_attempts: None,
            reconnect_jitter: Duration::from_millis(10),
        },
        delivery: DeliveryConfig {
            ack_timeout: Duration::from_millis(300),
            subscribe_timeout: Duration::from_millis(300),
        },
        invite_poll_interval: Duration::from_millis(50),
    }
}

/// Shared infrastructure for one multi-client test.
pub struct SimWorld {
    /// The simulated relay every client dials.
    pub relay: SimRelay,
    /// Mediating store for the invite handshake.
    pub mediator: Arc<MemoryMediator>,
    /// Shared membership registry.
    pub membership: Arc<MemoryMembership>,
    /// Seeded environment shared by all clients.
    pub env: Arc<SimEnv>,
}

impl SimWorld {
    /// Build a world with an invite TTL of one minute of simulated wall
    /// time.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_invite_ttl(seed, Some(60_000))
    }

    /// Build a world with an explicit invite TTL.
    #[must_use]
    pub fn with_invite_ttl(seed: u64, ttl_ms: Option<u64>) -> Self {
        let env = Arc::new(SimEnv::new(seed));
        Self {
            relay: SimRelay::new(),
            mediator: Arc::new(MemoryMediator::new(env.clone(), ttl_ms)),
            membership: Arc::new(MemoryMembership::new()),
            env,
        }
    }

    /// Spawn a client with an in-memory queue. Returns the client and
    /// its engine so tests can reach the engine's fault knobs.
    #[must_use]
    pub fn client(&self, user: &str, device: &str) -> (TetherClient, Arc<FakeEngine>) {
        self.client_with_queue(user, device, Arc::new(MemoryQueue::new()))
    }

    /// Spawn a client over a caller-provided queue (e.g. a file-backed
    /// queue whose contents should survive the client).
    #[must_use]
    pub fn client_with_queue(
        &self,
        user: &str,
        device: &str,
        queue: Arc<dyn OfflineQueue>,
    ) -> (TetherClient, Arc<FakeEngine>) {
        let engine = Arc::new(FakeEngine::new());
        let deps = ClientDeps {
            connector: Arc::new(self.relay.clone()),
            engine: engine.clone(),
            mediator: self.mediator.clone(),
            membership: self.membership.clone(),
            queue,
            handled: Arc::new(MemoryHandled::new()),
            env: self.env.clone(),
        };
        let identity =
            ClientIdentity { user_id: UserId::from(user), device_id: DeviceId::from(device) };
        (TetherClient::new(deps, identity, fast_config()), engine)
    }
}
