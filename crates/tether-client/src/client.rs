//! The constructed client: one identity, one connection, one session
//! tracker, wired together.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;

use tether_core::connection::{ConnectionConfig, ConnectionState};
use tether_core::delivery::{DeliveryConfig, SendOutcome};
use tether_core::env::Environment;
use tether_core::error::{ConnectionError, DeliveryError, InviteError, SessionError};
use tether_core::invite::{InviteId, InviteInfo, MediatorStore, MembershipStore};
use tether_core::queue::OfflineQueue;
use tether_core::session::{EpochState, GroupCryptoEngine, SessionTracker};
use tether_proto::{DeviceId, GroupId, IncomingEnvelope, MsgKind, UserId};

use crate::coordinator::DeliveryCoordinator;
use crate::invite::InviteFlows;
use crate::manager::{ClientEvent, ConnectionManager};
use crate::store::HandledInvites;
use crate::transport::Connector;

/// Any failure surfaced by the client facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Connection-layer failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Delivery-layer failure.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    /// Session-layer failure.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Invite-handshake failure.
    #[error(transparent)]
    Invite(#[from] InviteError),
}

/// Who this client is.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Stable user id.
    pub user_id: UserId,
    /// This installation's device id.
    pub device_id: DeviceId,
}

/// Tunables for one client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection machine configuration.
    pub connection: ConnectionConfig,
    /// Delivery coordinator configuration.
    pub delivery: DeliveryConfig,
    /// Interval between invite poll reads on the joiner side.
    pub invite_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            delivery: DeliveryConfig::default(),
            invite_poll_interval: Duration::from_secs(3),
        }
    }
}

/// External capabilities the client is built over.
///
/// Everything here is a trait object so production and the simulation
/// harness construct the same client from different edges.
pub struct ClientDeps {
    /// Opens framed channels to the relay.
    pub connector: Arc<dyn Connector>,
    /// Opaque group-cryptography engine.
    pub engine: Arc<dyn GroupCryptoEngine>,
    /// Mediating store for the invite handshake.
    pub mediator: Arc<dyn MediatorStore>,
    /// Group membership registry.
    pub membership: Arc<dyn MembershipStore>,
    /// Durable offline queue.
    pub queue: Arc<dyn OfflineQueue>,
    /// Marker store for consumed invites.
    pub handled: Arc<dyn HandledInvites>,
    /// Clock and randomness.
    pub env: Arc<dyn Environment>,
}

/// One group-messaging client.
pub struct TetherClient {
    identity: ClientIdentity,
    manager: Arc<ConnectionManager>,
    delivery: Arc<DeliveryCoordinator>,
    sessions: Arc<SessionTracker>,
    invites: InviteFlows,
    membership: Arc<dyn MembershipStore>,
}

impl TetherClient {
    /// Build the client and spawn its background tasks. Must be called
    /// inside a tokio runtime.
    #[must_use]
    pub fn new(deps: ClientDeps, identity: ClientIdentity, config: ClientConfig) -> Self {
        let manager = Arc::new(ConnectionManager::spawn(
            Arc::clone(&deps.connector),
            Arc::clone(&deps.env),
            config.connection,
        ));
        let delivery = DeliveryCoordinator::spawn(
            Arc::clone(&manager),
            Arc::clone(&deps.queue),
            Arc::clone(&deps.env),
            config.delivery,
            identity.user_id.clone(),
            identity.device_id.clone(),
        );
        let sessions = Arc::new(SessionTracker::new(Arc::clone(&deps.engine)));
        let invites = InviteFlows::new(
            Arc::clone(&deps.mediator),
            Arc::clone(&deps.membership),
            Arc::clone(&sessions),
            Arc::clone(&deps.handled),
            config.invite_poll_interval,
        );

        Self { identity, manager, delivery, sessions, invites, membership: deps.membership }
    }

    /// This client's identity.
    #[must_use]
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// The session tracker, for epoch queries, commits, and recovery
    /// exports.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    /// Connect to the relay at `addr`.
    pub async fn connect(&self, addr: &str) -> Result<(), ClientError> {
        Ok(self.manager.connect(addr).await?)
    }

    /// Disconnect explicitly: cancels suspended sends and unsubscribes.
    pub async fn disconnect(&self) {
        self.delivery.shutdown().await;
        self.manager.disconnect().await;
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.manager.state().await
    }

    /// Subscribe to connection and frame events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.manager.events()
    }

    /// Subscribe to decoded envelope deliveries.
    #[must_use]
    pub fn deliveries(&self) -> broadcast::Receiver<IncomingEnvelope> {
        self.delivery.deliveries()
    }

    /// Subscribe this device to a set of groups.
    pub async fn subscribe(&self, groups: Vec<GroupId>, auth: String) -> Result<(), ClientError> {
        Ok(self.delivery.subscribe(groups, auth).await?)
    }

    /// Encrypt `plaintext` for the group and send it as chat.
    pub async fn send_message(
        &self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<SendOutcome, ClientError> {
        let ciphertext = self.sessions.encrypt(group_id, plaintext).await?;
        Ok(self.delivery.send(group_id.clone(), MsgKind::Chat, ciphertext).await?)
    }

    /// Send a pre-built payload of any kind (control traffic, handshake
    /// artifacts).
    pub async fn send_raw(
        &self,
        group_id: GroupId,
        kind: MsgKind,
        ciphertext: Vec<u8>,
    ) -> Result<SendOutcome, ClientError> {
        Ok(self.delivery.send(group_id, kind, ciphertext).await?)
    }

    /// Decrypt a delivered chat envelope.
    pub async fn open_message(
        &self,
        envelope: &IncomingEnvelope,
    ) -> Result<Vec<u8>, ClientError> {
        Ok(self.sessions.decrypt(&envelope.group_id, &envelope.ciphertext).await?)
    }

    /// Drain the offline queue; returns how many envelopes were
    /// acknowledged.
    pub async fn sync_offline(&self) -> Result<usize, ClientError> {
        Ok(self.delivery.sync_offline().await?)
    }

    /// Create a new group with this client as the only member.
    pub async fn create_group(&self, group_id: &GroupId) -> Result<EpochState, ClientError> {
        let state = self.sessions.create_session(group_id).await?;
        self.membership
            .register(group_id, &self.identity.user_id, &self.identity.device_id)
            .await
            .map_err(|e| ClientError::Invite(InviteError::Store(e.0)))?;
        Ok(state)
    }

    /// Members of a group as recorded in the membership registry.
    pub async fn members(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<(UserId, DeviceId)>, ClientError> {
        self.membership
            .members(group_id)
            .await
            .map_err(|e| ClientError::Invite(InviteError::Store(e.0)))
    }

    /// Inviter: create an invite for a group.
    pub async fn create_invite(
        &self,
        group_id: &GroupId,
        group_name: &str,
    ) -> Result<InviteId, ClientError> {
        Ok(self.invites.create_invite(group_id, group_name, &self.identity.user_id).await?)
    }

    /// Inviter: welcome every joiner whose key package is waiting.
    pub async fn complete_pending_invites(&self) -> Result<usize, ClientError> {
        Ok(self.invites.complete_pending_invites(&self.identity.user_id).await?)
    }

    /// Joiner: preview an invite before joining.
    pub async fn invite_info(&self, id: &InviteId) -> Result<InviteInfo, ClientError> {
        Ok(self.invites.invite_info(id).await?)
    }

    /// Joiner: run the whole join flow for one invite.
    pub async fn join_via_invite(&self, id: &InviteId) -> Result<GroupId, ClientError> {
        Ok(self
            .invites
            .join_via_invite(id, &self.identity.user_id, &self.identity.device_id)
            .await?)
    }

    /// Joiner: resume a join whose key package was already submitted.
    pub async fn resume_join(&self, id: &InviteId) -> Result<GroupId, ClientError> {
        Ok(self
            .invites
            .resume_join(id, &self.identity.user_id, &self.identity.device_id)
            .await?)
    }
}
