//! Error taxonomy for the delivery and session-sync layer.
//!
//! Transient network failures (ack timeout, connection drop) are
//! recovered locally and surface only as a queued/pending status.
//! Permanent protocol violations (rejected send, epoch mismatch, invalid
//! invite transition) are surfaced immediately and never retried by this
//! layer.

use thiserror::Error;

use tether_proto::GroupId;

/// Failures of the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The dial attempt did not complete within the connect timeout.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// The underlying channel reported a fatal error.
    #[error("channel error: {0}")]
    Channel(String),

    /// The configured maximum number of reconnect attempts was reached.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    RetriesExhausted {
        /// How many attempts were made before giving up.
        attempts: u32,
    },

    /// The connection was closed while an operation was in flight.
    #[error("connection closed")]
    Closed,
}

/// Failures of the delivery coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Operation requires a live connection.
    #[error("not connected to the relay")]
    NotConnected,

    /// The relay did not confirm the subscribe request in time.
    #[error("subscribe confirmation timed out")]
    SubscribeTimeout,

    /// The relay rejected the subscribe request.
    #[error("subscribe rejected: {0}")]
    SubscribeRejected(String),

    /// No acknowledgment arrived within the ack timeout window.
    ///
    /// Recoverable: the envelope has already been persisted to the
    /// offline queue for retry when this error is reported.
    #[error("no acknowledgment within the timeout window (queued for retry)")]
    AckTimeout,

    /// The relay permanently rejected the send (e.g. not a member).
    /// Never queued for retry.
    #[error("send rejected: {0}")]
    SendRejected(String),

    /// The operation was cancelled by an explicit disconnect.
    #[error("cancelled by disconnect")]
    Cancelled,

    /// The durable queue failed.
    #[error("offline queue: {0}")]
    Queue(String),
}

/// Failures of the group session tracker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No session has been established for this group.
    #[error("no session for group {0}")]
    UnknownGroup(GroupId),

    /// The authenticator reported by the engine for a new epoch does not
    /// match the expected value. Fatal for the affected group: the
    /// session must be re-derived from a trusted export.
    #[error("epoch authenticator mismatch for group {group} at epoch {epoch}")]
    EpochAuthenticatorMismatch {
        /// Affected group.
        group: GroupId,
        /// Epoch at which verification failed.
        epoch: u64,
    },

    /// Commit requested while no proposals are pending.
    #[error("no pending proposals to commit")]
    NoProposals,

    /// The group was poisoned by an earlier authenticator mismatch and
    /// must be re-imported before further use.
    #[error("group {0} is unusable until resynchronized from a trusted export")]
    Poisoned(GroupId),

    /// The opaque cryptographic engine failed.
    #[error("crypto engine: {0}")]
    Engine(String),
}

/// Failures of the invite handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InviteError {
    /// The invite's expiry timestamp has passed. Dead end.
    #[error("invite has expired")]
    Expired,

    /// A key package was submitted to a non-`pending` invite.
    #[error("invite is not pending")]
    NotPending,

    /// A welcome was submitted from an invalid state, or the invite is
    /// already complete from the joiner's perspective.
    #[error("invite is not awaiting a welcome")]
    NotAwaitingWelcome,

    /// The caller is not the party allowed to perform this transition.
    #[error("not authorized for this invite")]
    NotAuthorized,

    /// No invite exists under this id.
    #[error("invite not found: {0}")]
    NotFound(String),

    /// The mediating store failed.
    #[error("mediator store: {0}")]
    Store(String),

    /// A session-layer failure while producing or consuming artifacts.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Failure of the membership store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("membership store: {0}")]
pub struct MembershipError(pub String);
