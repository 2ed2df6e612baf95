//! Asynchronous two-party invite/join handshake.
//!
//! The inviter and the joiner never talk directly: the joiner is not a
//! group member yet and cannot use the group's own channel, so both
//! sides communicate through a mediating store they poll.
//!
//! ```text
//!   pending ──(joiner submits key package)──> kp_submitted
//!   kp_submitted ──(inviter submits welcome)──> complete
//!   any ──(expiry timestamp passes)──> expired   (dead end)
//! ```
//!
//! The transition rules live on [`InviteRecord`] so that every store
//! implementation enforces the same structure: one key-package
//! submission, accepted only from `pending`; one welcome submission,
//! accepted only from `kp_submitted` and only by the original inviter;
//! expiry checked on every read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tether_proto::{DeviceId, GroupId, UserId};

use crate::error::{InviteError, MembershipError};

/// Unique id of one invite record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InviteId(pub String);

impl InviteId {
    /// Wrap a raw id string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl std::fmt::Display for InviteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of an invite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteStatus {
    /// Created, waiting for a joiner.
    Pending,
    /// A joiner submitted their key package.
    KpSubmitted,
    /// The inviter submitted the welcome; the joiner can finish.
    Complete,
    /// Expiry passed. No resurrection.
    Expired,
}

/// One invite record held by the mediating store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRecord {
    /// Unique id, shared out-of-band (e.g. a link).
    pub id: InviteId,
    /// Group the invite admits into.
    pub group_id: GroupId,
    /// Display name shown to the joiner before they commit to joining.
    pub group_name: String,
    /// Who created the invite.
    pub inviter_id: UserId,
    /// Who submitted the key package, once someone has.
    pub joiner_id: Option<UserId>,
    /// Stored lifecycle status (expiry is computed on read, not
    /// persisted back).
    pub status: InviteStatus,
    /// The joiner's one-time key package artifact.
    pub key_package: Option<Vec<u8>>,
    /// The inviter's welcome artifact.
    pub welcome: Option<Vec<u8>>,
    /// Expiry in unix milliseconds; `None` never expires.
    pub expires_at: Option<u64>,
}

impl InviteRecord {
    /// Status as observed at `now_ms`, folding in expiry.
    #[must_use]
    pub fn effective_status(&self, now_ms: u64) -> InviteStatus {
        if self.expires_at.is_some_and(|at| now_ms >= at) {
            InviteStatus::Expired
        } else {
            self.status
        }
    }

    /// Joiner submits their key package. Single allowed transition:
    /// `pending -> kp_submitted`; anything else is rejected.
    pub fn submit_key_package(
        &mut self,
        joiner: &UserId,
        key_package: Vec<u8>,
        now_ms: u64,
    ) -> Result<(), InviteError> {
        match self.effective_status(now_ms) {
            InviteStatus::Expired => Err(InviteError::Expired),
            InviteStatus::Pending => {
                self.status = InviteStatus::KpSubmitted;
                self.joiner_id = Some(joiner.clone());
                self.key_package = Some(key_package);
                Ok(())
            },
            InviteStatus::KpSubmitted | InviteStatus::Complete => Err(InviteError::NotPending),
        }
    }

    /// Inviter submits the welcome. Only valid from `kp_submitted` and
    /// only by the original inviter.
    pub fn submit_welcome(
        &mut self,
        inviter: &UserId,
        welcome: Vec<u8>,
        now_ms: u64,
    ) -> Result<(), InviteError> {
        if self.effective_status(now_ms) == InviteStatus::Expired {
            return Err(InviteError::Expired);
        }
        if &self.inviter_id != inviter {
            return Err(InviteError::NotAuthorized);
        }
        match self.status {
            InviteStatus::KpSubmitted => {
                self.status = InviteStatus::Complete;
                self.welcome = Some(welcome);
                Ok(())
            },
            _ => Err(InviteError::NotAwaitingWelcome),
        }
    }
}

/// What a prospective joiner sees before submitting anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteInfo {
    /// Group display name.
    pub group_name: String,
    /// Effective status at read time.
    pub status: InviteStatus,
    /// Convenience flag: `status == Expired`.
    pub expired: bool,
}

/// One poll response for the joiner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitePoll {
    /// Effective status at read time.
    pub status: InviteStatus,
    /// The welcome artifact, present once `status` is `Complete`.
    pub welcome: Option<Vec<u8>>,
    /// Group the invite admits into.
    pub group_id: GroupId,
}

/// The mediating store both parties talk through.
///
/// The store enforces expiry and transition validity server-side; the
/// [`InviteRecord`] methods define what "valid" means. First writer
/// wins on concurrent key-package submissions; this protocol adds no
/// extra exclusivity check.
#[async_trait]
pub trait MediatorStore: Send + Sync {
    /// Create a `pending` invite and return its id.
    async fn create_invite(
        &self,
        group_id: &GroupId,
        group_name: &str,
        inviter: &UserId,
    ) -> Result<InviteId, InviteError>;

    /// Read invite metadata (pre-join view).
    async fn invite_info(&self, id: &InviteId) -> Result<InviteInfo, InviteError>;

    /// Joiner submits their key package.
    async fn submit_key_package(
        &self,
        id: &InviteId,
        joiner: &UserId,
        key_package: Vec<u8>,
    ) -> Result<(), InviteError>;

    /// Joiner polls for completion. Restricted to the recorded joiner.
    async fn poll_invite(&self, id: &InviteId, joiner: &UserId)
    -> Result<InvitePoll, InviteError>;

    /// Inviter submits the welcome artifact.
    async fn submit_welcome(
        &self,
        id: &InviteId,
        inviter: &UserId,
        welcome: Vec<u8>,
    ) -> Result<(), InviteError>;

    /// Invites owned by this inviter that are waiting for a welcome.
    async fn awaiting_welcome(&self, inviter: &UserId) -> Result<Vec<InviteRecord>, InviteError>;
}

/// Group membership registry, updated by the joiner after a processed
/// welcome and read by anyone rendering the member list.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Register a (user, device) as a member of a group.
    async fn register(
        &self,
        group_id: &GroupId,
        user: &UserId,
        device: &DeviceId,
    ) -> Result<(), MembershipError>;

    /// All members of a group.
    async fn members(&self, group_id: &GroupId)
    -> Result<Vec<(UserId, DeviceId)>, MembershipError>;

    /// Remove a (user, device) from a group.
    async fn remove(
        &self,
        group_id: &GroupId,
        user: &UserId,
        device: &DeviceId,
    ) -> Result<(), MembershipError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> InviteRecord {
        InviteRecord {
            id: InviteId::new("i1"),
            group_id: GroupId::from("g1"),
            group_name: "ops".to_string(),
            inviter_id: UserId::from("alice"),
            joiner_id: None,
            status: InviteStatus::Pending,
            key_package: None,
            welcome: None,
            expires_at: Some(1_000),
        }
    }

    #[test]
    fn happy_path_transitions() {
        let mut r = record();
        let joiner = UserId::from("bob");

        r.submit_key_package(&joiner, vec![1], 10).unwrap();
        assert_eq!(r.status, InviteStatus::KpSubmitted);
        assert_eq!(r.joiner_id, Some(joiner));

        r.submit_welcome(&UserId::from("alice"), vec![2], 20).unwrap();
        assert_eq!(r.status, InviteStatus::Complete);
        assert_eq!(r.welcome, Some(vec![2]));
    }

    #[test]
    fn second_key_package_is_rejected() {
        let mut r = record();
        r.submit_key_package(&UserId::from("bob"), vec![1], 10).unwrap();
        let err = r.submit_key_package(&UserId::from("carol"), vec![2], 11).unwrap_err();
        assert_eq!(err, InviteError::NotPending);
        // First writer kept.
        assert_eq!(r.joiner_id, Some(UserId::from("bob")));
    }

    #[test]
    fn welcome_requires_kp_submitted_and_inviter() {
        let mut r = record();
        assert_eq!(
            r.submit_welcome(&UserId::from("alice"), vec![1], 10).unwrap_err(),
            InviteError::NotAwaitingWelcome
        );

        r.submit_key_package(&UserId::from("bob"), vec![1], 10).unwrap();
        assert_eq!(
            r.submit_welcome(&UserId::from("mallory"), vec![2], 11).unwrap_err(),
            InviteError::NotAuthorized
        );

        r.submit_welcome(&UserId::from("alice"), vec![2], 12).unwrap();
        assert_eq!(
            r.submit_welcome(&UserId::from("alice"), vec![3], 13).unwrap_err(),
            InviteError::NotAwaitingWelcome
        );
    }

    #[test]
    fn expired_rejects_everything() {
        let mut r = record();
        assert_eq!(r.effective_status(999), InviteStatus::Pending);
        assert_eq!(r.effective_status(1_000), InviteStatus::Expired);

        assert_eq!(
            r.submit_key_package(&UserId::from("bob"), vec![1], 1_001).unwrap_err(),
            InviteError::Expired
        );

        r.status = InviteStatus::KpSubmitted;
        assert_eq!(
            r.submit_welcome(&UserId::from("alice"), vec![1], 1_001).unwrap_err(),
            InviteError::Expired
        );
    }
}
