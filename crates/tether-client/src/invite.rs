//! Inviter and joiner sides of the asynchronous invite handshake.
//!
//! Both sides only ever talk to the mediating store. The joiner side is
//! a bounded poll loop: it terminates when the invite completes or
//! expires, never on a tick count. The inviter side is a sweep the
//! client calls whenever it comes online, welcoming every joiner whose
//! key package arrived while the inviter was away.

use std::sync::Arc;
use std::time::Duration;

use tether_core::error::{InviteError, SessionError};
use tether_core::invite::{InviteId, InviteStatus, MediatorStore, MembershipStore};
use tether_core::session::SessionTracker;
use tether_proto::{DeviceId, GroupId, UserId};

use crate::store::HandledInvites;

/// Invite orchestration over one mediating store.
pub struct InviteFlows {
    mediator: Arc<dyn MediatorStore>,
    membership: Arc<dyn MembershipStore>,
    sessions: Arc<SessionTracker>,
    handled: Arc<dyn HandledInvites>,
    poll_interval: Duration,
}

impl InviteFlows {
    /// Wire the flows to their collaborators.
    pub fn new(
        mediator: Arc<dyn MediatorStore>,
        membership: Arc<dyn MembershipStore>,
        sessions: Arc<SessionTracker>,
        handled: Arc<dyn HandledInvites>,
        poll_interval: Duration,
    ) -> Self {
        Self { mediator, membership, sessions, handled, poll_interval }
    }

    /// Inviter: create a `pending` invite for a group this client owns a
    /// session for. The returned id is shared out-of-band.
    pub async fn create_invite(
        &self,
        group_id: &GroupId,
        group_name: &str,
        inviter: &UserId,
    ) -> Result<InviteId, InviteError> {
        let id = self.mediator.create_invite(group_id, group_name, inviter).await?;
        tracing::info!(invite = %id, group = %group_id, "invite created");
        Ok(id)
    }

    /// Inviter: welcome every joiner whose key package is waiting.
    ///
    /// Each invite in `kp_submitted` gets an add-member commit and its
    /// welcome goes back through the store. Returns how many invites
    /// were completed; an invite that fails is skipped so one bad key
    /// package cannot starve the others.
    pub async fn complete_pending_invites(
        &self,
        inviter: &UserId,
    ) -> Result<usize, InviteError> {
        let waiting = self.mediator.awaiting_welcome(inviter).await?;
        let mut completed = 0;

        for record in waiting {
            let Some(key_package) = record.key_package.as_deref() else {
                continue;
            };
            let welcome = match self.sessions.add_member(&record.group_id, key_package).await {
                Ok(welcome) => welcome,
                Err(e) => {
                    tracing::warn!(invite = %record.id, error = %e, "add_member failed");
                    continue;
                },
            };
            match self.mediator.submit_welcome(&record.id, inviter, welcome).await {
                Ok(()) => {
                    tracing::info!(invite = %record.id, group = %record.group_id, "invite completed");
                    completed += 1;
                },
                Err(e) => {
                    tracing::warn!(invite = %record.id, error = %e, "welcome submission failed");
                },
            }
        }
        Ok(completed)
    }

    /// Joiner: run the whole join flow for one invite.
    ///
    /// Checks the invite is still joinable, submits a fresh key package,
    /// then polls until the inviter's welcome lands or the invite
    /// expires. Processing the welcome is idempotent: an invite already
    /// marked handled (say, after a crash between processing and
    /// registration on a previous run) is not processed twice.
    pub async fn join_via_invite(
        &self,
        id: &InviteId,
        joiner: &UserId,
        device: &DeviceId,
    ) -> Result<GroupId, InviteError> {
        let info = self.mediator.invite_info(id).await?;
        if info.expired {
            return Err(InviteError::Expired);
        }
        if info.status != InviteStatus::Pending {
            return Err(InviteError::NotPending);
        }

        let key_package = self
            .sessions
            .engine()
            .generate_key_package()
            .await
            .map_err(SessionError::from)?;
        self.mediator.submit_key_package(id, joiner, key_package).await?;
        tracing::info!(invite = %id, "key package submitted, waiting for welcome");

        self.poll_until_complete(id, joiner, device).await
    }

    /// Joiner: resume polling an invite whose key package was already
    /// submitted, e.g. after a restart mid-join. Safe to call after a
    /// completed join: the handled marker short-circuits before any
    /// welcome is reprocessed.
    pub async fn resume_join(
        &self,
        id: &InviteId,
        joiner: &UserId,
        device: &DeviceId,
    ) -> Result<GroupId, InviteError> {
        self.poll_until_complete(id, joiner, device).await
    }

    async fn poll_until_complete(
        &self,
        id: &InviteId,
        joiner: &UserId,
        device: &DeviceId,
    ) -> Result<GroupId, InviteError> {
        loop {
            let poll = self.mediator.poll_invite(id, joiner).await?;
            match poll.status {
                InviteStatus::Complete => {
                    if self.handled.is_handled(id).await? {
                        return Ok(poll.group_id);
                    }
                    let welcome = poll.welcome.ok_or_else(|| {
                        InviteError::Store("complete invite carries no welcome".to_string())
                    })?;
                    let group_id = self.sessions.process_welcome(&welcome).await?;
                    self.membership
                        .register(&group_id, joiner, device)
                        .await
                        .map_err(|e| InviteError::Store(e.0))?;
                    self.handled.mark_handled(id).await?;
                    tracing::info!(invite = %id, group = %group_id, "joined via invite");
                    return Ok(group_id);
                },
                InviteStatus::Expired => return Err(InviteError::Expired),
                InviteStatus::Pending | InviteStatus::KpSubmitted => {
                    tokio::time::sleep(self.poll_interval).await;
                },
            }
        }
    }

    /// Joiner-side preview of an invite before committing to join.
    pub async fn invite_info(
        &self,
        id: &InviteId,
    ) -> Result<tether_core::invite::InviteInfo, InviteError> {
        self.mediator.invite_info(id).await
    }
}
