//! In-memory mediating store and membership registry.
//!
//! Enforces the same transition and authorization rules a production
//! store would: all structural validation is delegated to
//! [`InviteRecord`], the store adds ids, expiry stamps, and the
//! joiner-only restriction on polling.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use tether_core::env::Environment;
use tether_core::error::{InviteError, MembershipError};
use tether_core::invite::{
    InviteId, InviteInfo, InvitePoll, InviteRecord, InviteStatus, MediatorStore, MembershipStore,
};
use tether_proto::{DeviceId, GroupId, UserId};

/// In-memory [`MediatorStore`].
pub struct MemoryMediator {
    env: Arc<dyn Environment>,
    ttl_ms: Option<u64>,
    invites: Mutex<HashMap<InviteId, InviteRecord>>,
    next_id: AtomicU64,
}

impl MemoryMediator {
    /// Create a store whose invites expire `ttl_ms` after creation
    /// (`None` never expires).
    #[must_use]
    pub fn new(env: Arc<dyn Environment>, ttl_ms: Option<u64>) -> Self {
        Self { env, ttl_ms, invites: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }
}

#[async_trait]
impl MediatorStore for MemoryMediator {
    async fn create_invite(
        &self,
        group_id: &GroupId,
        group_name: &str,
        inviter: &UserId,
    ) -> Result<InviteId, InviteError> {
        let id = InviteId::new(format!("inv-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        let record = InviteRecord {
            id: id.clone(),
            group_id: group_id.clone(),
            group_name: group_name.to_string(),
            inviter_id: inviter.clone(),
            joiner_id: None,
            status: InviteStatus::Pending,
            key_package: None,
            welcome: None,
            expires_at: self.ttl_ms.map(|ttl| self.env.unix_ms().saturating_add(ttl)),
        };
        self.invites.lock().await.insert(id.clone(), record);
        Ok(id)
    }

    async fn invite_info(&self, id: &InviteId) -> Result<InviteInfo, InviteError> {
        let invites = self.invites.lock().await;
        let record = invites.get(id).ok_or_else(|| InviteError::NotFound(id.to_string()))?;
        let status = record.effective_status(self.env.unix_ms());
        Ok(InviteInfo {
            group_name: record.group_name.clone(),
            status,
            expired: status == InviteStatus::Expired,
        })
    }

    async fn submit_key_package(
        &self,
        id: &InviteId,
        joiner: &UserId,
        key_package: Vec<u8>,
    ) -> Result<(), InviteError> {
        let mut invites = self.invites.lock().await;
        let record =
            invites.get_mut(id).ok_or_else(|| InviteError::NotFound(id.to_string()))?;
        record.submit_key_package(joiner, key_package, self.env.unix_ms())
    }

    async fn poll_invite(
        &self,
        id: &InviteId,
        joiner: &UserId,
    ) -> Result<InvitePoll, InviteError> {
        let invites = self.invites.lock().await;
        let record = invites.get(id).ok_or_else(|| InviteError::NotFound(id.to_string()))?;
        if record.joiner_id.as_ref() != Some(joiner) {
            return Err(InviteError::NotAuthorized);
        }
        let status = record.effective_status(self.env.unix_ms());
        let welcome =
            if status == InviteStatus::Complete { record.welcome.clone() } else { None };
        Ok(InvitePoll { status, welcome, group_id: record.group_id.clone() })
    }

    async fn submit_welcome(
        &self,
        id: &InviteId,
        inviter: &UserId,
        welcome: Vec<u8>,
    ) -> Result<(), InviteError> {
        let mut invites = self.invites.lock().await;
        let record =
            invites.get_mut(id).ok_or_else(|| InviteError::NotFound(id.to_string()))?;
        record.submit_welcome(inviter, welcome, self.env.unix_ms())
    }

    async fn awaiting_welcome(&self, inviter: &UserId) -> Result<Vec<InviteRecord>, InviteError> {
        let now_ms = self.env.unix_ms();
        Ok(self
            .invites
            .lock()
            .await
            .values()
            .filter(|r| {
                &r.inviter_id == inviter
                    && r.effective_status(now_ms) == InviteStatus::KpSubmitted
            })
            .cloned()
            .collect())
    }
}

/// In-memory [`MembershipStore`].
#[derive(Default)]
pub struct MemoryMembership {
    groups: Mutex<HashMap<GroupId, Vec<(UserId, DeviceId)>>>,
}

impl MemoryMembership {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipStore for MemoryMembership {
    async fn register(
        &self,
        group_id: &GroupId,
        user: &UserId,
        device: &DeviceId,
    ) -> Result<(), MembershipError> {
        let mut groups = self.groups.lock().await;
        let members = groups.entry(group_id.clone()).or_default();
        let entry = (user.clone(), device.clone());
        if !members.contains(&entry) {
            members.push(entry);
        }
        Ok(())
    }

    async fn members(
        &self,
        group_id: &GroupId,
    ) -> Result<Vec<(UserId, DeviceId)>, MembershipError> {
        Ok(self.groups.lock().await.get(group_id).cloned().unwrap_or_default())
    }

    async fn remove(
        &self,
        group_id: &GroupId,
        user: &UserId,
        device: &DeviceId,
    ) -> Result<(), MembershipError> {
        if let Some(members) = self.groups.lock().await.get_mut(group_id) {
            members.retain(|(u, d)| u != user || d != device);
        }
        Ok(())
    }
}
