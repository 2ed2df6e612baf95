//! Per-group cryptographic session bookkeeping.
//!
//! The actual group cryptography (key schedules, tree math, ratchets)
//! lives behind the opaque [`GroupCryptoEngine`] trait. This module
//! tracks what the delivery layer needs to know about each group: the
//! current epoch, the authenticator recorded for each epoch, and the
//! proposals staged toward the next commit.
//!
//! # Epoch continuity
//!
//! An authenticator is an opaque value every member at a given epoch
//! must compute identically. After any commit that advances a group to
//! epoch E, the authenticator the engine reports for E must equal the
//! value embedded in the commit artifact (when present) or the value
//! previously recorded for E. A mismatch means the local view of the
//! group has diverged: the group is marked poisoned and refuses further
//! operations until re-imported from a trusted export.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use tether_proto::GroupId;

use crate::error::SessionError;

/// Epoch number plus the authenticator the engine computed for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochState {
    /// Monotonically increasing epoch.
    pub epoch: u64,
    /// Opaque fixed-length agreement proof for this epoch.
    pub authenticator: Vec<u8>,
}

/// Output of an epoch-advancing engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBundle {
    /// Serialized commit artifact for distribution to members.
    pub commit: Vec<u8>,
    /// Welcome artifact for a newly added member, when the commit adds
    /// one.
    pub welcome: Option<Vec<u8>>,
    /// Epoch state the engine reports after applying the commit.
    pub state: EpochState,
    /// Authenticator embedded in the commit artifact, when the format
    /// carries one.
    pub embedded_authenticator: Option<Vec<u8>>,
}

/// Failure inside the opaque engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e.0)
    }
}

/// The opaque cryptographic group-session engine.
///
/// All inputs and outputs are opaque byte artifacts to this layer; the
/// trait exists so the tracker and the invite handshake can drive the
/// engine without knowing anything about its internals.
#[async_trait]
pub trait GroupCryptoEngine: Send + Sync {
    /// Create a new group; returns the state at epoch 0.
    async fn create_group(&self, group_id: &GroupId) -> Result<EpochState, EngineError>;

    /// Generate a one-time key package for joining groups.
    async fn generate_key_package(&self) -> Result<Vec<u8>, EngineError>;

    /// Produce a commit (and welcome) adding the holder of
    /// `key_package`, and apply it locally.
    async fn add_member(
        &self,
        group_id: &GroupId,
        key_package: &[u8],
    ) -> Result<CommitBundle, EngineError>;

    /// Join an existing group from a welcome artifact.
    async fn process_welcome(&self, welcome: &[u8]) -> Result<(GroupId, EpochState), EngineError>;

    /// Encrypt application plaintext for the group.
    async fn encrypt(&self, group_id: &GroupId, plaintext: &[u8]) -> Result<Vec<u8>, EngineError>;

    /// Decrypt application ciphertext from the group.
    async fn decrypt(&self, group_id: &GroupId, ciphertext: &[u8])
    -> Result<Vec<u8>, EngineError>;

    /// Apply a commit produced elsewhere.
    async fn apply_commit(
        &self,
        group_id: &GroupId,
        commit: &[u8],
    ) -> Result<EpochState, EngineError>;

    /// Stage a self-update proposal; returns the serialized proposal.
    async fn create_update_proposal(&self, group_id: &GroupId) -> Result<Vec<u8>, EngineError>;

    /// Commit previously staged proposals.
    async fn commit_pending(
        &self,
        group_id: &GroupId,
        proposals: &[Vec<u8>],
    ) -> Result<CommitBundle, EngineError>;

    /// Serialize the group state for persistence.
    async fn export_state(&self, group_id: &GroupId) -> Result<Vec<u8>, EngineError>;

    /// Restore a group from a previously exported snapshot.
    async fn import_state(&self, snapshot: &[u8]) -> Result<(GroupId, EpochState), EngineError>;
}

/// Tracked state of one group session.
#[derive(Debug, Clone)]
struct GroupSession {
    epoch: u64,
    authenticators: BTreeMap<u64, Vec<u8>>,
    pending_proposals: Vec<Vec<u8>>,
    poisoned: bool,
}

impl GroupSession {
    fn at(state: &EpochState) -> Self {
        let mut authenticators = BTreeMap::new();
        authenticators.insert(state.epoch, state.authenticator.clone());
        Self { epoch: state.epoch, authenticators, pending_proposals: Vec::new(), poisoned: false }
    }
}

/// Keyed collection of group sessions layered over one engine.
///
/// The session map is the only state mutated from more than one call
/// path (normal commits, plus commits discovered in delivered
/// handshakes), so every mutation goes through the single internal
/// mutex.
pub struct SessionTracker {
    engine: Arc<dyn GroupCryptoEngine>,
    groups: Mutex<HashMap<GroupId, GroupSession>>,
}

impl SessionTracker {
    /// Create a tracker over the given engine.
    pub fn new(engine: Arc<dyn GroupCryptoEngine>) -> Self {
        Self { engine, groups: Mutex::new(HashMap::new()) }
    }

    /// Access the underlying engine (key-package generation for the
    /// invite handshake goes straight to it).
    #[must_use]
    pub fn engine(&self) -> &Arc<dyn GroupCryptoEngine> {
        &self.engine
    }

    /// Create a new group session at epoch 0.
    pub async fn create_session(&self, group_id: &GroupId) -> Result<EpochState, SessionError> {
        let state = self.engine.create_group(group_id).await?;
        self.groups.lock().await.insert(group_id.clone(), GroupSession::at(&state));
        Ok(state)
    }

    /// Current epoch of a tracked group.
    pub async fn epoch(&self, group_id: &GroupId) -> Result<u64, SessionError> {
        let groups = self.groups.lock().await;
        let session =
            groups.get(group_id).ok_or_else(|| SessionError::UnknownGroup(group_id.clone()))?;
        Ok(session.epoch)
    }

    /// Recorded authenticator for an epoch of a tracked group.
    pub async fn authenticator(
        &self,
        group_id: &GroupId,
        epoch: u64,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let groups = self.groups.lock().await;
        let session =
            groups.get(group_id).ok_or_else(|| SessionError::UnknownGroup(group_id.clone()))?;
        Ok(session.authenticators.get(&epoch).cloned())
    }

    /// Add a member from a key package; returns the welcome artifact.
    ///
    /// Verifies the engine-reported authenticator for the new epoch
    /// against the one embedded in the commit. On mismatch the group is
    /// poisoned, the externally visible epoch does not advance, and the
    /// caller must treat the session as untrustworthy until it is
    /// re-derived from a known-good export.
    pub async fn add_member(
        &self,
        group_id: &GroupId,
        key_package: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let mut groups = self.groups.lock().await;
        let session =
            groups.get_mut(group_id).ok_or_else(|| SessionError::UnknownGroup(group_id.clone()))?;
        if session.poisoned {
            return Err(SessionError::Poisoned(group_id.clone()));
        }

        let bundle = self.engine.add_member(group_id, key_package).await?;
        Self::verify_and_advance(group_id, session, &bundle)?;
        session.pending_proposals.clear();

        bundle.welcome.ok_or_else(|| {
            SessionError::Engine("engine returned no welcome for add_member".to_string())
        })
    }

    /// Join an existing group from a welcome; records the resulting
    /// epoch and authenticator as the session baseline.
    pub async fn process_welcome(&self, welcome: &[u8]) -> Result<GroupId, SessionError> {
        let (group_id, state) = self.engine.process_welcome(welcome).await?;
        self.groups.lock().await.insert(group_id.clone(), GroupSession::at(&state));
        Ok(group_id)
    }

    /// Stage a self-update proposal for a later commit.
    pub async fn create_update_proposal(&self, group_id: &GroupId) -> Result<(), SessionError> {
        let mut groups = self.groups.lock().await;
        let session =
            groups.get_mut(group_id).ok_or_else(|| SessionError::UnknownGroup(group_id.clone()))?;
        if session.poisoned {
            return Err(SessionError::Poisoned(group_id.clone()));
        }
        let proposal = self.engine.create_update_proposal(group_id).await?;
        session.pending_proposals.push(proposal);
        Ok(())
    }

    /// Number of proposals staged for a group.
    pub async fn pending_proposals(&self, group_id: &GroupId) -> Result<usize, SessionError> {
        let groups = self.groups.lock().await;
        let session =
            groups.get(group_id).ok_or_else(|| SessionError::UnknownGroup(group_id.clone()))?;
        Ok(session.pending_proposals.len())
    }

    /// Commit staged proposals; returns the commit artifact for
    /// distribution. Requires at least one pending proposal.
    pub async fn commit_proposals(&self, group_id: &GroupId) -> Result<Vec<u8>, SessionError> {
        let mut groups = self.groups.lock().await;
        let session =
            groups.get_mut(group_id).ok_or_else(|| SessionError::UnknownGroup(group_id.clone()))?;
        if session.poisoned {
            return Err(SessionError::Poisoned(group_id.clone()));
        }
        if session.pending_proposals.is_empty() {
            return Err(SessionError::NoProposals);
        }

        let proposals = session.pending_proposals.clone();
        let bundle = self.engine.commit_pending(group_id, &proposals).await?;
        Self::verify_and_advance(group_id, session, &bundle)?;
        session.pending_proposals.clear();
        Ok(bundle.commit)
    }

    /// Apply a commit received from another member (e.g. in a delivered
    /// handshake envelope), enforcing the same continuity invariant.
    pub async fn apply_remote_commit(
        &self,
        group_id: &GroupId,
        commit: &[u8],
        embedded_authenticator: Option<&[u8]>,
    ) -> Result<u64, SessionError> {
        let mut groups = self.groups.lock().await;
        let session =
            groups.get_mut(group_id).ok_or_else(|| SessionError::UnknownGroup(group_id.clone()))?;
        if session.poisoned {
            return Err(SessionError::Poisoned(group_id.clone()));
        }

        let state = self.engine.apply_commit(group_id, commit).await?;
        let expected = embedded_authenticator
            .map(<[u8]>::to_vec)
            .or_else(|| session.authenticators.get(&state.epoch).cloned());
        if let Some(expected) = expected {
            if expected != state.authenticator {
                session.poisoned = true;
                return Err(SessionError::EpochAuthenticatorMismatch {
                    group: group_id.clone(),
                    epoch: state.epoch,
                });
            }
        }

        session.epoch = state.epoch;
        session.authenticators.insert(state.epoch, state.authenticator);
        session.pending_proposals.clear();
        Ok(state.epoch)
    }

    /// Encrypt through the engine; requires an established session.
    pub async fn encrypt(
        &self,
        group_id: &GroupId,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        self.ensure_usable(group_id).await?;
        Ok(self.engine.encrypt(group_id, plaintext).await?)
    }

    /// Decrypt through the engine; requires an established session.
    pub async fn decrypt(
        &self,
        group_id: &GroupId,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        self.ensure_usable(group_id).await?;
        Ok(self.engine.decrypt(group_id, ciphertext).await?)
    }

    /// Export the engine snapshot for a group.
    pub async fn export_state(&self, group_id: &GroupId) -> Result<Vec<u8>, SessionError> {
        self.groups
            .lock()
            .await
            .get(group_id)
            .ok_or_else(|| SessionError::UnknownGroup(group_id.clone()))?;
        Ok(self.engine.export_state(group_id).await?)
    }

    /// Restore a group from a trusted export. This is the recovery path
    /// after an authenticator mismatch: the imported state replaces the
    /// poisoned session entirely.
    pub async fn import_state(&self, snapshot: &[u8]) -> Result<GroupId, SessionError> {
        let (group_id, state) = self.engine.import_state(snapshot).await?;
        self.groups.lock().await.insert(group_id.clone(), GroupSession::at(&state));
        Ok(group_id)
    }

    async fn ensure_usable(&self, group_id: &GroupId) -> Result<(), SessionError> {
        let groups = self.groups.lock().await;
        let session =
            groups.get(group_id).ok_or_else(|| SessionError::UnknownGroup(group_id.clone()))?;
        if session.poisoned {
            return Err(SessionError::Poisoned(group_id.clone()));
        }
        Ok(())
    }

    /// Shared continuity check for locally produced commits.
    fn verify_and_advance(
        group_id: &GroupId,
        session: &mut GroupSession,
        bundle: &CommitBundle,
    ) -> Result<(), SessionError> {
        let reported = &bundle.state.authenticator;

        if let Some(embedded) = &bundle.embedded_authenticator {
            if embedded != reported {
                session.poisoned = true;
                return Err(SessionError::EpochAuthenticatorMismatch {
                    group: group_id.clone(),
                    epoch: bundle.state.epoch,
                });
            }
        } else if let Some(recorded) = session.authenticators.get(&bundle.state.epoch) {
            if recorded != reported {
                session.poisoned = true;
                return Err(SessionError::EpochAuthenticatorMismatch {
                    group: group_id.clone(),
                    epoch: bundle.state.epoch,
                });
            }
        }

        session.epoch = bundle.state.epoch;
        session.authenticators.insert(bundle.state.epoch, reported.clone());
        Ok(())
    }
}
