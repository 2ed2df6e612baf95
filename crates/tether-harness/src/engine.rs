//! Deterministic in-memory [`GroupCryptoEngine`].
//!
//! The fake engine does no cryptography. Artifacts are JSON documents
//! that describe themselves, so two engine instances establish a shared
//! view of a group purely from the bytes that pass between them, the
//! same way real welcomes and commits work.
//!
//! The authenticator for `(group, epoch)` is a pure function of both,
//! so every honest engine computes the same value. The
//! [`FakeEngine::skew_next_commit`] knob makes the next epoch-advancing
//! operation report a diverging authenticator while still embedding the
//! honest one, which is exactly the shape of a continuity violation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tether_core::session::{CommitBundle, EngineError, EpochState, GroupCryptoEngine};
use tether_proto::GroupId;

#[derive(Serialize, Deserialize)]
struct CommitArtifact {
    group: String,
    epoch: u64,
}

#[derive(Serialize, Deserialize)]
struct WelcomeArtifact {
    group: String,
    epoch: u64,
    authenticator: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct CipherArtifact {
    group: String,
    epoch: u64,
    body: Vec<u8>,
}

fn honest_authenticator(group: &str, epoch: u64) -> Vec<u8> {
    format!("auth:{group}:{epoch}").into_bytes()
}

fn encode<T: Serialize>(artifact: &T) -> Result<Vec<u8>, EngineError> {
    serde_json::to_vec(artifact).map_err(|e| EngineError(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, EngineError> {
    serde_json::from_slice(bytes).map_err(|e| EngineError(format!("bad artifact: {e}")))
}

/// Self-describing fake engine for tests.
#[derive(Default)]
pub struct FakeEngine {
    epochs: Mutex<HashMap<GroupId, u64>>,
    kp_counter: AtomicU64,
    skew_next: AtomicBool,
}

impl FakeEngine {
    /// Create an engine with no groups.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next epoch-advancing operation report an authenticator
    /// that disagrees with the honest value. One-shot.
    pub fn skew_next_commit(&self) {
        self.skew_next.store(true, Ordering::SeqCst);
    }

    fn reported_authenticator(&self, group: &str, epoch: u64) -> Vec<u8> {
        let mut auth = honest_authenticator(group, epoch);
        if self.skew_next.swap(false, Ordering::SeqCst) {
            auth.extend_from_slice(b"#skew");
        }
        auth
    }

    fn epoch_of(&self, group_id: &GroupId) -> Result<u64, EngineError> {
        self.epochs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(group_id)
            .copied()
            .ok_or_else(|| EngineError(format!("unknown group {group_id}")))
    }

    fn set_epoch(&self, group_id: &GroupId, epoch: u64) {
        self.epochs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(group_id.clone(), epoch);
    }
}

#[async_trait]
impl GroupCryptoEngine for FakeEngine {
    async fn create_group(&self, group_id: &GroupId) -> Result<EpochState, EngineError> {
        self.set_epoch(group_id, 0);
        Ok(EpochState { epoch: 0, authenticator: honest_authenticator(group_id.as_str(), 0) })
    }

    async fn generate_key_package(&self) -> Result<Vec<u8>, EngineError> {
        let n = self.kp_counter.fetch_add(1, Ordering::SeqCst);
        Ok(format!("kp-{n}").into_bytes())
    }

    async fn add_member(
        &self,
        group_id: &GroupId,
        _key_package: &[u8],
    ) -> Result<CommitBundle, EngineError> {
        let epoch = self.epoch_of(group_id)? + 1;
        self.set_epoch(group_id, epoch);

        let honest = honest_authenticator(group_id.as_str(), epoch);
        let reported = self.reported_authenticator(group_id.as_str(), epoch);
        Ok(CommitBundle {
            commit: encode(&CommitArtifact { group: group_id.0.clone(), epoch })?,
            welcome: Some(encode(&WelcomeArtifact {
                group: group_id.0.clone(),
                epoch,
                authenticator: honest.clone(),
            })?),
            state: EpochState { epoch, authenticator: reported },
            embedded_authenticator: Some(honest),
        })
    }

    async fn process_welcome(&self, welcome: &[u8]) -> Result<(GroupId, EpochState), EngineError> {
        let artifact: WelcomeArtifact = decode(welcome)?;
        let group_id = GroupId::new(artifact.group);
        self.set_epoch(&group_id, artifact.epoch);
        Ok((
            group_id,
            EpochState { epoch: artifact.epoch, authenticator: artifact.authenticator },
        ))
    }

    async fn encrypt(&self, group_id: &GroupId, plaintext: &[u8]) -> Result<Vec<u8>, EngineError> {
        let epoch = self.epoch_of(group_id)?;
        encode(&CipherArtifact { group: group_id.0.clone(), epoch, body: plaintext.to_vec() })
    }

    async fn decrypt(
        &self,
        group_id: &GroupId,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        self.epoch_of(group_id)?;
        let artifact: CipherArtifact = decode(ciphertext)?;
        if artifact.group != group_id.0 {
            return Err(EngineError("ciphertext is for a different group".to_string()));
        }
        Ok(artifact.body)
    }

    async fn apply_commit(
        &self,
        group_id: &GroupId,
        commit: &[u8],
    ) -> Result<EpochState, EngineError> {
        self.epoch_of(group_id)?;
        let artifact: CommitArtifact = decode(commit)?;
        if artifact.group != group_id.0 {
            return Err(EngineError("commit is for a different group".to_string()));
        }
        self.set_epoch(group_id, artifact.epoch);
        Ok(EpochState {
            epoch: artifact.epoch,
            authenticator: self.reported_authenticator(group_id.as_str(), artifact.epoch),
        })
    }

    async fn create_update_proposal(&self, group_id: &GroupId) -> Result<Vec<u8>, EngineError> {
        let epoch = self.epoch_of(group_id)?;
        Ok(format!("prop:{group_id}:{epoch}").into_bytes())
    }

    async fn commit_pending(
        &self,
        group_id: &GroupId,
        proposals: &[Vec<u8>],
    ) -> Result<CommitBundle, EngineError> {
        if proposals.is_empty() {
            return Err(EngineError("nothing to commit".to_string()));
        }
        let epoch = self.epoch_of(group_id)? + 1;
        self.set_epoch(group_id, epoch);

        let honest = honest_authenticator(group_id.as_str(), epoch);
        let reported = self.reported_authenticator(group_id.as_str(), epoch);
        Ok(CommitBundle {
            commit: encode(&CommitArtifact { group: group_id.0.clone(), epoch })?,
            welcome: None,
            state: EpochState { epoch, authenticator: reported },
            embedded_authenticator: Some(honest),
        })
    }

    async fn export_state(&self, group_id: &GroupId) -> Result<Vec<u8>, EngineError> {
        let epoch = self.epoch_of(group_id)?;
        encode(&CommitArtifact { group: group_id.0.clone(), epoch })
    }

    async fn import_state(&self, snapshot: &[u8]) -> Result<(GroupId, EpochState), EngineError> {
        let artifact: CommitArtifact = decode(snapshot)?;
        let group_id = GroupId::new(artifact.group);
        self.set_epoch(&group_id, artifact.epoch);
        Ok((
            group_id.clone(),
            EpochState {
                epoch: artifact.epoch,
                authenticator: honest_authenticator(group_id.as_str(), artifact.epoch),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn welcome_establishes_shared_view() {
        let alice = FakeEngine::new();
        let bob = FakeEngine::new();
        let group = GroupId::from("g1");

        alice.create_group(&group).await.unwrap();
        let kp = bob.generate_key_package().await.unwrap();
        let bundle = alice.add_member(&group, &kp).await.unwrap();

        let (joined, state) =
            bob.process_welcome(&bundle.welcome.unwrap()).await.unwrap();
        assert_eq!(joined, group);
        assert_eq!(state.epoch, 1);
        assert_eq!(state.authenticator, bundle.state.authenticator);

        let ct = alice.encrypt(&group, b"hello").await.unwrap();
        assert_eq!(bob.decrypt(&group, &ct).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn skew_makes_reported_diverge_from_embedded() {
        let engine = FakeEngine::new();
        let group = GroupId::from("g1");
        engine.create_group(&group).await.unwrap();

        engine.skew_next_commit();
        let bundle = engine.add_member(&group, b"kp-0").await.unwrap();
        assert_ne!(
            Some(&bundle.state.authenticator),
            bundle.embedded_authenticator.as_ref()
        );

        // One-shot: the next commit is honest again.
        let bundle = engine.add_member(&group, b"kp-1").await.unwrap();
        assert_eq!(
            Some(&bundle.state.authenticator),
            bundle.embedded_authenticator.as_ref()
        );
    }
}
