//! Epoch continuity under the [`SessionTracker`]: honest commits
//! advance the epoch, a diverging authenticator poisons the group, and
//! a trusted export brings it back.

use std::sync::Arc;

use tether_core::error::SessionError;
use tether_core::session::SessionTracker;
use tether_harness::FakeEngine;
use tether_proto::GroupId;

fn tracker() -> (SessionTracker, Arc<FakeEngine>) {
    let engine = Arc::new(FakeEngine::new());
    (SessionTracker::new(engine.clone()), engine)
}

#[tokio::test]
async fn update_commit_advances_the_epoch() {
    let (sessions, _) = tracker();
    let group = GroupId::from("g-update");
    let state = sessions.create_session(&group).await.unwrap();
    assert_eq!(state.epoch, 0);

    sessions.create_update_proposal(&group).await.unwrap();
    assert_eq!(sessions.pending_proposals(&group).await.unwrap(), 1);

    let commit = sessions.commit_proposals(&group).await.unwrap();
    assert!(!commit.is_empty());
    assert_eq!(sessions.epoch(&group).await.unwrap(), 1);
    assert_eq!(sessions.pending_proposals(&group).await.unwrap(), 0);
    assert!(sessions.authenticator(&group, 1).await.unwrap().is_some());
}

#[tokio::test]
async fn committing_with_nothing_staged_is_refused() {
    let (sessions, _) = tracker();
    let group = GroupId::from("g-empty");
    sessions.create_session(&group).await.unwrap();

    let err = sessions.commit_proposals(&group).await.unwrap_err();
    assert_eq!(err, SessionError::NoProposals);
    assert_eq!(sessions.epoch(&group).await.unwrap(), 0);
}

#[tokio::test]
async fn remote_commit_keeps_members_in_step() {
    let (alice, _) = tracker();
    let (bob, _) = tracker();
    let group = GroupId::from("g-pair");

    alice.create_session(&group).await.unwrap();
    let kp = bob.engine().generate_key_package().await.unwrap();
    let welcome = alice.add_member(&group, &kp).await.unwrap();
    assert_eq!(bob.process_welcome(&welcome).await.unwrap(), group);
    assert_eq!(bob.epoch(&group).await.unwrap(), 1);

    // Alice ratchets forward; bob catches up from the delivered commit.
    alice.create_update_proposal(&group).await.unwrap();
    let commit = alice.commit_proposals(&group).await.unwrap();
    let epoch = bob.apply_remote_commit(&group, &commit, None).await.unwrap();
    assert_eq!(epoch, 2);

    assert_eq!(
        alice.authenticator(&group, 2).await.unwrap(),
        bob.authenticator(&group, 2).await.unwrap(),
    );
}

#[tokio::test]
async fn skewed_commit_poisons_the_group() {
    let (sessions, engine) = tracker();
    let group = GroupId::from("g-skew");
    sessions.create_session(&group).await.unwrap();
    sessions.create_update_proposal(&group).await.unwrap();

    engine.skew_next_commit();
    let err = sessions.commit_proposals(&group).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::EpochAuthenticatorMismatch { group: group.clone(), epoch: 1 },
    );

    // The externally visible epoch never advanced, and every further
    // operation is refused until the group is re-imported.
    assert_eq!(sessions.epoch(&group).await.unwrap(), 0);
    let err = sessions.encrypt(&group, b"blocked").await.unwrap_err();
    assert_eq!(err, SessionError::Poisoned(group.clone()));
    let err = sessions.create_update_proposal(&group).await.unwrap_err();
    assert_eq!(err, SessionError::Poisoned(group));
}

#[tokio::test]
async fn forged_embedded_authenticator_poisons_the_receiver() {
    let (alice, _) = tracker();
    let (bob, _) = tracker();
    let group = GroupId::from("g-forge");

    alice.create_session(&group).await.unwrap();
    let kp = bob.engine().generate_key_package().await.unwrap();
    let welcome = alice.add_member(&group, &kp).await.unwrap();
    bob.process_welcome(&welcome).await.unwrap();

    alice.create_update_proposal(&group).await.unwrap();
    let commit = alice.commit_proposals(&group).await.unwrap();

    let err = bob.apply_remote_commit(&group, &commit, Some(b"forged")).await.unwrap_err();
    assert_eq!(
        err,
        SessionError::EpochAuthenticatorMismatch { group: group.clone(), epoch: 2 },
    );
    assert_eq!(bob.epoch(&group).await.unwrap(), 1);
    let err = bob.decrypt(&group, b"{}").await.unwrap_err();
    assert_eq!(err, SessionError::Poisoned(group));
}

#[tokio::test]
async fn trusted_import_recovers_a_poisoned_group() {
    let (sessions, engine) = tracker();
    let group = GroupId::from("g-recover");
    sessions.create_session(&group).await.unwrap();
    let snapshot = sessions.export_state(&group).await.unwrap();

    sessions.create_update_proposal(&group).await.unwrap();
    engine.skew_next_commit();
    sessions.commit_proposals(&group).await.unwrap_err();
    sessions.encrypt(&group, b"blocked").await.unwrap_err();

    // Re-import from the known-good export; the group is usable again
    // at the exported epoch.
    let restored = sessions.import_state(&snapshot).await.unwrap();
    assert_eq!(restored, group);
    assert_eq!(sessions.epoch(&group).await.unwrap(), 0);
    let ciphertext = sessions.encrypt(&group, b"back").await.unwrap();
    assert_eq!(sessions.decrypt(&group, &ciphertext).await.unwrap(), b"back");
}
