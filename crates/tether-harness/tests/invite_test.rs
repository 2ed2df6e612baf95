//! The invite handshake end to end through the mediating store:
//! create, key-package submission, welcome completion, joiner
//! registration, and the failure and resume paths.

use std::time::Duration;

use tokio::time::timeout;

use tether_client::ClientError;
use tether_core::error::InviteError;
use tether_harness::SimWorld;
use tether_proto::GroupId;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread")]
async fn full_invite_flow_registers_the_joiner() {
    let world = SimWorld::new(41);
    let (alice, _) = world.client("alice", "a-phone");
    let (bob, _) = world.client("bob", "b-phone");
    let group = GroupId::from("g-invite");
    alice.create_group(&group).await.unwrap();

    let invite = alice.create_invite(&group, "book club").await.unwrap();
    let info = bob.invite_info(&invite).await.unwrap();
    assert_eq!(info.group_name, "book club");

    // Bob starts the join before alice has welcomed anyone; he parks
    // in the polling loop until she does.
    let joiner = tokio::spawn(async move {
        let joined = bob.join_via_invite(&invite).await.unwrap();
        (bob, joined)
    });

    // Alice's side runs on her own schedule. Loop until bob's key
    // package shows up and exactly one welcome goes out.
    let completed = timeout(WAIT, async {
        loop {
            let n = alice.complete_pending_invites().await.unwrap();
            if n > 0 {
                break n;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(completed, 1);

    let (bob, joined) = timeout(WAIT, joiner).await.unwrap().unwrap();
    assert_eq!(joined, group);

    // Bob's session baseline is the post-add epoch, and both members
    // are on the shared registry.
    assert_eq!(bob.sessions().epoch(&group).await.unwrap(), 1);
    let members = bob.members(&group).await.unwrap();
    assert_eq!(members.len(), 2);
    assert!(members.iter().any(|(u, _)| u.as_str() == "alice"));
    assert!(members.iter().any(|(u, _)| u.as_str() == "bob"));
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_invite_refuses_a_second_joiner() {
    let world = SimWorld::new(42);
    let (alice, _) = world.client("alice", "a-phone");
    let (bob, _) = world.client("bob", "b-phone");
    let (carol, _) = world.client("carol", "c-phone");
    let group = GroupId::from("g-once");
    alice.create_group(&group).await.unwrap();
    let invite = alice.create_invite(&group, "once only").await.unwrap();

    let bob_join = {
        let invite = invite.clone();
        tokio::spawn(async move { bob.join_via_invite(&invite).await })
    };
    timeout(WAIT, async {
        while alice.complete_pending_invites().await.unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    timeout(WAIT, bob_join).await.unwrap().unwrap().unwrap();

    // The invite is single-use: carol finds it no longer pending.
    let err = carol.join_via_invite(&invite).await.unwrap_err();
    assert!(matches!(err, ClientError::Invite(InviteError::NotPending)));
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_invite_is_refused() {
    let world = SimWorld::with_invite_ttl(43, Some(1_000));
    let (alice, _) = world.client("alice", "a-phone");
    let (bob, _) = world.client("bob", "b-phone");
    let group = GroupId::from("g-stale");
    alice.create_group(&group).await.unwrap();
    let invite = alice.create_invite(&group, "too slow").await.unwrap();

    world.env.advance_ms(2_000);

    let info = bob.invite_info(&invite).await.unwrap();
    assert!(info.expired);
    let err = bob.join_via_invite(&invite).await.unwrap_err();
    assert!(matches!(err, ClientError::Invite(InviteError::Expired)));
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_after_a_completed_join_is_idempotent() {
    let world = SimWorld::new(44);
    let (alice, _) = world.client("alice", "a-phone");
    let (bob, _) = world.client("bob", "b-phone");
    let group = GroupId::from("g-resume");
    alice.create_group(&group).await.unwrap();
    let invite = alice.create_invite(&group, "resume").await.unwrap();

    let bob_join = {
        let invite = invite.clone();
        tokio::spawn(async move {
            bob.join_via_invite(&invite).await.unwrap();
            bob
        })
    };
    timeout(WAIT, async {
        while alice.complete_pending_invites().await.unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    let bob = timeout(WAIT, bob_join).await.unwrap().unwrap();
    let epoch_before = bob.sessions().epoch(&group).await.unwrap();

    // A resume after the fact hits the handled marker and returns
    // without reprocessing the welcome.
    let resumed = timeout(WAIT, bob.resume_join(&invite)).await.unwrap().unwrap();
    assert_eq!(resumed, group);
    assert_eq!(bob.sessions().epoch(&group).await.unwrap(), epoch_before);

    let members = bob.members(&group).await.unwrap();
    assert_eq!(members.iter().filter(|(u, _)| u.as_str() == "bob").count(), 1);
}
