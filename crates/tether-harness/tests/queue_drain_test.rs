//! Durable offline queue behavior end to end: offline queueing, ack
//! timeout requeueing, exactly-once drains, and ordered stop-on-failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use tether_client::{ClientError, TetherClient};
use tether_core::delivery::SendOutcome;
use tether_core::error::DeliveryError;
use tether_core::queue::{MemoryQueue, OfflineQueue};
use tether_harness::SimWorld;
use tether_proto::GroupId;

const WAIT: Duration = Duration::from_secs(2);

async fn share_group(alice: &TetherClient, bob: &TetherClient, group: &GroupId) {
    alice.create_group(group).await.unwrap();
    let kp = bob.sessions().engine().generate_key_package().await.unwrap();
    let welcome = alice.sessions().add_member(group, &kp).await.unwrap();
    bob.sessions().process_welcome(&welcome).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_sends_queue_and_drain_after_subscribe() {
    let world = SimWorld::new(21);
    let queue = Arc::new(MemoryQueue::new());
    let (alice, _) = world.client_with_queue("alice", "a-phone", queue.clone());
    let (bob, _) = world.client("bob", "b-phone");
    let group = GroupId::from("g1");
    share_group(&alice, &bob, &group).await;

    // Never connected: sends resolve immediately as queued.
    for body in [b"q1".as_slice(), b"q2"] {
        let outcome = alice.send_message(&group, body).await.unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
    }
    assert_eq!(queue.len().await.unwrap(), 2);

    bob.connect("relay").await.unwrap();
    bob.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();
    let mut inbox = bob.deliveries();

    // Subscribing triggers the drain without an explicit sync call.
    alice.connect("relay").await.unwrap();
    alice.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();

    let first = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(bob.open_message(&first).await.unwrap(), b"q1");
    assert_eq!(bob.open_message(&second).await.unwrap(), b"q2");

    // Entries are removed only after their acks; give the drain a
    // moment to process the final removal.
    for _ in 0..40 {
        if queue.len().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(queue.len().await.unwrap(), 0);

    // Exactly once: nothing further arrives.
    assert!(timeout(Duration::from_millis(300), inbox.recv()).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn ack_timeout_requeues_and_a_later_drain_delivers() {
    let world = SimWorld::new(22);
    let queue = Arc::new(MemoryQueue::new());
    let (alice, _) = world.client_with_queue("alice", "a-phone", queue.clone());
    let (bob, _) = world.client("bob", "b-phone");
    let group = GroupId::from("g1");
    share_group(&alice, &bob, &group).await;

    alice.connect("relay").await.unwrap();
    bob.connect("relay").await.unwrap();
    alice.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();
    bob.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();

    // The relay swallows the send: no ack, no delivery.
    world.relay.set_drop_sends(true);
    let err = alice.send_message(&group, b"lost?").await.unwrap_err();
    assert_eq!(err, ClientError::Delivery(DeliveryError::AckTimeout));
    assert_eq!(queue.len().await.unwrap(), 1);

    world.relay.set_drop_sends(false);
    let mut inbox = bob.deliveries();
    assert_eq!(alice.sync_offline().await.unwrap(), 1);
    assert_eq!(queue.len().await.unwrap(), 0);

    let envelope = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(bob.open_message(&envelope).await.unwrap(), b"lost?");
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_stops_at_the_first_failure_and_preserves_order() {
    let world = SimWorld::new(23);
    let queue = Arc::new(MemoryQueue::new());
    let (alice, _) = world.client_with_queue("alice", "a-phone", queue.clone());
    let (bob, _) = world.client("bob", "b-phone");
    let group = GroupId::from("g1");
    share_group(&alice, &bob, &group).await;

    for body in [b"m1".as_slice(), b"m2", b"m3"] {
        alice.send_message(&group, body).await.unwrap();
    }
    assert_eq!(queue.len().await.unwrap(), 3);

    bob.connect("relay").await.unwrap();
    bob.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();

    // Every send is rejected, so the automatic post-subscribe drain
    // must stop at the head without removing anything.
    world.relay.set_reject_sends(true);
    alice.connect("relay").await.unwrap();
    alice.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();
    assert_eq!(alice.sync_offline().await.unwrap(), 0);
    assert_eq!(queue.len().await.unwrap(), 3);

    // Once the relay accepts again, everything drains in order.
    world.relay.set_reject_sends(false);
    let mut inbox = bob.deliveries();
    assert_eq!(alice.sync_offline().await.unwrap(), 3);

    let mut bodies = Vec::new();
    for _ in 0..3 {
        let envelope = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        bodies.push(bob.open_message(&envelope).await.unwrap());
    }
    assert_eq!(bodies, vec![b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()]);
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_drain_removes_only_the_acked_prefix() {
    let world = SimWorld::new(24);
    let queue = Arc::new(MemoryQueue::new());
    let (alice, _) = world.client_with_queue("alice", "a-phone", queue.clone());
    let (bob, _) = world.client("bob", "b-phone");
    let group = GroupId::from("g1");
    share_group(&alice, &bob, &group).await;

    for body in [b"m1".as_slice(), b"m2", b"m3"] {
        alice.send_message(&group, body).await.unwrap();
    }
    assert_eq!(queue.len().await.unwrap(), 3);

    bob.connect("relay").await.unwrap();
    bob.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();
    let mut inbox = bob.deliveries();

    // The relay accepts exactly one send, so the drain gets the head
    // through and then stops at the second entry.
    world.relay.set_send_budget(Some(1)).await;
    alice.connect("relay").await.unwrap();
    alice.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();

    let head = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(bob.open_message(&head).await.unwrap(), b"m1");

    // Only the acked head was removed; the rejected entry and the one
    // behind it stay queued.
    for _ in 0..40 {
        if queue.len().await.unwrap() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(queue.len().await.unwrap(), 2);
    assert_eq!(alice.sync_offline().await.unwrap(), 0);
    assert_eq!(queue.len().await.unwrap(), 2);

    // Lifting the budget drains the remainder in original order.
    world.relay.set_send_budget(None).await;
    assert_eq!(alice.sync_offline().await.unwrap(), 2);
    let mut bodies = Vec::new();
    for _ in 0..2 {
        let envelope = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        bodies.push(bob.open_message(&envelope).await.unwrap());
    }
    assert_eq!(bodies, vec![b"m2".to_vec(), b"m3".to_vec()]);
    assert_eq!(queue.len().await.unwrap(), 0);
}
