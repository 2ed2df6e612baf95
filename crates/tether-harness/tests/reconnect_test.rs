//! Connection lifecycle over the simulated relay: reconnect with
//! backoff, automatic resubscribe, and dial failures.

use std::time::Duration;

use tokio::time::timeout;

use tether_client::{ClientError, ClientEvent, TetherClient};
use tether_core::connection::ConnectionState;
use tether_core::delivery::SendOutcome;
use tether_core::error::ConnectionError;
use tether_harness::SimWorld;
use tether_proto::GroupId;

const WAIT: Duration = Duration::from_secs(3);

async fn share_group(alice: &TetherClient, bob: &TetherClient, group: &GroupId) {
    alice.create_group(group).await.unwrap();
    let kp = bob.sessions().engine().generate_key_package().await.unwrap();
    let welcome = alice.sessions().add_member(group, &kp).await.unwrap();
    bob.sessions().process_welcome(&welcome).await.unwrap();
}

/// Wait until `client` reports the given state through its event bus.
async fn await_state(events: &mut tokio::sync::broadcast::Receiver<ClientEvent>, want: ConnectionState) {
    loop {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Ok(ClientEvent::StateChanged { state, .. }) if state == want => return,
            Ok(_) => {},
            Err(_) => {},
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_connection_reconnects_and_resubscribes() {
    let world = SimWorld::new(31);
    let (alice, _) = world.client("alice", "a-phone");
    let (bob, _) = world.client("bob", "b-phone");
    let group = GroupId::from("g1");
    share_group(&alice, &bob, &group).await;

    alice.connect("relay").await.unwrap();
    bob.connect("relay").await.unwrap();
    alice.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();
    bob.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();

    let mut alice_events = alice.events();
    let mut bob_events = bob.events();
    world.relay.disconnect_all().await;

    // Both clients notice the drop and come back on their own.
    await_state(&mut alice_events, ConnectionState::Connected).await;
    await_state(&mut bob_events, ConnectionState::Connected).await;
    // Give the replayed subscriptions a moment to confirm.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The subscription was replayed without any new subscribe call:
    // traffic flows again.
    let mut inbox = bob.deliveries();
    let sent = async {
        loop {
            // The first send may race the resubscribe confirmation and
            // time out into the queue; the queue drains automatically.
            match alice.send_message(&group, b"back online").await {
                Ok(SendOutcome::Acknowledged) => return,
                Ok(SendOutcome::Queued) | Err(_) => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                },
            }
        }
    };
    timeout(WAIT, sent).await.unwrap();

    let envelope = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(bob.open_message(&envelope).await.unwrap(), b"back online");
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_sent_during_the_outage_arrive_after_recovery() {
    let world = SimWorld::new(32);
    let (alice, _) = world.client("alice", "a-phone");
    let (bob, _) = world.client("bob", "b-phone");
    let group = GroupId::from("g1");
    share_group(&alice, &bob, &group).await;

    alice.connect("relay").await.unwrap();
    bob.connect("relay").await.unwrap();
    alice.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();
    bob.subscribe(vec![group.clone()], "tok".to_string()).await.unwrap();

    let mut alice_events = alice.events();
    let mut bob_events = bob.events();
    world.relay.disconnect_all().await;
    await_state(&mut alice_events, ConnectionState::Disconnected).await;

    // Let bob get back first so the relay has somewhere to deliver to,
    // whichever path alice's send takes.
    await_state(&mut bob_events, ConnectionState::Connected).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut inbox = bob.deliveries();

    // Depending on how far the reconnect got, the send either queues or
    // goes straight through; both must end in delivery.
    let outcome = alice.send_message(&group, b"while away").await.unwrap();
    assert!(matches!(outcome, SendOutcome::Queued | SendOutcome::Acknowledged));

    await_state(&mut alice_events, ConnectionState::Connected).await;

    // If it queued, the resubscribe confirmation kicks off the drain;
    // nothing else to call.
    let envelope = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(bob.open_message(&envelope).await.unwrap(), b"while away");
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_dial_fails_the_connect_call() {
    let world = SimWorld::new(33);
    world.relay.set_refuse_dials(true);
    let (alice, _) = world.client("alice", "a-phone");

    let err = alice.connect("relay").await.unwrap_err();
    assert!(matches!(err, ClientError::Connection(ConnectionError::Channel(_))));
    assert_eq!(alice.state().await, ConnectionState::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_disconnect_stays_down() {
    let world = SimWorld::new(34);
    let (alice, _) = world.client("alice", "a-phone");

    alice.connect("relay").await.unwrap();
    assert_eq!(alice.state().await, ConnectionState::Connected);

    alice.disconnect().await;
    assert_eq!(alice.state().await, ConnectionState::Disconnected);

    // No reconnect attempt: the relay sees no new connections.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(alice.state().await, ConnectionState::Disconnected);
    assert_eq!(world.relay.connections().await, 0);
}
