//! Delivery coordination: acknowledged send, inbound dedup, and
//! subscription replay.
//!
//! The coordinator sits above the connection machine and the durable
//! offline queue. Like [`crate::connection`], it is a pure state machine
//! following the action pattern: the runtime feeds it frames and clock
//! ticks, and executes the actions it returns (write a frame, hand an
//! envelope to the caller, persist an envelope to the queue, resolve a
//! suspended send).
//!
//! # At-least-once sends
//!
//! A send over an open connection registers a pending ack keyed by
//! `client_seq`. If no ack arrives within the timeout the pending record
//! transitions explicitly from in-flight to queued: the envelope is
//! persisted for retry and the caller is told `AckTimeout`. A later
//! retry can therefore deliver the same envelope twice; the relay keeps
//! no idempotency key beyond `client_seq`, which is deliberate (see the
//! dedup handling on the inbound side).

use std::{
    collections::{BTreeMap, HashSet},
    time::{Duration, Instant},
};

use tether_proto::{
    DeviceId, ErrorContext, GroupId, IncomingEnvelope, OutgoingEnvelope, UserId, WireMessage,
};

use crate::error::DeliveryError;

/// Delivery coordinator configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// How long a sent envelope may wait for its ack.
    pub ack_timeout: Duration,
    /// How long a subscribe request may wait for confirmation.
    pub subscribe_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            subscribe_timeout: Duration::from_secs(5),
        }
    }
}

/// The subscription payload, kept for replay on reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Subscribing user.
    pub user_id: UserId,
    /// Subscribing device.
    pub device_id: DeviceId,
    /// Groups to receive deliveries for.
    pub groups: Vec<GroupId>,
    /// Opaque auth value forwarded to the relay.
    pub auth: String,
}

impl Subscription {
    /// Build the wire record for this subscription.
    #[must_use]
    pub fn to_wire(&self) -> WireMessage {
        WireMessage::Subscribe {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            groups: self.groups.clone(),
            auth: self.auth.clone(),
        }
    }
}

/// How a send concluded, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The relay acknowledged the envelope.
    Acknowledged,
    /// The client was offline; the envelope went straight to the
    /// durable queue without suspending the caller.
    Queued,
}

/// Actions returned by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAction {
    /// Write this frame to the connection.
    SendFrame(WireMessage),
    /// Hand this envelope to the registered delivery callback.
    Deliver(IncomingEnvelope),
    /// Persist this envelope to the durable offline queue.
    EnqueueOffline(OutgoingEnvelope),
    /// Resolve the suspended send keyed by `client_seq`.
    SendResolved {
        /// Correlation number of the resolved send.
        client_seq: u64,
        /// Outcome handed to the waiting caller.
        outcome: Result<SendOutcome, DeliveryError>,
    },
    /// Resolve the suspended subscribe call.
    SubscribeResolved {
        /// Confirmation or the rejection reason.
        result: Result<(), DeliveryError>,
    },
    /// Connected and subscribed: drain the offline queue now.
    DrainQueue,
}

/// Whether a send suspended the caller or returned immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDisposition {
    /// Pending ack registered; the caller suspends until resolved.
    InFlight,
    /// Enqueued offline; the caller gets [`SendOutcome::Queued`] now.
    QueuedOffline,
}

#[derive(Debug, Clone)]
struct PendingAck {
    envelope: OutgoingEnvelope,
    deadline: Instant,
    // False for queue-drain retries: the envelope is still in the
    // durable queue, so expiry must not enqueue it a second time.
    persist_on_timeout: bool,
}

/// Delivery coordinator state machine.
///
/// One per client process, layered over one connection machine.
#[derive(Debug)]
pub struct Coordinator {
    config: DeliveryConfig,
    local_user: UserId,
    local_device: DeviceId,
    next_client_seq: u64,
    pending: BTreeMap<u64, PendingAck>,
    delivered: HashSet<(GroupId, u64)>,
    subscription: Option<Subscription>,
    subscribed: bool,
    subscribe_deadline: Option<Instant>,
}

impl Coordinator {
    /// Create a coordinator for the given local identity.
    ///
    /// The identity is what suppresses self-originated deliveries: the
    /// local client already holds the plaintext of anything it sent.
    pub fn new(config: DeliveryConfig, local_user: UserId, local_device: DeviceId) -> Self {
        Self {
            config,
            local_user,
            local_device,
            next_client_seq: 0,
            pending: BTreeMap::new(),
            delivered: HashSet::new(),
            subscription: None,
            subscribed: false,
            subscribe_deadline: None,
        }
    }

    /// Allocate the next correlation number.
    pub fn next_client_seq(&mut self) -> u64 {
        self.next_client_seq += 1;
        self.next_client_seq
    }

    /// Whether a confirmed subscription is live.
    #[must_use]
    pub fn subscribed(&self) -> bool {
        self.subscribed
    }

    /// Number of sends currently awaiting acknowledgment.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// The earliest instant at which [`Coordinator::tick`] has work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let ack = self.pending.values().map(|p| p.deadline).min();
        [ack, self.subscribe_deadline].into_iter().flatten().min()
    }

    /// Issue a subscribe request.
    ///
    /// Requires a live connection; a single outstanding subscribe is
    /// assumed, so confirmation is correlated by message type alone.
    pub fn subscribe_requested(
        &mut self,
        subscription: Subscription,
        connected: bool,
        now: Instant,
    ) -> Result<Vec<DeliveryAction>, DeliveryError> {
        if !connected {
            return Err(DeliveryError::NotConnected);
        }

        let frame = subscription.to_wire();
        self.subscription = Some(subscription);
        self.subscribed = false;
        self.subscribe_deadline = Some(now + self.config.subscribe_timeout);
        Ok(vec![DeliveryAction::SendFrame(frame)])
    }

    /// The connection came back. Re-issues the stored subscription, if
    /// any, before the caller requests anything. The dedup set is scoped
    /// to one connection lifetime and starts fresh here.
    pub fn connection_restored(&mut self, now: Instant) -> Vec<DeliveryAction> {
        self.delivered.clear();
        match &self.subscription {
            Some(sub) => {
                self.subscribed = false;
                self.subscribe_deadline = Some(now + self.config.subscribe_timeout);
                vec![DeliveryAction::SendFrame(sub.to_wire())]
            },
            None => Vec::new(),
        }
    }

    /// The connection dropped (not an explicit disconnect).
    ///
    /// Pending acks are left in place to expire through [`Self::tick`],
    /// which persists them for retry; only an explicit disconnect
    /// cancels them.
    pub fn connection_lost(&mut self) {
        self.subscribed = false;
        self.subscribe_deadline = None;
    }

    /// Submit an envelope for delivery.
    ///
    /// Offline: persists immediately and never suspends. Online:
    /// registers a pending ack and writes the frame; the caller suspends
    /// until an ack, a rejection, or the timeout resolves it.
    pub fn send_requested(
        &mut self,
        envelope: OutgoingEnvelope,
        connected: bool,
        now: Instant,
    ) -> (SendDisposition, Vec<DeliveryAction>) {
        if !connected {
            return (
                SendDisposition::QueuedOffline,
                vec![DeliveryAction::EnqueueOffline(envelope)],
            );
        }
        (SendDisposition::InFlight, self.register_pending(envelope, now, true))
    }

    /// Re-send an envelope that already sits in the durable queue.
    ///
    /// Unlike [`Self::send_requested`], going offline or timing out never
    /// persists the envelope again; the queue entry the drain is working
    /// from stays the single durable copy. The wire copy is re-stamped
    /// with a freshly allocated `client_seq` (returned to the caller for
    /// correlation): a durable entry carries the seq of the run that
    /// created it, which a later run may have handed out again to a live
    /// send.
    pub fn retry_requested(
        &mut self,
        mut envelope: OutgoingEnvelope,
        connected: bool,
        now: Instant,
    ) -> (SendDisposition, u64, Vec<DeliveryAction>) {
        if !connected {
            return (SendDisposition::QueuedOffline, envelope.client_seq, Vec::new());
        }
        envelope.client_seq = self.next_client_seq();
        let seq = envelope.client_seq;
        (SendDisposition::InFlight, seq, self.register_pending(envelope, now, false))
    }

    fn register_pending(
        &mut self,
        envelope: OutgoingEnvelope,
        now: Instant,
        persist_on_timeout: bool,
    ) -> Vec<DeliveryAction> {
        let frame = envelope.to_wire();
        let seq = envelope.client_seq;
        self.pending.insert(
            seq,
            PendingAck { envelope, deadline: now + self.config.ack_timeout, persist_on_timeout },
        );
        vec![DeliveryAction::SendFrame(frame)]
    }

    /// Process one inbound frame from the connection.
    pub fn frame_received(&mut self, frame: WireMessage, _now: Instant) -> Vec<DeliveryAction> {
        match frame {
            WireMessage::Deliver {
                group_id,
                server_seq,
                server_time,
                sender_id,
                device_id,
                kind,
                ciphertext,
            } => {
                // Self-originated: the local client already has the
                // plaintext.
                if sender_id == self.local_user && device_id == self.local_device {
                    return Vec::new();
                }
                // At most one delivery per (group, server_seq).
                if !self.delivered.insert((group_id.clone(), server_seq)) {
                    return Vec::new();
                }
                vec![DeliveryAction::Deliver(IncomingEnvelope {
                    group_id,
                    server_seq,
                    server_time,
                    sender_id,
                    device_id,
                    kind,
                    ciphertext,
                })]
            },

            WireMessage::Ack { client_seq, success, error } => {
                let Some(_pending) = self.pending.remove(&client_seq) else {
                    // Late ack after the timeout already queued the
                    // envelope. The retry may deliver twice; accepted.
                    return Vec::new();
                };
                let outcome = if success {
                    Ok(SendOutcome::Acknowledged)
                } else {
                    Err(DeliveryError::SendRejected(
                        error.unwrap_or_else(|| "rejected by relay".to_string()),
                    ))
                };
                vec![DeliveryAction::SendResolved { client_seq, outcome }]
            },

            WireMessage::Error { context: ErrorContext::Send, client_seq: Some(seq), error } => {
                if self.pending.remove(&seq).is_none() {
                    return Vec::new();
                }
                vec![DeliveryAction::SendResolved {
                    client_seq: seq,
                    outcome: Err(DeliveryError::SendRejected(error)),
                }]
            },

            WireMessage::Error { context: ErrorContext::Subscribe, error, .. } => {
                self.subscribed = false;
                self.subscribe_deadline = None;
                vec![DeliveryAction::SubscribeResolved {
                    result: Err(DeliveryError::SubscribeRejected(error)),
                }]
            },

            WireMessage::Subscribed => {
                self.subscribed = true;
                self.subscribe_deadline = None;
                vec![
                    DeliveryAction::SubscribeResolved { result: Ok(()) },
                    DeliveryAction::DrainQueue,
                ]
            },

            // Pongs never reach the coordinator (intercepted by the
            // connection machine); client-bound frames of other types
            // are ignored.
            _ => Vec::new(),
        }
    }

    /// Expire overdue pending acks and the subscribe deadline.
    ///
    /// An expired ack is the explicit `InFlight -> Queued` transition:
    /// one action persists the envelope, the next fails the caller.
    pub fn tick(&mut self, now: Instant) -> Vec<DeliveryAction> {
        let mut actions = Vec::new();

        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(pending) = self.pending.remove(&seq) {
                if pending.persist_on_timeout {
                    actions.push(DeliveryAction::EnqueueOffline(pending.envelope));
                }
                actions.push(DeliveryAction::SendResolved {
                    client_seq: seq,
                    outcome: Err(DeliveryError::AckTimeout),
                });
            }
        }

        if self.subscribe_deadline.is_some_and(|d| now >= d) && !self.subscribed {
            self.subscribe_deadline = None;
            actions.push(DeliveryAction::SubscribeResolved {
                result: Err(DeliveryError::SubscribeTimeout),
            });
        }

        actions
    }

    /// Explicit disconnect: cancel every pending ack (failure, not
    /// success, and not queued) and forget the subscription.
    pub fn shutdown(&mut self) -> Vec<DeliveryAction> {
        let mut actions = Vec::new();
        for (seq, _) in std::mem::take(&mut self.pending) {
            actions.push(DeliveryAction::SendResolved {
                client_seq: seq,
                outcome: Err(DeliveryError::Cancelled),
            });
        }
        self.subscription = None;
        self.subscribed = false;
        self.subscribe_deadline = None;
        self.delivered.clear();
        actions
    }
}

#[cfg(test)]
mod tests {
    use tether_proto::MsgKind;

    use super::*;

    fn coordinator() -> Coordinator {
        Coordinator::new(
            DeliveryConfig::default(),
            UserId::from("alice"),
            DeviceId::from("alice-phone"),
        )
    }

    fn envelope(seq: u64) -> OutgoingEnvelope {
        OutgoingEnvelope {
            group_id: GroupId::from("g1"),
            sender_id: UserId::from("alice"),
            device_id: DeviceId::from("alice-phone"),
            kind: MsgKind::Chat,
            ciphertext: vec![seq as u8],
            client_seq: seq,
        }
    }

    fn deliver(seq: u64, sender: &str, device: &str) -> WireMessage {
        WireMessage::Deliver {
            group_id: GroupId::from("g1"),
            server_seq: seq,
            server_time: 1_700_000_000_000,
            sender_id: UserId::from(sender),
            device_id: DeviceId::from(device),
            kind: MsgKind::Chat,
            ciphertext: vec![1],
        }
    }

    #[test]
    fn subscribe_requires_connection() {
        let mut c = coordinator();
        let sub = Subscription {
            user_id: UserId::from("alice"),
            device_id: DeviceId::from("alice-phone"),
            groups: vec![GroupId::from("g1")],
            auth: "tok".to_string(),
        };
        let err = c.subscribe_requested(sub, false, Instant::now()).unwrap_err();
        assert_eq!(err, DeliveryError::NotConnected);
    }

    #[test]
    fn subscribe_confirm_triggers_drain() {
        let mut c = coordinator();
        let now = Instant::now();
        let sub = Subscription {
            user_id: UserId::from("alice"),
            device_id: DeviceId::from("alice-phone"),
            groups: vec![GroupId::from("g1")],
            auth: "tok".to_string(),
        };
        let actions = c.subscribe_requested(sub, true, now).unwrap();
        assert!(matches!(actions[0], DeliveryAction::SendFrame(WireMessage::Subscribe { .. })));
        assert!(!c.subscribed());

        let actions = c.frame_received(WireMessage::Subscribed, now);
        assert!(c.subscribed());
        assert_eq!(
            actions,
            vec![
                DeliveryAction::SubscribeResolved { result: Ok(()) },
                DeliveryAction::DrainQueue
            ]
        );
    }

    #[test]
    fn subscribe_times_out() {
        let mut c = coordinator();
        let now = Instant::now();
        let sub = Subscription {
            user_id: UserId::from("alice"),
            device_id: DeviceId::from("alice-phone"),
            groups: vec![],
            auth: String::new(),
        };
        c.subscribe_requested(sub, true, now).unwrap();

        let actions = c.tick(now + Duration::from_secs(6));
        assert_eq!(
            actions,
            vec![DeliveryAction::SubscribeResolved {
                result: Err(DeliveryError::SubscribeTimeout)
            }]
        );
    }

    #[test]
    fn resubscribes_on_reconnect() {
        let mut c = coordinator();
        let now = Instant::now();
        let sub = Subscription {
            user_id: UserId::from("alice"),
            device_id: DeviceId::from("alice-phone"),
            groups: vec![GroupId::from("g1")],
            auth: "tok".to_string(),
        };
        c.subscribe_requested(sub.clone(), true, now).unwrap();
        c.frame_received(WireMessage::Subscribed, now);

        c.connection_lost();
        assert!(!c.subscribed());

        let actions = c.connection_restored(now);
        assert_eq!(actions, vec![DeliveryAction::SendFrame(sub.to_wire())]);
    }

    #[test]
    fn offline_send_queues_without_suspending() {
        let mut c = coordinator();
        let (disposition, actions) = c.send_requested(envelope(1), false, Instant::now());
        assert_eq!(disposition, SendDisposition::QueuedOffline);
        assert_eq!(actions, vec![DeliveryAction::EnqueueOffline(envelope(1))]);
        assert_eq!(c.in_flight(), 0);
    }

    #[test]
    fn ack_resolves_pending_send() {
        let mut c = coordinator();
        let now = Instant::now();
        let (disposition, _) = c.send_requested(envelope(7), true, now);
        assert_eq!(disposition, SendDisposition::InFlight);
        assert_eq!(c.in_flight(), 1);

        let actions = c.frame_received(
            WireMessage::Ack { client_seq: 7, success: true, error: None },
            now,
        );
        assert_eq!(
            actions,
            vec![DeliveryAction::SendResolved {
                client_seq: 7,
                outcome: Ok(SendOutcome::Acknowledged)
            }]
        );
        assert_eq!(c.in_flight(), 0);
    }

    #[test]
    fn negative_ack_is_permanent_rejection() {
        let mut c = coordinator();
        let now = Instant::now();
        c.send_requested(envelope(3), true, now);

        let actions = c.frame_received(
            WireMessage::Ack {
                client_seq: 3,
                success: false,
                error: Some("not a member".to_string()),
            },
            now,
        );
        // Rejected, and no EnqueueOffline anywhere: permanent failures
        // are never retried.
        assert_eq!(
            actions,
            vec![DeliveryAction::SendResolved {
                client_seq: 3,
                outcome: Err(DeliveryError::SendRejected("not a member".to_string()))
            }]
        );
    }

    #[test]
    fn ack_timeout_queues_then_fails_the_caller() {
        let mut c = coordinator();
        let now = Instant::now();
        c.send_requested(envelope(7), true, now);

        let actions = c.tick(now + Duration::from_secs(11));
        assert_eq!(
            actions,
            vec![
                DeliveryAction::EnqueueOffline(envelope(7)),
                DeliveryAction::SendResolved {
                    client_seq: 7,
                    outcome: Err(DeliveryError::AckTimeout)
                },
            ]
        );
        assert_eq!(c.in_flight(), 0);

        // A straggler ack for the already-expired seq is ignored.
        let actions = c.frame_received(
            WireMessage::Ack { client_seq: 7, success: true, error: None },
            now,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn retry_timeout_never_requeues() {
        let mut c = coordinator();
        let now = Instant::now();
        let (_, seq, _) = c.retry_requested(envelope(4), true, now);

        let actions = c.tick(now + Duration::from_secs(11));
        // The queue already holds the entry the retry came from, so the
        // only action is failing the waiter.
        assert_eq!(
            actions,
            vec![DeliveryAction::SendResolved {
                client_seq: seq,
                outcome: Err(DeliveryError::AckTimeout)
            }]
        );
    }

    #[test]
    fn retry_while_offline_takes_no_action() {
        let mut c = coordinator();
        let (disposition, _, actions) = c.retry_requested(envelope(4), false, Instant::now());
        assert_eq!(disposition, SendDisposition::QueuedOffline);
        assert!(actions.is_empty());
    }

    #[test]
    fn retry_never_displaces_a_live_send() {
        let mut c = coordinator();
        let now = Instant::now();

        // A fresh send holding seq 1.
        let live = envelope(c.next_client_seq());
        assert_eq!(live.client_seq, 1);
        c.send_requested(live.clone(), true, now);

        // A durable entry from an earlier run that was also allocated
        // seq 1. The retry must coexist with the live send, not replace
        // its pending record.
        let (disposition, seq, _) = c.retry_requested(envelope(1), true, now);
        assert_eq!(disposition, SendDisposition::InFlight);
        assert_ne!(seq, live.client_seq);
        assert_eq!(c.in_flight(), 2);

        // Expiry still persists the live send, exactly once.
        let actions = c.tick(now + Duration::from_secs(11));
        let queued: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                DeliveryAction::EnqueueOffline(e) => Some(e.client_seq),
                _ => None,
            })
            .collect();
        assert_eq!(queued, vec![live.client_seq]);
    }

    #[test]
    fn deliver_dedups_by_group_and_server_seq() {
        let mut c = coordinator();
        let now = Instant::now();

        let first = c.frame_received(deliver(5, "bob", "bob-laptop"), now);
        assert_eq!(first.len(), 1);
        assert!(matches!(first[0], DeliveryAction::Deliver(_)));

        let second = c.frame_received(deliver(5, "bob", "bob-laptop"), now);
        assert!(second.is_empty());
    }

    #[test]
    fn self_originated_deliveries_are_suppressed() {
        let mut c = coordinator();
        let now = Instant::now();

        assert!(c.frame_received(deliver(1, "alice", "alice-phone"), now).is_empty());
        // Same user from another device still delivers.
        assert_eq!(c.frame_received(deliver(2, "alice", "alice-tablet"), now).len(), 1);
    }

    #[test]
    fn shutdown_cancels_pending_without_queueing() {
        let mut c = coordinator();
        let now = Instant::now();
        c.send_requested(envelope(1), true, now);
        c.send_requested(envelope(2), true, now);

        let actions = c.shutdown();
        assert_eq!(actions.len(), 2);
        for action in &actions {
            match action {
                DeliveryAction::SendResolved { outcome, .. } => {
                    assert_eq!(outcome, &Err(DeliveryError::Cancelled));
                },
                other => panic!("unexpected action {other:?}"),
            }
        }
        assert_eq!(c.in_flight(), 0);
        assert!(!c.subscribed());
    }

    #[test]
    fn client_seq_is_monotonic() {
        let mut c = coordinator();
        let a = c.next_client_seq();
        let b = c.next_client_seq();
        let d = c.next_client_seq();
        assert!(a < b && b < d);
    }
}
