//! Delivery coordinator runtime: suspension points over the pure
//! [`Coordinator`] machine.
//!
//! The machine tracks pending acks and decides what happens; this
//! module owns the `await` side: callers of [`DeliveryCoordinator::send`]
//! and [`DeliveryCoordinator::subscribe`] park on oneshot channels that
//! the machine's `SendResolved`/`SubscribeResolved` actions complete.
//!
//! Queue drains run on their own task. A drain replays entries oldest
//! first, removes an entry only after its ack, and stops at the first
//! failure so nothing is reordered past a message that did not make it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, Mutex};

use tether_core::connection::ConnectionState;
use tether_core::delivery::{
    Coordinator, DeliveryAction, DeliveryConfig, SendDisposition, SendOutcome, Subscription,
};
use tether_core::env::Environment;
use tether_core::error::DeliveryError;
use tether_core::queue::OfflineQueue;
use tether_proto::{DeviceId, GroupId, IncomingEnvelope, MsgKind, OutgoingEnvelope, UserId};

use crate::manager::{ClientEvent, ConnectionManager};

// Upper bound on one tick sleep so a deadline armed after the sleep
// started is never missed by more than this.
const TICK_GRANULARITY: Duration = Duration::from_millis(200);

type SendWaiter = oneshot::Sender<Result<SendOutcome, DeliveryError>>;

/// Runtime wrapper around the delivery machine.
pub struct DeliveryCoordinator {
    weak: Weak<DeliveryCoordinator>,
    manager: Arc<ConnectionManager>,
    queue: Arc<dyn OfflineQueue>,
    env: Arc<dyn Environment>,
    local_user: UserId,
    local_device: DeviceId,
    machine: Mutex<Coordinator>,
    send_waiters: Mutex<HashMap<u64, SendWaiter>>,
    subscribe_waiter: Mutex<Option<oneshot::Sender<Result<(), DeliveryError>>>>,
    deliveries: broadcast::Sender<IncomingEnvelope>,
    // Serializes drains; a second DrainQueue while one runs waits.
    drain_lock: Mutex<()>,
}

impl DeliveryCoordinator {
    /// Build the coordinator and spawn its event and tick tasks.
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(
        manager: Arc<ConnectionManager>,
        queue: Arc<dyn OfflineQueue>,
        env: Arc<dyn Environment>,
        config: DeliveryConfig,
        local_user: UserId,
        local_device: DeviceId,
    ) -> Arc<Self> {
        let (deliveries, _) = broadcast::channel(256);
        let this = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            manager: Arc::clone(&manager),
            queue,
            env,
            local_user: local_user.clone(),
            local_device: local_device.clone(),
            machine: Mutex::new(Coordinator::new(config, local_user, local_device)),
            send_waiters: Mutex::new(HashMap::new()),
            subscribe_waiter: Mutex::new(None),
            deliveries,
            drain_lock: Mutex::new(()),
        });

        tokio::spawn(Self::run_events(Arc::downgrade(&this), manager.events()));
        tokio::spawn(Self::run_ticks(Arc::downgrade(&this)));
        this
    }

    /// Subscribe to deliveries addressed to this client.
    #[must_use]
    pub fn deliveries(&self) -> broadcast::Receiver<IncomingEnvelope> {
        self.deliveries.subscribe()
    }

    /// Issue a subscribe request and wait for confirmation.
    ///
    /// The subscription is remembered and replayed automatically on
    /// every reconnect.
    pub async fn subscribe(
        &self,
        groups: Vec<GroupId>,
        auth: String,
    ) -> Result<(), DeliveryError> {
        let subscription = Subscription {
            user_id: self.local_user.clone(),
            device_id: self.local_device.clone(),
            groups,
            auth,
        };
        let connected = self.connected().await;
        let (tx, rx) = oneshot::channel();

        let actions = {
            let mut machine = self.machine.lock().await;
            let actions = machine.subscribe_requested(subscription, connected, self.env.now())?;
            *self.subscribe_waiter.lock().await = Some(tx);
            actions
        };
        self.execute(actions).await;
        rx.await.map_err(|_| DeliveryError::Cancelled)?
    }

    /// Send one payload to a group with acknowledged delivery.
    ///
    /// Offline, this resolves immediately with [`SendOutcome::Queued`];
    /// online, it suspends until the relay acks, rejects, or the ack
    /// window expires (in which case the envelope is already queued for
    /// retry).
    pub async fn send(
        &self,
        group_id: GroupId,
        kind: MsgKind,
        ciphertext: Vec<u8>,
    ) -> Result<SendOutcome, DeliveryError> {
        let connected = self.connected().await;
        let now = self.env.now();

        let (envelope, disposition, actions) = {
            let mut machine = self.machine.lock().await;
            let envelope = OutgoingEnvelope {
                group_id,
                sender_id: self.local_user.clone(),
                device_id: self.local_device.clone(),
                kind,
                ciphertext,
                client_seq: machine.next_client_seq(),
            };
            let (disposition, actions) = machine.send_requested(envelope.clone(), connected, now);
            (envelope, disposition, actions)
        };

        match disposition {
            SendDisposition::QueuedOffline => {
                tracing::debug!(client_seq = envelope.client_seq, "offline, queueing envelope");
                self.execute(actions).await;
                Ok(SendOutcome::Queued)
            },
            SendDisposition::InFlight => {
                let (tx, rx) = oneshot::channel();
                self.send_waiters.lock().await.insert(envelope.client_seq, tx);
                self.execute(actions).await;
                rx.await.map_err(|_| DeliveryError::Cancelled)?
            },
        }
    }

    /// Drain the offline queue, oldest first.
    ///
    /// Returns how many entries were acknowledged and removed. Stops at
    /// the first entry that fails or when the client goes offline; the
    /// failed entry and everything behind it stay queued in order.
    pub async fn sync_offline(&self) -> Result<usize, DeliveryError> {
        let _guard = self.drain_lock.lock().await;

        let entries = self
            .queue
            .entries()
            .await
            .map_err(|e| DeliveryError::Queue(e.to_string()))?;
        if entries.is_empty() {
            return Ok(0);
        }
        tracing::debug!(queued = entries.len(), "draining offline queue");

        let mut drained = 0;
        for entry in entries {
            if !self.connected().await || !self.machine.lock().await.subscribed() {
                break;
            }

            let (disposition, seq, actions) = self
                .machine
                .lock()
                .await
                .retry_requested(entry.envelope.clone(), true, self.env.now());
            if disposition == SendDisposition::QueuedOffline {
                break;
            }

            let (tx, rx) = oneshot::channel();
            self.send_waiters.lock().await.insert(seq, tx);
            self.execute(actions).await;

            match rx.await {
                Ok(Ok(SendOutcome::Acknowledged)) => {
                    self.queue
                        .remove(entry.id)
                        .await
                        .map_err(|e| DeliveryError::Queue(e.to_string()))?;
                    drained += 1;
                },
                Ok(Ok(SendOutcome::Queued)) | Ok(Err(_)) | Err(_) => {
                    tracing::debug!(
                        client_seq = entry.envelope.client_seq,
                        "drain stopped at unacknowledged entry"
                    );
                    break;
                },
            }
        }
        Ok(drained)
    }

    /// Cancel every suspended operation and forget the subscription.
    /// Called on explicit disconnect.
    pub async fn shutdown(&self) {
        let actions = self.machine.lock().await.shutdown();
        self.execute(actions).await;
    }

    async fn connected(&self) -> bool {
        self.manager.state().await == ConnectionState::Connected
    }

    async fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::StateChanged { state: ConnectionState::Connected, .. } => {
                let actions = self.machine.lock().await.connection_restored(self.env.now());
                self.execute(actions).await;
            },
            ClientEvent::StateChanged { .. } => {
                self.machine.lock().await.connection_lost();
            },
            ClientEvent::MessageReceived(frame) => {
                let actions = self.machine.lock().await.frame_received(frame, self.env.now());
                self.execute(actions).await;
            },
        }
    }

    // Boxed rather than `async fn` to break the `Send` auto-trait
    // cycle with `sync_offline`, which this awaits and which is
    // awaited by the drain task spawned here.
    fn execute<'a>(
        &'a self,
        actions: Vec<DeliveryAction>,
    ) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        for action in actions {
            match action {
                DeliveryAction::SendFrame(frame) => {
                    let _ = self.manager.send(frame).await;
                },
                DeliveryAction::Deliver(envelope) => {
                    let _ = self.deliveries.send(envelope);
                },
                DeliveryAction::EnqueueOffline(envelope) => {
                    if let Err(e) = self.queue.append(envelope).await {
                        tracing::error!(error = %e, "failed to persist envelope");
                    }
                },
                DeliveryAction::SendResolved { client_seq, outcome } => {
                    if let Some(waiter) = self.send_waiters.lock().await.remove(&client_seq) {
                        let _ = waiter.send(outcome);
                    }
                },
                DeliveryAction::SubscribeResolved { result } => {
                    if let Some(waiter) = self.subscribe_waiter.lock().await.take() {
                        let _ = waiter.send(result);
                    }
                },
                DeliveryAction::DrainQueue => {
                    if let Some(this) = self.weak.upgrade() {
                        tokio::spawn(async move {
                            if let Err(e) = this.sync_offline().await {
                                tracing::warn!(error = %e, "offline queue drain failed");
                            }
                        });
                    }
                },
            }
        }
        })
    }

    async fn run_events(weak: Weak<Self>, mut events: broadcast::Receiver<ClientEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "delivery coordinator lagged on events");
                    continue;
                },
                Err(broadcast::error::RecvError::Closed) => return,
            };
            let Some(this) = weak.upgrade() else {
                return;
            };
            this.handle_event(event).await;
        }
    }

    async fn run_ticks(weak: Weak<Self>) {
        loop {
            let wait = {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                let deadline = this.machine.lock().await.next_deadline();
                match deadline {
                    Some(deadline) => deadline
                        .saturating_duration_since(this.env.now())
                        .min(TICK_GRANULARITY),
                    None => TICK_GRANULARITY,
                }
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;

            let Some(this) = weak.upgrade() else {
                return;
            };
            let now = this.env.now();
            let actions = this.machine.lock().await.tick(now);
            this.execute(actions).await;
        }
    }
}
