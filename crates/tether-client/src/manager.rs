//! Connection manager: the task that drives the connection machine.
//!
//! The pure [`Connection`] machine decides; this module executes. One
//! supervisor task owns the machine and serializes everything that can
//! touch it: caller commands, link events from the dial/reader/writer
//! tasks, and timer ticks at the machine's own deadlines.
//!
//! Every spawned link task is tagged with the generation counter current
//! at spawn time. Tearing the link down bumps the generation, so events
//! from a stale dial or a half-dead reader are recognized and dropped
//! instead of corrupting the machine.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use tether_core::connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState};
use tether_core::env::Environment;
use tether_core::error::ConnectionError;
use tether_proto::WireMessage;

use crate::transport::{Connector, FrameSink, FrameStream};

/// Events fanned out to listeners.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The connection entered a new state.
    StateChanged {
        /// The state just entered.
        state: ConnectionState,
        /// The error that caused the transition, if any.
        error: Option<ConnectionError>,
    },
    /// A non-heartbeat frame arrived from the relay.
    MessageReceived(WireMessage),
}

enum Cmd {
    Connect { addr: String, reply: oneshot::Sender<Result<(), ConnectionError>> },
    Disconnect { reply: oneshot::Sender<()> },
    Send(WireMessage),
    Reset,
    State { reply: oneshot::Sender<ConnectionState> },
}

enum LinkEvent {
    Opened { generation: u64, sink: Box<dyn FrameSink>, stream: Box<dyn FrameStream> },
    DialFailed { generation: u64, error: String },
    Frame { generation: u64, frame: WireMessage },
    Closed { generation: u64 },
}

/// Handle to the supervisor task.
///
/// Cheap to clone is not needed; wrap in `Arc` to share. Dropping the
/// last handle closes the command channel and the supervisor exits,
/// tearing down any live link.
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<Cmd>,
    events: broadcast::Sender<ClientEvent>,
}

impl ConnectionManager {
    /// Spawn the supervisor. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(
        connector: Arc<dyn Connector>,
        env: Arc<dyn Environment>,
        config: ConnectionConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(256);
        let (link_tx, link_rx) = mpsc::channel(256);

        let supervisor = Supervisor {
            machine: Connection::new(config),
            connector,
            env,
            events: events.clone(),
            cmd_rx,
            link_tx,
            link_rx,
            generation: 0,
            addr: None,
            writer: None,
            reader_task: None,
            writer_task: None,
            connect_waiters: Vec::new(),
            last_error: None,
        };
        tokio::spawn(supervisor.run());

        Self { cmd_tx, events }
    }

    /// Connect to the relay at `addr`.
    ///
    /// Resolves once the channel is open, or fails when the machine
    /// gives up. Already connecting or connected resolves immediately
    /// alongside the in-progress attempt.
    pub async fn connect(&self, addr: &str) -> Result<(), ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Connect { addr: addr.to_string(), reply: tx })
            .await
            .map_err(|_| ConnectionError::Closed)?;
        rx.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Explicit disconnect: close the link, drop buffered frames, no
    /// reconnect.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Disconnect { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Submit a frame. Buffered by the machine while not connected.
    pub async fn send(&self, frame: WireMessage) -> Result<(), ConnectionError> {
        self.cmd_tx.send(Cmd::Send(frame)).await.map_err(|_| ConnectionError::Closed)
    }

    /// Leave the terminal `Failed` state.
    pub async fn reset(&self) {
        let _ = self.cmd_tx.send(Cmd::Reset).await;
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::State { reply: tx }).await.is_err() {
            return ConnectionState::Disconnected;
        }
        rx.await.unwrap_or(ConnectionState::Disconnected)
    }

    /// Subscribe to connection events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

struct Supervisor {
    machine: Connection,
    connector: Arc<dyn Connector>,
    env: Arc<dyn Environment>,
    events: broadcast::Sender<ClientEvent>,
    cmd_rx: mpsc::Receiver<Cmd>,
    link_tx: mpsc::Sender<LinkEvent>,
    link_rx: mpsc::Receiver<LinkEvent>,
    generation: u64,
    addr: Option<String>,
    writer: Option<mpsc::Sender<WireMessage>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
    connect_waiters: Vec<oneshot::Sender<Result<(), ConnectionError>>>,
    last_error: Option<ConnectionError>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let deadline = self.machine.next_deadline();
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd).await,
                    None => break,
                },
                Some(event) = self.link_rx.recv() => self.handle_link(event).await,
                () = wait_until(deadline) => {
                    let now = self.env.now();
                    let unix_ms = self.env.unix_ms();
                    let jitter = self.env.jitter(self.machine.config().reconnect_jitter);
                    let actions = self.machine.tick(now, unix_ms, jitter);
                    self.execute(actions).await;
                },
            }
        }
        self.teardown_link();
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Connect { addr, reply } => match self.machine.state() {
                ConnectionState::Connected => {
                    let _ = reply.send(Ok(()));
                },
                ConnectionState::Failed => {
                    let error = self.last_error.clone().unwrap_or(ConnectionError::Closed);
                    let _ = reply.send(Err(error));
                },
                ConnectionState::Connecting => {
                    // Ride along with the attempt already in flight.
                    self.connect_waiters.push(reply);
                },
                ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                    self.addr = Some(addr);
                    self.connect_waiters.push(reply);
                    let actions = self.machine.connect_requested(self.env.now());
                    self.execute(actions).await;
                },
            },
            Cmd::Disconnect { reply } => {
                let actions = self.machine.disconnect_requested();
                self.execute(actions).await;
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(ConnectionError::Closed));
                }
                let _ = reply.send(());
            },
            Cmd::Send(frame) => {
                let actions = self.machine.send(frame);
                self.execute(actions).await;
            },
            Cmd::Reset => {
                self.last_error = None;
                let actions = self.machine.reset();
                self.execute(actions).await;
            },
            Cmd::State { reply } => {
                let _ = reply.send(self.machine.state());
            },
        }
    }

    async fn handle_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened { generation, sink, stream } if generation == self.generation => {
                self.attach_link(sink, stream);
                let actions = self.machine.channel_opened(self.env.now());
                self.execute(actions).await;
            },
            LinkEvent::DialFailed { generation, error } if generation == self.generation => {
                tracing::warn!(error = %error, "dial failed");
                let actions =
                    self.machine.channel_error(ConnectionError::Channel(error));
                self.execute(actions).await;
            },
            LinkEvent::Frame { generation, frame } if generation == self.generation => {
                match self.machine.frame_received(frame, self.env.now()) {
                    Ok(Some(frame)) => {
                        let _ = self.events.send(ClientEvent::MessageReceived(frame));
                    },
                    Ok(None) => {},
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping inbound record");
                    },
                }
            },
            LinkEvent::Closed { generation } if generation == self.generation => {
                tracing::debug!("link closed");
                self.teardown_link();
                let now = self.env.now();
                let jitter = self.env.jitter(self.machine.config().reconnect_jitter);
                let actions = self.machine.channel_closed(now, jitter);
                self.execute(actions).await;
            },
            // A previous link's tail; the machine moved on already.
            _ => {},
        }
    }

    async fn execute(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::Dial => self.spawn_dial(),
                ConnectionAction::SendFrame(frame) => {
                    if let Some(writer) = &self.writer {
                        // A dead writer surfaces as a Closed link event
                        // from its own task; nothing to do here.
                        let _ = writer.send(frame).await;
                    }
                },
                ConnectionAction::CloseChannel { reason } => {
                    tracing::debug!(%reason, "closing channel");
                    self.teardown_link();
                },
                ConnectionAction::NotifyState { state, error } => {
                    tracing::debug!(?state, ?error, "connection state changed");
                    match state {
                        ConnectionState::Connected => {
                            for waiter in self.connect_waiters.drain(..) {
                                let _ = waiter.send(Ok(()));
                            }
                        },
                        ConnectionState::Failed => {
                            self.last_error = error.clone();
                            let failure =
                                error.clone().unwrap_or(ConnectionError::Closed);
                            for waiter in self.connect_waiters.drain(..) {
                                let _ = waiter.send(Err(failure.clone()));
                            }
                        },
                        _ => {},
                    }
                    let _ = self.events.send(ClientEvent::StateChanged { state, error });
                },
            }
        }
    }

    fn spawn_dial(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let Some(addr) = self.addr.clone() else {
            return;
        };
        let connector = Arc::clone(&self.connector);
        let link_tx = self.link_tx.clone();
        tokio::spawn(async move {
            let event = match connector.dial(&addr).await {
                Ok((sink, stream)) => LinkEvent::Opened { generation, sink, stream },
                Err(e) => LinkEvent::DialFailed { generation, error: e.to_string() },
            };
            let _ = link_tx.send(event).await;
        });
    }

    fn attach_link(&mut self, mut sink: Box<dyn FrameSink>, mut stream: Box<dyn FrameStream>) {
        let generation = self.generation;
        let (writer_tx, mut writer_rx) = mpsc::channel::<WireMessage>(64);
        self.writer = Some(writer_tx);

        let link_tx = self.link_tx.clone();
        self.writer_task = Some(tokio::spawn(async move {
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = sink.send(&frame).await {
                    tracing::debug!(error = %e, "write failed");
                    let _ = link_tx.send(LinkEvent::Closed { generation }).await;
                    return;
                }
            }
            let _ = sink.close().await;
        }));

        let link_tx = self.link_tx.clone();
        self.reader_task = Some(tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Ok(Some(frame)) => {
                        if link_tx.send(LinkEvent::Frame { generation, frame }).await.is_err() {
                            return;
                        }
                    },
                    Ok(None) => {
                        let _ = link_tx.send(LinkEvent::Closed { generation }).await;
                        return;
                    },
                    Err(e) => {
                        tracing::debug!(error = %e, "read failed");
                        let _ = link_tx.send(LinkEvent::Closed { generation }).await;
                        return;
                    },
                }
            }
        }));
    }

    fn teardown_link(&mut self) {
        self.generation += 1;
        self.writer = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
