//! In-memory relay speaking the line-JSON wire protocol.
//!
//! One [`SimRelay`] plays the server side for any number of client
//! connections, each backed by an in-process duplex pipe. It assigns
//! `server_seq` per group, acks sends, answers pings, and fans deliveries
//! out to every subscribed connection, including the sender's own
//! (clients suppress self-originated deliveries themselves).
//!
//! Fault knobs flip what the relay does with traffic, so tests can land
//! a client in any protocol corner: refused dials, rejected subscribes,
//! rejected sends (outright or after an accept budget runs out),
//! silently dropped sends, and hard connection drops.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use tether_client::transport::{Connector, FrameSink, FrameStream, json_channel};
use tether_proto::{ErrorContext, GroupId, WireMessage};

/// Handle to the simulated relay. Clones share the same relay.
#[derive(Clone)]
pub struct SimRelay {
    state: Arc<RelayState>,
}

struct RelayState {
    next_seq: Mutex<HashMap<GroupId, u64>>,
    conns: Mutex<HashMap<u64, Conn>>,
    next_conn_id: AtomicU64,
    refuse_dials: AtomicBool,
    reject_subscribes: AtomicBool,
    reject_sends: AtomicBool,
    drop_sends: AtomicBool,
    send_budget: Mutex<Option<u64>>,
}

struct Conn {
    outbound: mpsc::Sender<WireMessage>,
    groups: HashSet<GroupId>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for SimRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRelay {
    /// Create a relay with no connections and all faults off.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RelayState {
                next_seq: Mutex::new(HashMap::new()),
                conns: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                refuse_dials: AtomicBool::new(false),
                reject_subscribes: AtomicBool::new(false),
                reject_sends: AtomicBool::new(false),
                drop_sends: AtomicBool::new(false),
                send_budget: Mutex::new(None),
            }),
        }
    }

    /// Refuse new dials (relay down).
    pub fn set_refuse_dials(&self, on: bool) {
        self.state.refuse_dials.store(on, Ordering::SeqCst);
    }

    /// Answer subscribes with a subscribe error.
    pub fn set_reject_subscribes(&self, on: bool) {
        self.state.reject_subscribes.store(on, Ordering::SeqCst);
    }

    /// Answer sends with a negative ack.
    pub fn set_reject_sends(&self, on: bool) {
        self.state.reject_sends.store(on, Ordering::SeqCst);
    }

    /// Swallow sends without acking or delivering (lossy network).
    pub fn set_drop_sends(&self, on: bool) {
        self.state.drop_sends.store(on, Ordering::SeqCst);
    }

    /// Accept the next `budget` sends, then answer the rest with
    /// negative acks. `None` lifts the budget.
    pub async fn set_send_budget(&self, budget: Option<u64>) {
        *self.state.send_budget.lock().await = budget;
    }

    /// Hard-drop every live connection.
    pub async fn disconnect_all(&self) {
        let mut conns = self.state.conns.lock().await;
        for (_, conn) in conns.drain() {
            for task in conn.tasks {
                task.abort();
            }
        }
    }

    /// Number of live connections.
    pub async fn connections(&self) -> usize {
        self.state.conns.lock().await.len()
    }
}

#[async_trait]
impl Connector for SimRelay {
    async fn dial(&self, _addr: &str) -> io::Result<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        if self.state.refuse_dials.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "relay unavailable"));
        }

        let (client_side, relay_side) = tokio::io::duplex(1 << 16);
        let (client_sink, client_stream) = json_channel(client_side);
        let (mut relay_sink, mut relay_stream) = json_channel(relay_side);

        let conn_id = self.state.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(256);

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if relay_sink.send(&frame).await.is_err() {
                    return;
                }
            }
            let _ = relay_sink.close().await;
        });

        let state = Arc::clone(&self.state);
        let reader_out = out_tx.clone();
        let reader = tokio::spawn(async move {
            while let Ok(Some(frame)) = relay_stream.next().await {
                handle_frame(&state, conn_id, frame, &reader_out).await;
            }
            state.conns.lock().await.remove(&conn_id);
        });

        self.state.conns.lock().await.insert(
            conn_id,
            Conn { outbound: out_tx, groups: HashSet::new(), tasks: vec![writer, reader] },
        );
        Ok((client_sink, client_stream))
    }
}

async fn handle_frame(
    state: &Arc<RelayState>,
    conn_id: u64,
    frame: WireMessage,
    out: &mpsc::Sender<WireMessage>,
) {
    match frame {
        WireMessage::Ping { timestamp } => {
            let _ = out.send(WireMessage::Pong { timestamp }).await;
        },

        WireMessage::Subscribe { groups, user_id, .. } => {
            if state.reject_subscribes.load(Ordering::SeqCst) {
                let _ = out
                    .send(WireMessage::Error {
                        context: ErrorContext::Subscribe,
                        client_seq: None,
                        error: "subscription rejected".to_string(),
                    })
                    .await;
                return;
            }
            tracing::debug!(conn = conn_id, user = %user_id, "subscribed");
            if let Some(conn) = state.conns.lock().await.get_mut(&conn_id) {
                conn.groups = groups.into_iter().collect();
            }
            let _ = out.send(WireMessage::Subscribed).await;
        },

        WireMessage::Send { group_id, sender_id, device_id, kind, ciphertext, client_seq } => {
            if state.drop_sends.load(Ordering::SeqCst) {
                return;
            }
            let over_budget = {
                let mut budget = state.send_budget.lock().await;
                match budget.as_mut() {
                    Some(0) => true,
                    Some(remaining) => {
                        *remaining -= 1;
                        false
                    },
                    None => false,
                }
            };
            if over_budget || state.reject_sends.load(Ordering::SeqCst) {
                let _ = out
                    .send(WireMessage::Ack {
                        client_seq,
                        success: false,
                        error: Some("not a member".to_string()),
                    })
                    .await;
                return;
            }

            let server_seq = {
                let mut seqs = state.next_seq.lock().await;
                let seq = seqs.entry(group_id.clone()).or_insert(0);
                *seq += 1;
                *seq
            };
            let _ = out.send(WireMessage::Ack { client_seq, success: true, error: None }).await;

            let deliver = WireMessage::Deliver {
                group_id: group_id.clone(),
                server_seq,
                server_time: wall_ms(),
                sender_id,
                device_id,
                kind,
                ciphertext,
            };
            let conns = state.conns.lock().await;
            for conn in conns.values() {
                if conn.groups.contains(&group_id) {
                    let _ = conn.outbound.send(deliver.clone()).await;
                }
            }
        },

        // Client-bound record types arriving at the relay are ignored.
        _ => {},
    }
}

fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
