//! Application envelopes carried over the wire.

use serde::{Deserialize, Serialize};

use crate::{
    ids::{DeviceId, GroupId, UserId},
    wire::WireMessage,
};

/// What kind of payload an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgKind {
    /// Ordinary chat message.
    Chat,
    /// Non-chat application control traffic.
    Control,
    /// Cryptographic handshake artifact (commit, proposal, ...).
    Handshake,
}

/// One outgoing application message.
///
/// Immutable after creation: the same envelope is replayed byte for byte
/// if it has to be queued and retried later. `client_seq` correlates the
/// send with its acknowledgment and is assigned exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEnvelope {
    /// Target group.
    pub group_id: GroupId,
    /// Sending user.
    pub sender_id: UserId,
    /// Sending device.
    pub device_id: DeviceId,
    /// Envelope kind.
    pub kind: MsgKind,
    /// Opaque ciphertext from the cryptographic engine.
    pub ciphertext: Vec<u8>,
    /// Client-assigned correlation number.
    pub client_seq: u64,
}

impl OutgoingEnvelope {
    /// Build the wire record for this envelope.
    #[must_use]
    pub fn to_wire(&self) -> WireMessage {
        WireMessage::Send {
            group_id: self.group_id.clone(),
            sender_id: self.sender_id.clone(),
            device_id: self.device_id.clone(),
            kind: self.kind,
            ciphertext: self.ciphertext.clone(),
            client_seq: self.client_seq,
        }
    }
}

/// One delivered message from the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingEnvelope {
    /// Originating group.
    pub group_id: GroupId,
    /// Relay-assigned, per-group strictly increasing sequence number.
    pub server_seq: u64,
    /// Relay wall-clock milliseconds at acceptance.
    pub server_time: u64,
    /// Original sender.
    pub sender_id: UserId,
    /// Original sending device.
    pub device_id: DeviceId,
    /// Envelope kind.
    pub kind: MsgKind,
    /// Opaque ciphertext.
    pub ciphertext: Vec<u8>,
}

/// An envelope persisted in the durable offline queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Durable queue identifier, assigned at enqueue time.
    pub id: u64,
    /// The queued envelope, unchanged from when it was first created.
    pub envelope: OutgoingEnvelope,
}
