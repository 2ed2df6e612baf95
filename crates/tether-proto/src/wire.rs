//! Tagged union of all wire records.
//!
//! # Protocol Flow
//!
//! Client to relay: `ping`, `subscribe`, `send`.
//! Relay to client: `pong`, `subscribed`, `ack`, `deliver`, `error`.
//!
//! Acknowledged send: the client assigns `client_seq` (monotonic per
//! connection session) and the relay answers with an `ack` carrying the
//! same value. Delivery ordering within a group is defined solely by the
//! relay-assigned `server_seq`; clients never assign it.

use serde::{Deserialize, Serialize};

use crate::{
    envelope::MsgKind,
    ids::{DeviceId, GroupId, UserId},
};

/// Which operation an `error` record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorContext {
    /// Failure of a `subscribe` request.
    Subscribe,
    /// Failure of a `send` request (correlated by `client_seq`).
    Send,
    /// Anything else (malformed input, internal relay failure).
    Protocol,
}

/// One wire record, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Heartbeat probe. The relay echoes the timestamp back in a `pong`.
    Ping {
        /// Sender wall-clock milliseconds, echoed verbatim.
        timestamp: u64,
    },

    /// Heartbeat response.
    Pong {
        /// Timestamp copied from the matching `ping`.
        timestamp: u64,
    },

    /// Subscribe this connection to a set of groups.
    Subscribe {
        /// Subscribing user.
        user_id: UserId,
        /// Subscribing device.
        device_id: DeviceId,
        /// Groups to receive deliveries for.
        groups: Vec<GroupId>,
        /// Opaque auth value validated by the relay.
        auth: String,
    },

    /// Positive confirmation of a `subscribe`.
    Subscribed,

    /// Deliver one envelope to a group.
    Send {
        /// Target group.
        group_id: GroupId,
        /// Sending user.
        sender_id: UserId,
        /// Sending device.
        device_id: DeviceId,
        /// Envelope kind.
        kind: MsgKind,
        /// Opaque ciphertext from the cryptographic engine.
        ciphertext: Vec<u8>,
        /// Client-assigned correlation number.
        client_seq: u64,
    },

    /// Acknowledgment of a `send`, positive or negative.
    Ack {
        /// Correlation number from the acknowledged `send`.
        client_seq: u64,
        /// Whether the relay accepted the envelope.
        success: bool,
        /// Rejection reason when `success` is false.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// An envelope delivered to this subscriber.
    Deliver {
        /// Originating group.
        group_id: GroupId,
        /// Relay-assigned, per-group strictly increasing sequence number.
        server_seq: u64,
        /// Relay wall-clock milliseconds at acceptance.
        server_time: u64,
        /// Original sender.
        sender_id: UserId,
        /// Original sending device.
        device_id: DeviceId,
        /// Envelope kind.
        kind: MsgKind,
        /// Opaque ciphertext, untouched by the relay.
        ciphertext: Vec<u8>,
    },

    /// Relay-reported failure.
    Error {
        /// Operation the failure refers to.
        context: ErrorContext,
        /// Correlation number when the failure refers to a `send`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_seq: Option<u64>,
        /// Human-readable reason.
        error: String,
    },
}

impl WireMessage {
    /// Encode this record as one JSON line (no trailing newline).
    pub fn encode(&self) -> Result<String, crate::ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one JSON record.
    pub fn decode(raw: &str) -> Result<Self, crate::ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// The wire `type` tag of this record.
    #[must_use]
    pub fn record_type(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Subscribe { .. } => "subscribe",
            Self::Subscribed => "subscribed",
            Self::Send { .. } => "send",
            Self::Ack { .. } => "ack",
            Self::Deliver { .. } => "deliver",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this record type may only travel client-to-relay.
    #[must_use]
    pub fn is_server_bound(&self) -> bool {
        matches!(self, Self::Ping { .. } | Self::Subscribe { .. } | Self::Send { .. })
    }
}
