//! Protocol-level error types.

use thiserror::Error;

/// Errors produced while encoding or decoding wire records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The record could not be serialized or parsed as JSON.
    #[error("malformed wire record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A record was syntactically valid but not allowed in this
    /// direction (e.g. a `subscribe` arriving at a client).
    #[error("unexpected wire record of type {0:?}")]
    UnexpectedRecord(&'static str),
}
