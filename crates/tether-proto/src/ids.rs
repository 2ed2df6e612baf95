//! Identity newtypes used across the protocol.
//!
//! Groups, users, and devices are all identified by opaque strings
//! (UUIDs in practice, but nothing here depends on that). Newtypes keep
//! the three spaces from being mixed up at call sites.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one group (conversation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

/// Identifier of one user identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Identifier of one device belonging to a user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

macro_rules! id_impls {
    ($ty:ident) => {
        impl $ty {
            /// Wrap a raw identifier string.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the raw identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $ty {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }
    };
}

id_impls!(GroupId);
id_impls!(UserId);
id_impls!(DeviceId);
