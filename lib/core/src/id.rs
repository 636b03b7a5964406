//! Strongly-typed identifiers for dispatchers and node occurrences.
//!
//! All IDs use ULID format. Their lexicographic order follows creation time,
//! which keeps occurrence lists in a serialized flow state stable and
//! readable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate a strongly-typed ID wrapper around ULID.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Creates a new ID with a randomly generated ULID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Creates an ID from a ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the prefix used for display formatting.
            #[must_use]
            pub const fn prefix() -> &'static str {
                $prefix
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                // Try with prefix first
                let prefix_with_underscore = concat!($prefix, "_");
                let ulid_str = if let Some(stripped) = s.strip_prefix(prefix_with_underscore) {
                    stripped
                } else {
                    // Try parsing as raw ULID
                    s
                };

                Ulid::from_str(ulid_str)
                    .map(Self)
                    .map_err(|e| ParseIdError {
                        id_type: stringify!($name),
                        reason: e.to_string(),
                    })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Identifies one dispatcher, i.e. one running flow instance.
    DispatcherId,
    "dsp"
);

define_id!(
    /// Identifies a single occurrence of a node within a flow instance.
    ///
    /// A node that runs several times (self-recursion, fan-in from several
    /// edges) gets a fresh id for every occurrence.
    NodeInstanceId,
    "node"
);
