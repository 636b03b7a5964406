//! Versioned wrapper for the flow state blob.
//!
//! The state of a flow instance travels between workers as JSON. It is always
//! wrapped with a format version so a worker running an older or newer build
//! refuses a blob it cannot interpret instead of misreading it.

use crate::error::EngineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// The state blob format written by this build.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// A payload tagged with its format version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Format version of the payload.
    pub version: u32,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps a payload with the current format version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            payload,
        }
    }

    /// Unwraps the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn to_value(&self) -> Result<JsonValue, EngineError> {
        serde_json::to_value(self).map_err(|e| EngineError::InvalidState {
            reason: e.to_string(),
        })
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Opens a JSON blob, checking the version before touching the payload.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnsupportedStateVersion`] for a foreign version
    /// and [`EngineError::InvalidState`] for a malformed blob.
    pub fn from_value(value: JsonValue) -> Result<Self, EngineError> {
        #[derive(Deserialize)]
        struct Raw {
            version: u32,
            payload: JsonValue,
        }

        let raw: Raw = serde_json::from_value(value).map_err(|e| EngineError::InvalidState {
            reason: e.to_string(),
        })?;

        if raw.version != STATE_FORMAT_VERSION {
            return Err(EngineError::UnsupportedStateVersion {
                found: raw.version,
                expected: STATE_FORMAT_VERSION,
            });
        }

        let payload = serde_json::from_value(raw.payload).map_err(|e| EngineError::InvalidState {
            reason: e.to_string(),
        })?;

        Ok(Self {
            version: raw.version,
            payload,
        })
    }
}
