//! Output schema validation for node results.
//!
//! Each task may reference a JSON Schema document describing its result.
//! Schemas are compiled once when the system configuration is built; the
//! envelope then validates every result against the compiled schema before
//! the result is reported as finished.

use crate::error::ConfigError;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// A node result that does not conform to the node's output schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// The node whose result failed validation.
    pub node_name: String,
    /// Where the schema was loaded from.
    pub schema_path: String,
    /// Every violation found, `instance path: message`, joined by `; `.
    pub detail: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "result of '{}' violates schema {}: {}",
            self.node_name, self.schema_path, self.detail
        )
    }
}

impl std::error::Error for SchemaViolation {}

/// Validates node results.
///
/// Implementations must be side-effect free: the same input always yields
/// the same outcome.
pub trait ResultValidator: Send + Sync {
    /// Checks `result` against the output schema configured for `node_name`.
    ///
    /// Nodes without a schema always pass.
    fn validate(&self, node_name: &str, result: &JsonValue) -> Result<(), SchemaViolation>;
}

struct CompiledSchema {
    path: String,
    schema: JSONSchema,
}

/// Compiled output schemas keyed by node name.
#[derive(Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<CompiledSchema>>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and registers a schema for a node.
    ///
    /// `path` is only used for reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema is not a valid JSON Schema.
    pub fn register(
        &mut self,
        node_name: impl Into<String>,
        path: impl Into<String>,
        schema: &JsonValue,
    ) -> Result<(), ConfigError> {
        let node_name = node_name.into();
        let path = path.into();

        let compiled = JSONSchema::compile(schema).map_err(|e| ConfigError::InvalidSchema {
            node_name: node_name.clone(),
            path: path.clone(),
            reason: e.to_string(),
        })?;

        self.schemas.insert(
            node_name,
            Arc::new(CompiledSchema {
                path,
                schema: compiled,
            }),
        );
        Ok(())
    }

    /// Loads a schema document from disk and registers it for a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not JSON, or is not a
    /// valid JSON Schema.
    pub fn load(&mut self, node_name: impl Into<String>, path: &Path) -> Result<(), ConfigError> {
        let node_name = node_name.into();
        let display = path.display().to_string();

        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: display.clone(),
            reason: e.to_string(),
        })?;
        let schema: JsonValue =
            serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidSchema {
                node_name: node_name.clone(),
                path: display.clone(),
                reason: e.to_string(),
            })?;

        self.register(node_name, display, &schema)
    }

    /// Returns true if the node has an output schema.
    #[must_use]
    pub fn has_schema(&self, node_name: &str) -> bool {
        self.schemas.contains_key(node_name)
    }

    /// Returns the path the node's schema was loaded from.
    #[must_use]
    pub fn schema_path(&self, node_name: &str) -> Option<&str> {
        self.schemas.get(node_name).map(|c| c.path.as_str())
    }
}

impl ResultValidator for SchemaRegistry {
    fn validate(&self, node_name: &str, result: &JsonValue) -> Result<(), SchemaViolation> {
        let Some(compiled) = self.schemas.get(node_name) else {
            return Ok(());
        };

        let messages = match compiled.schema.validate(result) {
            Ok(()) => return Ok(()),
            Err(errors) => errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect::<Vec<String>>(),
        };

        Err(SchemaViolation {
            node_name: node_name.to_string(),
            schema_path: compiled.path.clone(),
            detail: messages.join("; "),
        })
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.schemas.iter().map(|(name, c)| (name, &c.path)))
            .finish()
    }
}
