//! Pipeline stage contracts and the startup registration table.
//!
//! A file moves through four stage kinds in order:
//!
//! ```text
//!  FileTransfer ─▶ Loader ─▶ Content ─▶ Splitter ─▶ Vec<TextChunk>
//!                                                       │
//!          StoreAck ◀─ Sink ◀─ Vec<Vec<f32>> ◀─ Vectorizer
//! ```
//!
//! Implementations are registered once at startup in a [`StageRegistry`],
//! keyed by `(kind, name)`, and the registry is frozen behind an `Arc`
//! before the server accepts traffic. Per-file stage choices are resolved
//! against it at run time, so a misspelled stage name fails only the file
//! that asked for it.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use ingest_relay_core::error::StageError;
//! use ingest_relay_core::models::{Content, StageKind, TextChunk};
//! use ingest_relay_core::stage::{PipelineStageDescriptor, Splitter, StageRegistry};
//!
//! struct Lines;
//!
//! #[async_trait]
//! impl Splitter for Lines {
//!     async fn split(&self, content: &Content, _config: &Value) -> Result<Vec<TextChunk>, StageError> {
//!         Ok(content
//!             .text
//!             .lines()
//!             .enumerate()
//!             .map(|(index, line)| TextChunk { index, text: line.to_string(), hash: String::new() })
//!             .collect())
//!     }
//! }
//!
//! let mut registry = StageRegistry::new();
//! registry
//!     .register(PipelineStageDescriptor::splitter("lines", Lines).with_description("One chunk per line"))
//!     .unwrap();
//! assert_eq!(registry.list_available(StageKind::Splitter).len(), 1);
//! assert!(registry.resolve(StageKind::Splitter, "words").is_err());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{RegistryError, SchemaViolation, StageError};
use crate::models::{Content, FileTransfer, StageKind, StoreAck, StoreMetadata, TextChunk};

// ═══════════════════════════════════════════════════════════════════════
// Stage traits
// ═══════════════════════════════════════════════════════════════════════

/// Turns a raw upload into text.
#[async_trait]
pub trait Loader: Send + Sync {
    /// `config` has already been validated against the descriptor's
    /// schema, with defaults filled in.
    async fn load(&self, raw: &FileTransfer, config: &Value) -> Result<Content, StageError>;
}

/// Cuts loaded text into chunks.
#[async_trait]
pub trait Splitter: Send + Sync {
    async fn split(&self, content: &Content, config: &Value) -> Result<Vec<TextChunk>, StageError>;
}

/// Produces one vector per chunk.
///
/// The orchestrator calls this in batches; an implementation must return
/// exactly `chunks.len()` vectors, in order.
#[async_trait]
pub trait Vectorizer: Send + Sync {
    async fn embed(&self, chunks: &[TextChunk], config: &Value) -> Result<Vec<Vec<f32>>, StageError>;
}

/// Persists chunks and their vectors.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn store(
        &self,
        chunks: &[TextChunk],
        vectors: &[Vec<f32>],
        metadata: &StoreMetadata,
        config: &Value,
    ) -> Result<StoreAck, StageError>;
}

/// A registered stage implementation.
#[derive(Clone)]
pub enum StageHandler {
    Loader(Arc<dyn Loader>),
    Splitter(Arc<dyn Splitter>),
    Vectorizer(Arc<dyn Vectorizer>),
    Sink(Arc<dyn Sink>),
}

impl StageHandler {
    pub fn kind(&self) -> StageKind {
        match self {
            StageHandler::Loader(_) => StageKind::Loader,
            StageHandler::Splitter(_) => StageKind::Splitter,
            StageHandler::Vectorizer(_) => StageKind::Vectorizer,
            StageHandler::Sink(_) => StageKind::Sink,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Descriptor
// ═══════════════════════════════════════════════════════════════════════

/// A named stage plus its configuration schema.
///
/// The kind is derived from the handler, so a descriptor can never claim
/// a kind its handler does not implement.
#[derive(Clone)]
pub struct PipelineStageDescriptor {
    pub name: String,
    pub description: String,
    /// JSON-Schema-style object: `properties` with `type`, `enum`,
    /// `default`, `minimum`, plus a top-level `required` list.
    pub config_schema: Value,
    pub handler: StageHandler,
}

impl PipelineStageDescriptor {
    pub fn new(name: impl Into<String>, handler: StageHandler) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            config_schema: serde_json::json!({ "type": "object", "properties": {} }),
            handler,
        }
    }

    pub fn loader(name: impl Into<String>, loader: impl Loader + 'static) -> Self {
        Self::new(name, StageHandler::Loader(Arc::new(loader)))
    }

    pub fn splitter(name: impl Into<String>, splitter: impl Splitter + 'static) -> Self {
        Self::new(name, StageHandler::Splitter(Arc::new(splitter)))
    }

    pub fn vectorizer(name: impl Into<String>, vectorizer: impl Vectorizer + 'static) -> Self {
        Self::new(name, StageHandler::Vectorizer(Arc::new(vectorizer)))
    }

    pub fn sink(name: impl Into<String>, sink: impl Sink + 'static) -> Self {
        Self::new(name, StageHandler::Sink(Arc::new(sink)))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.config_schema = schema;
        self
    }

    pub fn kind(&self) -> StageKind {
        self.handler.kind()
    }

    /// Validate `config` against this stage's schema, returning the
    /// config with defaults applied.
    pub fn prepare_config(&self, config: &Value) -> Result<Value, StageError> {
        validate_config(&self.config_schema, config).map_err(|v| StageError::InvalidConfig {
            kind: self.kind(),
            message: v.to_string(),
        })
    }

    pub fn info(&self) -> StageInfo {
        StageInfo {
            kind: self.kind(),
            name: self.name.clone(),
            description: self.description.clone(),
            config_schema: self.config_schema.clone(),
        }
    }
}

/// Serializable view of a descriptor, used by `GET /api/stages` and
/// `relay stages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageInfo {
    pub kind: StageKind,
    pub name: String,
    pub description: String,
    pub config_schema: Value,
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Explicit `(kind, name)` table of stage implementations.
#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<(StageKind, String), Arc<PipelineStageDescriptor>>,
    order: Vec<(StageKind, String)>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage. A second registration under the same `(kind, name)`
    /// is a boot-time error.
    pub fn register(&mut self, descriptor: PipelineStageDescriptor) -> Result<(), RegistryError> {
        let key = (descriptor.kind(), descriptor.name.clone());
        if self.stages.contains_key(&key) {
            return Err(RegistryError::DuplicateStage {
                kind: key.0,
                name: key.1,
            });
        }
        self.order.push(key.clone());
        self.stages.insert(key, Arc::new(descriptor));
        Ok(())
    }

    pub fn resolve(
        &self,
        kind: StageKind,
        name: &str,
    ) -> Result<Arc<PipelineStageDescriptor>, RegistryError> {
        self.stages
            .get(&(kind, name.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::UnknownStage {
                kind,
                name: name.to_string(),
            })
    }

    pub fn contains(&self, kind: StageKind, name: &str) -> bool {
        self.stages.contains_key(&(kind, name.to_string()))
    }

    /// Stages of one kind, in registration order.
    pub fn list_available(&self, kind: StageKind) -> Vec<StageInfo> {
        self.order
            .iter()
            .filter(|(k, _)| *k == kind)
            .filter_map(|key| self.stages.get(key))
            .map(|d| d.info())
            .collect()
    }

    /// Every registered stage, grouped by kind in pipeline order.
    pub fn list_all(&self) -> Vec<StageInfo> {
        StageKind::ALL
            .iter()
            .flat_map(|kind| self.list_available(*kind))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Config validation
// ═══════════════════════════════════════════════════════════════════════

/// Check `config` against a stage schema and inject defaults.
///
/// A `null` config is treated as `{}`. Unknown fields pass through
/// untouched.
pub fn validate_config(schema: &Value, config: &Value) -> Result<Value, SchemaViolation> {
    let mut result = match config {
        Value::Null => serde_json::Map::new(),
        Value::Object(map) => map.clone(),
        other => return Err(SchemaViolation::NotAnObject(json_type_name(other))),
    };

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|v| v.as_str()) {
            if !result.contains_key(field) {
                return Err(SchemaViolation::Missing(field.to_string()));
            }
        }
    }

    for (field, prop) in &properties {
        let Some(value) = result.get(field) else {
            if let Some(default) = prop.get("default") {
                result.insert(field.clone(), default.clone());
            }
            continue;
        };

        if let Some(expected) = prop.get("type").and_then(|t| t.as_str()) {
            let type_ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !type_ok {
                return Err(SchemaViolation::WrongType {
                    field: field.clone(),
                    expected: expected.to_string(),
                    actual: json_type_name(value),
                });
            }
        }

        if let Some(allowed) = prop.get("enum").and_then(|e| e.as_array()) {
            if !allowed.contains(value) {
                return Err(SchemaViolation::NotAllowed {
                    field: field.clone(),
                    allowed: allowed
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                    actual: value.to_string(),
                });
            }
        }

        if let (Some(minimum), Some(actual)) = (
            prop.get("minimum").and_then(|m| m.as_f64()),
            value.as_f64(),
        ) {
            if actual < minimum {
                return Err(SchemaViolation::BelowMinimum {
                    field: field.clone(),
                    minimum,
                    actual,
                });
            }
        }
    }

    Ok(Value::Object(result))
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
