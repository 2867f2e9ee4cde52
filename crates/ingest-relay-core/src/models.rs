//! Core data models shared by the relay server, the uploader, and the
//! pipeline stages.
//!
//! Wire-facing types use the camelCase field names the browser client
//! already speaks (`fileID`, `isLastChunk`, …); everything else is plain
//! Rust naming.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════
// Channel
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle state of a resilient channel.
///
/// `Offline` is reached only after the automatic retry budget is spent and
/// is left only by an explicit manual reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Offline,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Reconnecting => "reconnecting",
            ChannelState::Offline => "offline",
        };
        f.write_str(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Transfers
// ═══════════════════════════════════════════════════════════════════════

/// One bounded slice of a larger payload.
///
/// Produced by [`crate::codec::split`]; `sequence_index < total_count`, and
/// the fragment at `total_count - 1` is the only one with `is_last` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFragment {
    pub transfer_id: String,
    pub sequence_index: usize,
    pub total_count: usize,
    pub is_last: bool,
    pub bytes: Vec<u8>,
}

/// How [`FileTransfer::content`] is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Text,
    Base64,
}

/// The reassembled upload: file descriptor plus inline content.
///
/// This is the JSON document a client serializes, fragments, and streams
/// over the import socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransfer {
    #[serde(rename = "fileID")]
    pub file_id: String,
    pub filename: String,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub content: String,
    #[serde(default)]
    pub content_encoding: ContentEncoding,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

// ═══════════════════════════════════════════════════════════════════════
// Pipeline configuration
// ═══════════════════════════════════════════════════════════════════════

/// The four pipeline stage kinds, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageKind {
    Loader,
    Splitter,
    Vectorizer,
    Sink,
}

impl StageKind {
    /// All kinds in the order a file passes through them.
    pub const ALL: [StageKind; 4] = [
        StageKind::Loader,
        StageKind::Splitter,
        StageKind::Vectorizer,
        StageKind::Sink,
    ];

    /// Status label sent to clients while a file is in this stage.
    pub fn status_label(&self) -> &'static str {
        match self {
            StageKind::Loader => "LOADING",
            StageKind::Splitter => "SPLITTING",
            StageKind::Vectorizer => "VECTORIZING",
            StageKind::Sink => "STORING",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Loader => "loader",
            StageKind::Splitter => "splitter",
            StageKind::Vectorizer => "vectorizer",
            StageKind::Sink => "sink",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "loader" => Ok(StageKind::Loader),
            "splitter" => Ok(StageKind::Splitter),
            "vectorizer" => Ok(StageKind::Vectorizer),
            "sink" => Ok(StageKind::Sink),
            other => Err(format!(
                "unknown stage kind '{}'. Must be loader, splitter, vectorizer, or sink.",
                other
            )),
        }
    }
}

/// A chosen stage implementation plus its per-file configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSelection {
    pub name: String,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
}

impl StageSelection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: empty_object(),
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// Per-file stage choices. Unset entries fall back to server defaults
/// when the record is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader: Option<StageSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splitter: Option<StageSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vectorizer: Option<StageSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<StageSelection>,
}

impl PipelineConfig {
    pub fn selection(&self, kind: StageKind) -> Option<&StageSelection> {
        match kind {
            StageKind::Loader => self.loader.as_ref(),
            StageKind::Splitter => self.splitter.as_ref(),
            StageKind::Vectorizer => self.vectorizer.as_ref(),
            StageKind::Sink => self.sink.as_ref(),
        }
    }

    /// Fill every unset selection from `defaults`.
    pub fn merged_with(&self, defaults: &PipelineConfig) -> PipelineConfig {
        PipelineConfig {
            loader: self.loader.clone().or_else(|| defaults.loader.clone()),
            splitter: self.splitter.clone().or_else(|| defaults.splitter.clone()),
            vectorizer: self
                .vectorizer
                .clone()
                .or_else(|| defaults.vectorizer.clone()),
            sink: self.sink.clone().or_else(|| defaults.sink.clone()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Stage inputs and outputs
// ═══════════════════════════════════════════════════════════════════════

/// Text extracted by a loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Content {
    pub text: String,
    pub title: Option<String>,
    /// Set when loading produced an artifact that must be tracked under a
    /// new file identifier (e.g. a page fetched from a URL upload).
    pub derived_name: Option<String>,
    pub metadata: serde_json::Value,
}

/// One piece of split text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// Context handed to a sink alongside the chunks and vectors.
#[derive(Debug, Clone, Serialize)]
pub struct StoreMetadata {
    pub file_id: String,
    pub filename: String,
    pub source: String,
    pub labels: Vec<String>,
    pub title: Option<String>,
    pub vectorizer: String,
    pub overwrite: bool,
}

/// Sink acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreAck {
    pub stored_chunks: usize,
    pub document_id: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Ingestion state
// ═══════════════════════════════════════════════════════════════════════

/// Per-file pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionState {
    Waiting,
    Running(StageKind),
    Done,
    Error,
}

impl IngestionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestionState::Done | IngestionState::Error)
    }

    /// The `status` string of the wire status message.
    pub fn wire_status(&self) -> &'static str {
        match self {
            IngestionState::Waiting => "WAITING",
            IngestionState::Running(kind) => kind.status_label(),
            IngestionState::Done => "DONE",
            IngestionState::Error => "ERROR",
        }
    }
}

impl fmt::Display for IngestionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestionState::Running(kind) => write!(f, "RUNNING({})", kind),
            other => f.write_str(other.wire_status()),
        }
    }
}

/// Result of one attempted stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    Failed(String),
}

/// One `stage_history` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub kind: StageKind,
    pub name: String,
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub elapsed_ms: u64,
}

/// A file being driven through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionRecord {
    pub file_id: String,
    pub display_name: String,
    #[serde(skip)]
    pub raw_payload: FileTransfer,
    pub pipeline_config: PipelineConfig,
    pub state: IngestionState,
    pub stage_history: Vec<StageRecord>,
    pub created_at: DateTime<Utc>,
}

impl IngestionRecord {
    /// Build a fresh `Waiting` record from a reassembled transfer,
    /// filling unset stage selections from `defaults`.
    pub fn from_transfer(transfer: FileTransfer, defaults: &PipelineConfig) -> Self {
        let pipeline_config = transfer.pipeline.merged_with(defaults);
        Self {
            file_id: transfer.file_id.clone(),
            display_name: transfer.filename.clone(),
            raw_payload: transfer,
            pipeline_config,
            state: IngestionState::Waiting,
            stage_history: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Notification emitted on every state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub file_id: String,
    pub state: IngestionState,
    pub stage_name: Option<String>,
    pub message: String,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Re-key notification: processing continues under `new_file_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFile {
    pub new_file_id: String,
    pub original_file_id: String,
    pub filename: String,
}

/// Latest known state of one file, as returned by a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSnapshot {
    pub file_id: String,
    pub state: Option<IngestionState>,
    pub stage_name: Option<String>,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_status_labels() {
        assert_eq!(IngestionState::Waiting.wire_status(), "WAITING");
        assert_eq!(
            IngestionState::Running(StageKind::Vectorizer).wire_status(),
            "VECTORIZING"
        );
        assert_eq!(IngestionState::Error.wire_status(), "ERROR");
        assert!(IngestionState::Done.is_terminal());
        assert!(!IngestionState::Running(StageKind::Sink).is_terminal());
    }

    #[test]
    fn test_file_transfer_wire_names() {
        let json = r#"{
            "fileID": "f1",
            "filename": "notes.md",
            "content": "hello",
            "pipeline": { "splitter": { "name": "token", "config": { "units": 50 } } }
        }"#;
        let t: FileTransfer = serde_json::from_str(json).unwrap();
        assert_eq!(t.file_id, "f1");
        assert_eq!(t.content_encoding, ContentEncoding::Text);
        assert_eq!(t.pipeline.splitter.as_ref().unwrap().name, "token");
        assert!(t.pipeline.loader.is_none());
    }

    #[test]
    fn test_pipeline_merge_keeps_explicit_choices() {
        let defaults = PipelineConfig {
            loader: Some(StageSelection::new("basic")),
            splitter: Some(StageSelection::new("paragraph")),
            vectorizer: Some(StageSelection::new("hashing")),
            sink: Some(StageSelection::new("memory")),
        };
        let explicit = PipelineConfig {
            splitter: Some(StageSelection::new("token")),
            ..Default::default()
        };
        let merged = explicit.merged_with(&defaults);
        assert_eq!(merged.splitter.unwrap().name, "token");
        assert_eq!(merged.loader.unwrap().name, "basic");
        assert_eq!(merged.sink.unwrap().name, "memory");
    }

    #[test]
    fn test_state_serialization() {
        let v = serde_json::to_value(IngestionState::Running(StageKind::Loader)).unwrap();
        assert_eq!(v, serde_json::json!({ "state": "RUNNING", "stage": "Loader" }));
        let v = serde_json::to_value(IngestionState::Done).unwrap();
        assert_eq!(v, serde_json::json!({ "state": "DONE" }));
    }

    #[test]
    fn test_stage_kind_parse() {
        assert_eq!("Vectorizer".parse::<StageKind>().unwrap(), StageKind::Vectorizer);
        assert!("embedder".parse::<StageKind>().is_err());
    }
}
