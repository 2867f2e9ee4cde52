//! Wire frames for the `/ws/import` socket.
//!
//! Client → server:
//!
//! ```json
//! {"type":"ping"}
//! {"type":"snapshot","fileIDs":["f1","f2"]}
//! {"type":"cancel","fileID":"f1"}
//! {"chunk":"...","isLastChunk":false,"total":3,"order":0,"fileID":"f1"}
//! ```
//!
//! Server → client:
//!
//! ```json
//! {"type":"pong"}
//! {"type":"snapshot","files":[{"fileID":"f1","status":"VECTORIZING","stage":"hashing","message":"..."}]}
//! {"fileID":"f1","status":"DONE","message":"...","took":1.25,"stage":null,"timestamp":"..."}
//! {"new_file_id":"f1Example","original_file_id":"f1","filename":"Example"}
//! ```
//!
//! A fragment's `chunk` is a slice of the JSON-serialized
//! [`FileTransfer`](ingest_relay_core::models::FileTransfer).

use chrono::{DateTime, Utc};
use ingest_relay_core::models::{DerivedFile, FileSnapshot, StatusEvent, TransferFragment};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON for this protocol: {0}")]
    Json(#[from] serde_json::Error),

    #[error("fragment {order} of transfer {file_id} is not valid UTF-8")]
    NotText { file_id: String, order: usize },
}

/// One slice of an upload, as it travels over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataBatch {
    pub chunk: String,
    pub is_last_chunk: bool,
    pub total: usize,
    pub order: usize,
    #[serde(rename = "fileID")]
    pub file_id: String,
    /// Accepted for compatibility; never inspected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<serde_json::Value>,
}

impl DataBatch {
    /// Fragments sent on the wire must carry whole characters; use
    /// [`split_text`](ingest_relay_core::codec::split_text) to produce them.
    pub fn from_fragment(fragment: TransferFragment) -> Result<Self, ProtocolError> {
        let TransferFragment {
            transfer_id,
            sequence_index,
            total_count,
            is_last,
            bytes,
        } = fragment;
        let chunk = String::from_utf8(bytes).map_err(|_| ProtocolError::NotText {
            file_id: transfer_id.clone(),
            order: sequence_index,
        })?;
        Ok(Self {
            chunk,
            is_last_chunk: is_last,
            total: total_count,
            order: sequence_index,
            file_id: transfer_id,
            credentials: None,
        })
    }

    pub fn into_fragment(self) -> TransferFragment {
        TransferFragment {
            transfer_id: self.file_id,
            sequence_index: self.order,
            total_count: self.total,
            is_last: self.is_last_chunk,
            bytes: self.chunk.into_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientControl {
    Ping,
    Snapshot {
        #[serde(rename = "fileIDs")]
        file_ids: Vec<String>,
    },
    Cancel {
        #[serde(rename = "fileID")]
        file_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Control(ClientControl),
    Fragment(DataBatch),
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Status line for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "fileID")]
    pub file_id: String,
    pub status: String,
    pub message: String,
    /// Seconds since the run started.
    pub took: f64,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl StatusMessage {
    pub fn is_terminal(&self) -> bool {
        self.status == "DONE" || self.status == "ERROR"
    }
}

impl From<&StatusEvent> for StatusMessage {
    fn from(event: &StatusEvent) -> Self {
        Self {
            file_id: event.file_id.clone(),
            status: event.state.wire_status().to_string(),
            message: event.message.clone(),
            took: event.elapsed_ms as f64 / 1000.0,
            stage: event.stage_name.clone(),
            timestamp: event.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    #[serde(rename = "fileID")]
    pub file_id: String,
    /// `None` for files the server knows nothing about.
    pub status: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl From<FileSnapshot> for SnapshotEntry {
    fn from(snap: FileSnapshot) -> Self {
        Self {
            file_id: snap.file_id,
            status: snap.state.map(|s| s.wire_status().to_string()),
            stage: snap.stage_name,
            message: snap.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerControl {
    Pong,
    Snapshot { files: Vec<SnapshotEntry> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Control(ServerControl),
    Status(StatusMessage),
    Derived(DerivedFile),
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data with string keys.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_relay_core::codec::split_text;
    use ingest_relay_core::models::{IngestionState, StageKind};

    #[test]
    fn test_parse_client_frames() {
        assert_eq!(
            ClientFrame::parse(r#"{"type":"ping"}"#).unwrap(),
            ClientFrame::Control(ClientControl::Ping)
        );
        assert_eq!(
            ClientFrame::parse(r#"{"type":"cancel","fileID":"f1"}"#).unwrap(),
            ClientFrame::Control(ClientControl::Cancel {
                file_id: "f1".to_string()
            })
        );
        let frame = ClientFrame::parse(
            r#"{"chunk":"{\"a\"","isLastChunk":false,"total":2,"order":0,"fileID":"f1","credentials":{"key":"x"}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::Fragment(batch) => {
                assert_eq!(batch.file_id, "f1");
                assert_eq!(batch.chunk, "{\"a\"");
                assert!(!batch.is_last_chunk);
            }
            other => panic!("expected fragment, got {:?}", other),
        }
        assert!(ClientFrame::parse(r#"{"type":"launch"}"#).is_err());
        assert!(ClientFrame::parse("not json").is_err());
    }

    #[test]
    fn test_fragment_conversion() {
        let frags: Vec<_> = split_text("f1", "héllo wörld", 4).unwrap().collect();
        let batches: Vec<DataBatch> = frags
            .iter()
            .cloned()
            .map(|f| DataBatch::from_fragment(f).unwrap())
            .collect();
        assert_eq!(batches.last().unwrap().order, batches.len() - 1);
        assert!(batches.last().unwrap().is_last_chunk);
        assert_eq!(batches[0].clone().into_fragment(), frags[0]);
    }

    #[test]
    fn test_status_message_from_event() {
        let event = StatusEvent {
            file_id: "f1".to_string(),
            state: IngestionState::Running(StageKind::Vectorizer),
            stage_name: Some("hashing".to_string()),
            message: "Vectorizing".to_string(),
            elapsed_ms: 1500,
            timestamp: Utc::now(),
        };
        let msg = StatusMessage::from(&event);
        assert_eq!(msg.status, "VECTORIZING");
        assert_eq!(msg.took, 1.5);
        let json: serde_json::Value =
            serde_json::from_str(&ServerFrame::Status(msg).to_json()).unwrap();
        assert_eq!(json["fileID"], "f1");
        assert_eq!(json["stage"], "hashing");
    }

    #[test]
    fn test_server_frames_distinguishable() {
        let frames = [
            r#"{"type":"pong"}"#,
            r#"{"type":"snapshot","files":[{"fileID":"x","status":null}]}"#,
            r#"{"fileID":"f","status":"DONE","message":"ok","took":0.5}"#,
            r#"{"new_file_id":"fB","original_file_id":"f","filename":"B"}"#,
        ];
        let parsed: Vec<_> = frames.iter().map(|f| ServerFrame::parse(f).unwrap()).collect();
        assert!(matches!(parsed[0], ServerFrame::Control(ServerControl::Pong)));
        assert!(matches!(parsed[1], ServerFrame::Control(ServerControl::Snapshot { .. })));
        assert!(matches!(&parsed[2], ServerFrame::Status(s) if s.is_terminal()));
        assert!(matches!(&parsed[3], ServerFrame::Derived(d) if d.new_file_id == "fB"));
    }
}
