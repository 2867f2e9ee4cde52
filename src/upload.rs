//! Client side of the import socket.
//!
//! Builds [`FileTransfer`] payloads from local files, fragments them onto a
//! [`ResilientChannel`], and follows the server's status stream until every
//! file is `DONE` or `ERROR`. After a reconnect the uploader asks for a
//! snapshot, so a terminal status that was broadcast while it was away is
//! not missed.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::Engine;
use ingest_relay_core::codec::split_text;
use ingest_relay_core::models::{ChannelState, ContentEncoding, FileTransfer, PipelineConfig};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::ResilientChannel;
use crate::progress::{UploadEvent, UploadProgressReporter};
use crate::protocol::{ClientControl, DataBatch, ServerControl, ServerFrame};

/// Per-upload descriptor fields applied to every file.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub source: String,
    pub labels: Vec<String>,
    pub overwrite: bool,
    pub pipeline: PipelineConfig,
}

/// How one file ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileOutcome {
    pub filename: String,
    #[serde(rename = "fileID")]
    pub file_id: String,
    pub status: String,
    pub message: String,
    pub took: f64,
}

impl FileOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == "DONE"
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadSummary {
    pub files: Vec<FileOutcome>,
}

impl UploadSummary {
    pub fn failed(&self) -> usize {
        self.files.iter().filter(|f| !f.succeeded()).count()
    }
}

/// Read `path` into a transfer. UTF-8 files travel as text, anything else
/// as base64.
pub fn build_transfer(path: &Path, options: &UploadOptions) -> Result<FileTransfer> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    let file_size = bytes.len() as u64;
    let (content, content_encoding) = match String::from_utf8(bytes) {
        Ok(text) => (text, ContentEncoding::Text),
        Err(e) => (
            base64::engine::general_purpose::STANDARD.encode(e.into_bytes()),
            ContentEncoding::Base64,
        ),
    };

    Ok(FileTransfer {
        file_id: Uuid::new_v4().to_string(),
        filename,
        extension,
        source: if options.source.is_empty() {
            path.display().to_string()
        } else {
            options.source.clone()
        },
        labels: options.labels.clone(),
        content,
        content_encoding,
        file_size,
        overwrite: options.overwrite,
        pipeline: options.pipeline.clone(),
    })
}

/// Turn a transfer into the wire frames that carry it.
pub fn encode_transfer(transfer: &FileTransfer, fragment_size: usize) -> Result<Vec<String>> {
    let json = serde_json::to_string(transfer)?;
    let fragments = split_text(&transfer.file_id, &json, fragment_size)?;
    fragments
        .map(|f| -> Result<String> {
            let batch = DataBatch::from_fragment(f)?;
            Ok(serde_json::to_string(&batch)?)
        })
        .collect()
}

enum Inbound {
    Frame(ServerFrame),
    State(ChannelState),
}

/// Send `transfers` and wait until each one is terminal. Fails if the
/// channel goes `Offline` with files still pending.
pub async fn upload(
    channel: &ResilientChannel,
    transfers: Vec<FileTransfer>,
    fragment_size: usize,
    reporter: &dyn UploadProgressReporter,
) -> Result<UploadSummary> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let frames_tx = tx.clone();
    let message_sub = channel.on_message(move |text| match ServerFrame::parse(text) {
        Ok(frame) => {
            let _ = frames_tx.send(Inbound::Frame(frame));
        }
        Err(e) => debug!(error = %e, "ignoring unreadable server frame"),
    });
    let state_sub = channel.on_state_change(move |state| {
        let _ = tx.send(Inbound::State(*state));
    });

    let result = run_upload(channel, transfers, fragment_size, reporter, &mut rx).await;

    channel.unsubscribe(&message_sub);
    channel.unsubscribe(&state_sub);
    result
}

async fn run_upload(
    channel: &ResilientChannel,
    transfers: Vec<FileTransfer>,
    fragment_size: usize,
    reporter: &dyn UploadProgressReporter,
    rx: &mut mpsc::UnboundedReceiver<Inbound>,
) -> Result<UploadSummary> {
    // file id → filename, for files not yet terminal
    let mut pending: HashMap<String, String> = HashMap::new();
    let mut summary = UploadSummary::default();

    channel.connect();
    for transfer in &transfers {
        let frames = encode_transfer(transfer, fragment_size)?;
        reporter.report(UploadEvent::Sending {
            filename: transfer.filename.clone(),
            bytes: transfer.file_size,
            fragments: frames.len(),
        });
        for frame in frames {
            channel.send(frame);
        }
        pending.insert(transfer.file_id.clone(), transfer.filename.clone());
    }
    info!(files = pending.len(), "upload queued");

    let mut was_connected = channel.state() == ChannelState::Connected;
    while !pending.is_empty() {
        let Some(inbound) = rx.recv().await else {
            bail!("channel closed with {} files pending", pending.len());
        };
        match inbound {
            Inbound::State(state) => {
                reporter.report(UploadEvent::Channel { state });
                match state {
                    ChannelState::Connected if was_connected => {
                        let request = ClientControl::Snapshot {
                            file_ids: pending.keys().cloned().collect(),
                        };
                        channel.send(serde_json::to_string(&request)?);
                    }
                    ChannelState::Connected => was_connected = true,
                    ChannelState::Offline => {
                        bail!("channel went offline with {} files pending", pending.len());
                    }
                    ChannelState::Disconnected => {
                        bail!("channel closed with {} files pending", pending.len());
                    }
                    _ => {}
                }
            }
            Inbound::Frame(ServerFrame::Status(msg)) => {
                let Some(filename) = pending.get(&msg.file_id).cloned() else {
                    continue;
                };
                reporter.report(UploadEvent::Status {
                    filename: filename.clone(),
                    status: msg.status.clone(),
                    message: msg.message.clone(),
                    took: msg.took,
                });
                if msg.is_terminal() {
                    pending.remove(&msg.file_id);
                    summary.files.push(FileOutcome {
                        filename,
                        file_id: msg.file_id,
                        status: msg.status,
                        message: msg.message,
                        took: msg.took,
                    });
                }
            }
            Inbound::Frame(ServerFrame::Derived(derived)) => {
                if let Some(filename) = pending.remove(&derived.original_file_id) {
                    reporter.report(UploadEvent::Derived {
                        filename: filename.clone(),
                        new_name: derived.filename.clone(),
                    });
                    pending.insert(derived.new_file_id, filename);
                }
            }
            Inbound::Frame(ServerFrame::Control(ServerControl::Snapshot { files })) => {
                for entry in files {
                    let terminal = matches!(entry.status.as_deref(), Some("DONE" | "ERROR"));
                    if !terminal {
                        continue;
                    }
                    if let Some(filename) = pending.remove(&entry.file_id) {
                        warn!(file_id = %entry.file_id, "terminal status recovered from snapshot");
                        summary.files.push(FileOutcome {
                            filename,
                            file_id: entry.file_id,
                            status: entry.status.unwrap_or_default(),
                            message: entry.message.unwrap_or_default(),
                            took: 0.0,
                        });
                    }
                }
            }
            Inbound::Frame(ServerFrame::Control(ServerControl::Pong)) => {}
        }
    }

    Ok(summary)
}
