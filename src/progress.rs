//! Upload progress reporting.
//!
//! `relay upload` reports what is being sent, each status line the server
//! streams back, and channel trouble. Progress is emitted on **stderr** so
//! stdout stays parseable; the final summary is the only stdout output.

use std::io::{IsTerminal, Write};

use ingest_relay_core::models::ChannelState;

/// A single progress event for an upload.
#[derive(Clone, Debug, PartialEq)]
pub enum UploadEvent {
    /// A file was fragmented and handed to the channel.
    Sending {
        filename: String,
        bytes: u64,
        fragments: usize,
    },
    /// A status line from the server.
    Status {
        filename: String,
        status: String,
        message: String,
        took: f64,
    },
    /// The server continues a file under a new id.
    Derived { filename: String, new_name: String },
    /// The channel changed state.
    Channel { state: ChannelState },
}

/// Reports upload progress. Implementations write to stderr (human or JSON).
pub trait UploadProgressReporter: Send + Sync {
    fn report(&self, event: UploadEvent);
}

/// Human-friendly progress on stderr: `upload notes.md  VECTORIZING  1.20s  Vectorizing with hashing`.
pub struct StderrProgress;

impl UploadProgressReporter for StderrProgress {
    fn report(&self, event: UploadEvent) {
        let line = match &event {
            UploadEvent::Sending {
                filename,
                bytes,
                fragments,
            } => format!(
                "upload {}  sending  {} bytes in {} fragments\n",
                filename,
                format_number(*bytes),
                format_number(*fragments as u64)
            ),
            UploadEvent::Status {
                filename,
                status,
                message,
                took,
            } => format!("upload {}  {}  {:.2}s  {}\n", filename, status, took, message),
            UploadEvent::Derived { filename, new_name } => {
                format!("upload {}  continues as {}\n", filename, new_name)
            }
            UploadEvent::Channel { state } => format!("channel {}\n", state),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl UploadProgressReporter for JsonProgress {
    fn report(&self, event: UploadEvent) {
        let obj = match &event {
            UploadEvent::Sending {
                filename,
                bytes,
                fragments,
            } => serde_json::json!({
                "event": "sending",
                "filename": filename,
                "bytes": bytes,
                "fragments": fragments
            }),
            UploadEvent::Status {
                filename,
                status,
                message,
                took,
            } => serde_json::json!({
                "event": "status",
                "filename": filename,
                "status": status,
                "message": message,
                "took": took
            }),
            UploadEvent::Derived { filename, new_name } => serde_json::json!({
                "event": "derived",
                "filename": filename,
                "new_name": new_name
            }),
            UploadEvent::Channel { state } => serde_json::json!({
                "event": "channel",
                "state": state
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl UploadProgressReporter for NoProgress {
    fn report(&self, _event: UploadEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn UploadProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
