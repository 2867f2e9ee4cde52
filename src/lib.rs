//! # Ingest Relay
//!
//! A real-time ingestion relay. Clients stream files to the server as
//! ordered fragments over a WebSocket that survives drops; the server
//! reassembles each file and runs it through a pluggable
//! load → split → vectorize → store pipeline, broadcasting a status line at
//! every step.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ fragments ┌──────────┐ FileTransfer ┌──────────────┐
//! │ Resilient    │──────────▶│  Intake  │─────────────▶│ Orchestrator │
//! │ Channel      │           │ sessions │              │ stage runner │
//! └──────▲───────┘           └──────────┘              └──────┬───────┘
//!        │                                                    │
//!        │            status lines       ┌─────────────┐      │
//!        └───────────────────────────────│ Broadcaster │◀─────┘
//!                                        └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! relay init                    # write ./config/relay.toml
//! relay serve                   # HTTP API + /ws/import
//! relay upload notes.md --label Docs
//! relay stages --kind splitter
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`channel`] | Reconnecting, heartbeating client channel |
//! | [`protocol`] | Frames exchanged on the import socket |
//! | [`intake`] | Server-side fragment reassembly |
//! | [`orchestrator`] | Per-file pipeline runs and their state |
//! | [`broadcast`] | Status fan-out to connected sockets |
//! | [`stages`] | Built-in loaders, splitters, vectorizers, sinks |
//! | [`server`] | HTTP and WebSocket server |
//! | [`upload`] | Client-side uploader |
//! | [`progress`] | Upload progress reporting |
//! | [`db`] | SQLite connection for the sqlite sink |
//! | [`migrate`] | Sink schema |

pub mod broadcast;
pub mod channel;
pub mod config;
pub mod db;
pub mod intake;
pub mod migrate;
pub mod orchestrator;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod stages;
pub mod upload;
