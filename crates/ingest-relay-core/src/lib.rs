//! # Ingest Relay Core
//!
//! Runtime-agnostic pieces of Ingest Relay: data models, the fragment
//! codec, transfer reassembly sessions, the pipeline stage contracts and
//! registry, text chunkers, and the subscriber lists used for events.
//!
//! This crate has no tokio, sqlx, or network dependencies. Everything
//! that touches a socket or a database lives in the `ingest-relay` crate.

pub mod chunk;
pub mod codec;
pub mod error;
pub mod events;
pub mod models;
pub mod session;
pub mod stage;
