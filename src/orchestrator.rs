//! Per-file pipeline runs.
//!
//! Each submitted file gets its own tokio task that walks the stages in
//! order:
//!
//! ```text
//! Waiting ─▶ Running(Loader) ─▶ Running(Splitter) ─▶ Running(Vectorizer) ─▶ Running(Sink) ─▶ Done
//!                 │                    │                     │                    │
//!                 └────────────────────┴──────── Error ◀─────┴────────────────────┘
//! ```
//!
//! Every transition is published on the [`StatusBroadcaster`]. A failing
//! stage ends only its own file; other runs never notice.
//!
//! Records are keyed by file id. Each run carries a generation number, and
//! a run whose generation no longer matches its record (cancelled, removed,
//! or replaced by a newer submission) stops at the next stage boundary and
//! discards whatever its in-flight stage returned.
//!
//! A status event is published while the record's slot is still locked, so
//! the order observers see matches the order the record changed in. Status
//! observers must therefore not call back into the orchestrator.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use ingest_relay_core::error::{RegistryError, StageError};
use ingest_relay_core::models::{
    Content, DerivedFile, FileTransfer, IngestionRecord, IngestionState, PipelineConfig,
    StageKind, StageOutcome, StageRecord, StatusEvent, StoreAck, StoreMetadata, TextChunk,
};
use ingest_relay_core::stage::{PipelineStageDescriptor, StageHandler, StageRegistry};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::broadcast::StatusBroadcaster;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("file {file_id} is still {state}; wait for it to finish or cancel it first")]
    AlreadyRunning {
        file_id: String,
        state: IngestionState,
    },

    #[error("no ingestion record for file {0}")]
    NotFound(String),
}

struct Slot {
    record: IngestionRecord,
    /// `None` once cancelled.
    run_id: Option<u64>,
    started: Instant,
}

/// Why a run stopped before `Done`.
enum Halt {
    /// Cancelled, removed, or superseded. Nothing more is published.
    Stale,
    Failed {
        kind: StageKind,
        name: String,
        error: StageError,
    },
}

pub struct Orchestrator {
    registry: Arc<StageRegistry>,
    broadcaster: Arc<StatusBroadcaster>,
    defaults: PipelineConfig,
    embed_batch_size: usize,
    slots: DashMap<String, Slot>,
    next_run: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<StageRegistry>,
        broadcaster: Arc<StatusBroadcaster>,
        defaults: PipelineConfig,
        embed_batch_size: usize,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            defaults,
            embed_batch_size: embed_batch_size.max(1),
            slots: DashMap::new(),
            next_run: AtomicU64::new(1),
        }
    }

    pub fn defaults(&self) -> &PipelineConfig {
        &self.defaults
    }

    /// Build a record from a reassembled upload and submit it.
    pub fn submit_transfer(self: &Arc<Self>, transfer: FileTransfer) -> Result<(), SubmitError> {
        self.submit(IngestionRecord::from_transfer(transfer, &self.defaults))
    }

    /// Queue `record` and start its run. Returns as soon as the run is
    /// spawned. A terminal record under the same id is replaced; an active
    /// one is left alone.
    pub fn submit(self: &Arc<Self>, mut record: IngestionRecord) -> Result<(), SubmitError> {
        let file_id = record.file_id.clone();
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        record.state = IngestionState::Waiting;
        record.stage_history.clear();
        let slot = Slot {
            record,
            run_id: Some(run_id),
            started: Instant::now(),
        };

        let guard = match self.slots.entry(file_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get().record.state;
                if !state.is_terminal() {
                    return Err(SubmitError::AlreadyRunning { file_id, state });
                }
                occupied.insert(slot);
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => vacant.insert(slot),
        };

        info!(file_id = %file_id, run_id, "file submitted");
        self.publish(&file_id, IngestionState::Waiting, None, "Queued for processing", 0);
        drop(guard);
        tokio::spawn(Arc::clone(self).run(file_id, run_id));
        Ok(())
    }

    /// Re-submit a terminal record with its original payload and stage
    /// choices.
    pub fn retry(self: &Arc<Self>, file_id: &str) -> Result<(), SubmitError> {
        let record = self
            .record(file_id)
            .ok_or_else(|| SubmitError::NotFound(file_id.to_string()))?;
        self.submit(record)
    }

    /// Stop an active run. The record goes to `Error` immediately and the
    /// stage in flight, if any, has its result thrown away. Returns `false`
    /// for unknown or already terminal files.
    pub fn cancel(&self, file_id: &str) -> bool {
        let Some(mut slot) = self.slots.get_mut(file_id) else {
            return false;
        };
        if slot.record.state.is_terminal() {
            return false;
        }
        slot.run_id = None;
        slot.record.state = IngestionState::Error;
        let elapsed_ms = slot.started.elapsed().as_millis() as u64;
        info!(file_id = %file_id, "run cancelled");
        self.publish(file_id, IngestionState::Error, None, "cancelled", elapsed_ms);
        true
    }

    pub fn get_state(&self, file_id: &str) -> Option<IngestionState> {
        self.slots.get(file_id).map(|s| s.record.state)
    }

    pub fn record(&self, file_id: &str) -> Option<IngestionRecord> {
        self.slots.get(file_id).map(|s| s.record.clone())
    }

    /// Drop a record. An active run for it stops at its next stage
    /// boundary.
    pub fn remove(&self, file_id: &str) -> Option<IngestionRecord> {
        let removed = self.slots.remove(file_id).map(|(_, slot)| slot.record);
        self.broadcaster.forget(file_id);
        removed
    }

    /// Drop every record.
    pub fn reset(&self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        self.broadcaster.clear();
        info!(count, "orchestrator reset");
        count
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    // ── run ──────────────────────────────────────────────────────────

    async fn run(self: Arc<Self>, file_id: String, run_id: u64) {
        let Some((transfer, pipeline)) = self.slots.get(&file_id).and_then(|s| {
            (s.run_id == Some(run_id))
                .then(|| (s.record.raw_payload.clone(), s.record.pipeline_config.clone()))
        }) else {
            return;
        };
        let started = Instant::now();
        let mut file_id = file_id;

        match self
            .drive(&mut file_id, run_id, &transfer, &pipeline, started)
            .await
        {
            Ok(ack) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let message = format!("Imported {} chunks", ack.stored_chunks);
                if self.settle(&file_id, run_id, IngestionState::Done, None, &message, elapsed_ms) {
                    info!(
                        file_id = %file_id,
                        chunks = ack.stored_chunks,
                        elapsed_ms,
                        "ingestion complete"
                    );
                }
            }
            Err(Halt::Failed { kind, name, error }) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let message = error.to_string();
                let settled = self.settle(
                    &file_id,
                    run_id,
                    IngestionState::Error,
                    Some(name.clone()),
                    &message,
                    elapsed_ms,
                );
                if settled {
                    warn!(file_id = %file_id, stage = %kind, name = %name, error = %error, "stage failed");
                }
            }
            Err(Halt::Stale) => {
                debug!(file_id = %file_id, run_id, "run abandoned");
            }
        }
    }

    async fn drive(
        &self,
        file_id: &mut String,
        run_id: u64,
        transfer: &FileTransfer,
        pipeline: &PipelineConfig,
        started: Instant,
    ) -> Result<StoreAck, Halt> {
        // Load
        let (name, prepared) = self.prepare(pipeline, StageKind::Loader);
        let t = self.begin_stage(file_id, run_id, StageKind::Loader, &name, started)?;
        let result = match prepared {
            Ok((desc, config)) => match &desc.handler {
                StageHandler::Loader(loader) => {
                    guarded(StageKind::Loader, loader.load(transfer, &config)).await
                }
                _ => Err(mismatched(StageKind::Loader, &name)),
            },
            Err(e) => Err(e),
        };
        let content: Content =
            self.finish_stage(file_id, run_id, StageKind::Loader, name.clone(), t, result)?;

        if let Some(derived_name) = content.derived_name.as_deref().filter(|n| !n.is_empty()) {
            *file_id = self.rekey(file_id, run_id, derived_name, &name)?;
        }

        // Split
        let (name, prepared) = self.prepare(pipeline, StageKind::Splitter);
        let t = self.begin_stage(file_id, run_id, StageKind::Splitter, &name, started)?;
        let result = match prepared {
            Ok((desc, config)) => match &desc.handler {
                StageHandler::Splitter(splitter) => {
                    guarded(StageKind::Splitter, splitter.split(&content, &config)).await
                }
                _ => Err(mismatched(StageKind::Splitter, &name)),
            },
            Err(e) => Err(e),
        };
        let chunks: Vec<TextChunk> =
            self.finish_stage(file_id, run_id, StageKind::Splitter, name, t, result)?;

        // Vectorize, one batch at a time
        let (vectorizer_name, prepared) = self.prepare(pipeline, StageKind::Vectorizer);
        let t = self.begin_stage(file_id, run_id, StageKind::Vectorizer, &vectorizer_name, started)?;
        let result = match prepared {
            Ok((desc, config)) => match &desc.handler {
                StageHandler::Vectorizer(vectorizer) => {
                    let mut vectors = Vec::with_capacity(chunks.len());
                    let mut outcome = Ok(());
                    for batch in chunks.chunks(self.embed_batch_size) {
                        if !self.is_current(file_id, run_id) {
                            return Err(Halt::Stale);
                        }
                        match guarded(StageKind::Vectorizer, vectorizer.embed(batch, &config)).await {
                            Ok(out) if out.len() == batch.len() => vectors.extend(out),
                            Ok(out) => {
                                outcome = Err(StageError::Embed(format!(
                                    "returned {} vectors for {} chunks",
                                    out.len(),
                                    batch.len()
                                )));
                                break;
                            }
                            Err(e) => {
                                outcome = Err(e);
                                break;
                            }
                        }
                    }
                    outcome.map(|_| vectors)
                }
                _ => Err(mismatched(StageKind::Vectorizer, &vectorizer_name)),
            },
            Err(e) => Err(e),
        };
        let vectors: Vec<Vec<f32>> = self.finish_stage(
            file_id,
            run_id,
            StageKind::Vectorizer,
            vectorizer_name.clone(),
            t,
            result,
        )?;

        // Store
        let metadata = StoreMetadata {
            file_id: file_id.clone(),
            filename: content
                .derived_name
                .clone()
                .unwrap_or_else(|| transfer.filename.clone()),
            source: transfer.source.clone(),
            labels: transfer.labels.clone(),
            title: content.title.clone(),
            vectorizer: vectorizer_name,
            overwrite: transfer.overwrite,
        };
        let (name, prepared) = self.prepare(pipeline, StageKind::Sink);
        let t = self.begin_stage(file_id, run_id, StageKind::Sink, &name, started)?;
        let result = match prepared {
            Ok((desc, config)) => match &desc.handler {
                StageHandler::Sink(sink) => {
                    guarded(
                        StageKind::Sink,
                        sink.store(&chunks, &vectors, &metadata, &config),
                    )
                    .await
                }
                _ => Err(mismatched(StageKind::Sink, &name)),
            },
            Err(e) => Err(e),
        };
        self.finish_stage(file_id, run_id, StageKind::Sink, name, t, result)
    }

    /// Resolve the selected stage and validate its config. Errors here
    /// fail the stage, not the run setup.
    fn prepare(
        &self,
        pipeline: &PipelineConfig,
        kind: StageKind,
    ) -> (String, Result<(Arc<PipelineStageDescriptor>, Value), StageError>) {
        let Some(selection) = pipeline.selection(kind) else {
            let err = RegistryError::UnknownStage {
                kind,
                name: String::new(),
            };
            return (String::new(), Err(err.into()));
        };
        let prepared = self
            .registry
            .resolve(kind, &selection.name)
            .map_err(StageError::from)
            .and_then(|desc| {
                let config = desc.prepare_config(&selection.config)?;
                Ok((desc, config))
            });
        (selection.name.clone(), prepared)
    }

    fn begin_stage(
        &self,
        file_id: &str,
        run_id: u64,
        kind: StageKind,
        name: &str,
        run_started: Instant,
    ) -> Result<Instant, Halt> {
        let mut slot = self.slots.get_mut(file_id).ok_or(Halt::Stale)?;
        if slot.run_id != Some(run_id) {
            return Err(Halt::Stale);
        }
        slot.record.state = IngestionState::Running(kind);
        debug!(file_id = %file_id, stage = %kind, name = %name, "stage started");
        let message = format!("{} with {}", stage_verb(kind), name);
        self.publish(
            file_id,
            IngestionState::Running(kind),
            Some(name.to_string()),
            &message,
            run_started.elapsed().as_millis() as u64,
        );
        drop(slot);
        Ok(Instant::now())
    }

    /// Record the stage outcome in history. A stale run's result is
    /// dropped without touching the record.
    fn finish_stage<T>(
        &self,
        file_id: &str,
        run_id: u64,
        kind: StageKind,
        name: String,
        stage_started: Instant,
        result: Result<T, StageError>,
    ) -> Result<T, Halt> {
        let mut slot = self.slots.get_mut(file_id).ok_or(Halt::Stale)?;
        if slot.run_id != Some(run_id) {
            return Err(Halt::Stale);
        }
        let outcome = match &result {
            Ok(_) => StageOutcome::Succeeded,
            Err(e) => StageOutcome::Failed(e.to_string()),
        };
        slot.record.stage_history.push(StageRecord {
            kind,
            name: name.clone(),
            outcome,
            elapsed_ms: stage_started.elapsed().as_millis() as u64,
        });
        result.map_err(|error| Halt::Failed { kind, name, error })
    }

    /// Move the record to a terminal state and announce it, if this run
    /// still owns the record.
    fn settle(
        &self,
        file_id: &str,
        run_id: u64,
        state: IngestionState,
        stage_name: Option<String>,
        message: &str,
        elapsed_ms: u64,
    ) -> bool {
        match self.slots.get_mut(file_id) {
            Some(mut slot) if slot.run_id == Some(run_id) => {
                slot.record.state = state;
                self.publish(file_id, state, stage_name, message, elapsed_ms);
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, file_id: &str, run_id: u64) -> bool {
        self.slots
            .get(file_id)
            .is_some_and(|s| s.run_id == Some(run_id))
    }

    /// Continue the run under `file_id + derived_name`.
    ///
    /// A finished record already under the derived id is replaced. An
    /// active one is left alone and this run fails instead.
    fn rekey(
        &self,
        file_id: &str,
        run_id: u64,
        derived_name: &str,
        loader_name: &str,
    ) -> Result<String, Halt> {
        let new_file_id = format!("{}{}", file_id, derived_name);
        if new_file_id == file_id {
            return Ok(new_file_id);
        }
        let taken = |state: IngestionState| Halt::Failed {
            kind: StageKind::Loader,
            name: loader_name.to_string(),
            error: StageError::Load(format!("derived file {} is still {}", new_file_id, state)),
        };
        if let Some(state) = self.get_state(&new_file_id).filter(|s| !s.is_terminal()) {
            return Err(taken(state));
        }

        let (_, mut slot) = self
            .slots
            .remove_if(file_id, |_, slot| slot.run_id == Some(run_id))
            .ok_or(Halt::Stale)?;
        let guard = match self.slots.entry(new_file_id.clone()) {
            Entry::Occupied(occupied) if !occupied.get().record.state.is_terminal() => {
                // Claimed between the check and the removal.
                let state = occupied.get().record.state;
                drop(occupied);
                self.slots.insert(file_id.to_string(), slot);
                return Err(taken(state));
            }
            Entry::Occupied(mut occupied) => {
                slot.record.file_id = new_file_id.clone();
                slot.record.display_name = derived_name.to_string();
                slot.record.raw_payload.file_id = new_file_id.clone();
                occupied.insert(slot);
                occupied.into_ref()
            }
            Entry::Vacant(vacant) => {
                slot.record.file_id = new_file_id.clone();
                slot.record.display_name = derived_name.to_string();
                slot.record.raw_payload.file_id = new_file_id.clone();
                vacant.insert(slot)
            }
        };

        info!(from = %file_id, to = %new_file_id, "file re-keyed");
        self.broadcaster.publish_derived(DerivedFile {
            new_file_id: new_file_id.clone(),
            original_file_id: file_id.to_string(),
            filename: derived_name.to_string(),
        });
        drop(guard);
        Ok(new_file_id)
    }

    fn publish(
        &self,
        file_id: &str,
        state: IngestionState,
        stage_name: Option<String>,
        message: &str,
        elapsed_ms: u64,
    ) {
        self.broadcaster.publish(StatusEvent {
            file_id: file_id.to_string(),
            state,
            stage_name,
            message: message.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
        });
    }
}

/// Run a stage future, turning a panic into an ordinary stage failure.
async fn guarded<T, F>(kind: StageKind, fut: F) -> Result<T, StageError>
where
    F: Future<Output = Result<T, StageError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(StageError::for_kind(kind, "stage panicked")),
    }
}

fn mismatched(kind: StageKind, name: &str) -> StageError {
    StageError::InvalidConfig {
        kind,
        message: format!("stage '{}' is not a {}", name, kind),
    }
}

fn stage_verb(kind: StageKind) -> &'static str {
    match kind {
        StageKind::Loader => "Loading",
        StageKind::Splitter => "Splitting",
        StageKind::Vectorizer => "Vectorizing",
        StageKind::Sink => "Storing",
    }
}
