//! Server-side transfer intake.
//!
//! Wire fragments are fed to the [`ChunkCodec`]; a completed payload is
//! decoded into a [`FileTransfer`] ready for the orchestrator. Transfers
//! that outlive their maximum age are swept on a timer.

use std::sync::Arc;
use std::time::Duration;

use ingest_relay_core::codec::ChunkCodec;
use ingest_relay_core::error::ReassemblyError;
use ingest_relay_core::models::FileTransfer;
use ingest_relay_core::session::TransferSessionRegistry;
use tracing::{debug, info, warn};

use crate::protocol::DataBatch;

pub struct TransferIntake {
    codec: ChunkCodec,
    max_age: Duration,
}

impl TransferIntake {
    pub fn new(max_age: Duration) -> Self {
        Self {
            codec: ChunkCodec::new(Arc::new(TransferSessionRegistry::new())),
            max_age,
        }
    }

    pub fn sessions(&self) -> &Arc<TransferSessionRegistry> {
        self.codec.sessions()
    }

    /// Store one wire fragment. Returns the decoded upload once its last
    /// missing fragment arrives.
    pub fn accept(&self, batch: DataBatch) -> Result<Option<FileTransfer>, ReassemblyError> {
        let transfer_id = batch.file_id.clone();
        debug!(
            transfer_id = %transfer_id,
            order = batch.order,
            total = batch.total,
            "fragment received"
        );
        let Some(payload) = self.codec.feed(batch.into_fragment())? else {
            return Ok(None);
        };

        let mut transfer: FileTransfer =
            serde_json::from_slice(&payload).map_err(|e| ReassemblyError::MalformedPayload {
                transfer_id: transfer_id.clone(),
                reason: e.to_string(),
            })?;
        if transfer.file_id.is_empty() {
            transfer.file_id = transfer_id;
        } else if transfer.file_id != transfer_id {
            return Err(ReassemblyError::MalformedPayload {
                reason: format!("payload names file {}", transfer.file_id),
                transfer_id,
            });
        }
        info!(
            file_id = %transfer.file_id,
            filename = %transfer.filename,
            bytes = payload.len(),
            "transfer reassembled"
        );
        Ok(Some(transfer))
    }

    /// Drop a partially received transfer.
    pub fn cancel(&self, transfer_id: &str) -> bool {
        self.codec.sessions().cancel(transfer_id)
    }

    /// Remove transfers still incomplete after the configured maximum age.
    pub fn sweep(&self) -> Vec<String> {
        let expired = self.codec.sessions().sweep_expired(self.max_age);
        if !expired.is_empty() {
            warn!(count = expired.len(), ids = ?expired, "discarded stale transfers");
        }
        expired
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_relay_core::codec::split_text;

    fn batches(file_id: &str, json: &str, size: usize) -> Vec<DataBatch> {
        split_text(file_id, json, size)
            .unwrap()
            .map(|f| DataBatch::from_fragment(f).unwrap())
            .collect()
    }

    fn transfer_json(file_id: &str) -> String {
        serde_json::json!({
            "fileID": file_id,
            "filename": "notes.txt",
            "content": "Some notes about the relay.",
        })
        .to_string()
    }

    #[test]
    fn test_reassembles_transfer() {
        let intake = TransferIntake::new(Duration::from_secs(60));
        let mut out = None;
        for b in batches("f1", &transfer_json("f1"), 16) {
            if let Some(t) = intake.accept(b).unwrap() {
                out = Some(t);
            }
        }
        let t = out.unwrap();
        assert_eq!(t.file_id, "f1");
        assert_eq!(t.filename, "notes.txt");
        assert!(intake.sessions().is_empty());
    }

    #[test]
    fn test_malformed_payload() {
        let intake = TransferIntake::new(Duration::from_secs(60));
        let err = batches("f1", "{not json", 100)
            .into_iter()
            .map(|b| intake.accept(b))
            .last()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ReassemblyError::MalformedPayload { .. }));
    }

    #[test]
    fn test_mismatched_file_id() {
        let intake = TransferIntake::new(Duration::from_secs(60));
        let err = batches("f1", &transfer_json("other"), 1000)
            .into_iter()
            .map(|b| intake.accept(b))
            .last()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.transfer_id(), Some("f1"));
    }

    #[test]
    fn test_cancel_and_sweep() {
        let intake = TransferIntake::new(Duration::ZERO);
        let all = batches("f1", &transfer_json("f1"), 8);
        intake.accept(all[0].clone()).unwrap();
        assert!(intake.cancel("f1"));
        assert!(!intake.cancel("f1"));

        intake.accept(all[0].clone()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(intake.sweep(), vec!["f1".to_string()]);
    }
}
