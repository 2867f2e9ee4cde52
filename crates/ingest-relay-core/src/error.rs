//! Error taxonomy for the relay core.

use crate::models::StageKind;

/// A transfer could not be reassembled. The affected transfer is
/// discarded; other transfers are untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("fragment size must be greater than zero")]
    ZeroFragmentSize,

    #[error("transfer {transfer_id}: total count must be at least 1")]
    EmptyTransfer { transfer_id: String },

    #[error("transfer {transfer_id}: fragment {index} is out of range for total {total}")]
    IndexOutOfRange {
        transfer_id: String,
        index: usize,
        total: usize,
    },

    #[error("transfer {transfer_id}: fragment {index} has an inconsistent last-fragment flag")]
    LastFlagMismatch { transfer_id: String, index: usize },

    #[error("transfer {transfer_id}: declared total {declared} conflicts with {expected}")]
    TotalMismatch {
        transfer_id: String,
        expected: usize,
        declared: usize,
    },

    #[error("transfer {transfer_id}: no such session (expired or never started)")]
    UnknownTransfer { transfer_id: String },

    #[error("transfer {transfer_id}: {received} of {total} fragments received")]
    Incomplete {
        transfer_id: String,
        received: usize,
        total: usize,
    },

    #[error("transfer {transfer_id}: payload is not a valid file transfer: {reason}")]
    MalformedPayload { transfer_id: String, reason: String },

    #[error("transfer {transfer_id}: expired before all fragments arrived; restart the upload")]
    Expired { transfer_id: String },
}

impl ReassemblyError {
    /// The transfer this error belongs to, when there is one.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            ReassemblyError::ZeroFragmentSize => None,
            ReassemblyError::EmptyTransfer { transfer_id }
            | ReassemblyError::IndexOutOfRange { transfer_id, .. }
            | ReassemblyError::LastFlagMismatch { transfer_id, .. }
            | ReassemblyError::TotalMismatch { transfer_id, .. }
            | ReassemblyError::UnknownTransfer { transfer_id }
            | ReassemblyError::Incomplete { transfer_id, .. }
            | ReassemblyError::MalformedPayload { transfer_id, .. }
            | ReassemblyError::Expired { transfer_id } => Some(transfer_id),
        }
    }
}

/// Stage registry configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two stages registered under the same `(kind, name)`. Fatal at boot.
    #[error("duplicate {kind} stage '{name}'")]
    DuplicateStage { kind: StageKind, name: String },

    /// No stage registered under `(kind, name)`. Fails only the file that
    /// asked for it.
    #[error("unknown {kind} stage '{name}'")]
    UnknownStage { kind: StageKind, name: String },
}

/// A stage configuration does not match the stage's schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaViolation {
    #[error("config must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("missing required field '{0}'")]
    Missing(String),

    #[error("field '{field}' must be of type '{expected}', got {actual}")]
    WrongType {
        field: String,
        expected: String,
        actual: &'static str,
    },

    #[error("field '{field}' must be one of [{allowed}], got {actual}")]
    NotAllowed {
        field: String,
        allowed: String,
        actual: String,
    },

    #[error("field '{field}' must be at least {minimum}, got {actual}")]
    BelowMinimum {
        field: String,
        minimum: f64,
        actual: f64,
    },
}

/// A pipeline stage failed for one file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("load failed: {0}")]
    Load(String),

    #[error("split failed: {0}")]
    Split(String),

    #[error("embedding failed: {0}")]
    Embed(String),

    #[error("store failed: {0}")]
    Store(String),

    #[error("invalid {kind} config: {message}")]
    InvalidConfig { kind: StageKind, message: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl StageError {
    /// Wrap an arbitrary error as the failure of a stage of `kind`.
    pub fn for_kind(kind: StageKind, err: impl std::fmt::Display) -> Self {
        let message = err.to_string();
        match kind {
            StageKind::Loader => StageError::Load(message),
            StageKind::Splitter => StageError::Split(message),
            StageKind::Vectorizer => StageError::Embed(message),
            StageKind::Sink => StageError::Store(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RegistryError::UnknownStage {
            kind: StageKind::Vectorizer,
            name: "ada".to_string(),
        };
        assert_eq!(err.to_string(), "unknown vectorizer stage 'ada'");

        let err = StageError::for_kind(StageKind::Sink, "disk full");
        assert_eq!(err, StageError::Store("disk full".to_string()));
    }

    #[test]
    fn test_transfer_id_accessor() {
        let err = ReassemblyError::TotalMismatch {
            transfer_id: "f1".to_string(),
            expected: 3,
            declared: 4,
        };
        assert_eq!(err.transfer_id(), Some("f1"));
        assert_eq!(ReassemblyError::ZeroFragmentSize.transfer_id(), None);
    }
}
