//! Transfer session registry.
//!
//! Holds one reassembly buffer per in-flight transfer. Every operation
//! takes a single short-held lock; nothing here awaits, so the lock is
//! never held across a suspension point.
//!
//! A session is removed the moment it is reassembled, cancelled, or swept
//! for outliving its maximum age. Nothing about a removed session is remembered: a later
//! fragment with the same transfer id starts a brand-new session.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::ReassemblyError;

struct TransferSession {
    total_count: usize,
    received: BTreeMap<usize, Vec<u8>>,
    created_at: Instant,
}

impl TransferSession {
    fn new(total_count: usize, now: Instant) -> Self {
        Self {
            total_count,
            received: BTreeMap::new(),
            created_at: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() == self.total_count
    }

    fn concat(self) -> Vec<u8> {
        let size = self.received.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(size);
        // BTreeMap iterates in index order regardless of arrival order.
        for bytes in self.received.into_values() {
            out.extend_from_slice(&bytes);
        }
        out
    }
}

/// What [`TransferSessionRegistry::add_fragment`] did with a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// Stored; the session now holds `received` of `total` fragments.
    Stored { received: usize, total: usize },
    /// Already had this index; nothing changed.
    Duplicate,
}

/// Registry of in-flight transfer sessions.
#[derive(Default)]
pub struct TransferSessionRegistry {
    sessions: Mutex<HashMap<String, TransferSession>>,
}

impl TransferSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a session exists for `transfer_id` expecting `total_count`
    /// fragments.
    ///
    /// Fails with [`ReassemblyError::TotalMismatch`] if a session already
    /// exists with a different declared total.
    pub fn get_or_create(&self, transfer_id: &str, total_count: usize) -> Result<(), ReassemblyError> {
        let mut sessions = self.sessions.lock();
        Self::session_for(&mut sessions, transfer_id, total_count, Instant::now()).map(|_| ())
    }

    /// Store one fragment of an existing session.
    pub fn add_fragment(
        &self,
        transfer_id: &str,
        index: usize,
        bytes: Vec<u8>,
    ) -> Result<FragmentOutcome, ReassemblyError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(transfer_id)
            .ok_or_else(|| ReassemblyError::UnknownTransfer {
                transfer_id: transfer_id.to_string(),
            })?;
        Self::store(session, transfer_id, index, bytes)
    }

    /// Whether every fragment of `transfer_id` has arrived. Unknown
    /// transfers are never complete.
    pub fn is_complete(&self, transfer_id: &str) -> bool {
        self.sessions
            .lock()
            .get(transfer_id)
            .map(TransferSession::is_complete)
            .unwrap_or(false)
    }

    /// Concatenate a complete session by index and remove it, as one step.
    pub fn reassemble(&self, transfer_id: &str) -> Result<Vec<u8>, ReassemblyError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get(transfer_id)
            .ok_or_else(|| ReassemblyError::UnknownTransfer {
                transfer_id: transfer_id.to_string(),
            })?;
        if !session.is_complete() {
            return Err(ReassemblyError::Incomplete {
                transfer_id: transfer_id.to_string(),
                received: session.received.len(),
                total: session.total_count,
            });
        }
        let session = sessions
            .remove(transfer_id)
            .ok_or_else(|| ReassemblyError::UnknownTransfer {
                transfer_id: transfer_id.to_string(),
            })?;
        Ok(session.concat())
    }

    /// Create-or-join, store, and reassemble-if-complete under one lock.
    ///
    /// This is the path fragment intake uses, so two fragments completing
    /// the same transfer at once can never both observe completion.
    pub fn accept(
        &self,
        transfer_id: &str,
        total_count: usize,
        index: usize,
        bytes: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, ReassemblyError> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let session = Self::session_for(&mut sessions, transfer_id, total_count, now)?;
        if let FragmentOutcome::Duplicate = Self::store(session, transfer_id, index, bytes)? {
            debug!(transfer_id, index, "duplicate fragment ignored");
        }
        if !session.is_complete() {
            return Ok(None);
        }
        Ok(sessions.remove(transfer_id).map(TransferSession::concat))
    }

    /// Drop a session. Returns whether one existed.
    pub fn cancel(&self, transfer_id: &str) -> bool {
        self.sessions.lock().remove(transfer_id).is_some()
    }

    /// Remove sessions created more than `max_age` ago that have not
    /// completed. Late fragments do not extend the deadline. Returns the
    /// ids that were swept.
    pub fn sweep_expired(&self, max_age: Duration) -> Vec<String> {
        self.sweep_expired_at(Instant::now(), max_age)
    }

    /// [`sweep_expired`](Self::sweep_expired) against an explicit clock.
    pub fn sweep_expired_at(&self, now: Instant, max_age: Duration) -> Vec<String> {
        let mut sessions = self.sessions.lock();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.created_at) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }

    /// `(received, total)` for a live session.
    pub fn progress(&self, transfer_id: &str) -> Option<(usize, usize)> {
        self.sessions
            .lock()
            .get(transfer_id)
            .map(|s| (s.received.len(), s.total_count))
    }

    /// Age of a live session since its first fragment.
    pub fn age(&self, transfer_id: &str) -> Option<Duration> {
        self.sessions
            .lock()
            .get(transfer_id)
            .map(|s| s.created_at.elapsed())
    }

    pub fn contains(&self, transfer_id: &str) -> bool {
        self.sessions.lock().contains_key(transfer_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn session_for<'a>(
        sessions: &'a mut HashMap<String, TransferSession>,
        transfer_id: &str,
        total_count: usize,
        now: Instant,
    ) -> Result<&'a mut TransferSession, ReassemblyError> {
        if total_count == 0 {
            return Err(ReassemblyError::EmptyTransfer {
                transfer_id: transfer_id.to_string(),
            });
        }
        let session = sessions
            .entry(transfer_id.to_string())
            .or_insert_with(|| TransferSession::new(total_count, now));
        if session.total_count != total_count {
            return Err(ReassemblyError::TotalMismatch {
                transfer_id: transfer_id.to_string(),
                expected: session.total_count,
                declared: total_count,
            });
        }
        Ok(session)
    }

    fn store(
        session: &mut TransferSession,
        transfer_id: &str,
        index: usize,
        bytes: Vec<u8>,
    ) -> Result<FragmentOutcome, ReassemblyError> {
        if index >= session.total_count {
            return Err(ReassemblyError::IndexOutOfRange {
                transfer_id: transfer_id.to_string(),
                index,
                total: session.total_count,
            });
        }
        if session.received.contains_key(&index) {
            return Ok(FragmentOutcome::Duplicate);
        }
        session.received.insert(index, bytes);
        Ok(FragmentOutcome::Stored {
            received: session.received.len(),
            total: session.total_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassemble_in_index_order() {
        let reg = TransferSessionRegistry::new();
        reg.get_or_create("t", 3).unwrap();
        reg.add_fragment("t", 2, b"c".to_vec()).unwrap();
        reg.add_fragment("t", 0, b"a".to_vec()).unwrap();
        assert!(!reg.is_complete("t"));
        reg.add_fragment("t", 1, b"b".to_vec()).unwrap();
        assert!(reg.is_complete("t"));
        assert_eq!(reg.reassemble("t").unwrap(), b"abc".to_vec());
        assert!(!reg.contains("t"));
    }

    #[test]
    fn test_reassemble_incomplete_keeps_session() {
        let reg = TransferSessionRegistry::new();
        reg.get_or_create("t", 2).unwrap();
        reg.add_fragment("t", 0, b"a".to_vec()).unwrap();
        let err = reg.reassemble("t").unwrap_err();
        assert!(matches!(err, ReassemblyError::Incomplete { received: 1, total: 2, .. }));
        assert!(reg.contains("t"));
    }

    #[test]
    fn test_duplicate_is_noop() {
        let reg = TransferSessionRegistry::new();
        reg.get_or_create("t", 2).unwrap();
        assert_eq!(
            reg.add_fragment("t", 0, b"first".to_vec()).unwrap(),
            FragmentOutcome::Stored { received: 1, total: 2 }
        );
        assert_eq!(
            reg.add_fragment("t", 0, b"other".to_vec()).unwrap(),
            FragmentOutcome::Duplicate
        );
        reg.add_fragment("t", 1, b"!".to_vec()).unwrap();
        assert_eq!(reg.reassemble("t").unwrap(), b"first!".to_vec());
    }

    #[test]
    fn test_total_mismatch_rejected() {
        let reg = TransferSessionRegistry::new();
        reg.get_or_create("t", 3).unwrap();
        let err = reg.get_or_create("t", 4).unwrap_err();
        assert_eq!(
            err,
            ReassemblyError::TotalMismatch {
                transfer_id: "t".to_string(),
                expected: 3,
                declared: 4
            }
        );
        assert_eq!(reg.progress("t"), Some((0, 3)));
    }

    #[test]
    fn test_out_of_range_and_unknown() {
        let reg = TransferSessionRegistry::new();
        assert!(matches!(
            reg.add_fragment("missing", 0, vec![]),
            Err(ReassemblyError::UnknownTransfer { .. })
        ));
        reg.get_or_create("t", 2).unwrap();
        assert!(matches!(
            reg.add_fragment("t", 2, vec![]),
            Err(ReassemblyError::IndexOutOfRange { index: 2, total: 2, .. })
        ));
        assert!(matches!(
            reg.get_or_create("z", 0),
            Err(ReassemblyError::EmptyTransfer { .. })
        ));
    }

    #[test]
    fn test_accept_completes_once() {
        let reg = TransferSessionRegistry::new();
        assert_eq!(reg.accept("t", 2, 1, b"lo".to_vec()).unwrap(), None);
        assert_eq!(
            reg.accept("t", 2, 0, b"hel".to_vec()).unwrap(),
            Some(b"hello".to_vec())
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn test_cancel() {
        let reg = TransferSessionRegistry::new();
        reg.get_or_create("t", 2).unwrap();
        assert!(reg.cancel("t"));
        assert!(!reg.cancel("t"));
        assert!(!reg.is_complete("t"));
    }

    #[test]
    fn test_stale_session_sweep() {
        let reg = TransferSessionRegistry::new();
        reg.get_or_create("stale", 5).unwrap();
        reg.add_fragment("stale", 0, b"a".to_vec()).unwrap();
        reg.add_fragment("stale", 1, b"b".to_vec()).unwrap();

        let max_age = Duration::from_secs(60);
        assert!(reg.sweep_expired_at(Instant::now(), max_age).is_empty());

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(reg.sweep_expired_at(later, max_age), vec!["stale".to_string()]);
        assert!(!reg.contains("stale"));
        assert!(!reg.is_complete("stale"));

        // A new session under the same id starts from nothing.
        reg.get_or_create("stale", 5).unwrap();
        assert_eq!(reg.progress("stale"), Some((0, 5)));
    }

    #[test]
    fn test_trickling_fragments_do_not_extend_deadline() {
        let reg = TransferSessionRegistry::new();
        reg.get_or_create("slow", 3).unwrap();
        reg.add_fragment("slow", 0, b"a".to_vec()).unwrap();

        let max_age = Duration::from_millis(200);
        std::thread::sleep(Duration::from_millis(150));
        reg.add_fragment("slow", 1, b"b".to_vec()).unwrap();

        let age = reg.age("slow").unwrap();
        let swept = reg.sweep_expired_at(Instant::now() + Duration::from_millis(100), max_age);
        assert!(age >= Duration::from_millis(150));
        assert_eq!(swept, vec!["slow".to_string()]);
        assert!(!reg.contains("slow"));
    }
}
