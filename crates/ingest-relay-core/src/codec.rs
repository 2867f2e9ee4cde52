//! Fragment codec.
//!
//! [`split`] cuts a payload into ordered, bounded fragments; [`ChunkCodec`]
//! feeds fragments back into a [`TransferSessionRegistry`] and hands out
//! the original payload once every fragment has arrived.
//!
//! # Guarantees
//!
//! - `total_count = ceil(len / fragment_size)`, and never zero: an empty
//!   payload is one empty fragment with `is_last` set.
//! - Reassembly concatenates by `sequence_index`, not arrival order.
//! - Feeding the same fragment twice is a no-op.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use ingest_relay_core::codec::{split, ChunkCodec};
//! use ingest_relay_core::session::TransferSessionRegistry;
//!
//! let codec = ChunkCodec::new(Arc::new(TransferSessionRegistry::new()));
//! let mut out = None;
//! for fragment in split("t1", b"hello world", 4).unwrap() {
//!     out = codec.feed(fragment).unwrap();
//! }
//! assert_eq!(out.unwrap(), b"hello world".to_vec());
//! ```

use std::sync::Arc;

use crate::error::ReassemblyError;
use crate::models::TransferFragment;
use crate::session::TransferSessionRegistry;

/// Lazy sequence of fragments for one transfer.
///
/// Fragment boundaries are fixed when the sequence is created; bytes are
/// copied out one fragment at a time as the iterator advances. Each call
/// to [`split`] or [`split_text`] yields a fresh, single-use sequence.
#[derive(Debug)]
pub struct Fragments<'a> {
    transfer_id: String,
    payload: &'a [u8],
    ends: Vec<usize>,
    next: usize,
}

impl Fragments<'_> {
    /// Number of fragments the whole sequence contains.
    pub fn total_count(&self) -> usize {
        self.ends.len()
    }
}

impl Iterator for Fragments<'_> {
    type Item = TransferFragment;

    fn next(&mut self) -> Option<Self::Item> {
        let end = *self.ends.get(self.next)?;
        let start = match self.next {
            0 => 0,
            i => self.ends[i - 1],
        };
        let index = self.next;
        self.next += 1;
        Some(TransferFragment {
            transfer_id: self.transfer_id.clone(),
            sequence_index: index,
            total_count: self.ends.len(),
            is_last: index + 1 == self.ends.len(),
            bytes: self.payload[start..end].to_vec(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.ends.len() - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Fragments<'_> {}

/// Split raw bytes into fragments of at most `fragment_size` bytes.
pub fn split<'a>(
    transfer_id: &str,
    payload: &'a [u8],
    fragment_size: usize,
) -> Result<Fragments<'a>, ReassemblyError> {
    if fragment_size == 0 {
        return Err(ReassemblyError::ZeroFragmentSize);
    }
    let mut ends: Vec<usize> = (1..=payload.len().div_ceil(fragment_size))
        .map(|i| (i * fragment_size).min(payload.len()))
        .collect();
    if ends.is_empty() {
        ends.push(0);
    }
    Ok(Fragments {
        transfer_id: transfer_id.to_string(),
        payload,
        ends,
        next: 0,
    })
}

/// Split UTF-8 text so that every fragment is itself valid UTF-8.
///
/// Each cut lands on the last character boundary at or before
/// `fragment_size` bytes from the previous cut. A character wider than
/// `fragment_size` gets a fragment of its own. For ASCII input this is
/// identical to [`split`].
pub fn split_text<'a>(
    transfer_id: &str,
    text: &'a str,
    fragment_size: usize,
) -> Result<Fragments<'a>, ReassemblyError> {
    if fragment_size == 0 {
        return Err(ReassemblyError::ZeroFragmentSize);
    }
    let mut ends = Vec::with_capacity(text.len() / fragment_size + 1);
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + fragment_size).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = text[start..]
                .char_indices()
                .nth(1)
                .map(|(i, _)| start + i)
                .unwrap_or(text.len());
        }
        ends.push(end);
        start = end;
    }
    if ends.is_empty() {
        ends.push(0);
    }
    Ok(Fragments {
        transfer_id: transfer_id.to_string(),
        payload: text.as_bytes(),
        ends,
        next: 0,
    })
}

/// Feeds fragments into the session registry.
///
/// The codec holds no per-transfer state of its own; all buffering lives
/// in the shared [`TransferSessionRegistry`].
#[derive(Clone)]
pub struct ChunkCodec {
    sessions: Arc<TransferSessionRegistry>,
}

impl ChunkCodec {
    pub fn new(sessions: Arc<TransferSessionRegistry>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &Arc<TransferSessionRegistry> {
        &self.sessions
    }

    /// Store one fragment; returns the whole payload once the transfer is
    /// complete.
    ///
    /// A malformed fragment or a conflicting total discards the transfer's
    /// session; the sender has to restart that transfer from fragment 0.
    pub fn feed(&self, fragment: TransferFragment) -> Result<Option<Vec<u8>>, ReassemblyError> {
        let transfer_id = fragment.transfer_id.clone();
        let result = validate(&fragment).and_then(|_| {
            self.sessions.accept(
                &fragment.transfer_id,
                fragment.total_count,
                fragment.sequence_index,
                fragment.bytes,
            )
        });
        if result.is_err() {
            self.sessions.cancel(&transfer_id);
        }
        result
    }
}

fn validate(fragment: &TransferFragment) -> Result<(), ReassemblyError> {
    if fragment.total_count == 0 {
        return Err(ReassemblyError::EmptyTransfer {
            transfer_id: fragment.transfer_id.clone(),
        });
    }
    if fragment.sequence_index >= fragment.total_count {
        return Err(ReassemblyError::IndexOutOfRange {
            transfer_id: fragment.transfer_id.clone(),
            index: fragment.sequence_index,
            total: fragment.total_count,
        });
    }
    if fragment.is_last != (fragment.sequence_index + 1 == fragment.total_count) {
        return Err(ReassemblyError::LastFlagMismatch {
            transfer_id: fragment.transfer_id.clone(),
            index: fragment.sequence_index,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ChunkCodec {
        ChunkCodec::new(Arc::new(TransferSessionRegistry::new()))
    }

    fn feed_all(codec: &ChunkCodec, fragments: Vec<TransferFragment>) -> Option<Vec<u8>> {
        let mut out = None;
        for f in fragments {
            if let Some(p) = codec.feed(f).unwrap() {
                out = Some(p);
            }
        }
        out
    }

    #[test]
    fn test_fragment_count_is_ceiling() {
        let payload = vec![7u8; 4001];
        let frags: Vec<_> = split("t", &payload, 2000).unwrap().collect();
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[2].bytes.len(), 1);
        assert!(frags.iter().all(|f| f.total_count == 3));
        assert_eq!(frags.iter().filter(|f| f.is_last).count(), 1);
        assert!(frags[2].is_last);
    }

    #[test]
    fn test_empty_payload_single_fragment() {
        let frags: Vec<_> = split("t", b"", 10).unwrap().collect();
        assert_eq!(frags.len(), 1);
        assert!(frags[0].is_last);
        assert_eq!(frags[0].total_count, 1);
        assert!(frags[0].bytes.is_empty());
        assert_eq!(feed_all(&codec(), frags), Some(Vec::new()));
    }

    #[test]
    fn test_zero_fragment_size_rejected() {
        assert_eq!(
            split("t", b"abc", 0).unwrap_err(),
            ReassemblyError::ZeroFragmentSize
        );
    }

    #[test]
    fn test_round_trip_various_sizes() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1037).collect();
        for size in [1, 2, 7, 64, 1036, 1037, 1038, 5000] {
            let c = codec();
            let frags: Vec<_> = split("t", &payload, size).unwrap().collect();
            assert_eq!(feed_all(&c, frags), Some(payload.clone()), "size {}", size);
            assert!(c.sessions().is_empty());
        }
    }

    #[test]
    fn test_out_of_order_and_duplicates() {
        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut frags: Vec<_> = split("t", &payload, 5).unwrap().collect();
        frags.reverse();
        let dup = frags[3].clone();
        frags.insert(1, dup.clone());
        frags.insert(5, dup);
        // Keep one fragment back so duplicates land before completion.
        let last = frags.remove(0);
        let c = codec();
        assert_eq!(feed_all(&c, frags), None);
        assert_eq!(c.feed(last).unwrap(), Some(payload));
    }

    #[test]
    fn test_split_text_keeps_utf8_boundaries() {
        let text = "añb€c😀d";
        let frags: Vec<_> = split_text("t", text, 2).unwrap().collect();
        for f in &frags {
            assert!(std::str::from_utf8(&f.bytes).is_ok());
            assert!(!f.bytes.is_empty());
        }
        let joined: Vec<u8> = frags.iter().flat_map(|f| f.bytes.clone()).collect();
        assert_eq!(joined, text.as_bytes());
        // The 4-byte emoji does not fit in 2 bytes and gets its own fragment.
        assert!(frags.iter().any(|f| f.bytes == "😀".as_bytes()));
    }

    #[test]
    fn test_split_text_ascii_matches_split() {
        let text = "0123456789abcdef";
        let a: Vec<_> = split("t", text.as_bytes(), 5).unwrap().collect();
        let b: Vec<_> = split_text("t", text, 5).unwrap().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_malformed_fragment_discards_transfer() {
        let c = codec();
        let frags: Vec<_> = split("t", b"abcdef", 2).unwrap().collect();
        c.feed(frags[0].clone()).unwrap();
        assert!(c.sessions().contains("t"));

        let bad = TransferFragment {
            transfer_id: "t".to_string(),
            sequence_index: 1,
            total_count: 3,
            is_last: true,
            bytes: b"cd".to_vec(),
        };
        assert!(matches!(
            c.feed(bad),
            Err(ReassemblyError::LastFlagMismatch { index: 1, .. })
        ));
        assert!(!c.sessions().contains("t"));
    }

    #[test]
    fn test_conflicting_total_rejected() {
        let c = codec();
        let frags: Vec<_> = split("t", b"abcdef", 2).unwrap().collect();
        c.feed(frags[0].clone()).unwrap();
        let conflicting = TransferFragment {
            transfer_id: "t".to_string(),
            sequence_index: 3,
            total_count: 4,
            is_last: true,
            bytes: b"gh".to_vec(),
        };
        assert!(matches!(
            c.feed(conflicting),
            Err(ReassemblyError::TotalMismatch { expected: 3, declared: 4, .. })
        ));
    }

    #[test]
    fn test_concurrent_transfers_do_not_cross() {
        let c = codec();
        let a: Vec<_> = split("a", b"AAAAAAAAAA", 3).unwrap().collect();
        let b: Vec<_> = split("b", b"bbbbbbb", 3).unwrap().collect();
        let mut interleaved = Vec::new();
        for i in 0..a.len().max(b.len()) {
            interleaved.extend(a.get(i).cloned());
            interleaved.extend(b.get(i).cloned());
        }
        let mut done = Vec::new();
        for f in interleaved {
            if let Some(p) = c.feed(f).unwrap() {
                done.push(p);
            }
        }
        assert_eq!(done, vec![b"bbbbbbb".to_vec(), b"AAAAAAAAAA".to_vec()]);
        assert!(c.sessions().is_empty());
    }
}
