use std::collections::VecDeque;
use std::time::Instant;

/// A payload waiting for the channel to come back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub payload: String,
    pub enqueued_at: Instant,
}

/// Bounded FIFO of outbound payloads. When full, the oldest entry is
/// dropped to make room.
#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<QueueEntry>,
    capacity: usize,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append a payload; returns the entry evicted to make room, if any.
    pub fn push(&mut self, payload: String) -> Option<QueueEntry> {
        let evicted = if self.entries.len() >= self.capacity {
            self.dropped += 1;
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(QueueEntry {
            payload,
            enqueued_at: Instant::now(),
        });
        evicted
    }

    /// Put payloads that were handed to a dead session back at the head,
    /// keeping their relative order. They predate everything already
    /// queued, so they are the first to go if the bound is exceeded.
    pub fn requeue_front(&mut self, payloads: Vec<String>) {
        let now = Instant::now();
        for payload in payloads.into_iter().rev() {
            self.entries.push_front(QueueEntry {
                payload,
                enqueued_at: now,
            });
        }
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries evicted by the bound since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payloads(q: &mut OutboundQueue) -> Vec<String> {
        q.drain().into_iter().map(|e| e.payload).collect()
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let mut q = OutboundQueue::new(3);
        for i in 1..=5 {
            q.push(format!("m{}", i));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 2);
        assert_eq!(payloads(&mut q), vec!["m3", "m4", "m5"]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_push_reports_evicted() {
        let mut q = OutboundQueue::new(1);
        assert!(q.push("a".into()).is_none());
        assert_eq!(q.push("b".into()).unwrap().payload, "a");
    }

    #[test]
    fn test_requeue_goes_to_head() {
        let mut q = OutboundQueue::new(10);
        q.push("late".into());
        q.requeue_front(vec!["early1".into(), "early2".into()]);
        assert_eq!(payloads(&mut q), vec!["early1", "early2", "late"]);
    }

    #[test]
    fn test_requeue_respects_bound() {
        let mut q = OutboundQueue::new(2);
        q.push("x".into());
        q.requeue_front(vec!["a".into(), "b".into()]);
        assert_eq!(q.dropped(), 1);
        assert_eq!(payloads(&mut q), vec!["b", "x"]);
    }
}
