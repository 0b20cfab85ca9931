use std::collections::VecDeque;

use hmq_codec::Frame;
use hmq_utils::{timestamp_millis, TimestampMillis};

/// Outcome of a store push.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    /// The queue is at its message limit; the engine translates this into a
    /// sender-visible failure.
    Full,
}

/// Ordered in-memory storage of a queue's messages.
///
/// Two sequences: high-priority messages are always dequeued before regular
/// ones, FIFO within each class. Entries carry their enqueue time so the
/// engine can expire messages against the queue's send timeout. The store is
/// owned by the queue's actor and is never touched from another task.
pub struct MessageStore {
    limit: usize,
    high: VecDeque<(Frame, TimestampMillis)>,
    regular: VecDeque<(Frame, TimestampMillis)>,
}

impl MessageStore {
    /// `limit` of zero means unlimited.
    #[inline]
    pub fn new(limit: usize) -> Self {
        Self { limit, high: VecDeque::new(), regular: VecDeque::new() }
    }

    #[inline]
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    #[inline]
    pub fn push(&mut self, frame: Frame) -> PushOutcome {
        if self.limit > 0 && self.len() >= self.limit {
            return PushOutcome::Full;
        }
        let entry = (frame, timestamp_millis());
        if entry.0.high_priority() {
            self.high.push_back(entry);
        } else {
            self.regular.push_back(entry);
        }
        PushOutcome::Stored
    }

    /// Next message, high-priority first.
    #[inline]
    pub fn pop(&mut self) -> Option<Frame> {
        self.high.pop_front().or_else(|| self.regular.pop_front()).map(|(f, _)| f)
    }

    #[inline]
    pub fn peek(&self) -> Option<&Frame> {
        self.high.front().or_else(|| self.regular.front()).map(|(f, _)| f)
    }

    /// Puts a message back at the head of its priority class.
    #[inline]
    pub fn requeue_front(&mut self, frame: Frame) {
        let entry = (frame, timestamp_millis());
        if entry.0.high_priority() {
            self.high.push_front(entry);
        } else {
            self.regular.push_front(entry);
        }
    }

    /// Removes and returns every message enqueued at or before `cutoff`.
    pub fn take_older_than(&mut self, cutoff: TimestampMillis) -> Vec<Frame> {
        let mut expired = Vec::new();
        for seq in [&mut self.high, &mut self.regular] {
            let mut retained = VecDeque::with_capacity(seq.len());
            while let Some((frame, at)) = seq.pop_front() {
                if at <= cutoff {
                    expired.push(frame);
                } else {
                    retained.push_back((frame, at));
                }
            }
            *seq = retained;
        }
        expired
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.high.len() + self.regular.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.regular.is_empty()
    }

    #[inline]
    pub fn contains_id(&self, message_id: &str) -> bool {
        self.iter().any(|f| f.message_id == message_id)
    }

    /// Removes every message, returning them oldest first per class.
    #[inline]
    pub fn drain(&mut self) -> Vec<Frame> {
        self.high.drain(..).chain(self.regular.drain(..)).map(|(f, _)| f).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.high.iter().chain(self.regular.iter()).map(|(f, _)| f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmq_codec::{FrameFlags, MessageType};

    fn frame(id: &str, high: bool) -> Frame {
        let mut f = Frame::new(MessageType::QueueMessage);
        f.set_message_id(id);
        if high {
            f.flags |= FrameFlags::HIGH_PRIORITY;
        }
        f
    }

    #[test]
    fn high_priority_precedes_regular() {
        let mut store = MessageStore::new(0);
        store.push(frame("r1", false));
        store.push(frame("h1", true));
        store.push(frame("r2", false));
        store.push(frame("h2", true));

        let order: Vec<_> = std::iter::from_fn(|| store.pop()).map(|f| f.message_id.to_string()).collect();
        assert_eq!(order, ["h1", "h2", "r1", "r2"]);
    }

    #[test]
    fn fifo_within_class() {
        let mut store = MessageStore::new(0);
        for i in 0..5 {
            store.push(frame(&format!("m{i}"), false));
        }
        for i in 0..5 {
            assert_eq!(store.pop().unwrap().message_id, format!("m{i}"));
        }
    }

    #[test]
    fn capacity_is_enforced() {
        let mut store = MessageStore::new(2);
        assert_eq!(store.push(frame("a", false)), PushOutcome::Stored);
        assert_eq!(store.push(frame("b", true)), PushOutcome::Stored);
        assert_eq!(store.push(frame("c", false)), PushOutcome::Full);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn requeue_front_restores_head() {
        let mut store = MessageStore::new(0);
        store.push(frame("a", false));
        store.push(frame("b", false));

        let a = store.pop().unwrap();
        store.requeue_front(a);
        assert_eq!(store.pop().unwrap().message_id, "a");
        assert_eq!(store.pop().unwrap().message_id, "b");
    }

    #[test]
    fn take_older_than_cutoff() {
        let mut store = MessageStore::new(0);
        store.push(frame("old", false));
        store.push(frame("old-high", true));

        let expired = store.take_older_than(timestamp_millis() + 1);
        let ids: Vec<_> = expired.iter().map(|f| f.message_id.to_string()).collect();
        assert_eq!(ids, ["old-high", "old"]);
        assert!(store.is_empty());

        store.push(frame("fresh", false));
        assert!(store.take_older_than(timestamp_millis() - 1000).is_empty());
        assert_eq!(store.len(), 1);
    }
}
