//! Pending-ack and pending-response bookkeeping.
//!
//! One record per in-flight message, keyed by message id, with a deadline
//! min-heap drained by a single cooperative timer task. Equal deadlines
//! resolve in insertion order. A record leaves the tracker exactly once:
//! resolution, timeout or consumer cancellation; a late ack finds nothing
//! and is ignored.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use hmq_codec::Frame;
use hmq_utils::{timestamp_millis, Counter};

use crate::types::{ClientId, DashMap, Id, MessageId, QueueName, Reason, TimestampMillis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowKind {
    /// Waiting for an Acknowledge frame.
    Acknowledge,
    /// Waiting for a Response frame.
    Response,
}

/// Final outcome reported to whoever awaits the delivery.
#[derive(Debug)]
pub enum DeliverOutcome {
    Acked,
    Nacked(Reason),
    Response(Frame),
    Timeout,
}

pub struct DeliveryRecord {
    pub message_id: MessageId,
    /// Set for queue deliveries; `None` for direct-message correlation.
    pub queue: Option<QueueName>,
    pub consumer: ClientId,
    /// Producer awaiting an ack, if any.
    pub producer: Option<Id>,
    /// The delivered frame, kept for requeueing on failure.
    pub frame: Frame,
    pub kind: FollowKind,
    pub sent_at: TimestampMillis,
    reply: Option<oneshot::Sender<DeliverOutcome>>,
}

impl DeliveryRecord {
    pub fn new(
        message_id: MessageId,
        queue: Option<QueueName>,
        consumer: ClientId,
        producer: Option<Id>,
        frame: Frame,
        kind: FollowKind,
    ) -> Self {
        Self { message_id, queue, consumer, producer, frame, kind, sent_at: timestamp_millis(), reply: None }
    }

    /// Attaches the channel the producer awaits on.
    pub fn with_reply(mut self, reply: oneshot::Sender<DeliverOutcome>) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Reports the outcome to the awaiting producer, if any.
    pub fn complete(&mut self, outcome: DeliverOutcome) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(outcome);
        }
    }

    /// Detaches the reply channel, e.g. to re-arm it on a redelivery.
    pub fn take_reply(&mut self) -> Option<oneshot::Sender<DeliverOutcome>> {
        self.reply.take()
    }
}

impl std::fmt::Debug for DeliveryRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryRecord")
            .field("message_id", &self.message_id)
            .field("queue", &self.queue)
            .field("consumer", &self.consumer)
            .field("kind", &self.kind)
            .field("sent_at", &self.sent_at)
            .finish()
    }
}

/// Receives records whose deadline elapsed.
#[async_trait]
pub trait ExpiryNotify: Sync + Send {
    async fn expired(&self, record: DeliveryRecord);
}

#[derive(PartialEq, Eq)]
struct DeadlineEntry {
    deadline: TimestampMillis,
    seq: u64,
    message_id: MessageId,
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone)]
pub struct DeliveryTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    records: DashMap<MessageId, DeliveryRecord>,
    deadlines: Mutex<BinaryHeap<Reverse<DeadlineEntry>>>,
    seq: AtomicU64,
    timer_wakeup: Notify,
    pub in_flights: Counter,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                records: DashMap::default(),
                deadlines: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                timer_wakeup: Notify::new(),
                in_flights: Counter::new(),
            }),
        }
    }

    /// Spawns the timer task feeding `notify`; call once at startup.
    pub fn start(&self, notify: Arc<dyn ExpiryNotify>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let next = inner.deadlines.lock().peek().map(|Reverse(e)| e.deadline);
                match next {
                    None => inner.timer_wakeup.notified().await,
                    Some(at) => {
                        let now = timestamp_millis();
                        if at > now {
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_millis((at - now) as u64)) => {}
                                _ = inner.timer_wakeup.notified() => continue,
                            }
                        }
                        loop {
                            let due = {
                                let mut heap = inner.deadlines.lock();
                                match heap.peek() {
                                    Some(Reverse(e)) if e.deadline <= timestamp_millis() => {
                                        heap.pop().map(|Reverse(e)| e.message_id)
                                    }
                                    _ => None,
                                }
                            };
                            let Some(message_id) = due else { break };
                            // a resolved record leaves a stale heap entry behind
                            if let Some((_, record)) = inner.records.remove(&message_id) {
                                inner.in_flights.dec();
                                notify.expired(record).await;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Registers an in-flight delivery with a deadline relative to now.
    pub fn follow(&self, record: DeliveryRecord, deadline: Duration) {
        let message_id = record.message_id.clone();
        let deadline = timestamp_millis() + deadline.as_millis() as TimestampMillis;
        if self.inner.records.insert(message_id.clone(), record).is_none() {
            self.inner.in_flights.inc();
        }
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        self.inner.deadlines.lock().push(Reverse(DeadlineEntry { deadline, seq, message_id }));
        self.inner.timer_wakeup.notify_one();
    }

    /// Takes the record an Acknowledge frame refers to; `None` when the ack
    /// is late or unknown.
    pub fn resolve_ack(&self, message_id: &str) -> Option<DeliveryRecord> {
        let record = self.inner.records.remove(message_id).map(|(_, r)| r)?;
        if record.kind != FollowKind::Acknowledge {
            // a Response is still awaited for this id, put it back
            self.inner.records.insert(record.message_id.clone(), record);
            return None;
        }
        self.inner.in_flights.dec();
        Some(record)
    }

    /// Takes the record a Response frame refers to.
    pub fn resolve_response(&self, message_id: &str) -> Option<DeliveryRecord> {
        let record = self.inner.records.remove(message_id).map(|(_, r)| r)?;
        if record.kind != FollowKind::Response {
            self.inner.records.insert(record.message_id.clone(), record);
            return None;
        }
        self.inner.in_flights.dec();
        Some(record)
    }

    /// Removes every record delivered to the given consumer, e.g. when its
    /// connection closes.
    pub fn cancel_by_consumer(&self, consumer: &str) -> Vec<DeliveryRecord> {
        self.cancel_where(|r| r.consumer == consumer)
    }

    /// Like [`cancel_by_consumer`](Self::cancel_by_consumer), limited to one
    /// queue; used when a client unsubscribes without disconnecting.
    pub fn cancel_by_consumer_queue(&self, consumer: &str, queue: &str) -> Vec<DeliveryRecord> {
        self.cancel_where(|r| r.consumer == consumer && r.queue.as_deref() == Some(queue))
    }

    /// Removes every record of a queue, used when the queue is deleted.
    pub fn cancel_by_queue(&self, queue: &str) -> Vec<DeliveryRecord> {
        self.cancel_where(|r| r.queue.as_deref() == Some(queue))
    }

    fn cancel_where<F: Fn(&DeliveryRecord) -> bool>(&self, pred: F) -> Vec<DeliveryRecord> {
        let ids: Vec<MessageId> =
            self.inner.records.iter().filter(|e| pred(e.value())).map(|e| e.key().clone()).collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, r)) = self.inner.records.remove(&id) {
                self.inner.in_flights.dec();
                removed.push(r);
            }
        }
        removed
    }

    #[inline]
    pub fn contains(&self, message_id: &str) -> bool {
        self.inner.records.contains_key(message_id)
    }

    /// Queue owning the in-flight record, if any; used to route an inbound
    /// Acknowledge into the right queue's event stream.
    #[inline]
    pub fn queue_of(&self, message_id: &str) -> Option<QueueName> {
        self.inner.records.get(message_id).and_then(|r| r.queue.clone())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    #[inline]
    pub fn in_flights(&self) -> &Counter {
        &self.inner.in_flights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmq_codec::MessageType;
    use std::sync::Mutex as StdMutex;

    fn record(id: &str, consumer: &str, kind: FollowKind) -> DeliveryRecord {
        let mut frame = Frame::new(MessageType::QueueMessage);
        frame.set_message_id(id);
        DeliveryRecord::new(
            MessageId::from(id),
            Some(QueueName::from("q")),
            ClientId::from(consumer),
            None,
            frame,
            kind,
        )
    }

    struct Sink {
        expired: Arc<StdMutex<Vec<MessageId>>>,
    }

    #[async_trait]
    impl ExpiryNotify for Sink {
        async fn expired(&self, record: DeliveryRecord) {
            self.expired.lock().unwrap().push(record.message_id);
        }
    }

    #[tokio::test]
    async fn resolve_before_deadline_wins() {
        let tracker = DeliveryTracker::new();
        let expired = Arc::new(StdMutex::new(Vec::new()));
        tracker.start(Arc::new(Sink { expired: expired.clone() }));

        tracker.follow(record("m1", "c1", FollowKind::Acknowledge), Duration::from_millis(80));
        assert!(tracker.resolve_ack("m1").is_some());
        // resolving twice is a no-op
        assert!(tracker.resolve_ack("m1").is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(expired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deadline_fires_exactly_once() {
        let tracker = DeliveryTracker::new();
        let expired = Arc::new(StdMutex::new(Vec::new()));
        tracker.start(Arc::new(Sink { expired: expired.clone() }));

        tracker.follow(record("m1", "c1", FollowKind::Acknowledge), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(&*expired.lock().unwrap(), &[MessageId::from("m1")]);
        // the record is gone, a late ack is ignored
        assert!(tracker.resolve_ack("m1").is_none());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn kind_mismatch_is_ignored() {
        let tracker = DeliveryTracker::new();
        tracker.follow(record("m1", "c1", FollowKind::Response), Duration::from_secs(10));
        assert!(tracker.resolve_ack("m1").is_none());
        assert!(tracker.resolve_response("m1").is_some());
    }

    #[tokio::test]
    async fn cancel_by_consumer_takes_only_theirs() {
        let tracker = DeliveryTracker::new();
        tracker.follow(record("m1", "c1", FollowKind::Acknowledge), Duration::from_secs(10));
        tracker.follow(record("m2", "c2", FollowKind::Acknowledge), Duration::from_secs(10));
        tracker.follow(record("m3", "c1", FollowKind::Acknowledge), Duration::from_secs(10));

        let cancelled = tracker.cancel_by_consumer("c1");
        let mut ids: Vec<_> = cancelled.iter().map(|r| r.message_id.to_string()).collect();
        ids.sort();
        assert_eq!(ids, ["m1", "m3"]);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn equal_deadlines_expire_fifo() {
        let tracker = DeliveryTracker::new();
        let expired = Arc::new(StdMutex::new(Vec::new()));
        tracker.start(Arc::new(Sink { expired: expired.clone() }));

        tracker.follow(record("a", "c", FollowKind::Acknowledge), Duration::from_millis(40));
        tracker.follow(record("b", "c", FollowKind::Acknowledge), Duration::from_millis(40));
        tracker.follow(record("c", "c", FollowKind::Acknowledge), Duration::from_millis(40));
        tokio::time::sleep(Duration::from_millis(140)).await;

        assert_eq!(
            &*expired.lock().unwrap(),
            &[MessageId::from("a"), MessageId::from("b"), MessageId::from("c")]
        );
    }
}
