//! Per-consumer deliver queue.
//!
//! The queue engine hands dispatched messages to a consumer through one of
//! these channels; the session side drains it and writes frames to the
//! socket. The receiver can be rate limited, which is how a queue's
//! `delay_between_messages` spacing is enforced for each consumer.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam::queue::SegQueue;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub enum Policy {
    //Discard current value
    Current,
    //Discard earliest value
    Early,
}

pub trait PolicyFn<P>: 'static + Sync + Send + Fn(&P) -> Policy {}

impl<T, P> PolicyFn<P> for T where T: 'static + Sync + Send + Clone + Fn(&P) -> Policy {}

pub struct Sender<T> {
    tx: mpsc::Sender<()>,
    queue: Arc<Queue<T>>,
    policy_fn: Arc<dyn PolicyFn<T>>,
}

impl<T> Sender<T> {
    #[inline]
    pub async fn close(&mut self) -> Result<()> {
        self.tx.close().await?;
        Ok(())
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn policy<F>(mut self, f: F) -> Self
    where
        F: PolicyFn<T>,
    {
        self.policy_fn = Arc::new(f);
        self
    }

    ///If the queue is full, the data is discarded according to the policy
    #[inline]
    pub async fn send(&self, v: T) -> Result<(), T> {
        if let Err(v) = self.queue.push(v) {
            match (self.policy_fn)(&v) {
                Policy::Current => return Err(v),
                Policy::Early => {
                    let removed = self.queue.pop();
                    if let Err(v) = self.queue.push(v) {
                        log::warn!("deliver queue is full, queue len is {}", self.queue.len());
                        return Err(v);
                    }
                    if let Some(removed) = removed {
                        return Err(removed);
                    } else {
                        return Ok(());
                    }
                }
            }
        } else if let Err(e) = self.tx.clone().try_send(()) {
            log::warn!("deliver channel is full, {:?}", e);
        }
        Ok(())
    }
}

pub struct Receiver<T> {
    rx: mpsc::Receiver<()>,
    queue: Arc<Queue<T>>,
    limiter: Option<Arc<DirectLimiter>>,
}

impl<T> Receiver<T> {
    /// Next deliverable item, respecting the rate limit. The outer `None`
    /// means the sender side is gone; the inner `None` means a wakeup with an
    /// empty queue (an item was dropped by policy).
    pub async fn next(&mut self) -> Option<Option<T>> {
        match self.rx.next().await {
            Some(()) => {
                if let Some(l) = self.limiter.as_ref() {
                    l.until_ready().await;
                }
                Some(self.queue.pop())
            }
            None => None,
        }
    }

    #[inline]
    pub fn close(&mut self) {
        self.rx.close();
    }
}

pub struct Limiter {
    l: Option<Arc<DirectLimiter>>,
}

impl Limiter {
    #[inline]
    pub fn new(burst: NonZeroU32, replenish_n_per: Duration) -> Result<Self> {
        if replenish_n_per.as_nanos() == 0 {
            return Err(anyhow!("illegal parameter, replenish_n_per is 0"));
        }
        let period = replenish_n_per.as_nanos() as u64 / burst.get() as u64;
        let period = if period > 0 { Duration::from_nanos(period) } else { Duration::from_nanos(1) };
        let q = Quota::with_period(period).ok_or_else(|| anyhow!("period is 0"))?.allow_burst(burst);
        Ok(Self { l: Some(Arc::new(RateLimiter::direct(q))) })
    }

    /// A limiter that never delays, for queues without a per-consumer delay.
    #[inline]
    pub fn none() -> Self {
        Self { l: None }
    }

    #[inline]
    pub fn channel<T>(&self, queue: Arc<Queue<T>>) -> (Sender<T>, Receiver<T>) {
        let (tx, rx) = mpsc::channel::<()>(((queue.capacity() as f64 * 1.5) as usize).max(16));
        let receiver = Receiver { rx, queue: queue.clone(), limiter: self.l.clone() };
        (0..queue.len()).for_each(|_| {
            if let Err(e) = tx.clone().try_send(()) {
                log::warn!("deliver channel is full, {:?}", e);
            }
        });
        (Sender { tx, queue, policy_fn: Arc::new(|_v: &T| -> Policy { Policy::Current }) }, receiver)
    }
}

pub struct Queue<T> {
    cap: usize,
    inner: SegQueue<T>,
}

impl<T> Queue<T> {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap, inner: SegQueue::new() }
    }

    #[inline]
    pub fn push(&self, v: T) -> Result<(), T> {
        if self.inner.len() > self.cap {
            return Err(v);
        }
        self.inner.push(v);
        Ok(())
    }

    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn rate_limited_channel_spaces_deliveries() {
        let limiter = Limiter::new(NonZeroU32::new(1).unwrap(), Duration::from_millis(50)).unwrap();
        let (tx, mut rx) = limiter.channel::<u64>(Arc::new(Queue::new(100)));

        for i in 0..4u64 {
            tx.send(i).await.unwrap();
        }

        let start = Instant::now();
        let mut got = Vec::new();
        while got.len() < 4 {
            match rx.next().await {
                Some(Some(v)) => got.push(v),
                Some(None) => {}
                None => break,
            }
        }
        assert_eq!(got, [0, 1, 2, 3]);
        // first passes immediately, the rest are spaced by >= 50ms
        assert!(start.elapsed() >= Duration::from_millis(140), "elapsed: {:?}", start.elapsed());
    }

    #[tokio::test]
    async fn full_queue_applies_policy() {
        let limiter = Limiter::none();
        let (tx, _rx) = limiter.channel::<u64>(Arc::new(Queue::new(0)));
        // capacity 0 admits a single element
        tx.send(1).await.unwrap();
        assert!(tx.send(2).await.is_err());

        let (tx, _rx) = limiter.channel::<u64>(Arc::new(Queue::new(0)));
        let tx = tx.policy(|_: &u64| Policy::Early);
        tx.send(1).await.unwrap();
        // early policy drops the oldest element and reports it back
        assert_eq!(tx.send(2).await.unwrap_err(), 1);
    }
}
