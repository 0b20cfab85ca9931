//! Queue engine: one single-writer actor per queue.
//!
//! Every mutation of a queue (push, pull, subscribe, acknowledge, timer,
//! status change) arrives as a [`QueueEvent`] on the actor's own stream, so
//! queue invariants hold without locks. Dispatch consults the queue's
//! delivery-handler pipeline at each step and registers in-flight work with
//! the delivery tracker; messages reach consumers through their
//! rate-limited deliver channels.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::channel::mpsc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use hmq_codec::types::headers;
use hmq_codec::Frame;
use hmq_utils::{timestamp_millis, Counter, TimestampMillis};

use crate::context::ServerContext;
use crate::deliver;
use crate::events::event_names;
use crate::handler::{AckVote, HandlerPipeline, HookContext, KeepVote, Type};
use crate::store::{MessageStore, PushOutcome};
use crate::tracker::{DeliverOutcome, DeliveryRecord, FollowKind};
use crate::types::*;

/// Capacity of one consumer's deliver channel.
const DELIVER_QUEUE_CAP: usize = 1000;

/// Interval of the send-timeout sweep.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

pub enum QueueEvent {
    Push { frame: Frame, producer: Id, reply: Option<oneshot::Sender<DeliverOutcome>> },
    Pull { consumer: Id, reply: oneshot::Sender<std::result::Result<Option<Frame>, Reason>> },
    Subscribe { info: Id, reply: oneshot::Sender<std::result::Result<deliver::Receiver<Frame>, Reason>> },
    Unsubscribe { client_id: ClientId, reply: Option<oneshot::Sender<bool>> },
    Ack { frame: Frame },
    Expired { record: DeliveryRecord },
    ConsumerGone { client_id: ClientId, records: Vec<DeliveryRecord> },
    StatusChange { status: QueueStatus },
    UpdateOptions { opts: QueueOptions },
    Clear { reply: oneshot::Sender<usize> },
    Info { reply: oneshot::Sender<QueueInfo> },
    Trigger,
    Delete { reply: oneshot::Sender<()> },
}

#[derive(Debug, Default, Serialize)]
pub struct QueueStats {
    pub stored: Counter,
    pub delivered: Counter,
    pub acked: Counter,
    pub nacked: Counter,
    pub timed_out: Counter,
}

#[derive(Debug, Serialize)]
pub struct QueueInfo {
    pub name: QueueName,
    pub status: QueueStatus,
    pub options: QueueOptions,
    pub message_count: usize,
    pub subscriber_count: usize,
    /// Subscribed client ids with their join timestamps, insertion ordered.
    pub subscribers: Vec<(ClientId, TimestampMillis)>,
    pub stats: QueueStats,
}

/// Cheap-clone handle to a queue actor.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueHandle>,
}

struct QueueHandle {
    name: QueueName,
    tx: mpsc::UnboundedSender<QueueEvent>,
    stats: Arc<QueueStats>,
}

impl Queue {
    /// Builds the queue's pipeline, replays its persisted messages and
    /// spawns the actor.
    pub(crate) async fn create(scx: ServerContext, name: QueueName, opts: QueueOptions) -> Result<Queue> {
        let pipeline = scx.extends.handler_factory().await.create(&name, &opts).await;
        let stats = Arc::new(QueueStats::default());

        let mut store = MessageStore::new(opts.message_limit);
        let storage = scx.extends.storage().await;
        if storage.enable() {
            match storage.load(&name).await {
                Ok(frames) => {
                    for frame in frames {
                        stats.stored.inc();
                        let _ = store.push(frame);
                    }
                }
                Err(e) => {
                    log::warn!("queue {:?} replay failed, starting empty, {:?}", name, e);
                }
            }
        }

        let (tx, rx) = mpsc::unbounded();
        let status = opts.status;
        let store_empty = store.is_empty();
        let hook_ctx = HookContext { queue: name.clone(), opts: opts.clone() };
        let actor = QueueActor {
            name: name.clone(),
            scx,
            opts,
            status,
            store,
            subscribers: Vec::new(),
            cursor: 0,
            pipeline,
            hook_ctx,
            pending_replies: HashMap::default(),
            messages_seen: !store_empty,
            consumers_seen: false,
            stats: stats.clone(),
            rx,
        };
        tokio::spawn(actor.run());

        Ok(Queue { inner: Arc::new(QueueHandle { name, tx, stats }) })
    }

    #[inline]
    pub fn name(&self) -> &QueueName {
        &self.inner.name
    }

    /// Whether two handles refer to the same live actor; a deleted and
    /// recreated queue compares unequal.
    #[inline]
    pub fn ptr_eq(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[inline]
    pub fn stats(&self) -> &QueueStats {
        &self.inner.stats
    }

    #[inline]
    fn send(&self, ev: QueueEvent) -> Result<()> {
        self.inner.tx.unbounded_send(ev).map_err(|_| anyhow!("queue {:?} is stopped", self.inner.name))
    }

    /// Push without waiting for an outcome.
    #[inline]
    pub fn push(&self, frame: Frame, producer: Id) -> Result<()> {
        self.send(QueueEvent::Push { frame, producer, reply: None })
    }

    /// Push and wait for the producer-visible outcome; with
    /// wait-for-acknowledge queues this resolves when the delivery does.
    pub async fn push_await(&self, frame: Frame, producer: Id) -> Result<DeliverOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueEvent::Push { frame, producer, reply: Some(tx) })?;
        Ok(rx.await.unwrap_or(DeliverOutcome::Timeout))
    }

    pub async fn pull(&self, consumer: Id) -> Result<std::result::Result<Option<Frame>, Reason>> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueEvent::Pull { consumer, reply: tx })?;
        Ok(rx.await?)
    }

    pub async fn subscribe(&self, info: Id) -> Result<deliver::Receiver<Frame>> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueEvent::Subscribe { info, reply: tx })?;
        rx.await?.map_err(|reason| anyhow!("subscribe rejected: {}", reason))
    }

    pub async fn unsubscribe(&self, client_id: ClientId) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueEvent::Unsubscribe { client_id, reply: Some(tx) })?;
        Ok(rx.await?)
    }

    #[inline]
    pub fn ack(&self, frame: Frame) {
        let _ = self.send(QueueEvent::Ack { frame });
    }

    #[inline]
    pub(crate) fn expired(&self, record: DeliveryRecord) {
        let _ = self.send(QueueEvent::Expired { record });
    }

    #[inline]
    pub(crate) fn consumer_gone(&self, client_id: ClientId, records: Vec<DeliveryRecord>) {
        let _ = self.send(QueueEvent::ConsumerGone { client_id, records });
    }

    #[inline]
    pub fn set_status(&self, status: QueueStatus) -> Result<()> {
        self.send(QueueEvent::StatusChange { status })
    }

    #[inline]
    pub fn update_options(&self, opts: QueueOptions) -> Result<()> {
        self.send(QueueEvent::UpdateOptions { opts })
    }

    pub async fn clear(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueEvent::Clear { reply: tx })?;
        Ok(rx.await?)
    }

    pub async fn info(&self) -> Result<QueueInfo> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueEvent::Info { reply: tx })?;
        Ok(rx.await?)
    }

    #[inline]
    pub fn trigger(&self) {
        let _ = self.send(QueueEvent::Trigger);
    }

    /// Stops the actor: cancels outstanding deliveries with negative acks,
    /// drops subscriptions and removes the persisted log.
    pub async fn delete(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(QueueEvent::Delete { reply: tx })?;
        rx.await?;
        Ok(())
    }
}

struct Subscriber {
    info: Id,
    joined_at: TimestampMillis,
    tx: deliver::Sender<Frame>,
    /// Wait-for-acknowledge queues stop sending to a consumer until its
    /// outstanding delivery resolves.
    blocked: bool,
}

enum Flow {
    Continue,
    Stop,
}

enum SendStatus {
    Sent,
    Busy,
}

enum BeginSend {
    Proceed,
    /// The message was dropped; move on to the next one.
    Dropped,
    /// The message went back to the head; stop dispatching for now.
    Requeued,
}

struct QueueActor {
    name: QueueName,
    scx: ServerContext,
    opts: QueueOptions,
    status: QueueStatus,
    store: MessageStore,
    subscribers: Vec<Subscriber>,
    cursor: usize,
    pipeline: HandlerPipeline,
    hook_ctx: HookContext,
    /// Producers awaiting a deferred (wait-for-acknowledge) outcome, keyed
    /// by message id until the message is handed to a consumer.
    pending_replies: HashMap<MessageId, oneshot::Sender<DeliverOutcome>>,
    /// Auto-destroy only triggers once the queue has seen the respective
    /// kind of activity, so a freshly created queue is not reaped.
    messages_seen: bool,
    consumers_seen: bool,
    stats: Arc<QueueStats>,
    rx: mpsc::UnboundedReceiver<QueueEvent>,
}

impl QueueActor {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                ev = self.rx.next() => {
                    match ev {
                        Some(ev) => {
                            if let Flow::Stop = self.handle_event(ev).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => self.sweep_send_timeouts().await,
            }
        }
        log::debug!("queue {:?} actor exit", self.name);
    }

    async fn handle_event(&mut self, ev: QueueEvent) -> Flow {
        match ev {
            QueueEvent::Push { frame, producer, reply } => {
                self.on_push(frame, producer, reply).await;
            }
            QueueEvent::Pull { consumer, reply } => {
                let r = self.on_pull(consumer).await;
                let _ = reply.send(r);
                self.check_auto_destroy();
            }
            QueueEvent::Subscribe { info, reply } => {
                let r = self.on_subscribe(info);
                let _ = reply.send(r);
                self.dispatch().await;
            }
            QueueEvent::Unsubscribe { client_id, reply } => {
                let removed = self.on_unsubscribe(&client_id).await;
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
                self.check_auto_destroy();
            }
            QueueEvent::Ack { frame } => {
                self.on_ack(frame).await;
                self.check_auto_destroy();
            }
            QueueEvent::Expired { record } => {
                self.on_expired(record).await;
                self.check_auto_destroy();
            }
            QueueEvent::ConsumerGone { client_id, records } => {
                self.on_consumer_gone(client_id, records).await;
                self.check_auto_destroy();
            }
            QueueEvent::StatusChange { status } => {
                if self.status != status {
                    self.status = status;
                    self.opts.status = status;
                    self.hook_ctx = HookContext { queue: self.name.clone(), opts: self.opts.clone() };
                    self.fire_event(event_names::QUEUE_STATUS_CHANGED, serde_json::json!({"status": status.as_str()}));
                    self.dispatch().await;
                }
            }
            QueueEvent::UpdateOptions { opts } => {
                self.status = opts.status;
                self.store.set_limit(opts.message_limit);
                self.opts = opts;
                self.hook_ctx = HookContext { queue: self.name.clone(), opts: self.opts.clone() };
                self.dispatch().await;
            }
            QueueEvent::Clear { reply } => {
                let frames = self.store.drain();
                let n = frames.len();
                for frame in frames {
                    self.finalize(&frame).await;
                }
                let _ = reply.send(n);
                self.check_auto_destroy();
            }
            QueueEvent::Info { reply } => {
                let _ = reply.send(self.info());
            }
            QueueEvent::Trigger => {
                self.dispatch().await;
            }
            QueueEvent::Delete { reply } => {
                self.on_delete().await;
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.name.clone(),
            status: self.status,
            options: self.opts.clone(),
            message_count: self.store.len(),
            subscriber_count: self.subscribers.len(),
            subscribers: self.subscribers.iter().map(|s| (s.info.client_id.clone(), s.joined_at)).collect(),
            stats: QueueStats {
                stored: self.stats.stored.clone(),
                delivered: self.stats.delivered.clone(),
                acked: self.stats.acked.clone(),
                nacked: self.stats.nacked.clone(),
                timed_out: self.stats.timed_out.clone(),
            },
        }
    }

    async fn on_push(&mut self, mut frame: Frame, producer: Id, reply: Option<oneshot::Sender<DeliverOutcome>>) {
        if !self.status.accepts_push() {
            let reason = match self.status {
                QueueStatus::Stopped => Reason::from_static("stopped"),
                _ => Reason::from_static("only-consume"),
            };
            complete(reply, DeliverOutcome::Nacked(reason));
            return;
        }

        if self.status == QueueStatus::Route {
            self.route_through(frame, producer, reply);
            return;
        }

        if self.opts.message_size_limit > 0 && frame.content.len() > self.opts.message_size_limit {
            complete(reply, DeliverOutcome::Nacked(Reason::from_static("Unacceptable")));
            return;
        }

        if self.opts.use_message_id && frame.message_id.is_empty() {
            frame.set_message_id(Uuid::new_v4().as_simple().to_string());
        }
        if self.opts.use_message_id
            && !frame.message_id.is_empty()
            && (self.store.contains_id(&frame.message_id) || self.scx.tracker.contains(&frame.message_id))
        {
            complete(reply, DeliverOutcome::Nacked(Reason::from_static("Duplicate")));
            return;
        }

        // capacity first so nothing is persisted for a rejected message
        if self.opts.message_limit > 0 && self.store.len() >= self.opts.message_limit {
            complete(reply, DeliverOutcome::Nacked(Reason::from_static(headers::REASON_LIMIT)));
            return;
        }

        let decision = self.pipeline.received_from_producer(&self.hook_ctx, &frame, &producer).await;
        if !decision.allow {
            complete(reply, DeliverOutcome::Nacked(Reason::from_static("policy")));
            return;
        }

        let saved = if decision.save { self.pipeline.save_message(&self.hook_ctx, &frame).await } else { false };
        if decision.save && !saved {
            // volatile from here on
            self.pipeline
                .exception_thrown(&self.hook_ctx, Type::SaveMessage, &anyhow!("save failed, keeping volatile"))
                .await;
        }

        let message_id = frame.message_id.clone();
        let pending_ack = frame.pending_acknowledge();
        match self.store.push(frame) {
            PushOutcome::Stored => {
                self.stats.stored.inc();
                self.messages_seen = true;
            }
            PushOutcome::Full => {
                complete(reply, DeliverOutcome::Nacked(Reason::from_static(headers::REASON_LIMIT)));
                return;
            }
        }

        match decision.ack {
            AckVote::Always => complete(reply, DeliverOutcome::Acked),
            AckVote::IfSaved => {
                if saved {
                    complete(reply, DeliverOutcome::Acked)
                } else {
                    complete(reply, DeliverOutcome::Nacked(Reason::from_static("PersistenceError")))
                }
            }
            AckVote::Negative => complete(reply, DeliverOutcome::Nacked(Reason::from_static("policy"))),
            AckVote::Skip => {
                if let Some(reply) = reply {
                    let defer = matches!(self.opts.acknowledge, AckPolicy::WaitForAcknowledge)
                        && (pending_ack || self.opts.wait_for_ack);
                    if defer {
                        self.pending_replies.insert(message_id, reply);
                    } else {
                        let _ = reply.send(DeliverOutcome::Acked);
                    }
                }
            }
        }

        self.dispatch().await;
    }

    /// Route-status queues never store: hand the message to the router of
    /// the same name and report its outcome.
    fn route_through(&self, frame: Frame, producer: Id, reply: Option<oneshot::Sender<DeliverOutcome>>) {
        let router = self.scx.routers.get(&self.name).map(|r| r.value().clone());
        let scx = self.scx.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            match router {
                Some(router) => {
                    let outcome = router.route(&scx, frame, producer).await;
                    complete(reply, outcome);
                }
                None => {
                    log::debug!("route queue {:?} has no router, message dropped", name);
                    complete(reply, DeliverOutcome::Nacked(Reason::from_static("NotFound")));
                }
            }
        });
    }

    async fn on_pull(&mut self, consumer: Id) -> std::result::Result<Option<Frame>, Reason> {
        if self.status != QueueStatus::Pull {
            return Err(Reason::from_static("not a pull queue"));
        }

        let Some(frame) = self.store.pop() else {
            return Ok(None);
        };

        let decision = self.pipeline.begin_send(&self.hook_ctx, &frame).await;
        if !decision.allow {
            self.store.requeue_front(frame);
            return Err(Reason::from_static("policy"));
        }
        let decision = self.pipeline.can_consumer_receive(&self.hook_ctx, &frame, &consumer).await;
        if !decision.allow {
            self.store.requeue_front(frame);
            return Err(Reason::from_static("policy"));
        }

        let decision = self.pipeline.consumer_received(&self.hook_ctx, &frame, &consumer).await;
        self.stats.delivered.inc();
        if decision.keep == KeepVote::Keep {
            let mut record = DeliveryRecord::new(
                frame.message_id.clone(),
                Some(self.name.clone()),
                consumer.client_id.clone(),
                Some(Id::from_client_id(frame.source.clone())),
                frame.clone(),
                FollowKind::Acknowledge,
            );
            if let Some(reply) = self.pending_replies.remove(&frame.message_id) {
                record = record.with_reply(reply);
            }
            self.scx.tracker.follow(record, self.ack_timeout());
        } else {
            self.finalize(&frame).await;
        }
        self.pipeline.end_send(&self.hook_ctx, &frame, 1).await;

        let mut out = frame;
        if self.opts.hide_client_names {
            out.set_source("");
        }
        Ok(Some(out))
    }

    fn on_subscribe(&mut self, info: Id) -> std::result::Result<deliver::Receiver<Frame>, Reason> {
        if self.status == QueueStatus::Stopped {
            return Err(Reason::from_static("stopped"));
        }

        let limiter = if self.opts.delay_between_messages.is_zero() {
            deliver::Limiter::none()
        } else {
            deliver::Limiter::new(NonZeroU32::MIN, self.opts.delay_between_messages)
                .unwrap_or_else(|_| deliver::Limiter::none())
        };
        let (tx, rx) = limiter.channel(Arc::new(deliver::Queue::new(DELIVER_QUEUE_CAP)));

        if let Some(pos) = self.subscribers.iter().position(|s| s.info.client_id == info.client_id) {
            self.subscribers.remove(pos);
            self.cursor = 0;
        }
        let client_id = info.client_id.clone();
        self.subscribers.push(Subscriber { info, joined_at: timestamp_millis(), tx, blocked: false });
        self.consumers_seen = true;
        self.fire_event(event_names::CLIENT_JOINED, serde_json::json!({ "client": client_id }));
        Ok(rx)
    }

    async fn on_unsubscribe(&mut self, client_id: &ClientId) -> bool {
        let Some(pos) = self.subscribers.iter().position(|s| &s.info.client_id == client_id) else {
            return false;
        };
        self.subscribers.remove(pos);
        self.cursor = 0;

        let records = self.scx.tracker.cancel_by_consumer_queue(client_id, &self.name);
        self.requeue_cancelled(client_id.clone(), records).await;
        self.fire_event(event_names::CLIENT_LEFT, serde_json::json!({ "client": client_id }));
        self.dispatch().await;
        true
    }

    async fn on_ack(&mut self, ack: Frame) {
        let success = !ack.is_negative_ack();
        // late or unknown acks are ignored
        let Some(mut record) = self.scx.tracker.resolve_ack(&ack.message_id) else {
            log::debug!("queue {:?} ignoring unknown ack {:?}", self.name, ack.message_id);
            return;
        };

        let decision = self.pipeline.acknowledge_received(&self.hook_ctx, &ack, &record.frame, success).await;

        if success {
            self.stats.acked.inc();
            record.complete(DeliverOutcome::Acked);
        } else {
            self.stats.nacked.inc();
            let reason = ack.negative_ack_reason().unwrap_or_else(|| Reason::from_static(headers::REASON_NONE));
            record.complete(DeliverOutcome::Nacked(reason));
        }

        self.unblock(&record.consumer);
        match decision.keep {
            KeepVote::RequeueHead => {
                self.store.requeue_front(record.frame);
            }
            KeepVote::Remove => {
                self.finalize(&record.frame).await;
            }
            KeepVote::Keep => {}
        }
        self.dispatch().await;
    }

    async fn on_expired(&mut self, mut record: DeliveryRecord) {
        let decision = self.pipeline.acknowledge_timed_out(&self.hook_ctx, &record.frame).await;
        self.stats.timed_out.inc();
        self.unblock(&record.consumer);
        record.complete(DeliverOutcome::Timeout);

        match decision.keep {
            KeepVote::RequeueHead => {
                self.store.requeue_front(record.frame);
            }
            KeepVote::Remove => {
                self.finalize(&record.frame).await;
            }
            KeepVote::Keep => {}
        }
        self.dispatch().await;
    }

    async fn on_consumer_gone(&mut self, client_id: ClientId, records: Vec<DeliveryRecord>) {
        if let Some(pos) = self.subscribers.iter().position(|s| s.info.client_id == client_id) {
            self.subscribers.remove(pos);
            self.cursor = 0;
        }
        self.requeue_cancelled(client_id.clone(), records).await;
        self.fire_event(event_names::CLIENT_LEFT, serde_json::json!({ "client": client_id }));
        self.dispatch().await;
    }

    /// Undelivered messages of a cancelled consumer go back to the head;
    /// their producers keep waiting for the redelivery to resolve.
    async fn requeue_cancelled(&mut self, client_id: ClientId, records: Vec<DeliveryRecord>) {
        let consumer = Id::from_client_id(client_id);
        for mut record in records {
            let decision = self.pipeline.consumer_receive_failed(&self.hook_ctx, &record.frame, &consumer).await;
            match decision.keep {
                KeepVote::RequeueHead | KeepVote::Keep => {
                    if let Some(reply) = record.take_reply() {
                        self.pending_replies.insert(record.message_id.clone(), reply);
                    }
                    self.store.requeue_front(record.frame);
                }
                KeepVote::Remove => {
                    record.complete(DeliverOutcome::Nacked(Reason::from_static("consumer disconnected")));
                    self.finalize(&record.frame).await;
                }
            }
        }
    }

    async fn on_delete(&mut self) {
        for mut record in self.scx.tracker.cancel_by_queue(&self.name) {
            record.complete(DeliverOutcome::Nacked(Reason::from_static("queue removed")));
        }
        for (_, reply) in self.pending_replies.drain() {
            let _ = reply.send(DeliverOutcome::Nacked(Reason::from_static("queue removed")));
        }
        for frame in self.store.drain() {
            self.pipeline.message_dequeued(&self.hook_ctx, &frame).await;
        }
        self.subscribers.clear();

        let storage = self.scx.extends.storage().await;
        if storage.enable() {
            if let Err(e) = storage.drop_queue(&self.name).await {
                log::warn!("queue {:?} log removal failed, {:?}", self.name, e);
            }
        }
        self.scx.drop_queue_handle(&self.name);
        self.fire_event(event_names::QUEUE_REMOVED, serde_json::json!({}));
    }

    async fn sweep_send_timeouts(&mut self) {
        self.check_auto_destroy();
        if self.opts.send_timeout.is_zero() || self.store.is_empty() {
            return;
        }
        let cutoff = timestamp_millis() - self.opts.send_timeout.as_millis() as TimestampMillis;
        let expired = self.store.take_older_than(cutoff);
        for frame in expired {
            let decision = self.pipeline.message_timed_out(&self.hook_ctx, &frame).await;
            self.stats.timed_out.inc();
            if let Some(reply) = self.pending_replies.remove(&frame.message_id) {
                let _ = reply.send(DeliverOutcome::Timeout);
            }
            self.fire_event(event_names::MESSAGE_TIMED_OUT, serde_json::json!({ "id": &*frame.message_id }));
            match decision.keep {
                KeepVote::RequeueHead | KeepVote::Keep => {
                    // handler vetoed the discard; the timestamp resets
                    self.store.requeue_front(frame);
                }
                KeepVote::Remove => {
                    self.finalize(&frame).await;
                }
            }
        }
        self.check_auto_destroy();
    }

    async fn dispatch(&mut self) {
        if !self.status.dispatches() {
            return;
        }
        match self.status {
            QueueStatus::Broadcast => self.dispatch_broadcast().await,
            QueueStatus::RoundRobin => self.dispatch_round_robin().await,
            _ => self.dispatch_push().await,
        }
    }

    /// Running/Push/OnlyConsume: each message to a single next-available
    /// subscriber, rotating for fairness over time.
    async fn dispatch_push(&mut self) {
        loop {
            if self.store.is_empty() {
                return;
            }
            let Some(idx) = self.next_available(None) else {
                return;
            };
            let Some(frame) = self.store.pop() else {
                return;
            };

            match self.begin_send(&frame).await {
                BeginSend::Proceed => {}
                BeginSend::Dropped => continue,
                BeginSend::Requeued => return,
            }

            // per-consumer gate, falling through to the next candidate
            let mut target = None;
            let mut probe = Some(idx);
            while let Some(i) = probe {
                let consumer = self.subscribers[i].info.clone();
                if self.pipeline.can_consumer_receive(&self.hook_ctx, &frame, &consumer).await.allow {
                    target = Some(i);
                    break;
                }
                probe = self.next_available(Some(i));
                if probe == Some(idx) {
                    break;
                }
            }
            let Some(target) = target else {
                self.store.requeue_front(frame);
                return;
            };

            match self.send_to(target, frame.clone()).await {
                SendStatus::Sent => {
                    self.pipeline.end_send(&self.hook_ctx, &frame, 1).await;
                }
                SendStatus::Busy => {
                    self.pipeline.end_send(&self.hook_ctx, &frame, 0).await;
                    return;
                }
            }
        }
    }

    /// One message to the subscriber under the cursor, advancing it per
    /// send; the cursor resets when a consumer drops.
    async fn dispatch_round_robin(&mut self) {
        loop {
            if self.store.is_empty() || self.subscribers.is_empty() {
                return;
            }
            let idx = self.cursor % self.subscribers.len();
            if !self.available(idx) {
                return;
            }
            let Some(frame) = self.store.pop() else {
                return;
            };

            match self.begin_send(&frame).await {
                BeginSend::Proceed => {}
                BeginSend::Dropped => continue,
                BeginSend::Requeued => return,
            }
            let consumer = self.subscribers[idx].info.clone();
            if !self.pipeline.can_consumer_receive(&self.hook_ctx, &frame, &consumer).await.allow {
                self.store.requeue_front(frame);
                return;
            }

            match self.send_to(idx, frame.clone()).await {
                SendStatus::Sent => {
                    self.cursor = (idx + 1) % self.subscribers.len().max(1);
                    self.pipeline.end_send(&self.hook_ctx, &frame, 1).await;
                }
                SendStatus::Busy => {
                    self.pipeline.end_send(&self.hook_ctx, &frame, 0).await;
                    return;
                }
            }
        }
    }

    /// Every subscriber passing the per-consumer gate receives a copy; the
    /// message is finalized afterwards regardless of receiver count.
    async fn dispatch_broadcast(&mut self) {
        loop {
            if self.store.is_empty() || self.subscribers.is_empty() {
                return;
            }
            let Some(frame) = self.store.pop() else {
                return;
            };
            match self.begin_send(&frame).await {
                BeginSend::Proceed => {}
                BeginSend::Dropped => continue,
                BeginSend::Requeued => return,
            }

            let mut receivers = 0usize;
            for idx in 0..self.subscribers.len() {
                let consumer = self.subscribers[idx].info.clone();
                if !self.pipeline.can_consumer_receive(&self.hook_ctx, &frame, &consumer).await.allow {
                    continue;
                }
                let mut out = frame.clone();
                if self.opts.hide_client_names {
                    out.set_source("");
                }
                match self.subscribers[idx].tx.send(out).await {
                    Ok(()) => {
                        self.pipeline.consumer_received(&self.hook_ctx, &frame, &consumer).await;
                        self.stats.delivered.inc();
                        receivers += 1;
                    }
                    Err(_) => {
                        self.pipeline.consumer_receive_failed(&self.hook_ctx, &frame, &consumer).await;
                    }
                }
            }
            self.pipeline.end_send(&self.hook_ctx, &frame, receivers).await;
            self.finalize(&frame).await;
        }
    }

    async fn begin_send(&mut self, frame: &Frame) -> BeginSend {
        let decision = self.pipeline.begin_send(&self.hook_ctx, frame).await;
        if decision.allow {
            return BeginSend::Proceed;
        }
        match decision.keep {
            KeepVote::RequeueHead | KeepVote::Keep => {
                self.store.requeue_front(frame.clone());
                BeginSend::Requeued
            }
            KeepVote::Remove => {
                self.finalize(frame).await;
                BeginSend::Dropped
            }
        }
    }

    async fn send_to(&mut self, idx: usize, frame: Frame) -> SendStatus {
        let consumer = self.subscribers[idx].info.clone();
        let mut out = frame.clone();
        if self.opts.hide_client_names {
            out.set_source("");
        }

        match self.subscribers[idx].tx.send(out).await {
            Ok(()) => {
                let decision = self.pipeline.consumer_received(&self.hook_ctx, &frame, &consumer).await;
                self.stats.delivered.inc();
                if decision.keep == KeepVote::Keep {
                    let mut record = DeliveryRecord::new(
                        frame.message_id.clone(),
                        Some(self.name.clone()),
                        consumer.client_id.clone(),
                        Some(Id::from_client_id(frame.source.clone())),
                        frame,
                        FollowKind::Acknowledge,
                    );
                    if let Some(reply) = self.pending_replies.remove(&record.message_id) {
                        record = record.with_reply(reply);
                    }
                    self.scx.tracker.follow(record, self.ack_timeout());
                    if matches!(self.opts.acknowledge, AckPolicy::WaitForAcknowledge) {
                        self.subscribers[idx].blocked = true;
                    }
                } else {
                    self.finalize(&frame).await;
                }
                SendStatus::Sent
            }
            Err(frame_back) => {
                let decision =
                    self.pipeline.consumer_receive_failed(&self.hook_ctx, &frame_back, &consumer).await;
                if matches!(decision.keep, KeepVote::RequeueHead | KeepVote::Keep) {
                    self.store.requeue_front(frame_back);
                }
                SendStatus::Busy
            }
        }
    }

    /// The message's life is over: run the dequeue side effects and release
    /// any producer still waiting.
    async fn finalize(&mut self, frame: &Frame) {
        self.pipeline.message_dequeued(&self.hook_ctx, frame).await;
        if let Some(reply) = self.pending_replies.remove(&frame.message_id) {
            let _ = reply.send(DeliverOutcome::Acked);
        }
    }

    #[inline]
    fn available(&self, idx: usize) -> bool {
        let s = &self.subscribers[idx];
        !s.blocked && !s.tx.is_closed()
    }

    /// Next available subscriber starting at the fairness cursor; `after`
    /// continues a scan past a rejected candidate.
    fn next_available(&mut self, after: Option<usize>) -> Option<usize> {
        let n = self.subscribers.len();
        if n == 0 {
            return None;
        }
        let start = match after {
            Some(i) => (i + 1) % n,
            None => self.cursor % n,
        };
        for off in 0..n {
            let idx = (start + off) % n;
            if self.available(idx) {
                if after.is_none() {
                    self.cursor = (idx + 1) % n;
                }
                return Some(idx);
            }
        }
        None
    }

    #[inline]
    fn unblock(&mut self, client_id: &ClientId) {
        for s in self.subscribers.iter_mut() {
            if &s.info.client_id == client_id {
                s.blocked = false;
            }
        }
    }

    #[inline]
    fn ack_timeout(&self) -> Duration {
        if self.opts.ack_timeout.is_zero() {
            self.scx.default_ack_timeout
        } else {
            self.opts.ack_timeout
        }
    }

    #[inline]
    fn fire_event(&self, event: &str, payload: serde_json::Value) {
        self.scx.events.fire(&self.scx.clients, event, &self.name, payload);
    }

    fn check_auto_destroy(&mut self) {
        let no_messages = self.messages_seen && self.store.is_empty() && self.pending_replies.is_empty();
        let no_consumers = self.consumers_seen && self.subscribers.is_empty();
        let destroy = match self.opts.auto_destroy {
            AutoDestroy::Disabled => false,
            AutoDestroy::NoMessages => no_messages,
            AutoDestroy::NoConsumers => no_consumers,
            AutoDestroy::NoMessagesAndConsumers => no_messages && no_consumers,
        };
        if destroy {
            if let Some(queue) = self.scx.get_queue(&self.name) {
                let name = self.name.clone();
                tokio::spawn(async move {
                    log::info!("queue {:?} auto destroy", name);
                    if let Err(e) = queue.delete().await {
                        log::warn!("queue {:?} auto destroy failed, {:?}", name, e);
                    }
                });
            }
        }
    }
}

#[inline]
fn complete(reply: Option<oneshot::Sender<DeliverOutcome>>, outcome: DeliverOutcome) {
    if let Some(reply) = reply {
        let _ = reply.send(outcome);
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Queue({:?})", self.inner.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServerContext;
    use hmq_codec::{FrameFlags, MessageType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue_message(id: &str, queue: &str, body: &str) -> Frame {
        let mut f = Frame::new(MessageType::QueueMessage);
        f.set_message_id(id).set_source("producer-1").set_target(queue);
        f.set_content_string(body);
        f
    }

    async fn scx() -> ServerContext {
        ServerContext::new().build().await
    }

    fn pump_counting(mut rx: deliver::Receiver<Frame>, counter: Arc<AtomicUsize>) {
        tokio::spawn(async move {
            while let Some(item) = rx.next().await {
                if item.is_some() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
    }

    #[tokio::test]
    async fn delay_between_messages_paces_one_consumer() {
        let scx = scx().await;
        let opts = QueueOptions {
            status: QueueStatus::Push,
            delay_between_messages: Duration::from_millis(100),
            ..Default::default()
        };
        let q = scx.create_queue("push-a", opts).await.unwrap();

        let rx = q.subscribe(Id::from_client_id("consumer-1")).await.unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        pump_counting(rx, received.clone());

        for i in 0..30 {
            q.push(queue_message(&format!("m{i}"), "push-a", "Hello, World!"), Id::from_client_id("producer-1"))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        let n = received.load(Ordering::SeqCst);
        assert!((5..=6).contains(&n), "received {} messages after 500ms", n);
    }

    #[tokio::test]
    async fn negative_ack_fails_the_push_and_requeues() {
        let scx = scx().await;
        let opts = QueueOptions {
            status: QueueStatus::Push,
            acknowledge: AckPolicy::WaitForAcknowledge,
            wait_for_ack: true,
            ..Default::default()
        };
        let q = scx.create_queue("orders", opts).await.unwrap();

        let mut rx = q.subscribe(Id::from_client_id("consumer-1")).await.unwrap();
        let q2 = q.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.next().await {
                if let Some(frame) = item {
                    // stop receiving before nacking so the requeued message
                    // stays queued instead of being redelivered here
                    rx.close();
                    let mut ack = frame.create_acknowledge(Some("busy"));
                    ack.set_source("consumer-1");
                    q2.ack(ack);
                    break;
                }
            }
        });

        let mut frame = queue_message("m1", "orders", "payload");
        frame.flags |= FrameFlags::PENDING_ACKNOWLEDGE;
        let outcome = q.push_await(frame, Id::from_client_id("producer-1")).await.unwrap();
        match outcome {
            DeliverOutcome::Nacked(reason) => assert_eq!(reason, "busy"),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let info = q.info().await.unwrap();
        assert_eq!(info.message_count, 1, "message must be requeued to head");
    }

    #[tokio::test]
    async fn message_limit_rejects_the_third_push() {
        let scx = scx().await;
        let opts = QueueOptions { status: QueueStatus::Push, message_limit: 2, ..Default::default() };
        let q = scx.create_queue("small", opts).await.unwrap();

        for i in 0..2 {
            let outcome = q
                .push_await(queue_message(&format!("m{i}"), "small", "x"), Id::from_client_id("p"))
                .await
                .unwrap();
            assert!(matches!(outcome, DeliverOutcome::Acked), "push {} should be accepted", i);
        }
        let outcome =
            q.push_await(queue_message("m2", "small", "x"), Id::from_client_id("p")).await.unwrap();
        match outcome {
            DeliverOutcome::Nacked(reason) => assert_eq!(reason, headers::REASON_LIMIT),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(q.info().await.unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_once() {
        let scx = scx().await;
        let opts = QueueOptions { status: QueueStatus::Broadcast, ..Default::default() };
        let q = scx.create_queue("fanout", opts).await.unwrap();

        let mut counters = Vec::new();
        for i in 0..3 {
            let rx = q.subscribe(Id::from_client_id(format!("c{i}"))).await.unwrap();
            let counter = Arc::new(AtomicUsize::new(0));
            pump_counting(rx, counter.clone());
            counters.push(counter);
        }

        q.push(queue_message("m1", "fanout", "hello"), Id::from_client_id("p")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        for (i, counter) in counters.iter().enumerate() {
            assert_eq!(counter.load(Ordering::SeqCst), 1, "consumer {} copies", i);
        }
        assert_eq!(q.info().await.unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn pull_returns_head_then_empty() {
        let scx = scx().await;
        let opts = QueueOptions { status: QueueStatus::Pull, ..Default::default() };
        let q = scx.create_queue("inbox", opts).await.unwrap();

        for i in 0..5 {
            q.push(queue_message(&format!("m{i}"), "inbox", "x"), Id::from_client_id("p")).unwrap();
        }

        let got = q.pull(Id::from_client_id("c")).await.unwrap().unwrap().unwrap();
        assert_eq!(got.message_id, "m0");
        assert_eq!(q.info().await.unwrap().message_count, 4);

        for _ in 0..4 {
            q.pull(Id::from_client_id("c")).await.unwrap().unwrap().unwrap();
        }
        assert!(q.pull(Id::from_client_id("c")).await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn round_robin_is_cyclically_fair() {
        let scx = scx().await;
        let opts = QueueOptions { status: QueueStatus::RoundRobin, ..Default::default() };
        let q = scx.create_queue("rr", opts).await.unwrap();

        let mut counters = Vec::new();
        for i in 0..3 {
            let rx = q.subscribe(Id::from_client_id(format!("c{i}"))).await.unwrap();
            let counter = Arc::new(AtomicUsize::new(0));
            pump_counting(rx, counter.clone());
            counters.push(counter);
        }

        for i in 0..9 {
            q.push(queue_message(&format!("m{i}"), "rr", "x"), Id::from_client_id("p")).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        for (i, counter) in counters.iter().enumerate() {
            assert_eq!(counter.load(Ordering::SeqCst), 3, "consumer {} share", i);
        }
    }

    #[tokio::test]
    async fn wait_for_ack_blocks_the_second_send() {
        let scx = scx().await;
        let opts = QueueOptions {
            status: QueueStatus::Push,
            acknowledge: AckPolicy::WaitForAcknowledge,
            ..Default::default()
        };
        let q = scx.create_queue("strict", opts).await.unwrap();

        let mut rx = q.subscribe(Id::from_client_id("c1")).await.unwrap();
        q.push(queue_message("m1", "strict", "x"), Id::from_client_id("p")).unwrap();
        q.push(queue_message("m2", "strict", "x"), Id::from_client_id("p")).unwrap();

        let first = tokio::time::timeout(Duration::from_millis(200), rx.next())
            .await
            .expect("first delivery")
            .unwrap()
            .unwrap();
        assert_eq!(first.message_id, "m1");

        // no second delivery until the first resolves
        assert!(tokio::time::timeout(Duration::from_millis(150), rx.next()).await.is_err());
        assert_eq!(q.info().await.unwrap().message_count, 1);

        let mut ack = first.create_acknowledge(None);
        ack.set_source("c1");
        q.ack(ack);

        let second = tokio::time::timeout(Duration::from_millis(300), rx.next())
            .await
            .expect("second delivery")
            .unwrap()
            .unwrap();
        assert_eq!(second.message_id, "m2");
    }

    #[tokio::test]
    async fn paused_queue_stores_without_dispatching() {
        let scx = scx().await;
        let opts = QueueOptions { status: QueueStatus::Paused, ..Default::default() };
        let q = scx.create_queue("held", opts).await.unwrap();

        let mut rx = q.subscribe(Id::from_client_id("c1")).await.unwrap();
        q.push(queue_message("m1", "held", "x"), Id::from_client_id("p")).unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(120), rx.next()).await.is_err());
        assert_eq!(q.info().await.unwrap().message_count, 1);

        // resuming drains the backlog
        q.set_status(QueueStatus::Push).unwrap();
        let got = tokio::time::timeout(Duration::from_millis(300), rx.next()).await.expect("delivery");
        assert_eq!(got.unwrap().unwrap().message_id, "m1");
    }

    #[tokio::test]
    async fn only_consume_denies_pushes() {
        let scx = scx().await;
        let opts = QueueOptions { status: QueueStatus::OnlyConsume, ..Default::default() };
        let q = scx.create_queue("drain", opts).await.unwrap();

        let outcome = q.push_await(queue_message("m1", "drain", "x"), Id::from_client_id("p")).await.unwrap();
        assert!(matches!(outcome, DeliverOutcome::Nacked(_)));
    }

    #[tokio::test]
    async fn ack_timeout_emits_negative_outcome() {
        let scx = scx().await;
        let opts = QueueOptions {
            status: QueueStatus::Push,
            acknowledge: AckPolicy::WaitForAcknowledge,
            ack_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let q = scx.create_queue("impatient", opts).await.unwrap();

        // consumer that never acks
        let rx = q.subscribe(Id::from_client_id("c1")).await.unwrap();
        let received = Arc::new(AtomicUsize::new(0));
        pump_counting(rx, received.clone());

        let mut frame = queue_message("m1", "impatient", "x");
        frame.flags |= FrameFlags::PENDING_ACKNOWLEDGE;
        let outcome = q.push_await(frame, Id::from_client_id("p")).await.unwrap();
        assert!(matches!(outcome, DeliverOutcome::Timeout), "outcome: {:?}", outcome);
        assert_eq!(q.stats().timed_out.count(), 1);
    }

    #[tokio::test]
    async fn duplicate_message_ids_are_rejected() {
        let scx = scx().await;
        let opts = QueueOptions { status: QueueStatus::Paused, ..Default::default() };
        let q = scx.create_queue("dedup", opts).await.unwrap();

        let outcome = q.push_await(queue_message("m1", "dedup", "x"), Id::from_client_id("p")).await.unwrap();
        assert!(matches!(outcome, DeliverOutcome::Acked));
        let outcome = q.push_await(queue_message("m1", "dedup", "x"), Id::from_client_id("p")).await.unwrap();
        match outcome {
            DeliverOutcome::Nacked(reason) => assert_eq!(reason, "Duplicate"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn durable_queue_replays_after_restart() {
        let dir =
            std::env::temp_dir().join(format!("hmq-replay-{}", Uuid::new_v4().as_simple()));
        let storage = Arc::new(crate::storage::FileStorage::new(&dir).unwrap());
        let opts = QueueOptions { status: QueueStatus::Paused, ..Default::default() };

        {
            let scx = ServerContext::new().storage(storage.clone()).build().await;
            let q = scx.create_queue("billing", opts.clone()).await.unwrap();
            for i in 0..3 {
                let outcome = q
                    .push_await(queue_message(&format!("m{i}"), "billing", "x"), Id::from_client_id("p"))
                    .await
                    .unwrap();
                assert!(matches!(outcome, DeliverOutcome::Acked));
            }
        }

        // a fresh context over the same directory sees the same ordered list
        let scx = ServerContext::new().storage(storage).build().await;
        let q = scx.create_queue("billing2", opts.clone()).await.unwrap();
        assert_eq!(q.info().await.unwrap().message_count, 0);

        let q = scx.create_queue("billing", opts).await.unwrap();
        let info = q.info().await.unwrap();
        assert_eq!(info.message_count, 3);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn consumer_drop_requeues_in_flight() {
        let scx = scx().await;
        let opts = QueueOptions {
            status: QueueStatus::Push,
            acknowledge: AckPolicy::WaitForAcknowledge,
            ..Default::default()
        };
        let q = scx.create_queue("resilient", opts).await.unwrap();

        let mut rx = q.subscribe(Id::from_client_id("c1")).await.unwrap();
        q.push(queue_message("m1", "resilient", "x"), Id::from_client_id("p")).unwrap();

        let got = tokio::time::timeout(Duration::from_millis(200), rx.next()).await.expect("delivery");
        assert_eq!(got.unwrap().unwrap().message_id, "m1");

        // consumer vanishes with the delivery unacknowledged
        let records = scx.tracker.cancel_by_consumer("c1");
        assert_eq!(records.len(), 1);
        q.consumer_gone(ClientId::from("c1"), records);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let info = q.info().await.unwrap();
        assert_eq!(info.message_count, 1);
        assert_eq!(info.subscriber_count, 0);
    }
}
