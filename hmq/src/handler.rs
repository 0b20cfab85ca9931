//! Delivery-handler pipeline.
//!
//! Every queue event runs through an ordered set of handlers; each hook
//! returns a [`Decision`] and the final outcome is the monotone fold over
//! the registration order: `allow` must be granted by all, `save` by any,
//! and the strongest `ack`/`keep` vote wins. Behavior variance between
//! brokers (non-durable, just-allow, persistent, ...) is expressed by
//! picking a handler composition, not by changing the engine.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use hmq_codec::Frame;

use crate::storage::QueueStorage;
use crate::types::{AckPolicy, Id, QueueName, QueueOptions};

pub type HandlerId = String;

/// Producer-acknowledgement vote; a later variant overrides an earlier one
/// in the fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AckVote {
    /// Nothing to acknowledge at this point.
    Skip,
    /// Ack once the message was saved successfully.
    IfSaved,
    /// Ack unconditionally.
    Always,
    /// Negative-ack the producer.
    Negative,
}

/// What to do with the message itself; a later variant overrides an earlier
/// one in the fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeepVote {
    /// Finalize and drop the message.
    Remove,
    /// Leave it where it is (in flight or queue resident).
    Keep,
    /// Put it back at the head of its priority class.
    RequeueHead,
}

#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allow: bool,
    pub save: bool,
    pub ack: AckVote,
    pub keep: KeepVote,
}

impl Default for Decision {
    #[inline]
    fn default() -> Self {
        Self::allow()
    }
}

impl Decision {
    #[inline]
    pub fn allow() -> Self {
        Self { allow: true, save: false, ack: AckVote::Skip, keep: KeepVote::Remove }
    }

    #[inline]
    pub fn deny() -> Self {
        Self { allow: false, save: false, ack: AckVote::Skip, keep: KeepVote::Remove }
    }

    #[inline]
    pub fn keep(mut self, keep: KeepVote) -> Self {
        self.keep = keep;
        self
    }

    #[inline]
    pub fn ack(mut self, ack: AckVote) -> Self {
        self.ack = ack;
        self
    }

    #[inline]
    pub fn save(mut self) -> Self {
        self.save = true;
        self
    }

    /// Monotone fold step.
    #[inline]
    pub fn merge(self, other: Decision) -> Decision {
        Decision {
            allow: self.allow && other.allow,
            save: self.save || other.save,
            ack: self.ack.max(other.ack),
            keep: self.keep.max(other.keep),
        }
    }
}

/// Hook identifiers, carried by failure reports such as
/// [`DeliveryHandler::exception_thrown`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Type {
    ReceivedFromProducer,
    BeginSend,
    CanConsumerReceive,
    ConsumerReceived,
    ConsumerReceiveFailed,
    EndSend,
    AcknowledgeReceived,
    MessageTimedOut,
    AcknowledgeTimedOut,
    MessageDequeued,
    ExceptionThrown,
    SaveMessage,
}

/// Snapshot of the queue a hook runs against; handlers receive their context
/// as a parameter and never hold a queue reference.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub queue: QueueName,
    pub opts: QueueOptions,
}

/// One decision hook set. All hooks have no-op defaults so a handler only
/// implements what it cares about.
#[async_trait]
pub trait DeliveryHandler: Sync + Send {
    ///Before accepting a message into the queue
    async fn received_from_producer(&self, _ctx: &HookContext, _frame: &Frame, _producer: &Id) -> Decision {
        Decision::allow()
    }

    ///About to hand a message to consumers
    async fn begin_send(&self, _ctx: &HookContext, _frame: &Frame) -> Decision {
        Decision::allow()
    }

    ///Per-consumer gate
    async fn can_consumer_receive(&self, _ctx: &HookContext, _frame: &Frame, _consumer: &Id) -> Decision {
        Decision::allow()
    }

    ///Message was written to a consumer
    async fn consumer_received(&self, _ctx: &HookContext, _frame: &Frame, _consumer: &Id) -> Decision {
        Decision::allow()
    }

    ///Write to a consumer failed
    async fn consumer_receive_failed(&self, _ctx: &HookContext, _frame: &Frame, _consumer: &Id) -> Decision {
        Decision::allow().keep(KeepVote::RequeueHead)
    }

    ///All candidate consumers processed
    async fn end_send(&self, _ctx: &HookContext, _frame: &Frame, _receiver_count: usize) -> Decision {
        Decision::allow()
    }

    ///Positive or negative acknowledge arrived
    async fn acknowledge_received(
        &self,
        _ctx: &HookContext,
        _ack: &Frame,
        _frame: &Frame,
        _success: bool,
    ) -> Decision {
        Decision::allow()
    }

    ///Message exceeded the queue's send timeout
    async fn message_timed_out(&self, _ctx: &HookContext, _frame: &Frame) -> Decision {
        Decision::allow()
    }

    ///No acknowledge within the ack timeout
    async fn acknowledge_timed_out(&self, _ctx: &HookContext, _frame: &Frame) -> Decision {
        Decision::allow()
    }

    ///After final removal, side effects only
    async fn message_dequeued(&self, _ctx: &HookContext, _frame: &Frame) {}

    ///A hook or I/O operation failed
    async fn exception_thrown(&self, ctx: &HookContext, typ: Type, error: &anyhow::Error) {
        log::warn!("queue {:?}, hook {:?} error: {:?}", ctx.queue, typ, error);
    }

    ///Persistence write-through; returns success
    async fn save_message(&self, _ctx: &HookContext, _frame: &Frame) -> bool {
        true
    }
}

/// Handlers in registration order plus the fold.
pub struct HandlerPipeline {
    handlers: Vec<(HandlerId, Arc<dyn DeliveryHandler>)>,
}

impl Default for HandlerPipeline {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! fold_hook {
    ($self:ident, $hook:ident ( $($arg:expr),* )) => {{
        let mut acc = Decision::allow();
        for (_, h) in $self.handlers.iter() {
            acc = acc.merge(h.$hook($($arg),*).await);
        }
        acc
    }};
}

impl HandlerPipeline {
    #[inline]
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    #[inline]
    pub fn add(&mut self, handler: Arc<dyn DeliveryHandler>) -> HandlerId {
        let id = Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_string();
        self.handlers.push((id.clone(), handler));
        id
    }

    #[inline]
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(hid, _)| hid != id);
        self.handlers.len() != before
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn received_from_producer(&self, ctx: &HookContext, frame: &Frame, producer: &Id) -> Decision {
        fold_hook!(self, received_from_producer(ctx, frame, producer))
    }

    pub async fn begin_send(&self, ctx: &HookContext, frame: &Frame) -> Decision {
        fold_hook!(self, begin_send(ctx, frame))
    }

    pub async fn can_consumer_receive(&self, ctx: &HookContext, frame: &Frame, consumer: &Id) -> Decision {
        fold_hook!(self, can_consumer_receive(ctx, frame, consumer))
    }

    pub async fn consumer_received(&self, ctx: &HookContext, frame: &Frame, consumer: &Id) -> Decision {
        fold_hook!(self, consumer_received(ctx, frame, consumer))
    }

    pub async fn consumer_receive_failed(&self, ctx: &HookContext, frame: &Frame, consumer: &Id) -> Decision {
        fold_hook!(self, consumer_receive_failed(ctx, frame, consumer))
    }

    pub async fn end_send(&self, ctx: &HookContext, frame: &Frame, receiver_count: usize) -> Decision {
        fold_hook!(self, end_send(ctx, frame, receiver_count))
    }

    pub async fn acknowledge_received(
        &self,
        ctx: &HookContext,
        ack: &Frame,
        frame: &Frame,
        success: bool,
    ) -> Decision {
        fold_hook!(self, acknowledge_received(ctx, ack, frame, success))
    }

    pub async fn message_timed_out(&self, ctx: &HookContext, frame: &Frame) -> Decision {
        fold_hook!(self, message_timed_out(ctx, frame))
    }

    pub async fn acknowledge_timed_out(&self, ctx: &HookContext, frame: &Frame) -> Decision {
        fold_hook!(self, acknowledge_timed_out(ctx, frame))
    }

    pub async fn message_dequeued(&self, ctx: &HookContext, frame: &Frame) {
        for (_, h) in self.handlers.iter() {
            h.message_dequeued(ctx, frame).await;
        }
    }

    pub async fn exception_thrown(&self, ctx: &HookContext, typ: Type, error: &anyhow::Error) {
        for (_, h) in self.handlers.iter() {
            h.exception_thrown(ctx, typ, error).await;
        }
    }

    /// True only if every handler's write-through succeeded.
    pub async fn save_message(&self, ctx: &HookContext, frame: &Frame) -> bool {
        let mut ok = true;
        for (_, h) in self.handlers.iter() {
            ok &= h.save_message(ctx, frame).await;
        }
        ok
    }
}

/// Picks the handler composition for a new queue.
#[async_trait]
pub trait HandlerFactory: Sync + Send {
    async fn create(&self, queue: &QueueName, opts: &QueueOptions) -> HandlerPipeline;
}

/// Composition used when nothing else is configured: acknowledgement
/// forwarding only, no persistence.
pub struct DefaultHandlerFactory;

#[async_trait]
impl HandlerFactory for DefaultHandlerFactory {
    async fn create(&self, _queue: &QueueName, _opts: &QueueOptions) -> HandlerPipeline {
        let mut pipeline = HandlerPipeline::new();
        pipeline.add(Arc::new(AckForwardHandler));
        pipeline
    }
}

/// Composition for durable brokers: ack forwarding plus write-behind
/// persistence.
pub struct DurableHandlerFactory {
    storage: Arc<dyn QueueStorage>,
}

impl DurableHandlerFactory {
    pub fn new(storage: Arc<dyn QueueStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl HandlerFactory for DurableHandlerFactory {
    async fn create(&self, _queue: &QueueName, _opts: &QueueOptions) -> HandlerPipeline {
        let mut pipeline = HandlerPipeline::new();
        pipeline.add(Arc::new(AckForwardHandler));
        pipeline.add(Arc::new(PersistentHandler::new(self.storage.clone())));
        pipeline
    }
}

/// Allows everything and never keeps or saves anything.
pub struct JustAllowHandler;

#[async_trait]
impl DeliveryHandler for JustAllowHandler {}

/// Implements the queue's acknowledgement discipline: acks the producer per
/// `AckPolicy`, keeps in-flight messages of wait-for-ack queues until their
/// acknowledge resolves, and requeues on negative ack or delivery failure.
pub struct AckForwardHandler;

#[async_trait]
impl DeliveryHandler for AckForwardHandler {
    async fn received_from_producer(&self, ctx: &HookContext, frame: &Frame, _producer: &Id) -> Decision {
        let ack = if frame.pending_acknowledge() {
            match ctx.opts.acknowledge {
                AckPolicy::JustRequest => AckVote::Always,
                // deferred until the consumer resolves the delivery
                AckPolicy::WaitForAcknowledge | AckPolicy::None => AckVote::Skip,
            }
        } else {
            AckVote::Skip
        };
        Decision::allow().ack(ack)
    }

    async fn consumer_received(&self, ctx: &HookContext, _frame: &Frame, _consumer: &Id) -> Decision {
        let keep = match ctx.opts.acknowledge {
            AckPolicy::WaitForAcknowledge => KeepVote::Keep,
            AckPolicy::None | AckPolicy::JustRequest => KeepVote::Remove,
        };
        Decision::allow().keep(keep)
    }

    async fn acknowledge_received(
        &self,
        _ctx: &HookContext,
        _ack: &Frame,
        _frame: &Frame,
        success: bool,
    ) -> Decision {
        if success {
            Decision::allow().ack(AckVote::Always).keep(KeepVote::Remove)
        } else {
            Decision::allow().ack(AckVote::Negative).keep(KeepVote::RequeueHead)
        }
    }

    async fn acknowledge_timed_out(&self, _ctx: &HookContext, _frame: &Frame) -> Decision {
        Decision::allow().ack(AckVote::Negative).keep(KeepVote::Remove)
    }

    async fn message_timed_out(&self, _ctx: &HookContext, _frame: &Frame) -> Decision {
        Decision::allow().keep(KeepVote::Remove)
    }
}

/// Write-behind persistence via the queue storage adapter.
pub struct PersistentHandler {
    storage: Arc<dyn QueueStorage>,
}

impl PersistentHandler {
    pub fn new(storage: Arc<dyn QueueStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DeliveryHandler for PersistentHandler {
    async fn received_from_producer(&self, _ctx: &HookContext, _frame: &Frame, _producer: &Id) -> Decision {
        Decision::allow().save()
    }

    async fn save_message(&self, ctx: &HookContext, frame: &Frame) -> bool {
        match self.storage.save(&ctx.queue, frame).await {
            Ok(saved) => saved,
            Err(e) => {
                self.exception_thrown(ctx, Type::SaveMessage, &e).await;
                false
            }
        }
    }

    async fn message_dequeued(&self, ctx: &HookContext, frame: &Frame) {
        if let Err(e) = self.storage.remove(&ctx.queue, &frame.message_id).await {
            self.exception_thrown(ctx, Type::MessageDequeued, &e).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmq_codec::MessageType;
    use std::sync::Mutex;

    fn ctx(ack: AckPolicy) -> HookContext {
        HookContext {
            queue: "q1".into(),
            opts: QueueOptions { acknowledge: ack, ..Default::default() },
        }
    }

    fn frame() -> Frame {
        let mut f = Frame::new(MessageType::QueueMessage);
        f.set_message_id("m1").set_source("p").set_target("q1");
        f
    }

    #[test]
    fn merge_is_monotone() {
        let allow = Decision::allow();
        let deny = Decision::deny();
        assert!(!allow.merge(deny).allow);
        assert!(!deny.merge(allow).allow);

        let saved = allow.merge(Decision::allow().save());
        assert!(saved.save);

        let kept = Decision::allow().keep(KeepVote::Keep).merge(Decision::allow().keep(KeepVote::RequeueHead));
        assert_eq!(kept.keep, KeepVote::RequeueHead);

        let ack = Decision::allow().ack(AckVote::Always).merge(Decision::allow().ack(AckVote::IfSaved));
        assert_eq!(ack.ack, AckVote::Always);
    }

    struct Recording {
        tag: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
        decision: Decision,
    }

    #[async_trait]
    impl DeliveryHandler for Recording {
        async fn begin_send(&self, _ctx: &HookContext, _frame: &Frame) -> Decision {
            self.order.lock().unwrap().push(self.tag);
            self.decision
        }
    }

    #[tokio::test]
    async fn pipeline_runs_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = HandlerPipeline::new();
        pipeline.add(Arc::new(Recording { tag: "first", order: order.clone(), decision: Decision::allow() }));
        pipeline.add(Arc::new(Recording { tag: "second", order: order.clone(), decision: Decision::deny() }));

        let d = pipeline.begin_send(&ctx(AckPolicy::None), &frame()).await;
        assert!(!d.allow);
        assert_eq!(*order.lock().unwrap(), ["first", "second"]);
    }

    #[tokio::test]
    async fn empty_pipeline_allows() {
        let pipeline = HandlerPipeline::new();
        let d = pipeline.received_from_producer(&ctx(AckPolicy::None), &frame(), &Id::from_client_id("p")).await;
        assert!(d.allow);
        assert!(!d.save);
    }

    #[tokio::test]
    async fn ack_forward_votes() {
        let h = AckForwardHandler;

        let wait = ctx(AckPolicy::WaitForAcknowledge);
        let d = h.consumer_received(&wait, &frame(), &Id::from_client_id("c")).await;
        assert_eq!(d.keep, KeepVote::Keep);

        let none = ctx(AckPolicy::None);
        let d = h.consumer_received(&none, &frame(), &Id::from_client_id("c")).await;
        assert_eq!(d.keep, KeepVote::Remove);

        let d = h.acknowledge_received(&wait, &frame(), &frame(), false).await;
        assert_eq!(d.keep, KeepVote::RequeueHead);
        assert_eq!(d.ack, AckVote::Negative);
    }
}
