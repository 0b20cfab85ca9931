//! Routers and bindings.
//!
//! A router owns an ordered list of bindings, lowest priority value first.
//! Routing walks the bindings in order: queue bindings push into their
//! resolved queue (cached for up to a minute, revalidated against the live
//! queue map so a deleted queue is a miss), client bindings forward to a
//! name/type set. A first-acquirer binding that succeeds ends the walk; a
//! failing binding never does.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, RwLock};

use hmq_codec::Frame;
use hmq_utils::{timestamp_millis, TimestampMillis};

use crate::context::ServerContext;
use crate::queue::Queue;
use crate::tracker::{DeliverOutcome, DeliveryRecord, FollowKind};
use crate::types::{
    ClientName, ClientType, Id, QueueName, Reason, RouterName, SessionCommand,
};

/// How long a binding may reuse a resolved queue handle.
const QUEUE_CACHE_TTL_MS: TimestampMillis = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindTarget {
    Queue(QueueName),
    ClientName(ClientName),
    ClientType(ClientType),
}

/// Whether the router awaits a reply for a binding before returning to the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Interaction {
    #[default]
    None,
    Response,
    Acknowledge,
}

pub struct Binding {
    pub name: RouterName,
    pub priority: u16,
    pub target: BindTarget,
    pub interaction: Interaction,
    /// Deliver to the first receiver only, and end the binding walk once
    /// this binding succeeded.
    pub only_first: bool,
    cache: Mutex<Option<(Queue, TimestampMillis)>>,
}

impl Binding {
    pub fn new(
        name: impl Into<RouterName>,
        priority: u16,
        target: BindTarget,
        interaction: Interaction,
        only_first: bool,
    ) -> Self {
        Self { name: name.into(), priority, target, interaction, only_first, cache: Mutex::new(None) }
    }
}

pub struct Router {
    pub name: RouterName,
    bindings: RwLock<Vec<Arc<Binding>>>,
}

impl Router {
    pub fn new(name: impl Into<RouterName>) -> Self {
        Self { name: name.into(), bindings: RwLock::new(Vec::new()) }
    }

    pub async fn add_binding(&self, binding: Binding) {
        let mut bindings = self.bindings.write().await;
        bindings.push(Arc::new(binding));
        bindings.sort_by_key(|b| b.priority);
    }

    pub async fn remove_binding(&self, name: &str) -> bool {
        let mut bindings = self.bindings.write().await;
        let before = bindings.len();
        bindings.retain(|b| b.name != name);
        bindings.len() != before
    }

    pub async fn bindings_len(&self) -> usize {
        self.bindings.read().await.len()
    }

    /// Directs a message through the bindings; the outcome reports whether
    /// at least one binding accepted it.
    pub async fn route(&self, scx: &ServerContext, mut frame: Frame, producer: Id) -> DeliverOutcome {
        if !frame.hop() {
            return DeliverOutcome::Nacked(Reason::from_static("ttl exceeded"));
        }

        let bindings = self.bindings.read().await.clone();
        if bindings.is_empty() {
            return DeliverOutcome::Nacked(Reason::from_static("NotFound"));
        }

        let mut delivered = 0usize;
        let mut last_response = None;
        for binding in bindings {
            let ok = self.apply(scx, &binding, &frame, &producer, &mut last_response).await;
            if ok {
                delivered += 1;
                if binding.only_first {
                    break;
                }
            }
        }

        if let Some(response) = last_response {
            DeliverOutcome::Response(response)
        } else if delivered > 0 {
            DeliverOutcome::Acked
        } else {
            DeliverOutcome::Nacked(Reason::from_static("NotFound"))
        }
    }

    async fn apply(
        &self,
        scx: &ServerContext,
        binding: &Binding,
        frame: &Frame,
        producer: &Id,
        last_response: &mut Option<Frame>,
    ) -> bool {
        match &binding.target {
            BindTarget::Queue(queue_name) => {
                let Some(queue) = self.resolve_queue(scx, binding, queue_name).await else {
                    return false;
                };
                let mut f = frame.clone();
                f.set_target(queue_name.clone());
                match binding.interaction {
                    Interaction::None => queue.push(f, producer.clone()).is_ok(),
                    Interaction::Acknowledge | Interaction::Response => {
                        let pushed = tokio::time::timeout(
                            scx.response_timeout,
                            queue.push_await(f, producer.clone()),
                        )
                        .await;
                        matches!(pushed, Ok(Ok(DeliverOutcome::Acked)))
                    }
                }
            }
            BindTarget::ClientName(name) => {
                self.forward_clients(scx, binding, frame, &scx.clients.find_by_name(name), last_response)
                    .await
            }
            BindTarget::ClientType(typ) => {
                self.forward_clients(scx, binding, frame, &scx.clients.find_by_type(typ), last_response)
                    .await
            }
        }
    }

    async fn forward_clients(
        &self,
        scx: &ServerContext,
        binding: &Binding,
        frame: &Frame,
        receivers: &[crate::clients::ClientEntry],
        last_response: &mut Option<Frame>,
    ) -> bool {
        if receivers.is_empty() {
            return false;
        }
        let receivers: Vec<_> =
            if binding.only_first || frame.first_acquirer_only() { receivers.iter().take(1).collect() } else { receivers.iter().collect() };

        let mut sent = 0usize;
        for entry in &receivers {
            let mut f = frame.clone();
            f.set_target(entry.info.client_id.clone());
            if entry.tx.unbounded_send(SessionCommand::Forward(f)).is_ok() {
                sent += 1;
            }
        }
        if sent == 0 {
            return false;
        }

        match binding.interaction {
            Interaction::None => true,
            Interaction::Acknowledge | Interaction::Response => {
                let kind = if binding.interaction == Interaction::Response {
                    FollowKind::Response
                } else {
                    FollowKind::Acknowledge
                };
                let (tx, rx) = oneshot::channel();
                let record = DeliveryRecord::new(
                    frame.message_id.clone(),
                    None,
                    receivers[0].info.client_id.clone(),
                    Some(Id::from_client_id(frame.source.clone())),
                    frame.clone(),
                    kind,
                )
                .with_reply(tx);
                scx.tracker.follow(record, scx.response_timeout);

                match rx.await {
                    Ok(DeliverOutcome::Response(response)) => {
                        *last_response = Some(response);
                        true
                    }
                    Ok(DeliverOutcome::Acked) => true,
                    Ok(_) | Err(_) => false,
                }
            }
        }
    }

    /// Cached queue resolution; a hit requires the cached handle to still be
    /// the live one, so delete-during-window reads as a miss.
    async fn resolve_queue(&self, scx: &ServerContext, binding: &Binding, name: &QueueName) -> Option<Queue> {
        {
            let cached = binding.cache.lock();
            if let Some((queue, at)) = cached.as_ref() {
                if timestamp_millis() - at < QUEUE_CACHE_TTL_MS {
                    if let Some(current) = scx.get_queue(name) {
                        if current.ptr_eq(queue) {
                            return Some(queue.clone());
                        }
                    }
                }
            }
        }

        let queue = match scx.get_queue(name) {
            Some(queue) => queue,
            None if scx.auto_queue_creation => {
                match scx.create_queue(name.clone(), scx.queue_defaults.clone()).await {
                    Ok(queue) => queue,
                    Err(e) => {
                        log::warn!("router {:?} auto-create of {:?} failed, {:?}", self.name, name, e);
                        return None;
                    }
                }
            }
            None => return None,
        };
        *binding.cache.lock() = Some((queue.clone(), timestamp_millis()));
        Some(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AckPolicy, QueueOptions, QueueStatus};
    use hmq_codec::MessageType;
    use std::time::Duration;

    fn router_message(id: &str) -> Frame {
        let mut f = Frame::new(MessageType::Router);
        f.set_message_id(id).set_source("p").set_target("r1");
        f.set_content_string("payload");
        f
    }

    fn paused() -> QueueOptions {
        QueueOptions { status: QueueStatus::Paused, acknowledge: AckPolicy::None, ..Default::default() }
    }

    #[tokio::test]
    async fn fan_out_reaches_all_queue_bindings() {
        let scx = ServerContext::new().build().await;
        let q1 = scx.create_queue("q1", paused()).await.unwrap();
        let q2 = scx.create_queue("q2", paused()).await.unwrap();

        let router = Router::new("r1");
        router.add_binding(Binding::new("b1", 1, BindTarget::Queue("q1".into()), Interaction::None, false)).await;
        router.add_binding(Binding::new("b2", 2, BindTarget::Queue("q2".into()), Interaction::None, false)).await;

        let outcome = router.route(&scx, router_message("m1"), Id::from_client_id("p")).await;
        assert!(matches!(outcome, DeliverOutcome::Acked));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q1.info().await.unwrap().message_count, 1);
        assert_eq!(q2.info().await.unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn only_first_stops_after_a_success() {
        let scx = ServerContext::new().build().await;
        let q1 = scx.create_queue("q1", paused()).await.unwrap();
        let q2 = scx.create_queue("q2", paused()).await.unwrap();

        let router = Router::new("r1");
        router.add_binding(Binding::new("b1", 1, BindTarget::Queue("q1".into()), Interaction::None, true)).await;
        router.add_binding(Binding::new("b2", 2, BindTarget::Queue("q2".into()), Interaction::None, true)).await;

        let outcome = router.route(&scx, router_message("m1"), Id::from_client_id("p")).await;
        assert!(matches!(outcome, DeliverOutcome::Acked));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q1.info().await.unwrap().message_count, 1);
        assert_eq!(q2.info().await.unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn first_acquirer_falls_through_a_failing_binding() {
        let scx = ServerContext::new().auto_queue_creation(false).build().await;
        let q2 = scx.create_queue("q2", paused()).await.unwrap();

        let router = Router::new("r1");
        // q-missing does not exist and cannot be auto-created
        router
            .add_binding(Binding::new("b1", 1, BindTarget::Queue("q-missing".into()), Interaction::None, true))
            .await;
        router.add_binding(Binding::new("b2", 2, BindTarget::Queue("q2".into()), Interaction::None, true)).await;

        let outcome = router.route(&scx, router_message("m1"), Id::from_client_id("p")).await;
        assert!(matches!(outcome, DeliverOutcome::Acked));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(q2.info().await.unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn cached_queue_delete_is_a_miss() {
        let scx = ServerContext::new().build().await;
        let old = scx.create_queue("q1", paused()).await.unwrap();

        let router = Router::new("r1");
        router.add_binding(Binding::new("b1", 1, BindTarget::Queue("q1".into()), Interaction::None, false)).await;

        router.route(&scx, router_message("m1"), Id::from_client_id("p")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(old.info().await.unwrap().message_count, 1);

        // delete within the cache window, then recreate
        old.delete().await.unwrap();
        let fresh = scx.create_queue("q1", paused()).await.unwrap();

        let outcome = router.route(&scx, router_message("m2"), Id::from_client_id("p")).await;
        assert!(matches!(outcome, DeliverOutcome::Acked));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fresh.info().await.unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn ttl_exhaustion_drops_the_message() {
        let scx = ServerContext::new().build().await;
        let router = Router::new("r1");
        router.add_binding(Binding::new("b1", 1, BindTarget::Queue("q1".into()), Interaction::None, false)).await;

        let mut frame = router_message("m1");
        frame.ttl = -1;
        let outcome = router.route(&scx, frame, Id::from_client_id("p")).await;
        assert!(matches!(outcome, DeliverOutcome::Nacked(_)));
    }
}
