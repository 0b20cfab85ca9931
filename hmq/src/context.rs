use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rust_box::task_exec_queue::{Builder, TaskExecQueue};
use serde_json::json;
use tokio::sync::Mutex;

use hmq_utils::Counter;

use crate::clients::ClientRegistry;
use crate::events::{event_names, EventRegistry};
use crate::extend;
use crate::node::Node;
use crate::queue::Queue;
use crate::router::Router;
use crate::storage::QueueStorage;
use crate::tracker::{DeliverOutcome, DeliveryRecord, DeliveryTracker, ExpiryNotify};
use crate::types::{DashMap, QueueName, QueueOptions, Reason, RouterName};

pub struct ServerContextBuilder {
    node: Node,

    task_exec_workers: usize,
    task_exec_queue_max: usize,

    auto_queue_creation: bool,
    default_ack_timeout: Duration,
    response_timeout: Duration,
    queue_defaults: QueueOptions,
    storage: Option<Arc<dyn QueueStorage>>,
}

impl Default for ServerContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerContextBuilder {
    pub fn new() -> ServerContextBuilder {
        Self {
            node: Node::default(),
            task_exec_workers: 1000,
            task_exec_queue_max: 100_000,
            auto_queue_creation: true,
            default_ack_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(30),
            queue_defaults: QueueOptions::default(),
            storage: None,
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.node = node;
        self
    }

    pub fn task_exec_workers(mut self, task_exec_workers: usize) -> Self {
        self.task_exec_workers = task_exec_workers;
        self
    }

    pub fn task_exec_queue_max(mut self, task_exec_queue_max: usize) -> Self {
        self.task_exec_queue_max = task_exec_queue_max;
        self
    }

    pub fn auto_queue_creation(mut self, auto_queue_creation: bool) -> Self {
        self.auto_queue_creation = auto_queue_creation;
        self
    }

    pub fn default_ack_timeout(mut self, default_ack_timeout: Duration) -> Self {
        self.default_ack_timeout = default_ack_timeout;
        self
    }

    pub fn response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    pub fn queue_defaults(mut self, queue_defaults: QueueOptions) -> Self {
        self.queue_defaults = queue_defaults;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn QueueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub async fn build(self) -> ServerContext {
        let (global_exec, task_runner) =
            Builder::default().workers(self.task_exec_workers).queue_max(self.task_exec_queue_max).build();

        tokio::spawn(async move {
            task_runner.await;
        });

        let scx = ServerContext {
            inner: Arc::new(ServerContextInner {
                node: self.node,
                clients: ClientRegistry::new(),
                queues: DashMap::default(),
                queue_lockers: DashMap::default(),
                routers: DashMap::default(),
                extends: extend::Manager::new(),
                tracker: DeliveryTracker::new(),
                events: EventRegistry::new(),
                global_exec,

                auto_queue_creation: self.auto_queue_creation,
                default_ack_timeout: self.default_ack_timeout,
                response_timeout: self.response_timeout,
                queue_defaults: self.queue_defaults,

                handshakings: Counter::new(),
                connections: Counter::new(),
                sessions: Counter::new(),
            }),
        };

        if let Some(storage) = self.storage {
            scx.extends.set_storage(storage.clone()).await;
            *scx.extends.handler_factory_mut().await =
                Box::new(crate::handler::DurableHandlerFactory::new(storage));
        }

        scx.tracker.start(Arc::new(TrackerBridge { scx: scx.clone() }));
        scx
    }
}

#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub node: Node,
    pub clients: ClientRegistry,
    pub(crate) queues: DashMap<QueueName, Queue>,
    queue_lockers: DashMap<QueueName, Arc<Mutex<()>>>,
    pub routers: DashMap<RouterName, Arc<Router>>,
    pub extends: extend::Manager,
    pub tracker: DeliveryTracker,
    pub events: EventRegistry,
    pub global_exec: TaskExecQueue,

    pub auto_queue_creation: bool,
    pub default_ack_timeout: Duration,
    pub response_timeout: Duration,
    pub queue_defaults: QueueOptions,

    pub handshakings: Counter,
    pub connections: Counter,
    pub sessions: Counter,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

/// Queue names are case-insensitive.
#[inline]
pub fn queue_key(name: &str) -> QueueName {
    QueueName::from(name.to_ascii_lowercase())
}

impl ServerContext {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> ServerContextBuilder {
        ServerContextBuilder::new()
    }

    #[inline]
    pub fn get_queue(&self, name: &str) -> Option<Queue> {
        self.queues.get(&queue_key(name)).map(|q| q.clone())
    }

    /// Creates the queue, or returns the live handle when it already exists.
    pub async fn create_queue<N: Into<QueueName>>(&self, name: N, opts: QueueOptions) -> Result<Queue> {
        let name = name.into();
        let key = queue_key(&name);
        if let Some(q) = self.queues.get(&key) {
            return Ok(q.clone());
        }

        let locker = self.queue_lockers.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        let _guard = locker.lock().await;
        if let Some(q) = self.queues.get(&key) {
            return Ok(q.clone());
        }

        let queue = Queue::create(self.clone(), name, opts).await?;
        self.queues.insert(key, queue.clone());
        self.events.fire(&self.clients, event_names::QUEUE_CREATED, queue.name(), json!({}));
        log::info!("queue {:?} created", queue.name());
        Ok(queue)
    }

    /// Queue for an inbound push: resolves, auto-creating with the broker's
    /// defaults when allowed.
    pub async fn resolve_queue(&self, name: &str) -> Result<Option<Queue>> {
        if let Some(q) = self.get_queue(name) {
            return Ok(Some(q));
        }
        if !self.auto_queue_creation {
            return Ok(None);
        }
        Ok(Some(self.create_queue(QueueName::from(name), self.queue_defaults.clone()).await?))
    }

    /// Deletes a queue; outstanding deliveries are negative-acked.
    pub async fn remove_queue(&self, name: &str) -> Result<bool> {
        match self.get_queue(name) {
            Some(queue) => {
                queue.delete().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Called by the queue actor once it stopped.
    pub(crate) fn drop_queue_handle(&self, name: &str) {
        let key = queue_key(name);
        self.queues.remove(&key);
        self.queue_lockers.remove(&key);
    }

    pub fn queue_names(&self) -> Vec<QueueName> {
        self.queues.iter().map(|e| e.value().name().clone()).collect()
    }

    pub fn get_or_create_router(&self, name: &str) -> Arc<Router> {
        self.routers
            .entry(RouterName::from(name))
            .or_insert_with(|| Arc::new(Router::new(RouterName::from(name))))
            .clone()
    }

    /// Connection teardown: cancels the client's in-flight deliveries and
    /// hands them back to their queues; response waiters resolve negatively.
    pub async fn client_disconnected(&self, client_id: &str) {
        let records = self.tracker.cancel_by_consumer(client_id);
        let mut by_queue: crate::types::HashMap<QueueName, Vec<DeliveryRecord>> = Default::default();
        for mut record in records {
            match record.queue.clone() {
                Some(queue) => by_queue.entry(queue).or_default().push(record),
                None => record.complete(DeliverOutcome::Nacked(Reason::from_static("receiver disconnected"))),
            }
        }
        for (queue_name, records) in by_queue {
            if let Some(queue) = self.get_queue(&queue_name) {
                queue.consumer_gone(crate::types::ClientId::from(client_id), records);
            }
        }
        self.events.remove_client(&crate::types::ClientId::from(client_id));
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ServerContext node: {:?}, queues: {}, clients: {}, in_flights: {}",
            self.node.id,
            self.queues.len(),
            self.clients.len(),
            self.tracker.len(),
        )?;
        Ok(())
    }
}

/// Routes tracker expirations back into the owning queue's event stream;
/// correlation records without a queue resolve as timeouts right here.
struct TrackerBridge {
    scx: ServerContext,
}

#[async_trait]
impl ExpiryNotify for TrackerBridge {
    async fn expired(&self, mut record: DeliveryRecord) {
        match record.queue.clone() {
            Some(queue_name) => match self.scx.get_queue(&queue_name) {
                Some(queue) => queue.expired(record),
                None => record.complete(DeliverOutcome::Timeout),
            },
            None => record.complete(DeliverOutcome::Timeout),
        }
    }
}
