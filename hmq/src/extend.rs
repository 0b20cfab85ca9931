use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::handler::{DefaultHandlerFactory, HandlerFactory};
use crate::storage::{NullStorage, QueueStorage};

/// Pluggable seams of the broker: the delivery-handler composition applied
/// to new queues and the persistence adapter behind durable handlers.
pub struct Manager {
    handler_factory: RwLock<Box<dyn HandlerFactory>>,
    storage: RwLock<Arc<dyn QueueStorage>>,
}

impl Manager {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            handler_factory: RwLock::new(Box::new(DefaultHandlerFactory)),
            storage: RwLock::new(Arc::new(NullStorage)),
        }
    }

    #[inline]
    pub async fn handler_factory(&self) -> RwLockReadGuard<'_, Box<dyn HandlerFactory>> {
        self.handler_factory.read().await
    }

    #[inline]
    pub async fn handler_factory_mut(&self) -> RwLockWriteGuard<'_, Box<dyn HandlerFactory>> {
        self.handler_factory.write().await
    }

    #[inline]
    pub async fn storage(&self) -> Arc<dyn QueueStorage> {
        self.storage.read().await.clone()
    }

    #[inline]
    pub async fn set_storage(&self, storage: Arc<dyn QueueStorage>) {
        *self.storage.write().await = storage;
    }
}
