use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use anyhow::anyhow;
use config::{Config, File};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::types::QueueOptions;
use crate::Result;

use self::log::Log;

pub use self::listener::Listener;
pub use self::options::Options;

pub mod listener;
pub mod log;
pub mod options;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub log: Log,
    #[serde(rename = "listener")]
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub broker: Broker,
    #[serde(default)]
    pub queue: QueueOptions,
    #[serde(default, skip)]
    pub opts: Options,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    fn new(opts: Options) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/hmq/hmq").required(false))
            .add_source(File::with_name("hmq").required(false))
            .add_source(config::Environment::with_prefix("hmq").try_parsing(true));

        if let Some(cfg) = opts.cfg_name.as_ref() {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        let mut inner: Inner = builder.build()?.try_deserialize()?;

        if inner.listeners.is_empty() {
            inner.listeners.push(Listener::default());
        }

        //Command line configuration overriding file configuration
        if let Some(id) = opts.node_id {
            if id > 0 {
                inner.node.id = id;
            }
        }
        if let Some(dir) = opts.storage_dir.as_ref() {
            inner.broker.storage_dir = Some(dir.clone());
        }

        inner.opts = opts;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> Result<&'static Self> {
        SETTINGS.get().ok_or_else(|| anyhow!("Settings not initialized"))
    }

    #[inline]
    pub fn init(opts: Options) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(opts)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Settings(node: {}, listeners: {})", self.node.id, self.listeners.len())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Node {
    #[serde(default = "Node::id_default")]
    pub id: u64,
    #[serde(default = "Node::name_default")]
    pub name: String,
}

impl Default for Node {
    fn default() -> Self {
        Self { id: Self::id_default(), name: Self::name_default() }
    }
}

impl Node {
    fn id_default() -> u64 {
        1
    }
    fn name_default() -> String {
        "hmq".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Broker {
    #[serde(default = "Broker::auto_queue_creation_default")]
    pub auto_queue_creation: bool,
    #[serde(
        default = "Broker::default_ack_timeout_default",
        deserialize_with = "hmq_utils::deserialize_duration"
    )]
    pub default_ack_timeout: std::time::Duration,
    #[serde(
        default = "Broker::response_timeout_default",
        deserialize_with = "hmq_utils::deserialize_duration"
    )]
    pub response_timeout: std::time::Duration,
    /// Enables durable queues when set.
    #[serde(default)]
    pub storage_dir: Option<String>,
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            auto_queue_creation: Self::auto_queue_creation_default(),
            default_ack_timeout: Self::default_ack_timeout_default(),
            response_timeout: Self::response_timeout_default(),
            storage_dir: None,
        }
    }
}

impl Broker {
    fn auto_queue_creation_default() -> bool {
        true
    }
    fn default_ack_timeout_default() -> std::time::Duration {
        std::time::Duration::from_secs(30)
    }
    fn response_timeout_default() -> std::time::Duration {
        std::time::Duration::from_secs(30)
    }
}

/// A configuration value that stays adjustable at runtime, e.g. the log
/// level.
#[derive(Debug, Clone)]
pub struct ValueMut<T>(Arc<RwLock<T>>);

impl<T> ValueMut<T>
where
    T: Copy,
{
    #[inline]
    pub fn new(v: T) -> Self {
        Self(Arc::new(RwLock::new(v)))
    }

    #[inline]
    pub fn get(&self) -> T {
        *self.0.read()
    }

    #[inline]
    pub fn set(&self, v: T) {
        *self.0.write() = v;
    }
}

impl<'de, T: Deserialize<'de> + Copy> Deserialize<'de> for ValueMut<T> {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = T::deserialize(deserializer)?;
        Ok(ValueMut::new(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let broker = Broker::default();
        assert!(broker.auto_queue_creation);
        assert_eq!(broker.default_ack_timeout.as_secs(), 30);
        assert!(broker.storage_dir.is_none());

        let node = Node::default();
        assert_eq!(node.id, 1);
    }

    #[test]
    fn value_mut_updates() {
        let v = ValueMut::new(1u8);
        assert_eq!(v.get(), 1);
        v.set(7);
        assert_eq!(v.get(), 7);
    }
}
