use std::net::SocketAddr;
use std::time::Duration;

use bytestring::ByteString;
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};

use hmq_utils::timestamp_millis;

pub use hmq_utils::TimestampMillis;

pub type ClientId = ByteString;
pub type ClientName = ByteString;
pub type ClientType = ByteString;
pub type QueueName = ByteString;
pub type RouterName = ByteString;
pub type MessageId = ByteString;
pub type Reason = ByteString;

pub type Tx = mpsc::UnboundedSender<SessionCommand>;
pub type Rx = mpsc::UnboundedReceiver<SessionCommand>;

pub type DashSet<V> = dashmap::DashSet<V, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

/// Identity of a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Id {
    pub client_id: ClientId,
    pub client_name: ClientName,
    pub client_type: ClientType,
    pub remote_addr: Option<SocketAddr>,
    pub create_time: TimestampMillis,
}

impl Id {
    #[inline]
    pub fn new(
        client_id: ClientId,
        client_name: ClientName,
        client_type: ClientType,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self { client_id, client_name, client_type, remote_addr, create_time: timestamp_millis() }
    }

    #[inline]
    pub fn from_client_id<S: Into<ClientId>>(client_id: S) -> Self {
        let client_id = client_id.into();
        Self::new(client_id.clone(), client_id, ClientType::default(), None)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{:?}", self.client_id, self.remote_addr)
    }
}

/// Commands delivered to a session's writer task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Write a frame to the socket.
    Forward(hmq_codec::Frame),
    /// Close the connection.
    Close(Reason),
}

/// Queue state; a mix of lifecycle states and delivery disciplines, matching
/// the wire-visible status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    Running,
    Paused,
    OnlyConsume,
    OnlyPush,
    Stopped,
    Route,
    Pull,
    RoundRobin,
    Broadcast,
    Push,
}

impl QueueStatus {
    /// Whether pushes from producers are accepted in this state.
    #[inline]
    pub fn accepts_push(&self) -> bool {
        !matches!(self, QueueStatus::OnlyConsume | QueueStatus::Stopped)
    }

    /// Whether the queue dispatches spontaneously in this state.
    #[inline]
    pub fn dispatches(&self) -> bool {
        matches!(
            self,
            QueueStatus::Running
                | QueueStatus::OnlyConsume
                | QueueStatus::Push
                | QueueStatus::RoundRobin
                | QueueStatus::Broadcast
        )
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Running => "running",
            QueueStatus::Paused => "paused",
            QueueStatus::OnlyConsume => "only-consume",
            QueueStatus::OnlyPush => "only-push",
            QueueStatus::Stopped => "stopped",
            QueueStatus::Route => "route",
            QueueStatus::Pull => "pull",
            QueueStatus::RoundRobin => "round-robin",
            QueueStatus::Broadcast => "broadcast",
            QueueStatus::Push => "push",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(QueueStatus::Running),
            "paused" => Ok(QueueStatus::Paused),
            "only-consume" => Ok(QueueStatus::OnlyConsume),
            "only-push" => Ok(QueueStatus::OnlyPush),
            "stopped" => Ok(QueueStatus::Stopped),
            "route" => Ok(QueueStatus::Route),
            "pull" => Ok(QueueStatus::Pull),
            "round-robin" => Ok(QueueStatus::RoundRobin),
            "broadcast" => Ok(QueueStatus::Broadcast),
            "push" => Ok(QueueStatus::Push),
            _ => Err(anyhow::anyhow!("unknown queue status: {}", s)),
        }
    }
}

/// Producer acknowledgement discipline of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AckPolicy {
    /// No acks are produced or awaited.
    #[default]
    None,
    /// Ack the producer as soon as the message is accepted.
    JustRequest,
    /// Ack the producer after the consumer acknowledged; one in-flight
    /// delivery per consumer.
    WaitForAcknowledge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AutoDestroy {
    #[default]
    Disabled,
    NoMessagesAndConsumers,
    NoMessages,
    NoConsumers,
}

/// Per-queue behavior knobs. Durations of zero disable the corresponding
/// timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub acknowledge: AckPolicy,
    #[serde(
        deserialize_with = "hmq_utils::deserialize_duration",
        serialize_with = "hmq_utils::serialize_duration"
    )]
    pub send_timeout: Duration,
    #[serde(
        deserialize_with = "hmq_utils::deserialize_duration",
        serialize_with = "hmq_utils::serialize_duration"
    )]
    pub ack_timeout: Duration,
    /// Zero means unlimited.
    pub message_limit: usize,
    /// Zero means unlimited.
    pub message_size_limit: usize,
    #[serde(
        deserialize_with = "hmq_utils::deserialize_duration",
        serialize_with = "hmq_utils::serialize_duration"
    )]
    pub delay_between_messages: Duration,
    pub use_message_id: bool,
    pub wait_for_ack: bool,
    pub hide_client_names: bool,
    pub status: QueueStatus,
    pub auto_destroy: AutoDestroy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            acknowledge: AckPolicy::None,
            send_timeout: Duration::ZERO,
            ack_timeout: Duration::from_secs(30),
            message_limit: 0,
            message_size_limit: 0,
            delay_between_messages: Duration::ZERO,
            use_message_id: true,
            wait_for_ack: false,
            hide_client_names: false,
            status: QueueStatus::Running,
            auto_destroy: AutoDestroy::Disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_gates() {
        assert!(QueueStatus::Running.accepts_push());
        assert!(!QueueStatus::OnlyConsume.accepts_push());
        assert!(!QueueStatus::Stopped.accepts_push());
        assert!(QueueStatus::OnlyConsume.dispatches());
        assert!(!QueueStatus::Paused.dispatches());
        assert!(!QueueStatus::OnlyPush.dispatches());
        assert!(QueueStatus::Broadcast.dispatches());
    }

    #[test]
    fn status_parses_kebab_case() {
        assert_eq!("round-robin".parse::<QueueStatus>().unwrap(), QueueStatus::RoundRobin);
        assert_eq!("Push".parse::<QueueStatus>().unwrap(), QueueStatus::Push);
        assert!("bogus".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn queue_options_json_roundtrip() {
        let opts = QueueOptions {
            acknowledge: AckPolicy::WaitForAcknowledge,
            delay_between_messages: Duration::from_millis(100),
            message_limit: 2,
            ..Default::default()
        };
        let json = serde_json::to_string(&opts).unwrap();
        let back: QueueOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
    }
}
