use std::net::{SocketAddr, ToSocketAddrs};

use serde::de::{self, Deserializer};
use serde::Deserialize;

use hmq_utils::deserialize_duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Listener {
    #[serde(default = "Listener::name_default")]
    pub name: String,
    #[serde(default = "Listener::addr_default", deserialize_with = "deserialize_addr")]
    pub addr: SocketAddr,
    #[serde(default = "Listener::max_connections_default")]
    pub max_connections: usize,
    #[serde(default = "Listener::max_frame_size_default")]
    pub max_frame_size: u32,
    #[serde(default = "Listener::backlog_default")]
    pub backlog: i32,
    #[serde(default)]
    pub nodelay: bool,
    #[serde(
        default = "Listener::handshake_timeout_default",
        deserialize_with = "deserialize_duration"
    )]
    pub handshake_timeout: std::time::Duration,
    #[serde(default = "Listener::send_timeout_default", deserialize_with = "deserialize_duration")]
    pub send_timeout: std::time::Duration,
    #[serde(default = "Listener::idle_timeout_default", deserialize_with = "deserialize_duration")]
    pub idle_timeout: std::time::Duration,

    #[serde(default)]
    pub cross_certificate: bool,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            name: Self::name_default(),
            addr: Self::addr_default(),
            max_connections: Self::max_connections_default(),
            max_frame_size: Self::max_frame_size_default(),
            backlog: Self::backlog_default(),
            nodelay: false,
            handshake_timeout: Self::handshake_timeout_default(),
            send_timeout: Self::send_timeout_default(),
            idle_timeout: Self::idle_timeout_default(),
            cross_certificate: false,
            cert: None,
            key: None,
        }
    }
}

impl Listener {
    fn name_default() -> String {
        "external/tcp".into()
    }
    fn addr_default() -> SocketAddr {
        ([0, 0, 0, 0], 2622).into()
    }
    fn max_connections_default() -> usize {
        1_000_000
    }
    fn max_frame_size_default() -> u32 {
        1024 * 1024
    }
    fn backlog_default() -> i32 {
        512
    }
    fn handshake_timeout_default() -> std::time::Duration {
        std::time::Duration::from_secs(30)
    }
    fn send_timeout_default() -> std::time::Duration {
        std::time::Duration::from_secs(10)
    }
    fn idle_timeout_default() -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }

    /// TLS listeners are the ones configured with a certificate.
    #[inline]
    pub fn is_tls(&self) -> bool {
        self.cert.is_some()
    }
}

fn deserialize_addr<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
where
    D: Deserializer<'de>,
{
    let addr = String::deserialize(deserializer)?;
    addr.to_socket_addrs()
        .map_err(de::Error::custom)?
        .next()
        .ok_or_else(|| de::Error::custom(format!("cannot resolve listener addr: {addr}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listener_is_plain_tcp() {
        let l = Listener::default();
        assert!(!l.is_tls());
        assert_eq!(l.addr.port(), 2622);
    }
}
