#![deny(unsafe_code)]

mod builder;
mod error;
mod stream;

pub use builder::{Acceptor, Builder, Listener, ListenerType};
pub use error::HmqError;
#[cfg(feature = "tls")]
pub use rustls;
#[cfg(not(target_os = "windows"))]
#[cfg(feature = "tls")]
pub use rustls::crypto::aws_lc_rs as tls_provider;
#[cfg(target_os = "windows")]
#[cfg(feature = "tls")]
pub use rustls::crypto::ring as tls_provider;

pub use stream::{Dispatcher, HmqStream};

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
