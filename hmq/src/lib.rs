#![deny(unsafe_code)]
#![recursion_limit = "256"]

//! # Overall Example
//! ```rust,no_run
//! use hmq::context::ServerContext;
//! use hmq::net::{Builder, Result};
//! use hmq::server::HmqServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let scx = ServerContext::new().build().await;
//!
//!     HmqServer::new(scx)
//!         .listener(Builder::new().name("external/tcp").laddr(([0, 0, 0, 0], 2622).into()).bind()?.tcp()?)
//!         .build()
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod clients; // Connected-client registry
pub mod context; // Shared execution context
pub mod deliver; // Rate-limited consumer deliver queues
pub mod events; // Server-side event subscriptions
pub mod extend; // Extension points
pub mod handler; // Delivery-handler pipeline
pub mod logger; // slog-backed logging setup
pub mod node; // Broker instance identity
pub mod queue; // Queue engine
pub mod router; // Routers and bindings
pub mod server; // Listener lifecycle
pub mod session; // Per-connection sessions
pub mod settings; // Configuration
pub mod storage; // Queue persistence
pub mod store; // In-memory queue storage
pub mod tracker; // In-flight delivery tracking
pub mod types; // Common data types

/// External Crate Re-exports
pub use hmq_codec as codec; // HMQ frame codec
pub use hmq_net as net; // Network abstractions
pub use hmq_utils as utils; // Common utilities

pub use net::{Error, Result};
