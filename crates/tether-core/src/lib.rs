//! Tether Core - bidirectional call/reply correlation over a duplex channel.
//!
//! This crate lets either side of an already-open message channel (an
//! embedding host and a guest script context, two processes, two tasks) issue
//! named calls and receive replies asynchronously, and register handlers that
//! answer the peer's calls.
//!
//! The channel itself is abstracted by [`Transport`]: a `send` of one text
//! message and a single inbound `listen` callback. [`MemoryTransport`]
//! provides an in-process pair for tests and demos.
//!
//! # Example
//!
//! ```rust,ignore
//! use serde_json::json;
//! use std::time::Duration;
//! use tether_core::{Engine, MemoryTransport};
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let (host_side, guest_side) = MemoryTransport::pair();
//!
//!     let guest = Engine::new()?;
//!     guest.register_method("add", |args| {
//!         Ok(json!(args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0)))
//!     });
//!     guest.start(guest_side);
//!
//!     let host = Engine::new()?;
//!     host.start(host_side);
//!
//!     let sum = host
//!         .call_async("add", json!({"a": 2, "b": 3}), Duration::from_secs(1))
//!         .await?;
//!     assert_eq!(sum, json!(5));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use config::{EngineConfig, RpcConfig};
pub use engine::{Engine, EngineBuilder, EngineStats, Handler, Seq, WeakEngine};
pub use error::{Result, RpcError, TransportError};
pub use protocol::{Direction, Envelope};
pub use transport::{InboundHandler, MemoryTransport, Transport};
