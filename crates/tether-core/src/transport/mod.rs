//! Transport abstraction the engine is layered on.
//!
//! A transport is an already-open duplex channel of text messages. The engine
//! needs exactly two things from it:
//!
//! - **send**: hand off one serialized envelope. Fire-and-forget, but a
//!   failure that is known immediately is reported through the return value.
//! - **listen**: install the single inbound handler. A later `listen`
//!   replaces the earlier handler.

pub mod memory;

pub use memory::MemoryTransport;

use crate::error::TransportError;
use std::sync::Arc;

/// Callback invoked once per inbound message.
pub type InboundHandler = Arc<dyn Fn(String) + Send + Sync + 'static>;

/// Duplex message channel consumed by the engine.
pub trait Transport: Send + Sync + 'static {
    /// Send one serialized envelope to the peer.
    fn send(&self, message: String) -> Result<(), TransportError>;

    /// Install the inbound handler, replacing any previous one.
    fn listen(&self, handler: InboundHandler);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, message: String) -> Result<(), TransportError> {
        (**self).send(message)
    }

    fn listen(&self, handler: InboundHandler) {
        (**self).listen(handler)
    }
}
