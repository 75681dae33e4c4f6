//! Builder for configuring an [`Engine`].

use super::sequence::Seq;
use super::Engine;
use crate::config::EngineConfig;
use crate::error::{Result, RpcError};
use std::time::Duration;
use tokio::runtime::Handle;

/// Builder for configuring an [`Engine`].
///
/// # Example
///
/// ```rust,ignore
/// use tether_core::Engine;
/// use std::time::Duration;
///
/// let engine = Engine::builder()
///     .default_timeout(Duration::from_secs(5))
///     .max_pending(256)
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    runtime: Option<Handle>,
    first_seq: Seq,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Timeout used by [`Engine::call_default`].
    ///
    /// Default: 30 seconds
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Maximum number of outstanding outbound calls.
    ///
    /// Default: 1024
    pub fn max_pending(mut self, max: usize) -> Self {
        self.config.max_pending = max;
        self
    }

    /// Maximum accepted inbound message length in bytes.
    ///
    /// Default: 16MB
    pub fn max_message_size(mut self, max: usize) -> Self {
        self.config.max_message_size = max;
        self
    }

    /// Runtime that drives call timers.
    ///
    /// Default: the runtime current at `build()` time.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// First sequence number issued by this engine.
    ///
    /// Default: 0
    pub fn first_sequence(mut self, seq: Seq) -> Self {
        self.first_seq = seq;
        self
    }

    /// Build the engine. It does nothing until [`Engine::start`] is called.
    pub fn build(self) -> Result<Engine> {
        if self.config.max_pending == 0 {
            return Err(RpcError::Config {
                message: "max_pending must be at least 1".to_string(),
            });
        }
        if self.config.max_message_size == 0 {
            return Err(RpcError::Config {
                message: "max_message_size must be at least 1".to_string(),
            });
        }

        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| RpcError::Config {
                message: format!("No tokio runtime available for call timers: {}", e),
            })?,
        };

        Ok(Engine::from_parts(self.config, runtime, self.first_seq))
    }
}
