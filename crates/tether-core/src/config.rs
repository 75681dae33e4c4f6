//! Centralized configuration for the tether engine.
//!
//! Constants live on [`RpcConfig`]; per-engine settings live on
//! [`EngineConfig`], which [`EngineBuilder`](crate::engine::EngineBuilder)
//! fills in.

use std::time::Duration;

/// Protocol-level constants.
pub struct RpcConfig;

impl RpcConfig {
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_PENDING_CALLS: usize = 1024;
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

    /// Reply `err` text for calls to a method with no registered handler.
    pub const UNKNOWN_METHOD: &'static str = "Unknown method";

    /// Reply `err` text for a call that ran out of time.
    pub const TIMEOUT: &'static str = "timeout";
}

/// Settings for a single [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Timeout used by `call_default`.
    pub default_timeout: Duration,
    /// Outstanding calls allowed before new calls fail with `TooManyPending`.
    pub max_pending: usize,
    /// Inbound messages longer than this are dropped as decode errors.
    pub max_message_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: RpcConfig::DEFAULT_CALL_TIMEOUT,
            max_pending: RpcConfig::MAX_PENDING_CALLS,
            max_message_size: RpcConfig::MAX_MESSAGE_SIZE,
        }
    }
}
