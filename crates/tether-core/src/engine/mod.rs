//! The call/reply correlation engine.
//!
//! An [`Engine`] composes four parts:
//!
//! - **Sequence allocator**: issues a fresh `seq` per outbound call
//! - **Method registry**: method name to locally exposed handler
//! - **Pending-call registry**: `seq` to completion and timeout timer
//! - **Dispatcher**: routes inbound replies and calls
//!
//! ```text
//! call()   -> seq -> pending.register -> encode -> transport.send
//! inbound  -> dispatcher -> reply: pending.complete
//!                        -> call:  handler -> reply envelope -> transport.send
//! ```
//!
//! # Thread Safety
//!
//! `Engine` is a cheap `Clone` handle over shared state. Each registry has
//! its own lock, and no lock is held while a handler, a completion or the
//! transport runs. Handlers that need to issue calls should capture a
//! [`WeakEngine`] to avoid keeping the engine alive through its own registry.

mod builder;
pub mod dispatcher;
pub mod methods;
pub mod pending;
pub mod sequence;

pub use builder::EngineBuilder;
pub use dispatcher::Dispatcher;
pub use methods::{Handler, MethodRegistry};
pub use pending::{Completion, PendingCallRegistry, PendingStats};
pub use sequence::{Seq, SequenceAllocator};

use crate::config::EngineConfig;
use crate::error::{Result, RpcError, TransportError};
use crate::protocol::{CallEnvelope, Envelope, ReplyEnvelope};
use crate::transport::{InboundHandler, Transport};
use dispatcher::DispatchCounters;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Snapshot of an engine's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Outbound calls currently awaiting a terminal event.
    pub pending: usize,
    /// Outbound calls handed to the transport successfully.
    pub calls_sent: u64,
    /// Replies that completed a pending call.
    pub replies_matched: u64,
    /// Replies for a `seq` that was no longer pending.
    pub late_replies: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub inbound_calls: u64,
    pub unknown_method_calls: u64,
    pub handler_failures: u64,
    /// Inbound messages that could not be decoded.
    pub dropped_messages: u64,
    /// Replies to inbound calls the transport refused.
    pub reply_send_failures: u64,
}

struct EngineInner {
    config: EngineConfig,
    sequence: SequenceAllocator,
    methods: Arc<MethodRegistry>,
    pending: PendingCallRegistry,
    dispatcher: Dispatcher,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Bumped by every `start`; listeners from older subscriptions go quiet.
    subscription: AtomicU64,
    counters: Arc<DispatchCounters>,
    calls_sent: AtomicU64,
    reply_send_failures: AtomicU64,
}

/// Bidirectional call/reply engine over a single [`Transport`].
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Non-owning handle to an [`Engine`].
#[derive(Clone)]
pub struct WeakEngine {
    inner: Weak<EngineInner>,
}

impl WeakEngine {
    /// Get the engine back, if it is still alive.
    pub fn upgrade(&self) -> Option<Engine> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }
}

impl Engine {
    /// Create a builder for more control over engine settings.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Create an engine with default settings on the current tokio runtime.
    pub fn new() -> Result<Self> {
        EngineBuilder::new().build()
    }

    pub(crate) fn from_parts(config: EngineConfig, runtime: Handle, first_seq: Seq) -> Self {
        let methods = Arc::new(MethodRegistry::new());
        let pending = PendingCallRegistry::new(runtime, config.max_pending);
        let counters = Arc::new(DispatchCounters::default());
        let dispatcher = Dispatcher::new(
            methods.clone(),
            pending.clone(),
            config.max_message_size,
            counters.clone(),
        );

        Self {
            inner: Arc::new(EngineInner {
                config,
                sequence: SequenceAllocator::starting_at(first_seq),
                methods,
                pending,
                dispatcher,
                transport: RwLock::new(None),
                subscription: AtomicU64::new(0),
                counters,
                calls_sent: AtomicU64::new(0),
                reply_send_failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakEngine {
        WeakEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Attach the engine to `transport` and subscribe to its inbound messages.
    ///
    /// The engine has one inbound subscriber. Starting again (with the same
    /// or another transport) replaces the previous subscription: messages
    /// still arriving through an earlier transport are ignored.
    pub fn start<T: Transport>(&self, transport: T) {
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let epoch = {
            let mut current = self
                .inner
                .transport
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *current = Some(transport.clone());
            self.inner.subscription.fetch_add(1, Ordering::SeqCst) + 1
        };

        let weak = Arc::downgrade(&self.inner);
        let handler: InboundHandler = Arc::new(move |message: String| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.subscription.load(Ordering::SeqCst) != epoch {
                debug!("Ignoring message from a replaced transport");
                return;
            }
            Engine { inner }.handle_inbound(&message);
        });
        transport.listen(handler);
        info!("Engine started (subscription {})", epoch);
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Process one raw inbound message.
    ///
    /// This is what [`start`](Self::start) subscribes to the transport; hosts
    /// that pump messages themselves can call it directly.
    pub fn handle_inbound(&self, raw: &str) {
        if let Some(reply) = self.inner.dispatcher.handle_inbound(raw) {
            self.send_reply(reply);
        }
    }

    fn send_reply(&self, reply: ReplyEnvelope) {
        let seq = reply.seq;
        let sent = Envelope::Reply(reply)
            .encode()
            .and_then(|text| match self.transport() {
                Some(transport) => transport.send(text).map_err(RpcError::from),
                None => Err(RpcError::Transport(TransportError::NotStarted)),
            });

        if let Err(e) = sent {
            self.inner.reply_send_failures.fetch_add(1, Ordering::Relaxed);
            error!("Failed to send reply {}: {}", seq, e);
        }
    }

    /// Call `method` on the peer.
    ///
    /// Returns the `seq` assigned to the call immediately. `completion` runs
    /// exactly once, later, with the decoded reply or an error (timeout,
    /// transport failure, remote error, cancellation, engine close). If the
    /// transport rejects the send, the call is rolled back and `completion`
    /// runs before this method returns.
    pub fn call<F>(&self, method: &str, args: Value, timeout: Duration, completion: F) -> Seq
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let seq = self.inner.sequence.next();

        if method.is_empty() {
            completion(Err(RpcError::InvalidCall {
                message: "method name is empty".to_string(),
            }));
            return seq;
        }

        let encoded = CallEnvelope::new(seq, method, &args).and_then(|c| Envelope::Call(c).encode());
        let message = match encoded {
            Ok(message) => message,
            Err(e) => {
                completion(Err(e));
                return seq;
            }
        };

        if let Err(rejected) = self.inner.pending.register(seq, Box::new(completion), timeout) {
            match &rejected.error {
                RpcError::DuplicateSequence(_) => {
                    error!("Sequence allocator issued {} twice", seq)
                }
                other => debug!("Call {} to {} rejected: {}", seq, method, other),
            }
            rejected.fail();
            return seq;
        }

        let sent = match self.transport() {
            Some(transport) => transport.send(message),
            None => Err(TransportError::NotStarted),
        };

        match sent {
            Ok(()) => {
                self.inner.calls_sent.fetch_add(1, Ordering::Relaxed);
                debug!("Call {} -> {} (timeout {:?})", seq, method, timeout);
            }
            Err(e) => {
                debug!("Call {} to {} not sent: {}", seq, method, e);
                self.inner.pending.complete(seq, Err(RpcError::Transport(e)));
            }
        }
        seq
    }

    /// [`call`](Self::call) with the configured default timeout.
    pub fn call_default<F>(&self, method: &str, args: Value, completion: F) -> Seq
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        self.call(method, args, self.inner.config.default_timeout, completion)
    }

    /// Call `method` and await the outcome.
    pub async fn call_async(&self, method: &str, args: Value, timeout: Duration) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.call(method, args, timeout, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.await.unwrap_or(Err(RpcError::Closed))
    }

    /// Expose `handler` to the peer under `method`. Last registration wins.
    pub fn register_method<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let method = method.into();
        if self.inner.methods.register(method.clone(), Arc::new(handler)).is_some() {
            debug!("Replaced handler for {}", method);
        }
    }

    pub fn unregister_method(&self, method: &str) -> bool {
        self.inner.methods.unregister(method).is_some()
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.inner.methods.contains(method)
    }

    /// Cancel an outstanding call. Its completion receives `Cancelled`.
    ///
    /// Returns `false` if the call already finished.
    pub fn cancel(&self, seq: Seq) -> bool {
        self.inner.pending.cancel(seq)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// The `seq` the next call will receive.
    pub fn next_sequence(&self) -> Seq {
        self.inner.sequence.peek()
    }

    /// Shut the engine down.
    ///
    /// Fails every outstanding call with `Closed`; later calls fail the same
    /// way. Inbound calls are still answered. Returns the number of calls
    /// that were failed.
    pub fn close(&self) -> usize {
        let failed = self.inner.pending.close();
        info!("Engine closed ({} pending calls failed)", failed);
        failed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pending.is_closed()
    }

    pub fn stats(&self) -> EngineStats {
        let pending = self.inner.pending.stats();
        let counters = &self.inner.counters;
        EngineStats {
            pending: pending.pending,
            calls_sent: self.inner.calls_sent.load(Ordering::Relaxed),
            replies_matched: counters.replies_matched.load(Ordering::Relaxed),
            late_replies: counters.late_replies.load(Ordering::Relaxed),
            timeouts: pending.expired,
            cancelled: pending.cancelled,
            inbound_calls: counters.inbound_calls.load(Ordering::Relaxed),
            unknown_method_calls: counters.unknown_method_calls.load(Ordering::Relaxed),
            handler_failures: counters.handler_failures.load(Ordering::Relaxed),
            dropped_messages: counters.dropped_messages.load(Ordering::Relaxed),
            reply_send_failures: self.inner.reply_send_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let failed = self.pending.close();
        if failed > 0 {
            debug!("Engine dropped with {} pending calls", failed);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("methods", &self.inner.methods)
            .field("pending", &self.inner.pending)
            .finish()
    }
}
