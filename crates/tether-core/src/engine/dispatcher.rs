//! Inbound demultiplexing: replies go to the pending-call registry, calls go
//! to the method registry.

use super::methods::MethodRegistry;
use super::pending::PendingCallRegistry;
use crate::error::RpcError;
use crate::protocol::{CallEnvelope, Envelope, ReplyEnvelope};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifetime counters for inbound traffic.
#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    pub inbound_calls: AtomicU64,
    pub unknown_method_calls: AtomicU64,
    pub handler_failures: AtomicU64,
    pub replies_matched: AtomicU64,
    pub late_replies: AtomicU64,
    pub dropped_messages: AtomicU64,
}

/// Routes decoded inbound envelopes.
///
/// Holds no lock while a handler runs, so handlers may call back into the
/// engine (register methods, issue calls, cancel calls).
pub struct Dispatcher {
    methods: Arc<MethodRegistry>,
    pending: PendingCallRegistry,
    max_message_size: usize,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    pub(crate) fn new(
        methods: Arc<MethodRegistry>,
        pending: PendingCallRegistry,
        max_message_size: usize,
        counters: Arc<DispatchCounters>,
    ) -> Self {
        Self {
            methods,
            pending,
            max_message_size,
            counters,
        }
    }

    /// Handle one raw inbound message.
    ///
    /// Returns the reply to send back when the message was a call. Exactly one
    /// reply is produced per decodable call; malformed messages and replies
    /// produce none.
    pub fn handle_inbound(&self, raw: &str) -> Option<ReplyEnvelope> {
        let envelope = match self.decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.dropped_messages.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping inbound message: {}", e);
                return None;
            }
        };

        match envelope {
            Envelope::Reply(reply) => {
                self.deliver_reply(reply);
                None
            }
            Envelope::Call(call) => Some(self.dispatch_call(call)),
        }
    }

    fn decode(&self, raw: &str) -> Result<Envelope, RpcError> {
        if raw.len() > self.max_message_size {
            return Err(RpcError::decode(format!(
                "message size {} exceeds maximum {}",
                raw.len(),
                self.max_message_size
            )));
        }
        Envelope::decode(raw)
    }

    fn deliver_reply(&self, reply: ReplyEnvelope) {
        let seq = reply.seq;
        if self.pending.complete(seq, reply.into_result()) {
            self.counters.replies_matched.fetch_add(1, Ordering::Relaxed);
        } else {
            // Already timed out, cancelled, or never ours.
            self.counters.late_replies.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping reply for unknown seq {}", seq);
        }
    }

    fn dispatch_call(&self, call: CallEnvelope) -> ReplyEnvelope {
        self.counters.inbound_calls.fetch_add(1, Ordering::Relaxed);
        let seq = call.seq;
        debug!("Inbound call {}: {}", seq, call.method);

        match self.invoke(&call).and_then(|result| ReplyEnvelope::success(seq, &result)) {
            Ok(reply) => reply,
            Err(e) => {
                match &e {
                    RpcError::UnknownMethod { method } => {
                        self.counters
                            .unknown_method_calls
                            .fetch_add(1, Ordering::Relaxed);
                        debug!("No handler for {}", method);
                    }
                    other => {
                        self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                        debug!("Call {} to {} failed: {}", seq, call.method, other);
                    }
                }
                ReplyEnvelope::failure(seq, e.wire_message())
            }
        }
    }

    fn invoke(&self, call: &CallEnvelope) -> Result<Value, RpcError> {
        let handler = self
            .methods
            .lookup(&call.method)
            .ok_or_else(|| RpcError::UnknownMethod {
                method: call.method.clone(),
            })?;

        let args = call.args()?;

        match catch_unwind(AssertUnwindSafe(|| handler(args))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(RpcError::Handler {
                method: call.method.clone(),
                message: format!("{:#}", e),
            }),
            Err(panic) => Err(RpcError::Handler {
                method: call.method.clone(),
                message: format!("handler panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::engine::methods::Handler;
    use crate::error::Result;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::runtime::Handle;

    fn dispatcher() -> (Dispatcher, Arc<MethodRegistry>, PendingCallRegistry) {
        let methods = Arc::new(MethodRegistry::new());
        let pending = PendingCallRegistry::new(Handle::current(), 16);
        let dispatcher = Dispatcher::new(
            methods.clone(),
            pending.clone(),
            1024,
            Arc::new(DispatchCounters::default()),
        );
        (dispatcher, methods, pending)
    }

    fn add_handler() -> Handler {
        Arc::new(|args: Value| -> anyhow::Result<Value> {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        })
    }

    #[tokio::test]
    async fn test_registered_call_replies_with_result() {
        let (dispatcher, methods, _) = dispatcher();
        methods.register("add", add_handler());

        let reply = dispatcher
            .handle_inbound(r#"{"dir":"call","seq":12,"method":"add","data":"{\"a\":2,\"b\":3}"}"#)
            .unwrap();

        assert_eq!(reply.seq, 12);
        assert_eq!(reply.data.as_deref(), Some("5"));
        assert!(reply.err.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method_replies_with_error() {
        let (dispatcher, _, _) = dispatcher();

        let reply = dispatcher
            .handle_inbound(r#"{"dir":"call","seq":1,"method":"ghost","data":"null"}"#)
            .unwrap();

        assert_eq!(reply.seq, 1);
        assert_eq!(reply.err.as_deref(), Some(RpcConfig::UNKNOWN_METHOD));
        assert!(reply.data.is_none());
        assert_eq!(
            dispatcher.counters.unknown_method_calls.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_handler_error_captured_in_reply() {
        let (dispatcher, methods, _) = dispatcher();
        methods.register(
            "strict",
            Arc::new(|_: Value| -> anyhow::Result<Value> {
                Err(anyhow::anyhow!("arguments format error"))
            }),
        );

        let reply = dispatcher
            .handle_inbound(r#"{"dir":"call","seq":2,"method":"strict","data":"[]"}"#)
            .unwrap();

        assert_eq!(reply.err.as_deref(), Some("arguments format error"));
        assert!(reply.data.is_none());
    }

    #[tokio::test]
    async fn test_handler_panic_captured_in_reply() {
        let (dispatcher, methods, _) = dispatcher();
        methods.register(
            "explode",
            Arc::new(|_: Value| -> anyhow::Result<Value> { panic!("kaboom") }),
        );

        let reply = dispatcher
            .handle_inbound(r#"{"dir":"call","seq":3,"method":"explode"}"#)
            .unwrap();

        assert_eq!(reply.err.as_deref(), Some("handler panicked: kaboom"));
        assert_eq!(
            dispatcher.counters.handler_failures.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_malformed_call_payload_replies_with_error() {
        let (dispatcher, methods, _) = dispatcher();
        methods.register("add", add_handler());

        let reply = dispatcher
            .handle_inbound(r#"{"dir":"call","seq":4,"method":"add","data":"{nope"}"#)
            .unwrap();

        assert!(reply.err.unwrap().contains("malformed payload"));
    }

    #[tokio::test]
    async fn test_malformed_envelope_dropped() {
        let (dispatcher, _, _) = dispatcher();

        assert!(dispatcher.handle_inbound("garbage").is_none());
        assert!(dispatcher.handle_inbound(r#"{"dir":"call","seq":1}"#).is_none());
        assert_eq!(
            dispatcher.counters.dropped_messages.load(Ordering::Relaxed),
            2
        );
    }

    #[tokio::test]
    async fn test_oversized_message_dropped() {
        let (dispatcher, methods, _) = dispatcher();
        methods.register("add", add_handler());

        let padding = "x".repeat(2048);
        let raw = format!(
            r#"{{"dir":"call","seq":1,"method":"add","data":"\"{}\""}}"#,
            padding
        );
        assert!(dispatcher.handle_inbound(&raw).is_none());
    }

    #[tokio::test]
    async fn test_reply_completes_pending_call() {
        let (dispatcher, _, pending) = dispatcher();
        let seen: Arc<Mutex<Vec<Result<Value>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        pending
            .register(
                7,
                Box::new(move |outcome: Result<Value>| sink.lock().unwrap().push(outcome)),
                Duration::from_secs(10),
            )
            .unwrap();

        assert!(dispatcher
            .handle_inbound(r#"{"dir":"reply","seq":7,"data":"5"}"#)
            .is_none());
        // Duplicate reply is ignored.
        assert!(dispatcher
            .handle_inbound(r#"{"dir":"reply","seq":7,"data":"6"}"#)
            .is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_ref().unwrap(), &json!(5));
        assert_eq!(
            dispatcher.counters.late_replies.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_error_reply_delivers_remote_error() {
        let (dispatcher, _, pending) = dispatcher();
        let seen: Arc<Mutex<Vec<Result<Value>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        pending
            .register(
                8,
                Box::new(move |outcome: Result<Value>| sink.lock().unwrap().push(outcome)),
                Duration::from_secs(10),
            )
            .unwrap();

        dispatcher.handle_inbound(r#"{"dir":"reply","seq":8,"err":"Unknown method"}"#);

        let seen = seen.lock().unwrap();
        match &seen[0] {
            Err(RpcError::Remote(msg)) => assert_eq!(msg, "Unknown method"),
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_with_malformed_data_completes_with_decode_error() {
        let (dispatcher, _, pending) = dispatcher();
        let seen: Arc<Mutex<Vec<Result<Value>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        pending
            .register(
                9,
                Box::new(move |outcome: Result<Value>| sink.lock().unwrap().push(outcome)),
                Duration::from_millis(100),
            )
            .unwrap();

        assert!(dispatcher
            .handle_inbound(r#"{"dir":"reply","seq":9,"data":"{oops"}"#)
            .is_none());
        tokio::time::sleep(Duration::from_millis(500)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Err(RpcError::Decode { .. })));
        assert_eq!(pending.stats().expired, 0);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_reply_for_unknown_seq_ignored() {
        let (dispatcher, _, _) = dispatcher();
        assert!(dispatcher
            .handle_inbound(r#"{"dir":"reply","seq":999,"data":"1"}"#)
            .is_none());
    }
}
