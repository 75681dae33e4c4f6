//! In-process transport backed by tokio channels.
//!
//! [`MemoryTransport::pair`] returns two connected ends. Messages sent on one
//! end are delivered, in order, to the inbound handler of the other end by a
//! pump task spawned on the first `listen`. The pump runs on the runtime the
//! pair was created on, so `listen` itself may be called from any thread.
//! Closing either end closes the whole channel.

use super::{InboundHandler, Transport};
use crate::error::TransportError;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// One end of an in-memory duplex channel.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemInner>,
}

struct MemInner {
    name: &'static str,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    handler: Arc<RwLock<Option<InboundHandler>>>,
    closed: Arc<watch::Sender<bool>>,
    runtime: Option<Handle>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MemoryTransport {
    /// Create two connected ends, conventionally the host and the guest.
    ///
    /// Pumps run on the current tokio runtime. Outside a runtime, use
    /// [`pair_on`](Self::pair_on).
    pub fn pair() -> (Self, Self) {
        Self::with_runtime(Handle::try_current().ok())
    }

    /// Create two connected ends whose pumps run on `runtime`.
    pub fn pair_on(runtime: Handle) -> (Self, Self) {
        Self::with_runtime(Some(runtime))
    }

    fn with_runtime(runtime: Option<Handle>) -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);

        let a = MemInner {
            name: "a",
            tx: tx_b,
            rx: Mutex::new(Some(rx_a)),
            handler: Arc::new(RwLock::new(None)),
            closed: closed.clone(),
            runtime: runtime.clone(),
        };
        let b = MemInner {
            name: "b",
            tx: tx_a,
            rx: Mutex::new(Some(rx_b)),
            handler: Arc::new(RwLock::new(None)),
            closed,
            runtime,
        };

        (Self { inner: Arc::new(a) }, Self { inner: Arc::new(b) })
    }

    /// Close the channel for both ends. Pending deliveries are discarded.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    fn spawn_pump(&self) {
        let mut slot = self.inner.rx.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            return;
        }

        let runtime = match self.inner.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => handle,
            None => {
                // The receiver stays in place so a later listen on a runtime
                // can still start the pump.
                warn!(
                    "Memory transport {} has no tokio runtime; nothing is delivered until listen is called on one",
                    self.inner.name
                );
                return;
            }
        };

        if let Some(rx) = slot.take() {
            let handler = self.inner.handler.clone();
            let closed = self.inner.closed.subscribe();
            runtime.spawn(pump(self.inner.name, rx, handler, closed));
        }
    }
}

async fn pump(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<String>,
    handler: Arc<RwLock<Option<InboundHandler>>>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        if *closed.borrow() {
            break;
        }

        let message = tokio::select! {
            message = rx.recv() => match message {
                Some(m) => m,
                None => break,
            },
            changed = closed.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        let current = handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match current {
            Some(handle) => handle(message),
            None => debug!("Memory transport {} dropped message: no listener", name),
        }
    }
    debug!("Memory transport {} pump stopped", name);
}

impl Transport for MemoryTransport {
    fn send(&self, message: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.inner
            .tx
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn listen(&self, handler: InboundHandler) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
        self.spawn_pump();
    }
}
