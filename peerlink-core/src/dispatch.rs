//! Event dispatch: turns an accepted inbound stream into a handle and one message for a foreign
//! process endpoint.
//!
//! Delivery is fire-and-forget. When a sink reports that an endpoint cannot take the message
//! (dead process, closed mailbox, full queue) the dispatcher logs it, deletes the handle it just
//! minted and drops the stream, so an undeliverable stream never leaks a registry entry.

use std::collections::HashMap;
use std::fmt;
use std::os::raw::c_int;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;

use crate::handle::{Handle, Registry};
use crate::stream::StreamObject;

/// Foreign-runtime process identifier a notification is addressed to. Opaque here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessEndpoint(pub u64);

impl fmt::Display for ProcessEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

/// One inbound-stream notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub endpoint: ProcessEndpoint,
    pub stream: Handle,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("endpoint {0} is not reachable")]
    EndpointGone(ProcessEndpoint),
    #[error("foreign runtime rejected message for {endpoint} (status {status})")]
    Rejected {
        endpoint: ProcessEndpoint,
        status: c_int,
    },
}

/// Where notifications go. Called from runtime worker threads; must not block for long.
pub trait MessageSink: Send + Sync {
    fn send(&self, notification: Notification) -> Result<(), DeliveryError>;
}

/// Mints stream handles for inbound streams and hands them to a [`MessageSink`].
///
/// Holds the registry weakly: hosts live in the registry and own their handlers, which own a
/// dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Weak<Registry>,
    sink: Arc<dyn MessageSink>,
}

impl Dispatcher {
    pub fn new(registry: &Arc<Registry>, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            sink,
        }
    }

    /// Register `stream` and notify `endpoint`. Returns the handle if the message was accepted.
    pub fn dispatch(&self, endpoint: ProcessEndpoint, stream: StreamObject) -> Option<Handle> {
        let peer = stream.peer();
        let protocol = stream.protocol().clone();
        let Some(registry) = self.registry.upgrade() else {
            tracing::debug!(%peer, %protocol, "bridge gone, dropping inbound stream");
            return None;
        };
        let handle = match registry.insert(stream) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(%peer, %protocol, error = %e, "cannot register inbound stream");
                return None;
            }
        };
        match self.sink.send(Notification {
            endpoint,
            stream: handle,
        }) {
            Ok(()) => {
                tracing::debug!(%peer, %protocol, %endpoint, %handle, "inbound stream dispatched");
                Some(handle)
            }
            Err(e) => {
                tracing::warn!(%peer, %protocol, %endpoint, error = %e, "dropping undeliverable stream");
                let _ = registry.remove(handle);
                None
            }
        }
    }
}

/// In-process mailboxes keyed by endpoint. For Rust embedders and tests.
#[derive(Default)]
pub struct Mailboxes {
    boxes: RwLock<HashMap<ProcessEndpoint, mpsc::UnboundedSender<Notification>>>,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a mailbox for `endpoint`, replacing any previous one.
    pub fn open(&self, endpoint: ProcessEndpoint) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.boxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint, tx);
        rx
    }

    pub fn close(&self, endpoint: ProcessEndpoint) {
        self.boxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&endpoint);
    }
}

impl MessageSink for Mailboxes {
    fn send(&self, notification: Notification) -> Result<(), DeliveryError> {
        let boxes = self.boxes.read().unwrap_or_else(PoisonError::into_inner);
        let tx = boxes
            .get(&notification.endpoint)
            .ok_or(DeliveryError::EndpointGone(notification.endpoint))?;
        tx.send(notification)
            .map_err(|_| DeliveryError::EndpointGone(notification.endpoint))
    }
}

/// Foreign-side send function: `(endpoint, stream handle) -> status`, 0 on success.
pub type SendMessageFn = extern "C" fn(endpoint: u64, handle: usize) -> c_int;

/// Sink backed by a C function supplied by the foreign runtime's native shim.
pub struct CallbackSink {
    send_message: SendMessageFn,
}

impl CallbackSink {
    pub fn new(send_message: SendMessageFn) -> Self {
        Self { send_message }
    }
}

impl MessageSink for CallbackSink {
    fn send(&self, notification: Notification) -> Result<(), DeliveryError> {
        let status = (self.send_message)(notification.endpoint.0, notification.stream.as_raw());
        if status == 0 {
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                endpoint: notification.endpoint,
                status,
            })
        }
    }
}
