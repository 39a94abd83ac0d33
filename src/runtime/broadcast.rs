//! Fan-out of one message to the registered sessions.
//!
//! Delivery happens under the registry lock and only enqueues; each
//! session's writer does the socket I/O. A recipient whose queue is closed
//! is logged and skipped; the remaining recipients still get the message
//! and the caller never sees the failure.

use crate::protocol::Message;
use crate::runtime::registry::SessionRegistry;
use crate::runtime::session::SessionId;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

/// Write side of a registered session.
pub trait Outbound: Send + Sync {
    /// Deliver one encoded message to the peer.
    fn deliver(&self, bytes: &[u8]) -> io::Result<()>;
}

impl<T: Outbound + ?Sized> Outbound for Arc<T> {
    fn deliver(&self, bytes: &[u8]) -> io::Result<()> {
        (**self).deliver(bytes)
    }
}

/// Queue feeding a session's writer.
impl Outbound for UnboundedSender<Bytes> {
    fn deliver(&self, bytes: &[u8]) -> io::Result<()> {
        self.send(Bytes::copy_from_slice(bytes))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "session writer closed"))
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Deliver `bytes` to every registered session except `exclude`.
pub fn broadcast_to_others<W: Outbound>(
    registry: &SessionRegistry<W>,
    bytes: &[u8],
    exclude: Option<SessionId>,
) -> Delivery {
    let mut delivery = Delivery::default();

    registry.for_each(|entry| {
        if Some(entry.id) == exclude {
            return;
        }
        match entry.outbound.deliver(bytes) {
            Ok(()) => delivery.delivered += 1,
            Err(e) => {
                debug!(
                    session = entry.id,
                    name = %entry.name,
                    peer = %entry.peer,
                    error = %e,
                    "Delivery failed"
                );
                delivery.failed += 1;
            }
        }
    });

    delivery
}

/// Deliver `bytes` to every registered session.
pub fn broadcast_to_all<W: Outbound>(registry: &SessionRegistry<W>, bytes: &[u8]) -> Delivery {
    broadcast_to_others(registry, bytes, None)
}

/// Encode and deliver a message, honoring its sender exclusion.
pub fn send<W: Outbound>(registry: &SessionRegistry<W>, message: &Message<'_>) -> Delivery {
    let bytes = message.encode();
    let delivery = match message.excluded() {
        Some(sender) => broadcast_to_others(registry, &bytes, Some(sender)),
        None => broadcast_to_all(registry, &bytes),
    };
    trace!(
        delivered = delivery.delivered,
        failed = delivery.failed,
        len = bytes.len(),
        "Broadcast"
    );
    delivery
}
