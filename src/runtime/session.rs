//! Per-connection session state and the blocking receive loop.
//!
//! A session is registered by the acceptor, announces itself to everyone,
//! rebroadcasts each framed line to the other sessions, and on close
//! deregisters before announcing its departure.

use crate::protocol::{frame_line, Message, READ_BUFFER_SIZE};
use crate::runtime::broadcast::{self, Delivery, Outbound};
use crate::runtime::registry::{SessionEntry, SessionRegistry};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Process-unique session identifier.
pub type SessionId = u64;

/// Id handed to the first accepted connection.
pub const FIRST_SESSION_ID: SessionId = 10;

/// Monotonic session id source.
///
/// Post-increment is atomic, so ids stay unique even if accepts run on
/// several threads.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::starting_at(FIRST_SESSION_ID)
    }

    pub fn starting_at(first: SessionId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Take the next id.
    pub fn next(&self) -> SessionId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, join not yet announced.
    Joining,
    /// Receive loop running.
    Active,
    /// Deregistered and announced as gone.
    Closed,
}

/// One connected client.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    name: String,
    peer: SocketAddr,
    state: SessionState,
}

impl Session {
    /// Create a session; its display name is the decimal id.
    pub fn new(id: SessionId, peer: SocketAddr) -> Self {
        Self {
            id,
            name: id.to_string(),
            peer,
            state: SessionState::Joining,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    #[cfg(test)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Liveness flag: true until the session has left.
    pub fn is_alive(&self) -> bool {
        self.state != SessionState::Closed
    }

    /// Registry entry for this session with the given write handle.
    pub fn entry<W>(&self, outbound: W) -> SessionEntry<W> {
        SessionEntry {
            id: self.id,
            name: self.name.clone(),
            peer: self.peer,
            outbound,
        }
    }

    /// Announce the session to every registered session, itself included.
    pub fn join<W: Outbound>(&mut self, registry: &SessionRegistry<W>) -> Delivery {
        info!(session = self.id, peer = %self.peer, "Session joined");
        let delivery = broadcast::send(registry, &Message::Join { name: &self.name });
        self.state = SessionState::Active;
        delivery
    }

    /// Handle one received chunk.
    ///
    /// Returns `None` when the framed line is empty and nothing was sent.
    pub fn receive<W: Outbound>(
        &self,
        chunk: &[u8],
        registry: &SessionRegistry<W>,
    ) -> Option<Delivery> {
        let text = frame_line(chunk)?;
        Some(broadcast::send(
            registry,
            &Message::Chat {
                sender: self.id,
                name: &self.name,
                text,
            },
        ))
    }

    /// Deregister and announce the departure to the remaining sessions.
    ///
    /// Idempotent; the owner closes the connection afterwards.
    pub fn leave<W: Outbound>(&mut self, registry: &SessionRegistry<W>) {
        if !self.is_alive() {
            return;
        }
        registry.remove(self.id);
        broadcast::send(registry, &Message::Leave { name: &self.name });
        self.state = SessionState::Closed;
        info!(session = self.id, peer = %self.peer, "Session left");
    }
}

/// Run a session's receive loop over a blocking reader.
///
/// Returns once the peer closes or a read fails; by then the session has
/// left the registry. The caller still owns and must close the connection.
pub fn run_blocking<R, W>(session: &mut Session, mut reader: R, registry: &SessionRegistry<W>)
where
    R: Read,
    W: Outbound,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];

    session.join(registry);

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                session.receive(&buf[..n], registry);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(session = session.id, error = %e, "Read failed");
                break;
            }
        }
    }

    session.leave(registry);
}
