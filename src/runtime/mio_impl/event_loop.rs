//! mio accept loop.
//!
//! Readiness-based model for the listening socket only: poll tells us
//! when connections are waiting, then we accept until `WouldBlock`.
//! Each accepted connection is switched back to blocking mode and handed
//! to two threads: a reader running the session receive loop and a writer
//! draining the session's outbound queue. Broadcasts only enqueue, so a
//! peer that stops reading holds up nobody but its own writer.

use crate::runtime::registry::{ChannelRegistry, SessionRegistry};
use crate::runtime::session::{self, IdAllocator, Session, SessionId};
use bytes::Bytes;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Events drained per poll; only two sources are ever registered.
const EVENT_CAPACITY: usize = 16;

/// Longest a single write may block before the peer is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// A running session: its connection and its reader thread.
struct SessionThread {
    stream: Arc<TcpStream>,
    handle: JoinHandle<()>,
}

/// Listening socket plus the poll instance watching it.
pub struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    registry: Arc<ChannelRegistry>,
    ids: IdAllocator,
    sessions: Vec<SessionThread>,
}

/// Stops a running [`Acceptor`] from another thread.
///
/// The listener closes first, then every live session is ended in accept
/// order and announced as gone to those still connected.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

impl Acceptor {
    /// Bind and listen on `addr`.
    pub fn bind(addr: SocketAddr, max_sessions: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let listener = crate::runtime::create_listener(addr)?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;

        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            listener,
            local_addr,
            waker,
            registry: Arc::new(SessionRegistry::new(max_sessions)),
            ids: IdAllocator::new(),
            sessions: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg(test)]
    pub fn registry(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
        }
    }

    /// Accept connections until shut down, then end the live sessions.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        info!(
            addr = %self.local_addr,
            max_sessions = self.registry.capacity(),
            "Server started"
        );

        'accept: loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => break 'accept,
                    _ => {}
                }
            }
        }

        info!(
            addr = %self.local_addr,
            sessions = self.registry.len(),
            "Acceptor shutting down"
        );

        let Acceptor {
            listener, sessions, ..
        } = self;
        drop(listener);
        drain(sessions);
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.admit(OwnedFd::from(stream), peer) {
                        warn!(peer = %peer, error = %e, "Connection rejected");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Transient (e.g. EMFILE); the listener stays readable.
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Register an accepted connection and start its session threads.
    ///
    /// On error the connection is dropped, which closes it.
    fn admit(&mut self, fd: OwnedFd, peer: SocketAddr) -> io::Result<()> {
        if self.registry.is_full() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("session limit reached ({})", self.registry.capacity()),
            ));
        }

        let stream = TcpStream::from(fd);
        // Session I/O blocks on its own threads.
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let stream = Arc::new(stream);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut session = Session::new(self.ids.next(), peer);
        let id = session.id();
        self.registry
            .insert(session.entry(tx))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        debug!(session = id, peer = %peer, "Accepted connection");

        let spawned = spawn_writer(id, Arc::clone(&stream), rx).and_then(|writer| {
            let registry = Arc::clone(&self.registry);
            let stream = Arc::clone(&stream);
            thread::Builder::new()
                .name(format!("session-{id}"))
                .spawn(move || {
                    session::run_blocking(&mut session, &*stream, &*registry);
                    // Leaving dropped the queue's sender; the writer flushes and exits.
                    let _ = writer.join();
                    let _ = stream.shutdown(Shutdown::Both);
                })
        });

        match spawned {
            Ok(handle) => {
                self.sessions.retain(|s| !s.handle.is_finished());
                self.sessions.push(SessionThread { stream, handle });
                Ok(())
            }
            Err(e) => {
                self.registry.remove(id);
                Err(e)
            }
        }
    }
}

/// Start the thread that writes a session's queued messages in order.
///
/// A failed or timed-out write shuts the connection down, which also ends
/// the session's blocked read.
fn spawn_writer(
    id: SessionId,
    stream: Arc<TcpStream>,
    mut rx: UnboundedReceiver<Bytes>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("session-{id}-tx"))
        .spawn(move || {
            while let Some(message) = rx.blocking_recv() {
                if let Err(e) = (&*stream).write_all(&message) {
                    debug!(session = id, error = %e, "Write failed");
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
            }
        })
}

/// End every live session, one at a time, in accept order.
///
/// Closing the read side makes the session's blocked read return, so it
/// leaves the registry and announces itself gone to the sessions not yet
/// drained.
fn drain(sessions: Vec<SessionThread>) {
    for session in sessions {
        let _ = session.stream.shutdown(Shutdown::Read);
        if session.handle.join().is_err() {
            warn!("Session thread panicked");
        }
    }
}
