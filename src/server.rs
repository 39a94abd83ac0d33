//! Tokio runtime for the chat broadcaster.
//!
//! Same session semantics as the mio backend, expressed as tasks: the
//! accept loop spawns a reader task and a writer task per connection.
//! The registry holds the writer task's channel sender, so broadcasts
//! only queue bytes and never wait on a slow peer.

use crate::protocol::READ_BUFFER_SIZE;
use crate::runtime::broadcast::Outbound;
use crate::runtime::registry::{ChannelRegistry, SessionRegistry};
use crate::runtime::session::{IdAllocator, Session, SessionId};
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A running session: the signal that ends it and its reader task.
struct SessionTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    registry: Arc<ChannelRegistry>,
    ids: IdAllocator,
    sessions: Vec<SessionTask>,
}

impl Server {
    /// Bind and listen on `addr`. Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, max_sessions: usize) -> io::Result<Self> {
        let listener = TcpListener::from_std(crate::runtime::create_listener(addr)?)?;

        Ok(Server {
            listener,
            registry: Arc::new(SessionRegistry::new(max_sessions)),
            ids: IdAllocator::new(),
            sessions: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn registry(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// The listener then closes and every live session is ended in accept
    /// order, so each departure is announced to the sessions still open.
    pub async fn run_until<F>(mut self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            addr = %self.local_addr()?,
            max_sessions = self.registry.capacity(),
            "Server started"
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = self.admit(stream, peer) {
                            warn!(peer = %peer, error = %e, "Connection rejected");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                () = &mut shutdown => break,
            }
        }

        info!(
            addr = %self.local_addr()?,
            sessions = self.registry.len(),
            "Server shutting down"
        );

        let Server {
            listener, sessions, ..
        } = self;
        drop(listener);
        drain(sessions).await;
        Ok(())
    }

    /// Register an accepted connection and spawn its tasks.
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        if self.registry.is_full() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("session limit reached ({})", self.registry.capacity()),
            ));
        }

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut session = Session::new(self.ids.next(), peer);
        self.registry
            .insert(session.entry(tx))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        debug!(session = session.id(), peer = %peer, "Accepted connection");

        let writing = tokio::spawn(write_loop(session.id(), writer, rx));

        let (stop, stopped) = oneshot::channel();
        let registry = Arc::clone(&self.registry);
        let handle = tokio::spawn(async move {
            let stopped = async move {
                let _ = stopped.await;
            };
            run_async(&mut session, reader, &*registry, stopped).await;
            // Leaving dropped the queue's sender; the writer flushes and exits.
            let _ = writing.await;
        });

        self.sessions.retain(|s| !s.handle.is_finished());
        self.sessions.push(SessionTask { stop, handle });
        Ok(())
    }
}

/// End every live session, one at a time, in accept order.
async fn drain(sessions: Vec<SessionTask>) {
    for session in sessions {
        let _ = session.stop.send(());
        if let Err(e) = session.handle.await {
            warn!(error = %e, "Session task failed");
        }
    }
}

/// Run a session's receive loop over an async reader.
///
/// Returns once the peer closes, a read fails or `stop` resolves; by then
/// the session has left the registry, which drops its sender and lets the
/// writer finish.
pub async fn run_async<R, W, S>(
    session: &mut Session,
    mut reader: R,
    registry: &SessionRegistry<W>,
    stop: S,
) where
    R: AsyncRead + Unpin,
    W: Outbound,
    S: Future<Output = ()>,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    tokio::pin!(stop);

    session.join(registry);

    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            () = &mut stop => {
                debug!(session = session.id(), "Session stopped");
                break;
            }
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                session.receive(&buf[..n], registry);
            }
            Err(e) => {
                debug!(session = session.id(), error = %e, "Read failed");
                break;
            }
        }
    }

    session.leave(registry);
}

/// Drain queued messages into the connection's write half.
///
/// Ends when every sender is gone or a write fails; dropping the write
/// half then closes the connection.
async fn write_loop<W>(id: SessionId, mut writer: W, mut rx: UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.write_all(&message).await {
            debug!(session = id, error = %e, "Write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::broadcast::tests::{register, Recorder};
    use std::future::pending;
    use std::time::Duration;
    use tokio::time::timeout;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    struct Running {
        addr: SocketAddr,
        registry: Arc<ChannelRegistry>,
        stop: oneshot::Sender<()>,
        task: JoinHandle<io::Result<()>>,
    }

    async fn start(max_sessions: usize) -> Running {
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), max_sessions).unwrap();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));
        Running {
            addr,
            registry,
            stop,
            task,
        }
    }

    async fn expect(stream: &mut TcpStream, expected: &str) {
        let mut buf = vec![0u8; expected.len()];
        timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);
    }

    async fn read_to_close(stream: &mut TcpStream) -> String {
        let mut rest = String::new();
        timeout(Duration::from_secs(5), stream.read_to_string(&mut rest))
            .await
            .expect("timed out")
            .unwrap();
        rest
    }

    #[tokio::test]
    async fn test_session_over_mock_io() {
        let registry = SessionRegistry::new(0);
        let other = register(&registry, 11, Recorder::default());

        let mut session = Session::new(10, peer());
        let own = Arc::new(Recorder::default());
        registry.insert(session.entry(Arc::clone(&own))).unwrap();

        let reader = tokio_test::io::Builder::new()
            .read(b"hi\n")
            .read(b"\r\n")
            .read(b"there\r\n")
            .build();
        run_async(&mut session, reader, &registry, pending()).await;

        assert_eq!(own.text(), "HELLO 10\n");
        assert_eq!(
            other.text(),
            "HELLO 10\n[10] hi \r\n[10] there \r\n10 LEAVE\r\n"
        );
        assert_eq!(registry.ids(), vec![11]);
    }

    #[tokio::test]
    async fn test_session_read_error_leaves() {
        let registry = SessionRegistry::new(0);
        let other = register(&registry, 11, Recorder::default());

        let mut session = Session::new(10, peer());
        registry
            .insert(session.entry(Arc::new(Recorder::default())))
            .unwrap();

        let reader = tokio_test::io::Builder::new()
            .read(b"bye\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        run_async(&mut session, reader, &registry, pending()).await;

        assert_eq!(other.text(), "HELLO 10\n[10] bye \r\n10 LEAVE\r\n");
        assert!(!session.is_alive());
    }

    #[tokio::test]
    async fn test_stop_ends_idle_session() {
        let registry = SessionRegistry::new(0);
        let other = register(&registry, 11, Recorder::default());

        let mut session = Session::new(10, peer());
        registry
            .insert(session.entry(Arc::new(Recorder::default())))
            .unwrap();

        // The peer stays connected and silent.
        let (_client, reader) = tokio::io::duplex(64);
        run_async(&mut session, reader, &registry, async {}).await;

        assert_eq!(other.text(), "HELLO 10\n10 LEAVE\r\n");
        assert_eq!(registry.ids(), vec![11]);
    }

    #[tokio::test]
    async fn test_write_loop_flushes_queue() {
        let writer = tokio_test::io::Builder::new()
            .write(b"HELLO 10\n")
            .write(b"[11] x \r\n")
            .build();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.deliver(b"HELLO 10\n").unwrap();
        tx.deliver(b"[11] x \r\n").unwrap();
        drop(tx);

        write_loop(10, writer, rx).await;
    }

    #[tokio::test]
    async fn test_join_chat_leave() {
        let server = start(0).await;

        let mut a = TcpStream::connect(server.addr).await.unwrap();
        expect(&mut a, "HELLO 10\n").await;

        let mut b = TcpStream::connect(server.addr).await.unwrap();
        expect(&mut a, "HELLO 11\n").await;
        expect(&mut b, "HELLO 11\n").await;

        a.write_all(b"hi\n").await.unwrap();
        expect(&mut b, "[10] hi \r\n").await;

        b.write_all(b"yo\n").await.unwrap();
        expect(&mut a, "[11] yo \r\n").await;

        drop(a);
        expect(&mut b, "10 LEAVE\r\n").await;
        assert_eq!(server.registry.ids(), vec![11]);

        // The survivor keeps working with sessions that join later.
        let mut c = TcpStream::connect(server.addr).await.unwrap();
        expect(&mut b, "HELLO 12\n").await;
        expect(&mut c, "HELLO 12\n").await;

        b.write_all(b"after\n").await.unwrap();
        expect(&mut c, "[11] after \r\n").await;

        let mut ids = server.registry.ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![11, 12]);
    }

    #[tokio::test]
    async fn test_full_registry_rejects_connection() {
        let server = start(1).await;

        let mut a = TcpStream::connect(server.addr).await.unwrap();
        expect(&mut a, "HELLO 10\n").await;

        let mut b = TcpStream::connect(server.addr).await.unwrap();
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), b.read(&mut buf))
            .await
            .expect("timed out")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(server.registry.ids(), vec![10]);
    }

    #[tokio::test]
    async fn test_shutdown_ends_live_sessions() {
        let server = start(0).await;

        let mut a = TcpStream::connect(server.addr).await.unwrap();
        expect(&mut a, "HELLO 10\n").await;
        let mut b = TcpStream::connect(server.addr).await.unwrap();
        expect(&mut a, "HELLO 11\n").await;
        expect(&mut b, "HELLO 11\n").await;

        server.stop.send(()).unwrap();
        timeout(Duration::from_secs(5), server.task)
            .await
            .expect("timed out")
            .unwrap()
            .unwrap();

        assert!(server.registry.is_empty());
        // Sessions end in accept order: B hears A go, A hears nothing.
        assert_eq!(read_to_close(&mut b).await, "10 LEAVE\r\n");
        assert_eq!(read_to_close(&mut a).await, "");
    }
}
