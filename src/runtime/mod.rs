//! Connection lifecycle and broadcast core.
//!
//! Two interchangeable backends share the same session, registry and
//! broadcast code:
//! - mio: readiness-based acceptor plus a blocking reader thread and a
//!   writer thread per session
//! - tokio: async accept loop plus one reader task and one writer task
//!   per session
//!
//! Shared pieces:
//! - `SessionRegistry`: the single lock-protected table of live sessions
//! - `broadcast`: fan-out with per-recipient failure isolation
//! - `Session`: join, receive and leave handling for one client

pub mod broadcast;
pub mod registry;
pub mod session;

#[cfg(unix)]
mod mio_impl;

pub use session::SessionId;

use crate::config::Config;
use std::net::SocketAddr;

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 128;

/// Run with the mio acceptor and session threads.
pub fn run_mio(config: Config) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        mio_impl::run(config)
    }

    #[cfg(not(unix))]
    {
        let _ = config;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Unsupported platform: the mio runtime requires a unix target",
        ))
    }
}

/// Run with the tokio accept loop and session tasks.
///
/// Ctrl-C stops accepting and ends the live sessions before returning.
pub fn run_tokio(config: Config) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("session-worker")
        .build()?;

    runtime.block_on(async {
        let server = crate::server::Server::bind(config.listen, config.max_sessions)?;
        server.run_until(interrupted()).await
    })
}

/// Resolves on Ctrl-C. If the signal cannot be watched, never resolves.
pub(crate) async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Interrupt received"),
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for interrupt");
            std::future::pending::<()>().await
        }
    }
}

/// Create a non-blocking listening socket bound to `addr`.
pub(crate) fn create_listener(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_listener_ephemeral_port() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_create_listener_port_in_use() {
        let first = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        // SO_REUSEADDR does not allow two active listeners on one port.
        assert!(create_listener(addr).is_err());
    }
}
