//! mio-based acceptor.
//!
//! Readiness-based accept loop (epoll on Linux, kqueue on macOS) with a
//! reader thread and a writer thread per client.

mod event_loop;

pub use event_loop::Acceptor;

use crate::config::Config;
use std::future::Future;
use std::io;

/// Run the server using the mio acceptor.
///
/// Ctrl-C closes the listener and ends the live sessions before this
/// returns.
pub fn run(config: Config) -> io::Result<()> {
    let acceptor = Acceptor::bind(config.listen, config.max_sessions)?;
    run_until(acceptor, crate::runtime::interrupted())
}

/// Run `acceptor` on a blocking thread until it fails or `shutdown`
/// resolves.
///
/// A single current-thread tokio runtime drives `shutdown`; when it
/// resolves the acceptor is woken and awaited while it drains.
fn run_until<F>(acceptor: Acceptor, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()>,
{
    let handle = acceptor.shutdown_handle();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut accepting = tokio::task::spawn_blocking(move || acceptor.run());

        tokio::select! {
            joined = &mut accepting => return flatten(joined),
            () = shutdown => {}
        }

        handle.shutdown()?;
        flatten(accepting.await)
    })
}

fn flatten(joined: Result<io::Result<()>, tokio::task::JoinError>) -> io::Result<()> {
    joined.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}
