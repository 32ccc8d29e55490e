//! Closable TCP listener.

use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::once_close::Close;

/// A bound TCP listener that can be closed from any task.
///
/// Closing wakes a pending `accept` with an error. The socket itself is
/// released when the listener is dropped, which the server does as soon as
/// its accept loop returns.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl Listener {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Self::from_tokio(inner)
    }

    pub fn from_tokio(inner: TcpListener) -> io::Result<Self> {
        let local_addr = inner.local_addr()?;
        Ok(Self {
            inner,
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next connection, failing once the listener is closed.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_error()),
            accepted = self.inner.accept() => accepted,
        }
    }
}

impl Close for Listener {
    fn close(&self) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.closed.cancel();
        debug!(addr = %self.local_addr, "Listener closed");
        Ok(())
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed listener")
}
