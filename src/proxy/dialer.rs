//! Downstream dialing.

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::warn;

use crate::server::{set_keepalive, Context, ContextError};

/// Opens the downstream connection for a proxy session.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr`, giving up once `ctx` is done.
    async fn dial(&self, ctx: &Context, addr: &str) -> io::Result<TcpStream>;
}

/// Plain TCP dialer.
///
/// The connect is bounded by `ctx` alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer {
    /// TCP keep-alive period applied to the new connection. Zero disables.
    pub keep_alive: Duration,
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, ctx: &Context, addr: &str) -> io::Result<TcpStream> {
        let stream = ctx
            .run(TcpStream::connect(addr))
            .await
            .map_err(context_error)??;

        if !self.keep_alive.is_zero() {
            if let Err(e) = set_keepalive(&stream, self.keep_alive) {
                warn!(addr = %addr, error = %e, "Failed to enable downstream keep-alive");
            }
        }
        Ok(stream)
    }
}

pub(crate) fn context_error(err: ContextError) -> io::Error {
    let kind = match err {
        ContextError::Canceled => io::ErrorKind::Interrupted,
        ContextError::DeadlineExceeded => io::ErrorKind::TimedOut,
    };
    io::Error::new(kind, err)
}
