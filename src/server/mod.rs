//! TCP server: accept loop, per-connection dispatch, one-shot shutdown.
//!
//! ```text
//! Listener::accept
//!     → Conn::new (deadlines, keep-alive)
//!     → tokio::spawn(Conn::serve) → Handler::serve
//!     → stream shutdown
//! ```
//!
//! Shutdown is a single atomic flag, a cancellation token and an
//! idempotent close of the listener. No lock is held across the accept
//! loop, and in-flight connections are left to finish on their own.

mod conn;
mod context;
mod listener;
mod once_close;
mod stream;

pub use conn::install_panic_hook;
pub use context::{Context, ContextError};
pub use listener::Listener;
pub use once_close::{Close, CloseResult, OnceClose};
pub use stream::Stream;

pub(crate) use stream::set_keepalive;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::handler::{Greeting, Handler};
use conn::Conn;

/// Errors returned by [`Server::listen_and_serve`] and [`Server::serve`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The server was closed, before or while serving.
    #[error("tcp: server closed")]
    Closed,
    #[error("tcp: missing listen address")]
    MissingAddress,
    #[error("tcp: failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// Accept failed outside shutdown. The accept loop does not retry.
    #[error("tcp: accept failed: {0}")]
    Accept(#[source] io::Error),
}

pub(crate) struct ServerInner {
    addr: String,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) keep_alive: Duration,
    in_shutdown: AtomicBool,
    /// Child of the base context, cancelled exactly once by `close`.
    shutdown: Context,
    listener: Mutex<Option<Arc<OnceClose<Listener>>>>,
}

/// A TCP server dispatching every connection to a [`Handler`].
///
/// Cloning yields another handle to the same server, so one clone can run
/// `listen_and_serve` while another calls `close`.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    addr: String,
    handler: Option<Arc<dyn Handler>>,
    base_context: Option<Context>,
    read_timeout: Duration,
    write_timeout: Duration,
    keep_alive: Duration,
}

impl ServerBuilder {
    /// Handler for every connection. Defaults to [`Greeting`].
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Context every connection context is derived from.
    pub fn base_context(mut self, ctx: Context) -> Self {
        self.base_context = Some(ctx);
        self
    }

    /// Reads fail once this much time has passed since accept. Zero disables.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Writes fail once this much time has passed since accept. Zero disables.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// TCP keep-alive period for accepted connections. Zero disables.
    pub fn keep_alive(mut self, period: Duration) -> Self {
        self.keep_alive = period;
        self
    }

    pub fn build(self) -> Server {
        let handler = self.handler.unwrap_or_else(|| Arc::new(Greeting));
        let base_context = self.base_context.unwrap_or_else(Context::background);

        Server {
            inner: Arc::new(ServerInner {
                addr: self.addr,
                handler,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                keep_alive: self.keep_alive,
                in_shutdown: AtomicBool::new(false),
                shutdown: base_context.child(),
                listener: Mutex::new(None),
            }),
        }
    }
}

impl Server {
    pub fn builder(addr: impl Into<String>) -> ServerBuilder {
        ServerBuilder {
            addr: addr.into(),
            handler: None,
            base_context: None,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            keep_alive: Duration::ZERO,
        }
    }

    /// A server on `addr` with the default handler and no timeouts.
    pub fn new(addr: impl Into<String>) -> Self {
        Self::builder(addr).build()
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Address of the listener currently being served, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_listener().map(|l| l.get_ref().local_addr())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.in_shutdown.load(Ordering::SeqCst)
    }

    /// Bind the configured address and serve until closed or accept fails.
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        if self.is_shutting_down() {
            return Err(ServerError::Closed);
        }
        if self.inner.addr.is_empty() {
            return Err(ServerError::MissingAddress);
        }

        let listener = Listener::bind(self.inner.addr.as_str())
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.inner.addr.clone(),
                source,
            })?;

        self.serve(listener).await
    }

    /// Serve connections from `listener`.
    ///
    /// Always returns an error: [`ServerError::Closed`] after [`close`],
    /// [`ServerError::Accept`] if accepting fails for any other reason.
    ///
    /// [`close`]: Server::close
    pub async fn serve(&self, listener: Listener) -> Result<(), ServerError> {
        let listener = Arc::new(OnceClose::new(listener));
        self.set_listener(Some(Arc::clone(&listener)));

        // Close may have won the race before the listener was published.
        let result = if self.is_shutting_down() {
            Err(ServerError::Closed)
        } else {
            self.accept_loop(&listener).await
        };

        if let Err(e) = listener.close() {
            debug!(error = %e, "Listener already closed");
        }
        self.set_listener(None);

        info!(addr = %listener.get_ref().local_addr(), "Server stopped");
        result
    }

    async fn accept_loop(&self, listener: &OnceClose<Listener>) -> Result<(), ServerError> {
        let local_addr = listener.get_ref().local_addr();
        info!(addr = %local_addr, "Server listening");

        let ctx = self
            .inner
            .shutdown
            .child()
            .with_server_addr(self.inner.addr.clone());

        loop {
            let accepted = tokio::select! {
                _ = self.inner.shutdown.done() => {
                    self.mark_shutdown();
                    return Err(ServerError::Closed);
                }
                accepted = listener.get_ref().accept() => accepted,
            };

            let (tcp, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(_) if self.is_shutting_down() => return Err(ServerError::Closed),
                Err(e) => {
                    warn!(addr = %local_addr, error = %e, "Accept failed");
                    return Err(ServerError::Accept(e));
                }
            };

            debug!(peer = %peer, "Connection accepted");
            let conn = Conn::new(Arc::clone(&self.inner), tcp, peer);
            tokio::spawn(conn.serve(ctx.clone()));
        }
    }

    /// Stop accepting and close the listener.
    ///
    /// Safe to call any number of times from any task. Connections already
    /// accepted are not interrupted; their contexts are cancelled.
    pub fn close(&self) -> CloseResult {
        self.mark_shutdown();
        self.inner.shutdown.cancel();

        match self.current_listener() {
            Some(listener) => listener.close(),
            None => Ok(()),
        }
    }

    fn mark_shutdown(&self) {
        if self
            .inner
            .in_shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(addr = %self.inner.addr, "Server closing");
        }
    }

    fn current_listener(&self) -> Option<Arc<OnceClose<Listener>>> {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_listener(&self, listener: Option<Arc<OnceClose<Listener>>>) {
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = listener;
    }
}

/// Serve `handler` on `addr` until the process exits or accept fails.
pub async fn listen_and_serve(
    addr: impl Into<String>,
    handler: Arc<dyn Handler>,
) -> Result<(), ServerError> {
    Server::builder(addr).handler(handler).build().listen_and_serve().await
}
