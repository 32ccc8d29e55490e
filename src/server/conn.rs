//! Per-connection state and the task that drives one handler call.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{error, trace, warn};

use super::{Context, ServerInner, Stream};
use crate::handler::AbortHandler;

/// An accepted connection, with the server's deadlines already applied.
pub(crate) struct Conn {
    server: Arc<ServerInner>,
    stream: Stream,
    remote_addr: SocketAddr,
}

impl Conn {
    pub(crate) fn new(server: Arc<ServerInner>, tcp: TcpStream, remote_addr: SocketAddr) -> Self {
        let now = Instant::now();
        let mut stream = Stream::new(tcp);

        // An unrepresentable deadline is the same as none.
        if !server.read_timeout.is_zero() {
            stream.set_read_deadline(now.checked_add(server.read_timeout));
        }
        if !server.write_timeout.is_zero() {
            stream.set_write_deadline(now.checked_add(server.write_timeout));
        }
        if !server.keep_alive.is_zero() {
            if let Err(e) = stream.set_keepalive(server.keep_alive) {
                warn!(peer = %remote_addr, error = %e, "Failed to enable keep-alive");
            }
        }

        Self {
            server,
            stream,
            remote_addr,
        }
    }

    /// Run the handler once, then shut the stream down.
    ///
    /// Panics from the handler are caught here so one connection cannot
    /// take the process down.
    pub(crate) async fn serve(mut self, ctx: Context) {
        let ctx = ctx
            .child()
            .with_local_addr(self.stream.local_addr().ok())
            .with_peer_addr(self.remote_addr);

        let handler = Arc::clone(&self.server.handler);
        let outcome = CatchUnwind(handler.serve(&ctx, &mut self.stream)).await;

        if let Err(payload) = outcome {
            if is_reportable(&*payload) {
                error!(
                    peer = %self.remote_addr,
                    panic = %payload_to_string(&*payload),
                    "Panic serving connection"
                );
            }
        }

        if let Err(e) = self.stream.shutdown().await {
            trace!(peer = %self.remote_addr, error = %e, "Shutdown after handler");
        }
        trace!(peer = %self.remote_addr, "Connection closed");
    }
}

/// Polls the wrapped future, turning a panic into `Err(payload)`.
struct CatchUnwind<F>(F);

impl<F: Future + Unpin> Future for CatchUnwind<F> {
    type Output = std::thread::Result<F::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.0;
        match std::panic::catch_unwind(AssertUnwindSafe(|| Pin::new(inner).poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(v)) => Poll::Ready(Ok(v)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

/// Report panics through `tracing` instead of stderr.
///
/// The hook runs at the panic site, so the log carries the location and a
/// backtrace (captured when `RUST_BACKTRACE` enables it). Unwinds raised by
/// [`crate::handler::abort`] are not reported.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        if !is_reportable(info.payload()) {
            return;
        }
        let location = info
            .location()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown".to_string());
        error!(
            panic = %payload_to_string(info.payload()),
            location = %location,
            backtrace = %Backtrace::capture(),
            "Panicked"
        );
    }));
}

fn is_reportable(payload: &(dyn Any + Send)) -> bool {
    !payload.is::<AbortHandler>()
}

fn payload_to_string(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
