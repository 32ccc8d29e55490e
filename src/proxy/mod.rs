//! Layer-4 reverse proxy handler.
//!
//! For every inbound connection the proxy opens one connection to a fixed
//! downstream target and relays bytes both ways until the session ends.
//!
//! ## Session
//!
//! ```text
//! inbound ctx → bound by dial timeout and deadline → Dialer::dial
//!     → modify_response hook (may veto)
//!     → relay: inbound ⇄ downstream
//!     → error hook on any failure
//! ```
//!
//! ## Dial bounds
//!
//! Dial timeout and deadline both bound the dial when non-zero, and the
//! earlier expiry wins. Neither bounds the relay: once connected, the
//! session ends on EOF or error only.

mod copy;
mod dialer;

pub use copy::{bytes_copy, Copied};
pub use dialer::{Dialer, TcpDialer};

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use crate::handler::Handler;
use crate::server::{Context, Stream};

/// Default upper bound on one connect attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default dial deadline, measured from the start of the session.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

/// Default keep-alive period for downstream connections.
pub const DEFAULT_KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(60 * 60);

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Inspects the downstream connection before relaying. An error aborts the
/// session.
pub type ModifyResponse = Arc<dyn Fn(&TcpStream) -> Result<(), BoxError> + Send + Sync>;

/// Receives every session failure along with the inbound stream.
pub type ErrorHandler = Arc<dyn Fn(&Stream, &ProxyError) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("tcp proxy: target address must not be empty")]
    EmptyAddress,
    #[error("tcp proxy: dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("tcp proxy: modify response: {0}")]
    ModifyResponse(#[source] BoxError),
    #[error("tcp proxy: relay: {0}")]
    Relay(#[source] io::Error),
}

/// Bytes moved by one relay session.
#[derive(Debug, Default)]
struct Relayed {
    to_target: u64,
    from_target: u64,
    error: Option<io::Error>,
}

/// Reverse proxy to a single downstream address.
#[derive(Clone)]
pub struct TcpReverseProxy {
    addr: String,
    dial_timeout: Duration,
    deadline: Duration,
    keep_alive_period: Duration,
    dialer: Option<Arc<dyn Dialer>>,
    modify_response: Option<ModifyResponse>,
    error_handler: Option<ErrorHandler>,
}

impl fmt::Debug for TcpReverseProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpReverseProxy")
            .field("addr", &self.addr)
            .field("dial_timeout", &self.dial_timeout)
            .field("deadline", &self.deadline)
            .field("keep_alive_period", &self.keep_alive_period)
            .field("custom_dialer", &self.dialer.is_some())
            .field("modify_response", &self.modify_response.is_some())
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl TcpReverseProxy {
    /// Proxy to `addr` with the default timeouts.
    pub fn new(addr: impl Into<String>) -> Result<Self, ProxyError> {
        let addr = addr.into();
        if addr.is_empty() {
            return Err(ProxyError::EmptyAddress);
        }

        Ok(Self {
            addr,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            deadline: DEFAULT_DEADLINE,
            keep_alive_period: DEFAULT_KEEP_ALIVE_PERIOD,
            dialer: None,
            modify_response: None,
            error_handler: None,
        })
    }

    /// Zero disables the dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Zero disables the dial deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Zero leaves keep-alive off on downstream connections.
    pub fn with_keep_alive_period(mut self, period: Duration) -> Self {
        self.keep_alive_period = period;
        self
    }

    /// Replace the default [`TcpDialer`].
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn with_modify_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&TcpStream) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.modify_response = Some(Arc::new(f));
        self
    }

    pub fn with_error_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&Stream, &ProxyError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(f));
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn keep_alive_period(&self) -> Duration {
        self.keep_alive_period
    }

    /// Context bounding the dial: the earlier of dial timeout and deadline.
    fn dial_context(&self, ctx: &Context) -> Context {
        let mut ctx = ctx.child();
        if !self.dial_timeout.is_zero() {
            ctx = ctx.with_timeout(self.dial_timeout);
        }
        if !self.deadline.is_zero() {
            ctx = ctx.with_timeout(self.deadline);
        }
        ctx
    }

    async fn dial(&self, ctx: &Context) -> io::Result<TcpStream> {
        let ctx = self.dial_context(ctx);
        let _cancel = ctx.cancel_on_drop();

        let dial = async {
            match &self.dialer {
                Some(dialer) => dialer.dial(&ctx, &self.addr).await,
                None => {
                    let dialer = TcpDialer {
                        keep_alive: self.keep_alive_period,
                    };
                    dialer.dial(&ctx, &self.addr).await
                }
            }
        };

        ctx.run(dial).await.map_err(dialer::context_error)?
    }

    fn report(&self, stream: &Stream, err: ProxyError) {
        debug!(target_addr = %self.addr, error = %err, "Proxy session failed");
        if let Some(handler) = &self.error_handler {
            handler(stream, &err);
        }
    }
}

#[async_trait]
impl Handler for TcpReverseProxy {
    async fn serve(&self, ctx: &Context, stream: &mut Stream) {
        let mut downstream = match self.dial(ctx).await {
            Ok(downstream) => downstream,
            Err(source) => {
                let err = ProxyError::Dial {
                    addr: self.addr.clone(),
                    source,
                };
                self.report(stream, err);
                return;
            }
        };

        if let Some(modify) = &self.modify_response {
            if let Err(e) = modify(&downstream) {
                self.report(stream, ProxyError::ModifyResponse(e));
                return;
            }
        }

        let relayed = relay(stream, &mut downstream).await;
        debug!(
            peer = ?ctx.peer_addr(),
            target_addr = %self.addr,
            bytes_to_target = relayed.to_target,
            bytes_from_target = relayed.from_target,
            "Proxy session finished"
        );

        if let Some(e) = relayed.error {
            self.report(stream, ProxyError::Relay(e));
        }
    }
}

/// Relay both directions until the target side is drained.
///
/// Inbound EOF half-closes the downstream connection and keeps draining
/// the reply; an inbound error, or the end of the downstream-to-inbound
/// direction, ends the session.
async fn relay(inbound: &mut Stream, downstream: &mut TcpStream) -> Relayed {
    let (mut in_read, mut in_write) = tokio::io::split(inbound);
    let (mut down_read, mut down_write) = downstream.split();

    let to_target = async {
        let copied = bytes_copy(&mut in_read, &mut down_write).await;
        if copied.result.is_ok() {
            if let Err(e) = down_write.shutdown().await {
                return Copied {
                    bytes: copied.bytes,
                    result: Err(e),
                };
            }
        }
        copied
    };
    let from_target = bytes_copy(&mut down_read, &mut in_write);
    tokio::pin!(to_target, from_target);

    let mut relayed = Relayed::default();
    let mut sent: Option<Copied> = None;

    loop {
        tokio::select! {
            received = &mut from_target => {
                relayed.from_target = received.bytes;
                relayed.error = received.result.err();
                break;
            }
            copied = &mut to_target, if sent.is_none() => {
                let failed = copied.result.is_err();
                sent = Some(copied);
                if failed {
                    break;
                }
            }
        }
    }

    if let Some(copied) = sent {
        relayed.to_target = copied.bytes;
        if let Err(e) = copied.result {
            relayed.error.get_or_insert(e);
        }
    }
    relayed
}
