//! Handler capability.
//!
//! A server hands every accepted connection to exactly one [`Handler`].
//! Implementations:
//! - [`Greeting`]: writes a fixed line and returns (the default)
//! - [`crate::proxy::TcpReverseProxy`]: relays to a downstream target
//!
//! Callers plug in their own by implementing the trait.

mod greeting;

pub use greeting::{Greeting, GREETING};

use async_trait::async_trait;

use crate::server::{Context, Stream};

/// Per-connection processing contract.
///
/// The server owns the stream: it applies deadlines before calling
/// `serve` and shuts the stream down after `serve` returns or panics.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, ctx: &Context, stream: &mut Stream);
}

/// Panic payload that stops a handler without being logged.
///
/// Raise it with [`abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortHandler;

impl std::fmt::Display for AbortHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("abort handler")
    }
}

/// Unwind out of the current handler quietly. The connection is closed.
pub fn abort() -> ! {
    std::panic::panic_any(AbortHandler)
}
