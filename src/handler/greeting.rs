//! Default handler.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use super::Handler;
use crate::server::{Context, Stream};

/// Line written by [`Greeting`].
pub const GREETING: &[u8] = b"Pong! TCP handler here.\n";

/// Writes [`GREETING`] and returns, closing the connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct Greeting;

#[async_trait]
impl Handler for Greeting {
    async fn serve(&self, ctx: &Context, stream: &mut Stream) {
        if let Err(e) = stream.write_all(GREETING).await {
            trace!(peer = ?ctx.peer_addr(), error = %e, "Greeting write failed");
        }
    }
}
