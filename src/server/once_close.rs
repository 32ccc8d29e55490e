//! Idempotent close guard.
//!
//! Several code paths may close the same listener: an explicit
//! `Server::close`, and the accept loop on its way out. `OnceClose` runs
//! the real close on the first request and replays its result to every
//! later caller.

use std::io;
use std::sync::{Arc, OnceLock};

/// A resource with an explicit close operation.
pub trait Close {
    fn close(&self) -> io::Result<()>;
}

/// Close result shared by every caller of [`OnceClose::close`].
pub type CloseResult = Result<(), Arc<io::Error>>;

#[derive(Debug)]
pub struct OnceClose<T> {
    inner: T,
    result: OnceLock<CloseResult>,
}

impl<T: Close> OnceClose<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            result: OnceLock::new(),
        }
    }

    /// Close the wrapped resource at most once.
    ///
    /// Concurrent callers block until the first close finishes and then
    /// observe the same result.
    pub fn close(&self) -> CloseResult {
        self.result
            .get_or_init(|| self.inner.close().map_err(Arc::new))
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.result.get().is_some()
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}
