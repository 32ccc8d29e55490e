//! tcp-gateway: a connection-oriented TCP server framework.
//!
//! - [`server`]: accept loop, per-connection deadlines, one-shot shutdown
//! - [`handler`]: the per-connection contract and the default greeting
//! - [`proxy`]: a layer-4 reverse proxy built as a handler
//! - [`config`]: CLI and TOML configuration for the binary

pub mod config;
pub mod handler;
pub mod proxy;
pub mod server;

pub use handler::{abort, AbortHandler, Greeting, Handler};
pub use proxy::{ProxyError, TcpReverseProxy};
pub use server::{listen_and_serve, Context, Listener, Server, ServerError, Stream};
