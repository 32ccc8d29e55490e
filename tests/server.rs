//! Server lifecycle tests over loopback sockets.

mod common;

use async_trait::async_trait;
use common::{spawn_server, TEST_TIMEOUT};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcp_gateway::handler::GREETING;
use tcp_gateway::{Context, Handler, Server, ServerError, Stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn read_all(addr: SocketAddr) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut buf))
        .await
        .expect("server did not close the connection")
        .unwrap();
    buf
}

struct Counting {
    calls: AtomicU64,
}

#[async_trait]
impl Handler for Counting {
    async fn serve(&self, _ctx: &Context, stream: &mut Stream) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = stream.write_all(b"ok").await;
    }
}

struct Panicking;

#[async_trait]
impl Handler for Panicking {
    async fn serve(&self, _ctx: &Context, stream: &mut Stream) {
        let _ = stream.write_all(b"partial").await;
        panic!("handler blew up");
    }
}

struct Aborting;

#[async_trait]
impl Handler for Aborting {
    async fn serve(&self, _ctx: &Context, _stream: &mut Stream) {
        tcp_gateway::abort();
    }
}

struct ReadOnce {
    results: mpsc::UnboundedSender<io::Result<usize>>,
}

#[async_trait]
impl Handler for ReadOnce {
    async fn serve(&self, _ctx: &Context, stream: &mut Stream) {
        let mut buf = [0u8; 16];
        let _ = self.results.send(stream.read(&mut buf).await);
    }
}

struct Addresses {
    seen: mpsc::UnboundedSender<(Option<SocketAddr>, Option<SocketAddr>, Option<String>)>,
}

#[async_trait]
impl Handler for Addresses {
    async fn serve(&self, ctx: &Context, _stream: &mut Stream) {
        let _ = self.seen.send((
            ctx.peer_addr(),
            ctx.local_addr(),
            ctx.server_addr().map(str::to_string),
        ));
    }
}

struct WaitForShutdown;

#[async_trait]
impl Handler for WaitForShutdown {
    async fn serve(&self, ctx: &Context, stream: &mut Stream) {
        let _ = stream.write_all(b"hi\n").await;
        ctx.done().await;
        let _ = stream.write_all(b"bye\n").await;
    }
}

#[tokio::test]
async fn test_default_handler_greets_and_keeps_serving() {
    let server = Server::new("127.0.0.1:0");
    let (addr, handle) = spawn_server(&server).await;

    assert_eq!(read_all(addr).await, GREETING);
    assert_eq!(read_all(addr).await, GREETING);
    assert!(!handle.is_finished());

    server.close().unwrap();
    let result = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ServerError::Closed)));
}

#[tokio::test]
async fn test_each_connection_served_once() {
    let handler = Arc::new(Counting {
        calls: AtomicU64::new(0),
    });
    let server = Server::builder("127.0.0.1:0")
        .handler(handler.clone())
        .build();
    let (addr, _handle) = spawn_server(&server).await;

    let clients: Vec<_> = (0..32).map(|_| tokio::spawn(read_all(addr))).collect();
    for client in clients {
        assert_eq!(client.await.unwrap(), b"ok");
    }

    assert_eq!(handler.calls.load(Ordering::SeqCst), 32);
    server.close().unwrap();
}

#[tokio::test]
async fn test_close_before_listen() {
    let server = Server::new("127.0.0.1:0");
    server.close().unwrap();

    let result = server.listen_and_serve().await;
    assert!(matches!(result, Err(ServerError::Closed)));
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn test_missing_address() {
    let server = Server::new("");
    let result = server.listen_and_serve().await;
    assert!(matches!(result, Err(ServerError::MissingAddress)));
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = Server::new(taken.local_addr().unwrap().to_string());
    let result = server.listen_and_serve().await;
    assert!(matches!(result, Err(ServerError::Bind { .. })));
}

#[tokio::test]
async fn test_listen_and_serve_binds_configured_address() {
    let server = Server::new("127.0.0.1:0");
    let handle = {
        let server = server.clone();
        tokio::spawn(async move { server.listen_and_serve().await })
    };

    let addr = timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(addr) = server.local_addr() {
                break addr;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(read_all(addr).await, GREETING);
    server.close().unwrap();
    let result = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ServerError::Closed)));
}

#[tokio::test]
async fn test_concurrent_close() {
    let server = Server::new("127.0.0.1:0");
    let (addr, handle) = spawn_server(&server).await;
    assert_eq!(read_all(addr).await, GREETING);

    let closers: Vec<_> = (0..16)
        .map(|_| {
            let server = server.clone();
            tokio::spawn(async move { server.close() })
        })
        .collect();
    for closer in closers {
        assert!(closer.await.unwrap().is_ok());
    }

    let result = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ServerError::Closed)));
    assert!(server.is_shutting_down());
    assert!(server.close().is_ok());

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_panicking_handler_closes_connection() {
    let server = Server::builder("127.0.0.1:0")
        .handler(Arc::new(Panicking))
        .build();
    let (addr, handle) = spawn_server(&server).await;

    assert_eq!(read_all(addr).await, b"partial");
    assert_eq!(read_all(addr).await, b"partial");
    assert!(!handle.is_finished());
    server.close().unwrap();
}

#[tokio::test]
async fn test_abort_closes_connection() {
    let server = Server::builder("127.0.0.1:0")
        .handler(Arc::new(Aborting))
        .build();
    let (addr, _handle) = spawn_server(&server).await;

    assert!(read_all(addr).await.is_empty());
    assert!(read_all(addr).await.is_empty());
    server.close().unwrap();
}

#[tokio::test]
async fn test_read_timeout_applied_before_handler() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Server::builder("127.0.0.1:0")
        .handler(Arc::new(ReadOnce { results: tx }))
        .read_timeout(Duration::from_millis(50))
        .keep_alive(Duration::from_secs(30))
        .build();
    let (addr, _handle) = spawn_server(&server).await;

    let _client = TcpStream::connect(addr).await.unwrap();
    let result = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    server.close().unwrap();
}

#[tokio::test]
async fn test_unbounded_timeouts_keep_serving() {
    let server = Server::builder("127.0.0.1:0")
        .read_timeout(Duration::MAX)
        .write_timeout(Duration::MAX)
        .build();
    let (addr, handle) = spawn_server(&server).await;

    assert_eq!(read_all(addr).await, GREETING);
    assert_eq!(read_all(addr).await, GREETING);
    assert!(!handle.is_finished());

    server.close().unwrap();
    let result = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ServerError::Closed)));
}

#[tokio::test]
async fn test_data_within_read_timeout() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Server::builder("127.0.0.1:0")
        .handler(Arc::new(ReadOnce { results: tx }))
        .read_timeout(Duration::from_secs(5))
        .build();
    let (addr, _handle) = spawn_server(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"abc").await.unwrap();
    let result = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(result.unwrap(), 3);
    server.close().unwrap();
}

#[tokio::test]
async fn test_context_carries_addresses() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Server::builder("127.0.0.1:0")
        .handler(Arc::new(Addresses { seen: tx }))
        .build();
    let (addr, _handle) = spawn_server(&server).await;

    let client = TcpStream::connect(addr).await.unwrap();
    let (peer, local, server_addr) = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(peer, Some(client.local_addr().unwrap()));
    assert_eq!(local, Some(addr));
    assert_eq!(server_addr.as_deref(), Some("127.0.0.1:0"));
    server.close().unwrap();
}

#[tokio::test]
async fn test_close_cancels_live_connection_contexts() {
    let server = Server::builder("127.0.0.1:0")
        .handler(Arc::new(WaitForShutdown))
        .build();
    let (addr, handle) = spawn_server(&server).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut hello = [0u8; 3];
    client.read_exact(&mut hello).await.unwrap();
    assert_eq!(&hello, b"hi\n");

    server.close().unwrap();
    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rest, b"bye\n");

    let result = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ServerError::Closed)));
}

#[tokio::test]
async fn test_base_context_cancellation_stops_server() {
    let base = Context::background();
    let server = Server::builder("127.0.0.1:0")
        .base_context(base.clone())
        .build();
    let (_addr, handle) = spawn_server(&server).await;

    base.cancel();
    let result = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    assert!(matches!(result, Err(ServerError::Closed)));
    assert!(server.is_shutting_down());
}
