//! Accepted connection stream with absolute I/O deadlines.
//!
//! Tokio sockets have no notion of a deadline, so `Stream` keeps one timer
//! per direction. Once a timer fires, every pending and future operation in
//! that direction fails with `TimedOut` until the deadline is moved or
//! cleared.

use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

#[derive(Debug)]
pub struct Stream {
    inner: TcpStream,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl Stream {
    pub fn new(inner: TcpStream) -> Self {
        Self {
            inner,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// Fail reads at `deadline`. `None` clears it.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    /// Fail writes at `deadline`. `None` clears it.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline.as_ref().map(|s| s.deadline())
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline.as_ref().map(|s| s.deadline())
    }

    /// Enable TCP keep-alive: first probe after `period` of idleness, then
    /// one every `period`.
    pub fn set_keepalive(&self, period: Duration) -> io::Result<()> {
        set_keepalive(&self.inner, period)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut TcpStream {
        &mut self.inner
    }

    pub fn into_inner(self) -> TcpStream {
        self.inner
    }
}

pub(crate) fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period).with_interval(period);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

fn expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
        Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
        None => false,
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} deadline exceeded"))
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if expired(&mut this.read_deadline, cx) {
            return Poll::Ready(Err(timed_out("read")));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if expired(&mut this.write_deadline, cx) {
            return Poll::Ready(Err(timed_out("write")));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (Stream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Stream::new(server), client)
    }

    #[tokio::test]
    async fn test_read_before_deadline() {
        let (mut stream, mut client) = pair().await;
        stream.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
        client.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_read_deadline_fires() {
        let (mut stream, _client) = pair().await;
        stream.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));

        let mut buf = [0u8; 1];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_expired_write_deadline() {
        let (mut stream, _client) = pair().await;
        stream.set_write_deadline(Some(Instant::now()));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = stream.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        stream.set_write_deadline(None);
        stream.write_all(b"fine").await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_applies() {
        let (stream, _client) = pair().await;
        stream.set_keepalive(Duration::from_secs(60)).unwrap();
        let sock = SockRef::from(stream.get_ref());
        assert!(sock.keepalive().unwrap());
        #[cfg(target_os = "linux")]
        {
            assert_eq!(sock.keepalive_time().unwrap(), Duration::from_secs(60));
            assert_eq!(sock.keepalive_interval().unwrap(), Duration::from_secs(60));
        }
    }
}
