//! One-direction byte copy.

use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy buffer size
const BUFFER_SIZE: usize = 8 * 1024;

/// Outcome of [`bytes_copy`]: bytes written, and the first error if any.
#[derive(Debug)]
pub struct Copied {
    pub bytes: u64,
    pub result: io::Result<()>,
}

/// Drain `src` into `dst` until EOF or the first error on either side.
///
/// On EOF `dst` is flushed but not shut down; half-closing is the caller's
/// decision. Nothing is retried.
pub async fn bytes_copy<R, W>(src: &mut R, dst: &mut W) -> Copied
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);
    let mut bytes = 0u64;

    loop {
        buf.clear();
        match src.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    return Copied {
                        bytes,
                        result: Err(e),
                    };
                }
                bytes += n as u64;
            }
            Err(e) => {
                return Copied {
                    bytes,
                    result: Err(e),
                }
            }
        }
    }

    Copied {
        bytes,
        result: dst.flush().await,
    }
}
