//! Streaming endpoint plumbing.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::is_stream_eof;

/// Boxed reader handed out for streaming responses (logs, stats, archive
/// export, events).
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed writer handed out for streaming requests (archive import, stdin).
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reader adapter that treats EOF-tagged transport errors as a clean end of
/// stream.
///
/// Long-poll and attach RPCs terminate by dropping the connection, which the
/// transport reports as an error whose message carries the wire EOF marker.
/// Callers of streaming reads must observe that as `Ok(0)`, not as a failure.
pub struct EofTolerantReader<R> {
    inner: R,
    done: bool,
}

impl<R> EofTolerantReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, done: false }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EofTolerantReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.done {
            return Poll::Ready(Ok(()));
        }
        match ready!(Pin::new(&mut self.inner).poll_read(cx, buf)) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e)
                if e.kind() == io::ErrorKind::UnexpectedEof
                    || is_stream_eof(&e.to_string()) =>
            {
                self.done = true;
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
