//! In-memory byte pipe between a log feed and a pump read loop.
//!
//! The writer half can be shared and closed from either side. Once closed,
//! the reader drains what is buffered and then sees end-of-stream, and every
//! further write fails with `BrokenPipe`.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::Mutex;

const PIPE_BUFFER: usize = 64 * 1024;

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (write_half, read_half) = tokio::io::duplex(PIPE_BUFFER);
    let writer = PipeWriter {
        inner: Arc::new(Mutex::new(Some(write_half))),
    };
    let reader = PipeReader {
        inner: read_half,
        writer: writer.clone(),
    };
    (writer, reader)
}

#[derive(Clone, Debug)]
pub struct PipeWriter {
    inner: Arc<Mutex<Option<DuplexStream>>>,
}

impl PipeWriter {
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.inner.lock().await;
        match guard.as_mut() {
            Some(stream) => stream.write_all(buf).await,
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")),
        }
    }

    /// Closes the pipe. Idempotent.
    pub async fn close(&self) {
        let stream = self.inner.lock().await.take();
        if let Some(mut stream) = stream {
            let _ = stream.shutdown().await;
        }
    }

    #[cfg(test)]
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

#[derive(Debug)]
pub struct PipeReader {
    inner: DuplexStream,
    writer: PipeWriter,
}

impl PipeReader {
    /// Handle that closes the writing end of this pipe.
    pub fn closer(&self) -> PipeWriter {
        self.writer.clone()
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
