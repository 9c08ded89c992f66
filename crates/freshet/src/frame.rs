//! Line framing — splits an incoming byte stream into complete UTF-8 lines.
//!
//! Splitting happens at the byte level, so multi-byte UTF-8 sequences that
//! straddle input chunks reassemble correctly: a `\n` byte can never occur
//! inside a multi-byte sequence. Content is not interpreted here.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::io::{AsyncRead, ReadBuf};

use freshet_core::wire::WireError;

/// Stateful byte-to-line transform.
///
/// Push input chunks in arrival order; each push yields every line that
/// completed, without its `\n` terminator. The trailing fragment stays
/// buffered. A well-formed stream ends with `\n` on its last line, so any
/// residual at end-of-input is discarded by simply dropping the framer.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        LineFramer {
            buffer: BytesMut::new(),
        }
    }

    /// Append a chunk and drain every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, WireError> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(newline + 1);
            let line = &line[..line.len() - 1];
            let line = std::str::from_utf8(line).map_err(|_| WireError::Utf8)?;
            lines.push(line.to_string());
        }
        Ok(lines)
    }

    /// Bytes currently buffered without a terminator.
    pub fn residual_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Adapt a reader-style source to the byte-chunk stream the consumer
/// entry point takes.
pub fn reader_stream<R>(reader: R) -> ReaderStream<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    ReaderStream {
        reader,
        buf: vec![0u8; READ_CHUNK],
        done: false,
    }
}

const READ_CHUNK: usize = 8 * 1024;

pub struct ReaderStream<R> {
    reader: R,
    buf: Vec<u8>,
    done: bool,
}

impl<R> Stream for ReaderStream<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let mut read_buf = ReadBuf::new(&mut this.buf);
        match Pin::new(&mut this.reader).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if filled.is_empty() {
                    this.done = true;
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(Bytes::copy_from_slice(filled))))
                }
            }
        }
    }
}
