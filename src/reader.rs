//! Upload sources.
//!
//! Save operations need the full payload in memory before dispatch (the
//! chunk engine slices one contiguous buffer), plus the length up front so
//! the worker can preallocate. A `RewindReader` provides both, and can be
//! re-read from the start if a command is retried.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};

/// A fully re-readable upload source with a known length.
pub trait RewindReader: AsyncRead + Send + Unpin {
    /// Total number of bytes the reader yields.
    fn length(&self) -> u64;

    /// Reset to the start of the stream.
    fn rewind(&mut self);
}

/// In-memory [`RewindReader`].
#[derive(Debug, Clone)]
pub struct ByteReader {
    cursor: io::Cursor<Bytes>,
}

impl ByteReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            cursor: io::Cursor::new(data.into()),
        }
    }
}

impl AsyncRead for ByteReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.cursor).poll_read(cx, buf)
    }
}

impl RewindReader for ByteReader {
    fn length(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    fn rewind(&mut self) {
        self.cursor.set_position(0);
    }
}
