//! Newline-delimited transport over async byte streams

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::error::{IpcResult, ProtocolError};

/// Outcome of reading one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line, without its terminator
    Line(String),
    /// A line longer than the cap; its bytes were discarded up to the newline
    Oversized { len: usize },
    /// The stream is closed
    Eof,
}

/// Reads `\n`-terminated lines with an upper bound on line length.
///
/// An over-long line is skipped rather than buffered, so a garbled peer
/// cannot make the reader grow without bound and the stream resynchronises
/// at the next newline.
pub struct LineReader<R> {
    inner: BufReader<R>,
    max_line_length: usize,
    buf: Vec<u8>,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, max_line_length: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_line_length,
            buf: Vec::new(),
        }
    }

    /// Read the next line.
    ///
    /// Invalid UTF-8 fails only the current line; the reader stays usable.
    pub async fn next_line(&mut self) -> IpcResult<LineRead> {
        self.buf.clear();
        let mut consumed = 0usize;
        let mut oversized = false;

        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if consumed == 0 {
                    return Ok(LineRead::Eof);
                }
                // Unterminated final line
                break;
            }

            let (take, done) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };

            if !oversized {
                let content = self.buf.len() + take - usize::from(done);
                if content > self.max_line_length {
                    oversized = true;
                    self.buf.clear();
                } else {
                    self.buf.extend_from_slice(&available[..take]);
                }
            }

            consumed += take;
            self.inner.consume(take);

            if done {
                break;
            }
        }

        if oversized {
            trace!(len = consumed, limit = self.max_line_length, "Discarded oversized line");
            return Ok(LineRead::Oversized { len: consumed });
        }

        while matches!(self.buf.last(), Some(b'\n') | Some(b'\r')) {
            self.buf.pop();
        }

        let line = String::from_utf8(std::mem::take(&mut self.buf))
            .map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(LineRead::Line(line))
    }
}

/// Writes one line at a time, each followed by `\n` and a flush
pub struct LineWriter<W> {
    inner: W,
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self { inner: writer }
    }

    /// Write a single line. Lines carrying a raw newline are refused.
    pub async fn write_line(&mut self, line: &str) -> IpcResult<()> {
        if line.contains('\n') {
            return Err(ProtocolError::EmbeddedNewline.into());
        }

        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Close the underlying stream
    pub async fn shutdown(&mut self) -> IpcResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
