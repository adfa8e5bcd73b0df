//! Fixed-size frames over a byte stream.
//!
//! Every frame is zero-padded to its full size. Tokens (commands and file
//! names) use `token_size` frames, file bodies use `chunk_size` frames.
//! There is no length prefix: a body ends when the reader sees silence for
//! its idle timeout, or the peer closes.

use bytes::BytesMut;
use std::io;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{CodecError, TransferSettings};

/// Outcome of one body receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyRead {
    Data(usize),
    /// Receive timeout elapsed with nothing to read
    Idle,
    /// Zero-length read, peer closed its side
    Closed,
}

/// Copies `payload` into a zeroed frame of `frame_size` bytes.
pub fn encode_frame(payload: &[u8], frame_size: usize) -> BytesMut {
    debug_assert!(payload.len() <= frame_size);
    let mut frame = BytesMut::zeroed(frame_size);
    frame[..payload.len()].copy_from_slice(payload);
    frame
}

/// Token text runs up to the first NUL.
pub fn decode_token(frame: &[u8]) -> Result<&str, CodecError> {
    let end = frame.iter().position(|&b| b == 0).unwrap_or(frame.len());
    std::str::from_utf8(&frame[..end]).map_err(|_| CodecError::InvalidToken)
}

/// Drops frame padding from received body bytes.
///
/// Receives are not aligned to frames, so padding can sit anywhere in the
/// buffer. Content NUL bytes are lost too; the transport is text only.
pub fn strip_padding(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().copied().filter(|&b| b != 0).collect()
}

async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read half of a framed connection.
pub struct FrameReader<R> {
    inner: R,
    token_size: usize,
    chunk_size: usize,
    /// `None` blocks until the peer sends
    timeout: Option<Duration>,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R, settings: &TransferSettings) -> Self {
        Self {
            inner,
            token_size: settings.token_size,
            chunk_size: settings.chunk_size,
            timeout: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Installs `timeout` until the returned guard drops, then restores the previous value.
    pub fn scoped_timeout(&mut self, timeout: Duration) -> TimeoutScope<'_, R> {
        let previous = self.timeout.replace(timeout);
        TimeoutScope {
            reader: self,
            previous,
        }
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Reads one token frame. `Ok(None)` means the peer closed between frames.
    pub async fn read_token(&mut self) -> Result<Option<String>, CodecError> {
        let mut frame = vec![0u8; self.token_size];
        let filled = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fill(&mut self.inner, &mut frame))
                .await
                .map_err(|_| CodecError::Timeout)??,
            None => fill(&mut self.inner, &mut frame).await?,
        };

        if filled == 0 {
            return Ok(None);
        }
        if filled < frame.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated token frame").into());
        }
        decode_token(&frame).map(|token| Some(token.to_string()))
    }

    /// One receive bounded by the current timeout.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> io::Result<BodyRead> {
        let n = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.inner.read(buf)).await {
                Ok(read) => read?,
                Err(_) => return Ok(BodyRead::Idle),
            },
            None => self.inner.read(buf).await?,
        };

        if n == 0 {
            Ok(BodyRead::Closed)
        } else {
            Ok(BodyRead::Data(n))
        }
    }
}

/// Restores the reader's previous timeout on drop, including on early return.
pub struct TimeoutScope<'a, R> {
    reader: &'a mut FrameReader<R>,
    previous: Option<Duration>,
}

impl<R> Deref for TimeoutScope<'_, R> {
    type Target = FrameReader<R>;

    fn deref(&self) -> &Self::Target {
        &*self.reader
    }
}

impl<R> DerefMut for TimeoutScope<'_, R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.reader
    }
}

impl<R> Drop for TimeoutScope<'_, R> {
    fn drop(&mut self) {
        self.reader.timeout = self.previous;
    }
}

/// Write half of a framed connection.
pub struct FrameWriter<W> {
    inner: W,
    token_size: usize,
    chunk_size: usize,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W, settings: &TransferSettings) -> Self {
        Self {
            inner,
            token_size: settings.token_size,
            chunk_size: settings.chunk_size,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Fails if `token` does not fit one token frame.
    pub fn check_token(&self, token: &str) -> Result<(), CodecError> {
        if token.len() > self.token_size {
            return Err(CodecError::TokenTooLong {
                len: token.len(),
                limit: self.token_size,
            });
        }
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Sends a command or file name as one padded token frame.
    pub async fn write_token(&mut self, token: &str) -> Result<(), CodecError> {
        self.check_token(token)?;
        let frame = encode_frame(token.as_bytes(), self.token_size);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Sends up to `chunk_size` bytes of body as one padded frame.
    pub async fn write_chunk(&mut self, payload: &[u8]) -> io::Result<()> {
        if payload.len() > self.chunk_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("chunk of {} bytes exceeds frame size {}", payload.len(), self.chunk_size),
            ));
        }
        let frame = encode_frame(payload, self.chunk_size);
        self.inner.write_all(&frame).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
