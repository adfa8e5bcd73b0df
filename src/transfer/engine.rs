//! Drives one file's bytes across a framed connection.
//!
//! The sender knows the true end of file. The receiver only knows that the
//! sender went quiet for the idle timeout, so a stalled link and a finished
//! file look the same. Nothing here verifies length or content.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::codec::{strip_padding, BodyRead, FrameReader, FrameWriter};
use crate::common::TransferError;

/// What ended a transfer pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndSignal {
    /// Sender reached end of file
    SourceExhausted,
    /// Receiver heard nothing for the idle timeout
    IdleTimeout,
    /// Receiver saw a zero-length read
    PeerClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Content bytes, padding excluded
    pub bytes: u64,
    /// Frames written by a sender, receives completed by a receiver
    pub chunks: u64,
    pub ended_by: EndSignal,
}

impl TransferStats {
    fn new(ended_by: EndSignal) -> Self {
        Self {
            bytes: 0,
            chunks: 0,
            ended_by,
        }
    }
}

/// Streams `path` as text lines, one frame per line (long lines are split).
pub async fn send_file<W: AsyncWrite + Unpin>(
    path: &Path,
    writer: &mut FrameWriter<W>,
) -> Result<TransferStats, TransferError> {
    // nothing has hit the wire yet, so the caller can keep the session
    let file = File::open(path)
        .await
        .map_err(|source| TransferError::FileNotFound {
            path: path.to_path_buf(),
            source,
        })?;

    let chunk_size = writer.chunk_size();
    let mut lines = BufReader::new(file);
    let mut line = Vec::with_capacity(chunk_size);
    let mut stats = TransferStats::new(EndSignal::SourceExhausted);

    loop {
        line.clear();
        // at most one frame's worth, stopping after a newline
        let n = (&mut lines)
            .take(chunk_size as u64)
            .read_until(b'\n', &mut line)
            .await
            .map_err(|source| TransferError::FileRead {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }

        writer.write_chunk(&line).await?;
        stats.bytes += n as u64;
        stats.chunks += 1;
    }

    writer.flush().await?;

    tracing::debug!(
        file = %path.display(),
        bytes = stats.bytes,
        chunks = stats.chunks,
        "file_sent"
    );
    Ok(stats)
}

/// Receives one body into `dest` until the idle timeout (or close) ends it.
///
/// `dest` is created on the first received bytes, so a pass with no body
/// leaves no file behind. Local file errors do not stop the pass: the body
/// is still drained so the next frame on the connection lines up.
pub async fn receive_file<R: AsyncRead + Unpin>(
    dest: &Path,
    reader: &mut FrameReader<R>,
    idle_timeout: Duration,
) -> Result<TransferStats, TransferError> {
    receive_into(dest, Sink::file(dest), reader, idle_timeout).await
}

/// Like [`receive_file`], but `dest` is created before the first receive.
///
/// Used once the sender has named the file, so an empty file still shows up.
pub async fn receive_entry_file<R: AsyncRead + Unpin>(
    dest: &Path,
    reader: &mut FrameReader<R>,
    idle_timeout: Duration,
) -> Result<TransferStats, TransferError> {
    let mut sink = Sink::file(dest);
    // a failed create is reported after the body has been drained
    sink.open().await;
    receive_into(dest, sink, reader, idle_timeout).await
}

async fn receive_into<R: AsyncRead + Unpin>(
    dest: &Path,
    mut sink: Sink,
    reader: &mut FrameReader<R>,
    idle_timeout: Duration,
) -> Result<TransferStats, TransferError> {
    let received = drain_into(reader, idle_timeout, &mut sink).await;
    // flush whatever made it to disk, even if the connection broke
    let finished = sink.finish().await;
    let stats = received?;
    finished?;

    tracing::debug!(
        file = %dest.display(),
        bytes = stats.bytes,
        ended_by = ?stats.ended_by,
        "file_received"
    );
    Ok(stats)
}

/// Receives and drops one body.
pub async fn discard_body<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    idle_timeout: Duration,
) -> Result<TransferStats, TransferError> {
    drain_into(reader, idle_timeout, &mut Sink::Discard).await
}

async fn drain_into<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    idle_timeout: Duration,
    sink: &mut Sink,
) -> Result<TransferStats, TransferError> {
    let mut reader = reader.scoped_timeout(idle_timeout);
    let mut buf = vec![0u8; reader.chunk_size()];
    let mut stats = TransferStats::new(EndSignal::IdleTimeout);

    stats.ended_by = loop {
        match reader.read_body(&mut buf).await? {
            BodyRead::Data(n) => {
                stats.chunks += 1;
                let text = strip_padding(&buf[..n]);
                if !text.is_empty() {
                    stats.bytes += sink.accept(&text).await;
                }
            }
            BodyRead::Idle => break EndSignal::IdleTimeout,
            BodyRead::Closed => break EndSignal::PeerClosed,
        }
    };

    Ok(stats)
}

enum Sink {
    File {
        path: PathBuf,
        file: Option<File>,
        failed: Option<TransferError>,
    },
    Discard,
}

impl Sink {
    fn file(path: &Path) -> Self {
        Sink::File {
            path: path.to_path_buf(),
            file: None,
            failed: None,
        }
    }

    /// Creates (truncating) the destination unless it is already open or has failed.
    async fn open(&mut self) {
        let Sink::File { path, file, failed } = self else {
            return;
        };
        if file.is_some() || failed.is_some() {
            return;
        }

        match File::create(&*path).await {
            Ok(created) => *file = Some(created),
            Err(source) => {
                *failed = Some(TransferError::FileCreate {
                    path: path.clone(),
                    source,
                });
            }
        }
    }

    /// Returns the number of bytes kept.
    async fn accept(&mut self, data: &[u8]) -> u64 {
        // first bytes of the body create the file
        self.open().await;

        let Sink::File { path, file, failed } = self else {
            return 0;
        };
        if failed.is_some() {
            return 0;
        }

        if let Some(open) = file.as_mut() {
            if let Err(source) = open.write_all(data).await {
                *failed = Some(TransferError::FileWrite {
                    path: path.clone(),
                    source,
                });
                return 0;
            }
        }
        data.len() as u64
    }

    async fn finish(self) -> Result<(), TransferError> {
        let Sink::File { path, file, failed } = self else {
            return Ok(());
        };
        if let Some(err) = failed {
            return Err(err);
        }
        if let Some(mut open) = file {
            open.flush()
                .await
                .map_err(|source| TransferError::FileWrite { path, source })?;
        }
        Ok(())
    }
}
