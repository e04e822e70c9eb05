//! How a sending session moves file bytes onto the socket.
//!
//! Two interchangeable senders implement [`ChunkSender`]:
//!
//! - [`BufferedSender`] reads a block into memory and writes it out.
//! - [`ZeroCopySender`] lets the kernel move bytes from the file to the
//!   socket (`sendfile` on Linux) without a user-space buffer.
//!
//! Both start at the resume offset, send at most the requested length per
//! call, and report how many bytes left the process. Pacing is handled by
//! the caller through [`RateLimiter`].

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::time::Instant;

use crate::dcc::error::DccError;
use crate::dcc::signal::Outcome;

/// Which sender a transfer uses. Not visible on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStrategy {
    #[default]
    Buffered,
    ZeroCopy,
}

/// Sends the next chunk of a file, honoring the current file offset.
#[allow(async_fn_in_trait)]
pub trait ChunkSender {
    /// Send at most `len` bytes. Returns 0 only when the file is exhausted.
    async fn send_chunk(&mut self, socket: &mut WriteHalf<'_>, len: usize) -> Outcome<usize>;
}

/// Open `path` positioned at `offset` with the requested strategy.
///
/// `ZeroCopy` degrades to `Buffered` on platforms without kernel-assisted
/// file-to-socket copies.
pub(crate) async fn open(
    strategy: SendStrategy,
    path: &Path,
    offset: u64,
    block_size: usize,
) -> Outcome<FileSender> {
    let mut file = File::open(path).await.map_err(DccError::file)?;
    file.seek(SeekFrom::Start(offset)).await.map_err(DccError::file)?;

    match strategy {
        #[cfg(target_os = "linux")]
        SendStrategy::ZeroCopy => Ok(FileSender::ZeroCopy(ZeroCopySender::new(file).await)),
        _ => Ok(FileSender::Buffered(BufferedSender::new(file, block_size))),
    }
}

/// The sender chosen for one session.
pub(crate) enum FileSender {
    Buffered(BufferedSender),
    #[cfg(target_os = "linux")]
    ZeroCopy(ZeroCopySender),
}

impl ChunkSender for FileSender {
    async fn send_chunk(&mut self, socket: &mut WriteHalf<'_>, len: usize) -> Outcome<usize> {
        match self {
            Self::Buffered(sender) => sender.send_chunk(socket, len).await,
            #[cfg(target_os = "linux")]
            Self::ZeroCopy(sender) => sender.send_chunk(socket, len).await,
        }
    }
}

pub struct BufferedSender {
    file: File,
    buf: Vec<u8>,
}

impl BufferedSender {
    fn new(file: File, block_size: usize) -> Self {
        Self {
            file,
            buf: vec![0; block_size.max(1)],
        }
    }
}

impl ChunkSender for BufferedSender {
    async fn send_chunk(&mut self, socket: &mut WriteHalf<'_>, len: usize) -> Outcome<usize> {
        let len = len.min(self.buf.len());
        let n = self
            .file
            .read(&mut self.buf[..len])
            .await
            .map_err(DccError::file)?;
        if n > 0 {
            socket
                .write_all(&self.buf[..n])
                .await
                .map_err(DccError::transport)?;
        }
        Ok(n)
    }
}

#[cfg(target_os = "linux")]
pub use zero_copy::ZeroCopySender;

#[cfg(target_os = "linux")]
mod zero_copy {
    use std::io::{self, Read, Seek};
    use std::os::fd::AsFd;

    use tokio::io::Interest;
    use tokio::net::tcp::WriteHalf;
    use tokio::net::TcpStream;

    use super::ChunkSender;
    use crate::dcc::error::DccError;
    use crate::dcc::signal::Outcome;

    /// Kernel-assisted sender.
    ///
    /// `std::io::copy` from a `File` into a `TcpStream` is specialised to
    /// `sendfile` on Linux. The copy runs against a duplicate of tokio's
    /// non-blocking socket inside `try_io`, so a full socket buffer yields
    /// `WouldBlock` instead of parking the runtime. Progress is read back
    /// from the file position, which `sendfile` advances.
    pub struct ZeroCopySender {
        file: std::fs::File,
    }

    impl ZeroCopySender {
        pub(super) async fn new(file: tokio::fs::File) -> Self {
            Self {
                file: file.into_std().await,
            }
        }
    }

    impl ChunkSender for ZeroCopySender {
        async fn send_chunk(&mut self, socket: &mut WriteHalf<'_>, len: usize) -> Outcome<usize> {
            let stream: &TcpStream = socket.as_ref();
            // Shares the open socket (and its O_NONBLOCK flag); dropping it
            // closes only the duplicate descriptor.
            let sink = std::net::TcpStream::from(
                stream
                    .as_fd()
                    .try_clone_to_owned()
                    .map_err(DccError::transport)?,
            );
            let file = &self.file;

            loop {
                stream.writable().await.map_err(DccError::transport)?;

                let start = position(file)?;
                let copied = stream.try_io(Interest::WRITABLE, || {
                    io::copy(&mut file.take(len as u64), &mut &sink)
                });
                let sent = (position(file)? - start) as usize;

                match copied {
                    Ok(_) => return Ok(sent),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if sent > 0 {
                            return Ok(sent);
                        }
                    }
                    Err(e) => return Err(DccError::transport(e)),
                }
            }
        }
    }

    fn position(mut file: &std::fs::File) -> Outcome<u64> {
        file.stream_position().map_err(DccError::file)
    }
}

/// Paces a sender so cumulative throughput stays at or below `rate`
/// bytes per second. Never drops data; only computes waits.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    rate: u64,
    started: Instant,
    sent: u64,
}

impl RateLimiter {
    pub fn new(rate: u64) -> Self {
        Self {
            rate: rate.max(1),
            started: Instant::now(),
            sent: 0,
        }
    }

    /// Chunk size to use so a single write never exceeds one second's
    /// allowance.
    pub fn chunk_len(&self, block_size: usize) -> usize {
        let per_second = usize::try_from(self.rate).unwrap_or(usize::MAX);
        block_size.min(per_second).max(1)
    }

    /// Record `n` bytes written and return how long to wait before the
    /// next write.
    pub fn record(&mut self, n: usize) -> Duration {
        self.sent += n as u64;
        let due = Duration::from_secs_f64(self.sent as f64 / self.rate as f64);
        due.saturating_sub(self.started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_paces_cumulative_bytes() {
        let mut limiter = RateLimiter::new(1000);
        assert_eq!(limiter.chunk_len(65536), 1000);
        assert_eq!(limiter.chunk_len(100), 100);

        assert_eq!(limiter.record(500), Duration::from_millis(500));
        tokio::time::sleep(Duration::from_millis(500)).await;
        let wait = limiter.record(500);
        assert!(wait <= Duration::from_millis(500));
        assert!(wait >= Duration::from_millis(490));

        // Falling behind schedule means no wait
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(limiter.record(1000), Duration::ZERO);
    }

    #[test]
    fn test_strategy_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            strategy: SendStrategy,
        }
        let parsed: Wrapper = toml::from_str("strategy = \"zero_copy\"").unwrap();
        assert_eq!(parsed.strategy, SendStrategy::ZeroCopy);
        assert_eq!(SendStrategy::default(), SendStrategy::Buffered);
    }
}
