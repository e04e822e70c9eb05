//! DCC SEND: move one file over the session socket.
//!
//! The offering side reads the file and writes it to the socket through a
//! [`ChunkSender`], optionally paced by a [`RateLimiter`]. The accepting
//! side writes what it receives to disk and acknowledges every chunk with
//! the running position as a 4-byte big-endian integer.
//!
//! A resumed transfer starts at the offset both sides agreed on during the
//! RESUME/ACCEPT exchange. The sender seeks to it; the receiver appends to
//! its partial file, which must be exactly that long.

use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::dcc::error::DccError;
use crate::dcc::registry::Role;
use crate::dcc::session::{Connected, Endpoint, SessionCore};
use crate::dcc::signal::Outcome;
use crate::dcc::strategy::{self, ChunkSender, RateLimiter, SendStrategy};

/// Per-session transfer settings, fixed at `create` time.
#[derive(Debug, Clone)]
pub(crate) struct TransferPlan {
    pub path: PathBuf,
    pub block_size: usize,
    /// Bytes per second; `None` sends as fast as the socket allows.
    pub limit_rate: Option<u64>,
    pub strategy: SendStrategy,
}

pub(crate) async fn run(core: SessionCore, endpoint: Endpoint, plan: TransferPlan) {
    let outcome = match core.connect(endpoint).await {
        Ok(connected) => match core.handle.key().id.role {
            Role::Offering => send(&core, connected, &plan).await,
            Role::Accepting => receive(&core, connected, &plan).await,
        },
        Err(e) => Err(e),
    };
    core.finish(outcome);
}

async fn send(core: &SessionCore, connected: Connected, plan: &TransferPlan) -> Outcome<()> {
    let handle = &core.handle;
    let size = handle.size().unwrap_or(0);
    let offset = connected.offset;
    handle.set_offset(offset);

    let mut file = strategy::open(plan.strategy, &plan.path, offset, plan.block_size).await?;
    let mut limiter = plan.limit_rate.map(RateLimiter::new);
    let chunk = limiter
        .as_ref()
        .map_or(plan.block_size, |l| l.chunk_len(plan.block_size)) as u64;
    let idle = core.idle();

    let mut stream = connected.stream;
    let (mut reader, mut writer) = stream.split();

    let pump = async {
        let mut position = offset;
        while position < size {
            let want = (size - position).min(chunk) as usize;
            let n = file.send_chunk(&mut writer, want).await?;
            if n == 0 {
                return Err(DccError::file(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("source file ended at {position} of {size} bytes"),
                )));
            }
            position += n as u64;
            handle.set_offset(position);
            core.mark_started();
            idle.touch();

            if let Some(limiter) = limiter.as_mut() {
                let wait = limiter.record(n);
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(key = %handle.key(), error = %e, "shutdown after send failed");
        }
        Ok::<_, DccError>(())
    };

    // Done once the receiver acknowledged the last byte, or hung up after
    // it was written.
    let acks = async {
        let mut ack = [0u8; 4];
        loop {
            match reader.read_exact(&mut ack).await {
                Ok(_) => {
                    idle.touch();
                    if handle.offset() >= size && u32::from_be_bytes(ack) == size as u32 {
                        return Ok(());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    let sent = handle.offset();
                    return if sent >= size {
                        Ok(())
                    } else {
                        Err(DccError::early_eof(sent, size))
                    };
                }
                Err(e) => return Err(DccError::transport(e)),
            }
        }
    };

    let mut interrupt = core.interrupt();
    tokio::select! {
        done = async { tokio::try_join!(pump, acks) } => done.map(|_| ()),
        err = interrupt.wait() => Err(err),
    }
}

async fn receive(core: &SessionCore, connected: Connected, plan: &TransferPlan) -> Outcome<()> {
    let handle = &core.handle;
    let size = handle.size();
    let offset = connected.offset;

    if let Some(parent) = plan.path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(DccError::file)?;
    }
    let mut file = if offset > 0 {
        let file = OpenOptions::new()
            .append(true)
            .open(&plan.path)
            .await
            .map_err(DccError::file)?;
        let on_disk = file.metadata().await.map_err(DccError::file)?.len();
        if on_disk != offset {
            return Err(DccError::ResumeMismatch {
                expected: offset,
                actual: on_disk,
            });
        }
        file
    } else {
        File::create(&plan.path).await.map_err(DccError::file)?
    };
    handle.set_offset(offset);

    let idle = core.idle();
    let mut stream = connected.stream;
    let mut buf = vec![0u8; plan.block_size.max(1)];

    let transfer = async {
        let mut position = offset;
        loop {
            let want = match size {
                Some(size) if position >= size => break,
                Some(size) => (size - position).min(buf.len() as u64) as usize,
                None => buf.len(),
            };
            let n = stream
                .read(&mut buf[..want])
                .await
                .map_err(DccError::transport)?;
            if n == 0 {
                match size {
                    Some(size) => return Err(DccError::early_eof(position, size)),
                    None => break,
                }
            }

            file.write_all(&buf[..n]).await.map_err(DccError::file)?;
            position += n as u64;
            handle.set_offset(position);
            core.mark_started();
            idle.touch();

            // Some senders never read acknowledgements
            if let Err(e) = stream.write_all(&(position as u32).to_be_bytes()).await {
                tracing::debug!(key = %handle.key(), position, error = %e, "ack not delivered");
            }
        }
        file.flush().await.map_err(DccError::file)?;
        Ok(())
    };

    let mut interrupt = core.interrupt();
    tokio::select! {
        done = transfer => done,
        err = interrupt.wait() => Err(err),
    }
}
