//! Session base: lifecycle signals, idle supervision and connection setup.
//!
//! A session runs as one task. The task owns a [`SessionCore`] (socket,
//! resolvers, timers); callers hold cheap [`SessionHandle`] clones.
//!
//! ```text
//! Connecting ──accept/dial──▶ Ready ──first traffic──▶ Active ──▶ Closed
//!      └───────────── timeout / cancel / error ─────────────────▶ Closed(err)
//! ```
//!
//! `closed` resolves exactly once, through [`SessionCore::finish`], which
//! consumes the core. The registry entry is dropped before `closed`
//! settles, so a caller woken by `closed` never sees a stale entry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};

use crate::dcc::dispatcher::Dispatcher;
use crate::dcc::error::DccError;
use crate::dcc::manager::Shared;
use crate::dcc::registry::{DccType, SessionKey};
use crate::dcc::signal::{signal, Outcome, Resolver, Signal};

/// Caller-side view of a session. Clones share the same session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    key: SessionKey,
    ready: Signal<SocketAddr>,
    started: Signal<()>,
    closed: Signal<()>,
    lines: mpsc::UnboundedSender<String>,
    cancel: watch::Sender<bool>,
    transfer: Option<TransferInfo>,
}

/// File metadata of a `Send` session.
#[derive(Debug)]
pub(crate) struct TransferInfo {
    pub token: String,
    pub size: Option<u64>,
    pub offset: AtomicU64,
}

impl TransferInfo {
    /// `offset` is where the transfer is expected to start: 0, or the
    /// length of a partial file waiting to be resumed.
    pub fn new(token: String, size: Option<u64>, offset: u64) -> Self {
        Self {
            token,
            size,
            offset: AtomicU64::new(offset),
        }
    }
}

impl SessionHandle {
    pub fn key(&self) -> &SessionKey {
        &self.inner.key
    }

    pub fn kind(&self) -> DccType {
        self.inner.key.kind
    }

    pub fn mask(&self) -> &str {
        &self.inner.key.mask
    }

    /// Local listening port when offering, remote port when accepting.
    pub fn port(&self) -> u16 {
        self.inner.key.id.port
    }

    /// Wire filename of a transfer.
    pub fn token(&self) -> Option<&str> {
        self.inner.transfer.as_ref().map(|t| t.token.as_str())
    }

    /// Declared size of a transfer, when known.
    pub fn size(&self) -> Option<u64> {
        self.inner.transfer.as_ref().and_then(|t| t.size)
    }

    /// Absolute file position reached so far. Never decreases once the
    /// transfer has started. A receiver created with `resume(true)` starts
    /// at the length of its partial file, the offset to pass to
    /// [`DccManager::resume`](crate::dcc::DccManager::resume).
    pub fn offset(&self) -> u64 {
        self.inner
            .transfer
            .as_ref()
            .map_or(0, |t| t.offset.load(Ordering::Acquire))
    }

    /// Resolves with the peer address once the socket is connected.
    pub fn ready(&self) -> &Signal<SocketAddr> {
        &self.inner.ready
    }

    /// Resolves once the session carried its first line or chunk.
    pub fn started(&self) -> &Signal<()> {
        &self.inner.started
    }

    /// Resolves exactly once when the session is over.
    pub fn closed(&self) -> &Signal<()> {
        &self.inner.closed
    }

    /// Queue a line for the peer of a chat session. Lines queued before the
    /// session is connected are sent once it is.
    pub fn send_line(&self, line: impl Into<String>) -> Result<(), DccError> {
        if self.kind() != DccType::Chat {
            return Err(DccError::InvalidRequest(
                "lines can only be sent on a chat session".into(),
            ));
        }
        self.inner
            .lines
            .send(line.into())
            .map_err(|_| DccError::InvalidRequest("session is closed".into()))
    }

    /// Ask the session to stop. `closed` settles with
    /// [`DccError::Cancelled`] unless the session already ended.
    pub fn close(&self) {
        self.inner.cancel.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_resolved()
    }

    pub(crate) fn set_offset(&self, offset: u64) {
        if let Some(transfer) = &self.inner.transfer {
            transfer.offset.fetch_max(offset, Ordering::AcqRel);
        }
    }
}

/// Idle deadline shared by everything that moves bytes for a session.
/// A zero timeout never expires.
#[derive(Debug, Clone)]
pub(crate) struct IdleTimer {
    timeout: Duration,
    deadline: Arc<watch::Sender<Instant>>,
}

impl IdleTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Arc::new(watch::Sender::new(Instant::now() + timeout)),
        }
    }

    /// Push the deadline `timeout` into the future.
    pub fn touch(&self) {
        self.deadline.send_replace(Instant::now() + self.timeout);
    }

    /// Completes once the deadline passes without being pushed back.
    pub async fn expired(&self) -> Duration {
        if self.timeout.is_zero() {
            return std::future::pending().await;
        }
        loop {
            let deadline = *self.deadline.borrow();
            sleep_until(deadline).await;
            if *self.deadline.borrow() <= Instant::now() {
                return self.timeout;
            }
        }
    }
}

/// Everything that stops an active session regardless of traffic.
pub(crate) struct Interrupt {
    cancel: watch::Receiver<bool>,
    idle: IdleTimer,
}

impl Interrupt {
    pub async fn wait(&mut self) -> DccError {
        tokio::select! {
            _ = cancelled(&mut self.cancel) => DccError::Cancelled,
            timeout = self.idle.expired() => DccError::IdleTimeout(timeout),
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// How the socket gets connected.
pub(crate) enum Endpoint {
    /// Wait up to `window` for the peer to connect.
    Listen {
        listener: std::net::TcpListener,
        window: Duration,
    },
    /// Dial the peer. With a `gate`, wait for it to open first (resume
    /// handshake); `window` covers both.
    Dial {
        addr: SocketAddr,
        window: Duration,
        gate: Option<oneshot::Receiver<Outcome<()>>>,
    },
}

pub(crate) struct Connected {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    /// Agreed resume offset, 0 for a fresh transfer.
    pub offset: u64,
}

/// Task-side half of a session.
pub(crate) struct SessionCore {
    pub handle: SessionHandle,
    pub lines: mpsc::UnboundedReceiver<String>,
    ready: Resolver<SocketAddr>,
    started: Resolver<()>,
    closed: Resolver<()>,
    cancel: watch::Receiver<bool>,
    idle: IdleTimer,
    shared: Arc<Shared>,
}

pub(crate) fn new_session(
    key: SessionKey,
    transfer: Option<TransferInfo>,
    idle_timeout: Duration,
    shared: Arc<Shared>,
) -> (SessionHandle, SessionCore) {
    let (ready, ready_rx) = signal();
    let (started, started_rx) = signal();
    let (closed, closed_rx) = signal();
    let (lines_tx, lines) = mpsc::unbounded_channel();
    let (cancel_tx, cancel) = watch::channel(false);

    let handle = SessionHandle {
        inner: Arc::new(HandleInner {
            key,
            ready: ready_rx,
            started: started_rx,
            closed: closed_rx,
            lines: lines_tx,
            cancel: cancel_tx,
            transfer,
        }),
    };
    let core = SessionCore {
        handle: handle.clone(),
        lines,
        ready,
        started,
        closed,
        cancel,
        idle: IdleTimer::new(idle_timeout),
        shared,
    };
    (handle, core)
}

impl SessionCore {
    pub fn dispatcher(&self) -> &Dispatcher {
        self.shared.dispatcher()
    }

    pub fn idle(&self) -> &IdleTimer {
        &self.idle
    }

    pub fn interrupt(&self) -> Interrupt {
        Interrupt {
            cancel: self.cancel.clone(),
            idle: self.idle.clone(),
        }
    }

    /// Connect the socket, promote the offer and resolve `ready`.
    pub async fn connect(&self, endpoint: Endpoint) -> Outcome<Connected> {
        let key = &self.handle.inner.key;
        let mut cancel = self.cancel.clone();

        let attempt = async {
            match endpoint {
                Endpoint::Listen { listener, window } => {
                    let listener = TcpListener::from_std(listener).map_err(DccError::transport)?;
                    match timeout(window, listener.accept()).await {
                        Ok(accepted) => accepted.map_err(DccError::transport),
                        Err(_) => Err(DccError::OfferTimeout),
                    }
                }
                Endpoint::Dial { addr, window, gate } => {
                    let dial = async {
                        if let Some(gate) = gate {
                            // A dropped gate means the offer was torn down
                            gate.await.map_err(|_| DccError::Cancelled)??;
                            tracing::debug!(%key, "resume accepted, dialing");
                        }
                        let stream = TcpStream::connect(addr)
                            .await
                            .map_err(DccError::transport)?;
                        Ok::<_, DccError>((stream, addr))
                    };
                    timeout(window, dial)
                        .await
                        .unwrap_or(Err(DccError::OfferTimeout))
                }
            }
        };

        let (stream, peer) = tokio::select! {
            connected = attempt => connected?,
            _ = cancelled(&mut cancel) => return Err(DccError::Cancelled),
        };

        let offset = self.shared.promote(key).unwrap_or(0);
        self.idle.touch();
        self.ready.resolve(Ok(peer));
        tracing::info!(%key, %peer, offset, "DCC connected");

        Ok(Connected {
            stream,
            peer,
            offset,
        })
    }

    pub fn mark_started(&self) {
        if self.started.resolve(Ok(())) {
            tracing::debug!(key = %self.handle.inner.key, "DCC session started");
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.is_resolved()
    }

    /// Tear the session down: drop the registry entry, settle whatever is
    /// still pending with `outcome`, then resolve `closed`.
    pub fn finish(self, outcome: Outcome<()>) {
        let key = &self.handle.inner.key;
        self.shared.deregister(key);

        match &outcome {
            Ok(()) => {
                self.started.resolve(Ok(()));
                tracing::info!(%key, offset = self.handle.offset(), "DCC session closed");
            }
            Err(e) => {
                self.ready.resolve(Err(e.clone()));
                self.started.resolve(Err(e.clone()));
                tracing::warn!(%key, error = %e, "DCC session failed");
            }
        }
        self.closed.resolve(outcome);
    }
}

/// A chat handle wired to nothing but its line queue.
#[cfg(test)]
pub(crate) fn test_handle(mask: &str) -> (SessionHandle, mpsc::UnboundedReceiver<String>) {
    use crate::dcc::registry::{OfferId, Role};

    let (lines_tx, lines) = mpsc::unbounded_channel();
    let (cancel_tx, _) = watch::channel(false);
    let handle = SessionHandle {
        inner: Arc::new(HandleInner {
            key: SessionKey::new(DccType::Chat, mask, OfferId::new(Role::Offering, 0)),
            ready: signal().1,
            started: signal().1,
            closed: signal().1,
            lines: lines_tx,
            cancel: cancel_tx,
            transfer: None,
        }),
    };
    (handle, lines)
}

/// A transfer handle wired to nothing.
#[cfg(test)]
pub(crate) fn test_transfer_handle(mask: &str) -> SessionHandle {
    use crate::dcc::registry::{OfferId, Role};

    let (lines_tx, _) = mpsc::unbounded_channel();
    let (cancel_tx, _) = watch::channel(false);
    SessionHandle {
        inner: Arc::new(HandleInner {
            key: SessionKey::new(DccType::Send, mask, OfferId::new(Role::Offering, 4567)),
            ready: signal().1,
            started: signal().1,
            closed: signal().1,
            lines: lines_tx,
            cancel: cancel_tx,
            transfer: Some(TransferInfo::new("src".into(), Some(10), 0)),
        }),
    }
}
