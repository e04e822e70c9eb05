//! DCC session manager.
//!
//! [`DccManager`] is what the IRC layer talks to. It owns the registry of
//! offers and sessions, opens sessions on request ([`DccManager::create`]),
//! and consumes the DCC control lines peers send over IRC
//! ([`DccManager::handle_ctcp`]). Control lines going the other way are
//! handed to a [`CtcpSender`].
//!
//! Every session runs as a task on the runtime passed to
//! [`DccManager::new`]. The registry lock is only held for table updates,
//! never across an await or a call into the IRC layer.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::config::DccConfig;
use crate::dcc::codec::DccRequest;
use crate::dcc::dispatcher::{Dispatcher, IoType};
use crate::dcc::error::DccError;
use crate::dcc::registry::{DccType, OfferId, Registry, Role, SessionKey};
use crate::dcc::security;
use crate::dcc::session::{new_session, Endpoint, SessionHandle, TransferInfo};
use crate::dcc::signal::Outcome;
use crate::dcc::strategy::SendStrategy;
use crate::dcc::transfer::TransferPlan;
use crate::dcc::{chat, transfer};

/// Outbound half of the IRC boundary.
pub trait CtcpSender: Send + Sync + 'static {
    /// Send `message` (without `\x01` framing) as a CTCP request to the
    /// peer behind `mask`.
    fn send_ctcp(&self, mask: &str, message: &str) -> Result<(), DccError>;
}

/// How to open a session. Start from [`CreateOptions::offer`] to listen
/// for the peer, or [`CreateOptions::dial`] to connect to an address the
/// peer announced.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    dial: Option<SocketAddr>,
    port: Option<u16>,
    filepath: Option<PathBuf>,
    filename: Option<String>,
    size: Option<u64>,
    accept_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    limit_rate: Option<u64>,
    resume: bool,
    strategy: Option<SendStrategy>,
}

impl CreateOptions {
    pub fn offer() -> Self {
        Self::default()
    }

    pub fn dial(addr: SocketAddr) -> Self {
        Self {
            dial: Some(addr),
            ..Self::default()
        }
    }

    /// Listening port for an offer. Defaults to an ephemeral port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// File to send when offering, destination when accepting.
    pub fn filepath(mut self, path: impl Into<PathBuf>) -> Self {
        self.filepath = Some(path.into());
        self
    }

    /// Wire filename. Defaults to the token derived from `filepath`.
    pub fn filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    /// Size announced by the sender, for a receiving session.
    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn accept_timeout(mut self, window: Duration) -> Self {
        self.accept_timeout = Some(window);
        self
    }

    /// Silence allowed on an active session. Zero disables the check.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Cap the send rate, in bytes per second. 0 sends unthrottled.
    pub fn limit_rate(mut self, bytes_per_sec: u64) -> Self {
        self.limit_rate = Some(bytes_per_sec);
        self
    }

    /// Receive into an existing partial file. The session waits for the
    /// RESUME/ACCEPT exchange (see [`DccManager::resume`]) before dialing.
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn strategy(mut self, strategy: SendStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// A CHAT or SEND offer received from a peer, after vetting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOffer {
    pub kind: DccType,
    pub mask: String,
    pub addr: SocketAddr,
    pub filename: Option<String>,
    pub size: Option<u64>,
}

impl IncomingOffer {
    /// Options that accept this offer. A SEND still needs a `filepath`.
    pub fn options(&self) -> CreateOptions {
        let mut options = CreateOptions::dial(self.addr);
        if let Some(filename) = &self.filename {
            options = options.filename(filename.clone());
        }
        if let Some(size) = self.size {
            options = options.size(size);
        }
        options
    }

    /// Options that accept this offer, saving a file under `download_dir`.
    pub fn options_in(&self, download_dir: &Path) -> Option<CreateOptions> {
        match self.kind {
            DccType::Chat => Some(self.options()),
            DccType::Send => {
                let filename = self.filename.as_deref()?;
                let path = security::safe_download_path(download_dir, filename)?;
                Some(self.options().filepath(path))
            }
        }
    }
}

struct Entry {
    handle: SessionHandle,
    created: Instant,
    stage: Stage,
}

enum Stage {
    Offer(Offer),
    Session,
}

#[derive(Default)]
struct Offer {
    /// Agreed start offset, once RESUME/ACCEPT completed.
    resume: Option<u64>,
    /// Offset this side asked for in its RESUME.
    requested: Option<u64>,
    /// Opens a receiving session's dial once ACCEPT arrives.
    gate: Option<oneshot::Sender<Outcome<()>>>,
}

/// State shared by the manager and every session task.
pub(crate) struct Shared {
    config: DccConfig,
    dispatcher: Dispatcher,
    ctcp: Arc<dyn CtcpSender>,
    runtime: Handle,
    registry: Mutex<Registry<Entry>>,
    local_ip: Mutex<Option<IpAddr>>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry<Entry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Mark an offer as connected. Returns the agreed resume offset.
    pub(crate) fn promote(&self, key: &SessionKey) -> Option<u64> {
        let mut registry = self.registry();
        let entry = registry.get_mut(key)?;
        match std::mem::replace(&mut entry.stage, Stage::Session) {
            Stage::Offer(offer) => {
                tracing::debug!(%key, waited = ?entry.created.elapsed(), "offer promoted");
                offer.resume
            }
            Stage::Session => None,
        }
    }

    pub(crate) fn deregister(&self, key: &SessionKey) {
        if self.registry().remove(key).is_some() {
            tracing::debug!(%key, "deregistered");
        }
    }
}

/// Entry point of the DCC engine. Cheap to clone.
#[derive(Clone)]
pub struct DccManager {
    shared: Arc<Shared>,
}

impl DccManager {
    /// Build a manager. Handlers must be registered on `dispatcher`
    /// beforehand; its command framing is taken from `config`.
    pub fn new(
        config: DccConfig,
        mut dispatcher: Dispatcher,
        ctcp: Arc<dyn CtcpSender>,
        runtime: Handle,
    ) -> Self {
        dispatcher.set_command_framing(&config.command_prefix, &config.command_suffix);
        Self {
            shared: Arc::new(Shared {
                config,
                dispatcher,
                ctcp,
                runtime,
                registry: Mutex::new(Registry::default()),
                local_ip: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &DccConfig {
        &self.shared.config
    }

    /// Record the local address of the IRC connection. Required before
    /// [`create`](Self::create).
    pub fn connection_established(&self, local_ip: IpAddr) {
        *self
            .shared
            .local_ip
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local_ip);
        tracing::info!(%local_ip, "DCC ready");
    }

    fn advertised_ip(&self) -> Result<IpAddr, DccError> {
        let local = *self
            .shared
            .local_ip
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let local = local.ok_or(DccError::NotConnected)?;
        Ok(self.shared.config.ip.unwrap_or(local))
    }

    /// Open a session with `mask`.
    ///
    /// Without a dial address this listens on a local port and sends the
    /// peer a `DCC CHAT` or `DCC SEND` offer; with one it connects to the
    /// peer's announced address. Returns as soon as the session is
    /// registered; progress is reported through the handle's signals.
    pub fn create(
        &self,
        kind: DccType,
        mask: &str,
        options: CreateOptions,
    ) -> Result<SessionHandle, DccError> {
        if mask.is_empty() {
            return Err(DccError::InvalidRequest("empty mask".into()));
        }
        let advertised = self.advertised_ip()?;
        let config = &self.shared.config;
        let limits = config.limits(kind);
        let role = if options.dial.is_some() {
            Role::Accepting
        } else {
            Role::Offering
        };

        let (transfer, plan) = match kind {
            DccType::Chat => (None, None),
            DccType::Send => {
                let (info, plan) = self.transfer_setup(role, &options)?;
                (Some(info), Some(plan))
            }
        };

        let window = options.accept_timeout.unwrap_or(limits.accept_window());
        let mut offer = Offer::default();
        let (endpoint, port) = match options.dial {
            Some(addr) => {
                let gate = (kind == DccType::Send && options.resume).then(|| {
                    let (tx, rx) = oneshot::channel();
                    offer.gate = Some(tx);
                    rx
                });
                (Endpoint::Dial { addr, window, gate }, addr.port())
            }
            None => {
                let listener = listen(SocketAddr::new(
                    config.bind_host,
                    options.port.unwrap_or(0),
                ))?;
                let port = listener
                    .local_addr()
                    .map_err(|e| DccError::InvalidRequest(format!("listener has no address: {e}")))?
                    .port();
                (Endpoint::Listen { listener, window }, port)
            }
        };

        let key = SessionKey::new(kind, mask, OfferId::new(role, port));
        let idle_timeout = options.idle_timeout.unwrap_or(limits.idle_window());
        let (handle, core) = new_session(key.clone(), transfer, idle_timeout, self.shared.clone());

        {
            let mut registry = self.shared.registry();
            if limits.limit > 0 && registry.count(kind) >= limits.limit {
                return Err(DccError::LimitReached(format!(
                    "{} {kind} sessions",
                    limits.limit
                )));
            }
            if limits.user_limit > 0 && registry.count_for(kind, mask) >= limits.user_limit {
                return Err(DccError::LimitReached(format!(
                    "{} {kind} sessions for {mask}",
                    limits.user_limit
                )));
            }
            let entry = Entry {
                handle: handle.clone(),
                created: Instant::now(),
                stage: Stage::Offer(offer),
            };
            if registry.insert(&key, entry).is_err() {
                return Err(DccError::InvalidRequest(format!("{key} already exists")));
            }
        }

        match plan {
            Some(plan) => self
                .shared
                .runtime
                .spawn(transfer::run(core, endpoint, plan)),
            None => self.shared.runtime.spawn(chat::run(core, endpoint)),
        };
        tracing::info!(%key, "DCC session created");

        if role == Role::Offering {
            let addr = SocketAddr::new(advertised, port);
            let request = match kind {
                DccType::Chat => DccRequest::Chat { addr },
                DccType::Send => DccRequest::Send {
                    filename: handle.token().unwrap_or_default().to_string(),
                    addr,
                    size: handle.size(),
                },
            };
            if let Err(e) = self.shared.ctcp.send_ctcp(mask, &request.to_string()) {
                handle.close();
                return Err(e);
            }
        }
        Ok(handle)
    }

    fn transfer_setup(
        &self,
        role: Role,
        options: &CreateOptions,
    ) -> Result<(TransferInfo, TransferPlan), DccError> {
        let config = &self.shared.config;
        let path = options
            .filepath
            .clone()
            .ok_or_else(|| DccError::InvalidRequest("a send session needs a filepath".into()))?;

        let size = match role {
            Role::Offering => {
                let meta = std::fs::metadata(&path).map_err(DccError::file)?;
                if !meta.is_file() {
                    return Err(DccError::InvalidRequest(format!(
                        "{} is not a file",
                        path.display()
                    )));
                }
                Some(meta.len())
            }
            Role::Accepting => options.size,
        };
        let token = match &options.filename {
            Some(name) => name.clone(),
            None => security::filename_token(&path).ok_or_else(|| {
                DccError::InvalidRequest(format!("no usable file name in {}", path.display()))
            })?,
        };

        // A receiver resuming into a partial file starts from its length
        let partial = match role {
            Role::Accepting if options.resume => match std::fs::metadata(&path) {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => {
                    return Err(DccError::InvalidRequest(format!(
                        "{} is not a file",
                        path.display()
                    )))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(DccError::file(e)),
            },
            _ => 0,
        };

        let plan = TransferPlan {
            path,
            block_size: config.block_size.max(1),
            limit_rate: options
                .limit_rate
                .or(config.send_limit_rate)
                .filter(|&rate| rate > 0),
            strategy: options.strategy.unwrap_or(config.strategy),
        };
        Ok((TransferInfo::new(token, size, partial), plan))
    }

    /// Ask the sender behind `mask` to restart the `token` transfer on
    /// `port` at `offset`. Only applies to a receiving session created with
    /// `resume(true)` that is still waiting; anything else is ignored.
    /// Returns whether a RESUME was sent.
    pub fn resume(&self, mask: &str, token: &str, port: u16, offset: u64) -> bool {
        let key = SessionKey::new(DccType::Send, mask, OfferId::new(Role::Accepting, port));
        let handle = {
            let mut registry = self.shared.registry();
            let Some(entry) = registry.get_mut(&key) else {
                tracing::debug!(%key, "resume: no such offer");
                return false;
            };
            if entry.handle.token() != Some(token) {
                tracing::debug!(%key, token, "resume: filename does not match");
                return false;
            }
            match &mut entry.stage {
                Stage::Offer(offer) if offer.gate.is_some() => offer.requested = Some(offset),
                _ => {
                    tracing::debug!(%key, "resume: offer is not waiting for a resume");
                    return false;
                }
            }
            entry.handle.clone()
        };

        let request = DccRequest::Resume {
            filename: token.to_string(),
            port,
            offset,
        };
        match self.send_control(mask, &handle, &request) {
            Ok(()) => {
                tracing::info!(%key, offset, "resume requested");
                true
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "could not send RESUME");
                false
            }
        }
    }

    /// Feed a DCC control line received from `mask`.
    ///
    /// RESUME and ACCEPT are answered internally. CHAT and SEND offers are
    /// returned for the caller to accept or drop. Anything unparseable is
    /// ignored.
    pub fn handle_ctcp(&self, mask: &str, line: &str) -> Option<IncomingOffer> {
        let request = match DccRequest::parse(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(%mask, error = %e, "ignoring control line");
                return None;
            }
        };

        match request {
            DccRequest::Resume {
                filename,
                port,
                offset,
            } => {
                self.on_resume(mask, line, filename, port, offset);
                None
            }
            DccRequest::Accept {
                filename,
                port,
                offset,
            } => {
                self.on_accept(mask, line, &filename, port, offset);
                None
            }
            DccRequest::Chat { addr } => self.vet(IncomingOffer {
                kind: DccType::Chat,
                mask: mask.to_string(),
                addr,
                filename: None,
                size: None,
            }),
            DccRequest::Send {
                filename,
                addr,
                size,
            } => self.vet(IncomingOffer {
                kind: DccType::Send,
                mask: mask.to_string(),
                addr,
                filename: Some(filename),
                size,
            }),
        }
    }

    fn on_resume(&self, mask: &str, line: &str, filename: String, port: u16, offset: u64) {
        let key = SessionKey::new(DccType::Send, mask, OfferId::new(Role::Offering, port));
        let handle = {
            let mut registry = self.shared.registry();
            let Some(entry) = registry.get_mut(&key) else {
                tracing::debug!(%key, "RESUME for unknown offer");
                return;
            };
            if entry.handle.token() != Some(filename.as_str()) {
                tracing::warn!(%key, %filename, "RESUME filename does not match the offer");
                return;
            }
            let size = entry.handle.size().unwrap_or(0);
            if offset > size {
                tracing::warn!(%key, offset, size, "RESUME offset beyond end of file");
                return;
            }
            let Stage::Offer(offer) = &mut entry.stage else {
                tracing::debug!(%key, "RESUME after the peer connected");
                return;
            };
            offer.resume = Some(offset);
            entry.handle.clone()
        };
        self.shared
            .dispatcher
            .dispatch_line(IoType::In, mask, &handle, control_text(line));

        let reply = DccRequest::Accept {
            filename,
            port,
            offset,
        };
        if let Err(e) = self.send_control(mask, &handle, &reply) {
            tracing::warn!(%key, error = %e, "could not send ACCEPT");
        }
    }

    fn on_accept(&self, mask: &str, line: &str, filename: &str, port: u16, offset: u64) {
        let key = SessionKey::new(DccType::Send, mask, OfferId::new(Role::Accepting, port));
        let (handle, gate, outcome) = {
            let mut registry = self.shared.registry();
            let Some(entry) = registry.get_mut(&key) else {
                tracing::debug!(%key, "ACCEPT for unknown offer");
                return;
            };
            if entry.handle.token() != Some(filename) {
                tracing::warn!(%key, %filename, "ACCEPT filename does not match the offer");
                return;
            }
            let Stage::Offer(offer) = &mut entry.stage else {
                return;
            };
            let Some(requested) = offer.requested else {
                tracing::debug!(%key, "ACCEPT without a pending RESUME");
                return;
            };
            let Some(gate) = offer.gate.take() else {
                return;
            };

            let outcome = if offset == requested {
                offer.resume = Some(offset);
                Ok(())
            } else {
                Err(DccError::ResumeMismatch {
                    expected: requested,
                    actual: offset,
                })
            };
            (entry.handle.clone(), gate, outcome)
        };

        self.shared
            .dispatcher
            .dispatch_line(IoType::In, mask, &handle, control_text(line));
        if gate.send(outcome).is_err() {
            tracing::debug!(%key, "ACCEPT arrived after the receiver went away");
        }
    }

    /// Send a control line about `handle` and mirror it to the `Out`
    /// line handlers.
    fn send_control(
        &self,
        mask: &str,
        handle: &SessionHandle,
        request: &DccRequest,
    ) -> Result<(), DccError> {
        let line = request.to_string();
        self.shared.ctcp.send_ctcp(mask, &line)?;
        self.shared
            .dispatcher
            .dispatch_line(IoType::Out, mask, handle, &line);
        Ok(())
    }

    fn vet(&self, offer: IncomingOffer) -> Option<IncomingOffer> {
        let config = &self.shared.config;
        if config.reject_private_ips && security::is_private_ip(&offer.addr.ip()) {
            tracing::warn!(mask = %offer.mask, addr = %offer.addr, "rejecting offer from private address");
            return None;
        }
        if let Some(size) = offer.size {
            if size > config.max_file_size {
                tracing::warn!(mask = %offer.mask, size, max = config.max_file_size, "rejecting oversized offer");
                return None;
            }
        }
        tracing::info!(mask = %offer.mask, kind = %offer.kind, addr = %offer.addr, "incoming DCC offer");
        Some(offer)
    }

    /// Offer ids registered for (kind, mask), pending or connected.
    pub fn list(&self, kind: DccType, mask: &str) -> Vec<OfferId> {
        self.shared.registry().ids(kind, mask)
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.shared.registry().get(key).map(|e| e.handle.clone())
    }

    /// Whether `key` is still waiting for its peer.
    pub fn is_pending(&self, key: &SessionKey) -> bool {
        matches!(
            self.shared.registry().get(key).map(|e| &e.stage),
            Some(Stage::Offer(_))
        )
    }
}

/// A control line without its CTCP `\x01` framing.
fn control_text(line: &str) -> &str {
    line.trim().trim_matches('\x01')
}

fn listen(addr: SocketAddr) -> Result<std::net::TcpListener, DccError> {
    let listener = std::net::TcpListener::bind(addr)
        .map_err(|e| DccError::InvalidRequest(format!("cannot listen on {addr}: {e}")))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| DccError::InvalidRequest(format!("cannot listen on {addr}: {e}")))?;
    Ok(listener)
}
