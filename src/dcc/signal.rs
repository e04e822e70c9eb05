//! Single-resolution result handles.
//!
//! Every session publishes three of these (`ready`, `started`, `closed`).
//! Each resolves at most once; anyone may subscribe at any time and a late
//! subscriber sees the value that was already settled.

use tokio::sync::watch;

use crate::dcc::error::DccError;

/// Result carried by a lifecycle signal.
pub type Outcome<T> = Result<T, DccError>;

/// Read side of a lifecycle signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Signal<T> {
    rx: watch::Receiver<Option<Outcome<T>>>,
}

/// Write side, owned by the session task.
#[derive(Debug)]
pub(crate) struct Resolver<T> {
    tx: watch::Sender<Option<Outcome<T>>>,
}

pub(crate) fn signal<T>() -> (Resolver<T>, Signal<T>) {
    let (tx, rx) = watch::channel(None);
    (Resolver { tx }, Signal { rx })
}

impl<T: Clone> Signal<T> {
    /// Waits until the signal resolves and returns its outcome.
    ///
    /// If the owning session disappears without resolving, this yields
    /// [`DccError::Cancelled`].
    pub async fn wait(&self) -> Outcome<T> {
        if let Some(outcome) = self.get() {
            return outcome;
        }
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(slot) => (*slot).clone().unwrap_or(Err(DccError::Cancelled)),
            Err(_) => Err(DccError::Cancelled),
        };
        outcome
    }

    /// The settled outcome, if any.
    pub fn get(&self) -> Option<Outcome<T>> {
        self.rx.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

impl<T> Resolver<T> {
    /// Settles the signal. Returns `false` if it was already settled, in
    /// which case `outcome` is discarded.
    pub(crate) fn resolve(&self, outcome: Outcome<T>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }
}
