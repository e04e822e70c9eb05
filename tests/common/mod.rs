#![allow(dead_code)]

use crabdcc::config::DccConfig;
use crabdcc::dcc::{
    CtcpSender, DccError, DccManager, Dispatcher, IncomingOffer, Outcome, Signal,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

pub const MASK: &str = "gawel";

/// Control lines sent by a manager come straight back to the same manager,
/// as if the peer were another process with the same mask.
struct LoopbackCtcp {
    tx: mpsc::UnboundedSender<(String, String)>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl CtcpSender for LoopbackCtcp {
    fn send_ctcp(&self, mask: &str, message: &str) -> Result<(), DccError> {
        self.sent.lock().unwrap().push(message.to_string());
        self.tx
            .send((mask.to_string(), message.to_string()))
            .map_err(|_| DccError::Ctcp("loopback closed".into()))
    }
}

pub struct Loopback {
    offers: mpsc::UnboundedReceiver<IncomingOffer>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl Loopback {
    pub async fn next_offer(&mut self) -> IncomingOffer {
        tokio::time::timeout(Duration::from_secs(5), self.offers.recv())
            .await
            .expect("no offer came back")
            .expect("loopback closed")
    }

    /// Every control line sent so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

pub fn test_config() -> DccConfig {
    DccConfig {
        bind_host: "127.0.0.1".parse().unwrap(),
        ..DccConfig::default()
    }
}

/// A connected manager whose CTCP lines loop back into `handle_ctcp`.
/// CHAT and SEND offers come out of [`Loopback::next_offer`].
pub fn loopback(config: DccConfig, dispatcher: Dispatcher) -> (DccManager, Loopback) {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String)>();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let ctcp = LoopbackCtcp {
        tx,
        sent: sent.clone(),
    };
    let manager = DccManager::new(config, dispatcher, Arc::new(ctcp), Handle::current());
    manager.connection_established("127.0.0.1".parse().unwrap());

    let (offer_tx, offers) = mpsc::unbounded_channel();
    let pump = manager.clone();
    tokio::spawn(async move {
        while let Some((mask, line)) = rx.recv().await {
            if let Some(offer) = pump.handle_ctcp(&mask, &line) {
                let _ = offer_tx.send(offer);
            }
        }
    });

    (manager, Loopback { offers, sent })
}

/// Wait for a lifecycle signal, failing the test instead of hanging.
pub async fn settle<T: Clone>(signal: &Signal<T>) -> Outcome<T> {
    tokio::time::timeout(Duration::from_secs(30), signal.wait())
        .await
        .expect("signal never settled")
}

pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("nothing received")
        .expect("channel closed")
}

/// `start`, 3 MiB of dashes, `send`: 3145737 bytes.
pub fn write_source(dir: &Path) -> PathBuf {
    let mut data = b"start".to_vec();
    data.extend(std::iter::repeat(b'-').take(3 * 1048576));
    data.extend_from_slice(b"send");
    let path = dir.join("src");
    std::fs::write(&path, data).unwrap();
    path
}
