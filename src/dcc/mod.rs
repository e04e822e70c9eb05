//! DCC (Direct Client-to-Client) engine.
//!
//! Chat and file-transfer sessions negotiated over IRC and carried on
//! direct TCP connections, with resume, rate limiting, idle timeouts, and
//! a pattern-based dispatcher for chat traffic.

mod chat;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod registry;
pub mod security;
pub mod session;
pub mod signal;
pub mod strategy;
mod transfer;

pub use codec::DccRequest;
pub use dispatcher::{CommandEvent, Dispatcher, IoType, LineEvent};
pub use error::DccError;
pub use manager::{CreateOptions, CtcpSender, DccManager, IncomingOffer};
pub use registry::{DccType, OfferId, Role, SessionKey};
pub use session::SessionHandle;
pub use signal::{Outcome, Signal};
pub use strategy::SendStrategy;
