//! crabdcc: DCC chat and file transfer for IRC clients and bots.
//!
//! The engine lives in [`dcc`]; [`DccManager`](dcc::DccManager) is the
//! entry point. [`irc`] connects it to a server with the `irc` crate.

pub mod config;
pub mod dcc;
pub mod irc;
pub mod logging;
