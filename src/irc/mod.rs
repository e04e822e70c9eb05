//! IRC boundary: connecting, spotting DCC requests, sending CTCP lines.

pub mod connection;

pub use connection::{classify, nick_of, spawn_connection, IrcConnection, IrcEvent};
