//! DCC control-line codec.
//!
//! Parses and renders the CTCP bodies that negotiate DCC sessions:
//!
//! ```text
//! DCC CHAT chat <ip> <port>
//! DCC SEND <filename> <ip> <port> [<size>]
//! DCC RESUME <filename> <port> <offset>
//! DCC ACCEPT <filename> <port> <offset>
//! ```
//!
//! `<ip>` is the legacy decimal form of an IPv4 address (network byte
//! order u32). Filenames may be quoted when they contain spaces.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::dcc::error::DccError;

/// A parsed DCC control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccRequest {
    Chat {
        addr: SocketAddr,
    },
    Send {
        filename: String,
        addr: SocketAddr,
        size: Option<u64>,
    },
    Resume {
        filename: String,
        port: u16,
        offset: u64,
    },
    Accept {
        filename: String,
        port: u16,
        offset: u64,
    },
}

impl DccRequest {
    /// Parse a CTCP body such as `DCC SEND file.txt 2130706433 4567 1024`.
    /// Surrounding `\x01` framing is tolerated.
    pub fn parse(line: &str) -> Result<Self, DccError> {
        let line = line.trim_matches('\x01').trim();
        let rest = line
            .strip_prefix("DCC ")
            .ok_or_else(|| malformed(line, "not a DCC request"))?;
        let (verb, args) = rest.split_once(' ').unwrap_or((rest, ""));

        match verb.to_ascii_uppercase().as_str() {
            "CHAT" => {
                let parts: Vec<&str> = args.split_whitespace().collect();
                if parts.len() < 3 || !parts[0].eq_ignore_ascii_case("chat") {
                    return Err(malformed(line, "expected `chat <ip> <port>`"));
                }
                let ip = decode_ip(parts[1]).ok_or_else(|| malformed(line, "bad ip"))?;
                let port = parse_num(parts[2], line)?;
                Ok(Self::Chat {
                    addr: SocketAddr::new(ip, port),
                })
            }
            "SEND" => {
                let (filename, rest) = split_filename(args).ok_or_else(|| malformed(line, "bad filename"))?;
                let parts: Vec<&str> = rest.split_whitespace().collect();
                if parts.len() < 2 {
                    return Err(malformed(line, "expected `<ip> <port> [<size>]`"));
                }
                let ip = decode_ip(parts[0]).ok_or_else(|| malformed(line, "bad ip"))?;
                let port = parse_num(parts[1], line)?;
                let size = parts.get(2).map(|s| parse_num(s, line)).transpose()?;
                Ok(Self::Send {
                    filename,
                    addr: SocketAddr::new(ip, port),
                    size,
                })
            }
            verb @ ("RESUME" | "ACCEPT") => {
                let (filename, rest) = split_filename(args).ok_or_else(|| malformed(line, "bad filename"))?;
                let parts: Vec<&str> = rest.split_whitespace().collect();
                if parts.len() < 2 {
                    return Err(malformed(line, "expected `<port> <offset>`"));
                }
                let port = parse_num(parts[0], line)?;
                let offset = parse_num(parts[1], line)?;
                Ok(if verb == "RESUME" {
                    Self::Resume { filename, port, offset }
                } else {
                    Self::Accept { filename, port, offset }
                })
            }
            _ => Err(malformed(line, "unknown DCC verb")),
        }
    }
}

impl fmt::Display for DccRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat { addr } => {
                write!(f, "DCC CHAT chat {} {}", encode_ip(addr.ip()), addr.port())
            }
            Self::Send { filename, addr, size } => {
                write!(
                    f,
                    "DCC SEND {} {} {}",
                    quote(filename),
                    encode_ip(addr.ip()),
                    addr.port()
                )?;
                if let Some(size) = size {
                    write!(f, " {}", size)?;
                }
                Ok(())
            }
            Self::Resume { filename, port, offset } => {
                write!(f, "DCC RESUME {} {} {}", quote(filename), port, offset)
            }
            Self::Accept { filename, port, offset } => {
                write!(f, "DCC ACCEPT {} {} {}", quote(filename), port, offset)
            }
        }
    }
}

/// Render an address the way DCC peers expect it: IPv4 as a decimal u32,
/// IPv6 in its textual form.
pub fn encode_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => u32::from(v4).to_string(),
        IpAddr::V6(v6) => v6.to_string(),
    }
}

/// Decode a decimal u32 address. Dotted or IPv6 literals are accepted too,
/// since some clients send them.
pub fn decode_ip(text: &str) -> Option<IpAddr> {
    if let Ok(decimal) = text.parse::<u32>() {
        return Some(IpAddr::V4(Ipv4Addr::from(decimal)));
    }
    text.parse().ok()
}

/// Split a leading (optionally quoted) filename from the remaining arguments.
fn split_filename(args: &str) -> Option<(String, &str)> {
    let args = args.trim_start();
    if let Some(quoted) = args.strip_prefix('"') {
        let end = quoted.find('"')?;
        let name = &quoted[..end];
        if name.is_empty() {
            return None;
        }
        Some((name.to_string(), &quoted[end + 1..]))
    } else {
        let (name, rest) = args.split_once(' ')?;
        Some((name.to_string(), rest))
    }
}

fn quote(filename: &str) -> String {
    if filename.contains(char::is_whitespace) {
        format!("\"{}\"", filename)
    } else {
        filename.to_string()
    }
}

fn parse_num<N: std::str::FromStr>(text: &str, line: &str) -> Result<N, DccError> {
    text.parse().map_err(|_| malformed(line, "bad number"))
}

fn malformed(line: &str, reason: &str) -> DccError {
    DccError::Protocol(format!("{reason}: {line:?}"))
}
