use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result};
use futures::StreamExt;
use ::irc::client::prelude::*;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::config::IrcConfig;
use crate::dcc::{CtcpSender, DccError};

/// What the bot cares about from the IRC stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcEvent {
    /// A `DCC ...` CTCP request, framing stripped.
    Dcc { mask: String, line: String },
    /// An ordinary message to a channel or to us.
    Privmsg {
        mask: String,
        target: String,
        text: String,
    },
    Error(String),
    Disconnected,
}

pub struct IrcConnection {
    pub sender: ::irc::client::Sender,
    /// Local address of the route to the server, for DCC offers.
    pub local_ip: IpAddr,
    pub events: mpsc::UnboundedReceiver<IrcEvent>,
}

pub async fn spawn_connection(config: &IrcConfig) -> Result<IrcConnection> {
    let irc_config = Config {
        server: Some(config.server.clone()),
        port: Some(config.port),
        use_tls: Some(config.tls),
        nickname: Some(config.nickname.clone()),
        username: config.username.clone(),
        realname: config.realname.clone(),
        password: config.password.clone(),
        channels: config.channels.clone(),
        dangerously_accept_invalid_certs: Some(config.accept_invalid_certs),
        ..Config::default()
    };

    let mut client = Client::from_config(irc_config)
        .await
        .with_context(|| format!("Failed to connect to {}:{}", config.server, config.port))?;
    client.identify()?;

    let local_ip = local_ip_towards(&config.server, config.port)
        .await
        .with_context(|| format!("Failed to find a local address towards {}", config.server))?;

    let sender = client.sender();
    let mut stream = client.stream()?;
    let (event_tx, events) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(result) = stream.next().await {
            match result {
                Ok(message) => {
                    let Some(event) = classify(&message) else {
                        continue;
                    };
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = event_tx.send(IrcEvent::Error(e.to_string()));
                    break;
                }
            }
        }
        let _ = event_tx.send(IrcEvent::Disconnected);
    });

    Ok(IrcConnection {
        sender,
        local_ip,
        events,
    })
}

/// Pick out DCC requests and plain messages.
pub fn classify(message: &Message) -> Option<IrcEvent> {
    let Command::PRIVMSG(target, text) = &message.command else {
        return None;
    };
    let mask = match message.prefix.as_ref()? {
        Prefix::Nickname(nick, user, host) if user.is_empty() && host.is_empty() => nick.clone(),
        Prefix::Nickname(nick, user, host) => format!("{}!{}@{}", nick, user, host),
        Prefix::ServerName(_) => return None,
    };

    if text.len() >= 2 && text.starts_with('\x01') && text.ends_with('\x01') {
        let ctcp = &text[1..text.len() - 1];
        return ctcp.starts_with("DCC ").then(|| IrcEvent::Dcc {
            mask,
            line: ctcp.to_string(),
        });
    }

    Some(IrcEvent::Privmsg {
        mask,
        target: target.clone(),
        text: text.clone(),
    })
}

/// Nickname part of a `nick!user@host` mask.
pub fn nick_of(mask: &str) -> &str {
    mask.split('!').next().unwrap_or(mask)
}

impl CtcpSender for ::irc::client::Sender {
    fn send_ctcp(&self, mask: &str, message: &str) -> Result<(), DccError> {
        self.send_privmsg(nick_of(mask), format!("\x01{}\x01", message))
            .map_err(|e| DccError::Ctcp(e.to_string()))
    }
}

/// The local address the kernel would use to reach `host`. Connecting a
/// UDP socket sends nothing.
async fn local_ip_towards(host: &str, port: u16) -> io::Result<IpAddr> {
    let remote = tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host has no address"))?;
    let bind = if remote.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(remote).await?;
    Ok(socket.local_addr()?.ip())
}
