//! Configuration data model.
//!
//! All structs derive `Serialize`/`Deserialize` for TOML persistence.
//! Every field has a sensible default so the bot works out of the box.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use super::nickname::generate_nickname;
use crate::dcc::registry::DccType;
use crate::dcc::strategy::SendStrategy;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub irc: IrcConfig,
    #[serde(default)]
    pub dcc: DccConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The IRC server the demo bot connects to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrcConfig {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default = "default_nickname")]
    pub nickname: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for IrcConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: default_port(),
            tls: true,
            nickname: default_nickname(),
            username: None,
            realname: None,
            password: None,
            channels: vec![],
            accept_invalid_certs: false,
        }
    }
}

/// DCC engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DccConfig {
    /// Address advertised in outgoing offers. Falls back to the local
    /// address of the IRC connection.
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Address offers listen on.
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Default send cap in bytes per second. Absent or 0 is unlimited.
    #[serde(default)]
    pub send_limit_rate: Option<u64>,
    #[serde(default)]
    pub strategy: SendStrategy,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default = "default_command_suffix")]
    pub command_suffix: String,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default)]
    pub reject_private_ips: bool,
    /// Accept incoming SEND offers without asking.
    #[serde(default)]
    pub auto_accept: bool,
    #[serde(default)]
    pub chat: SessionLimits,
    #[serde(default)]
    pub send: SessionLimits,
}

impl Default for DccConfig {
    fn default() -> Self {
        Self {
            ip: None,
            bind_host: default_bind_host(),
            block_size: default_block_size(),
            send_limit_rate: None,
            strategy: SendStrategy::default(),
            command_prefix: default_command_prefix(),
            command_suffix: default_command_suffix(),
            download_dir: default_download_dir(),
            max_file_size: default_max_file_size(),
            reject_private_ips: false,
            auto_accept: false,
            chat: SessionLimits::default(),
            send: SessionLimits::default(),
        }
    }
}

impl DccConfig {
    pub fn limits(&self, kind: DccType) -> &SessionLimits {
        match kind {
            DccType::Chat => &self.chat,
            DccType::Send => &self.send,
        }
    }
}

/// Caps and timeouts for one session type. Zero disables a cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimits {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_user_limit")]
    pub user_limit: usize,
    /// Seconds an offer waits for its peer.
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout: u64,
    /// Seconds of silence before an active session is dropped. 0 never
    /// drops it.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            user_limit: default_user_limit(),
            accept_timeout: default_accept_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl SessionLimits {
    pub fn accept_window(&self) -> Duration {
        Duration::from_secs(self.accept_timeout)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}

/// DCC chat transcript settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
        }
    }
}

fn default_server() -> String {
    "irc.libera.chat".to_string()
}
fn default_nickname() -> String {
    generate_nickname()
}
fn default_port() -> u16 {
    6697
}
fn default_true() -> bool {
    true
}
fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_block_size() -> usize {
    65536
}
fn default_command_prefix() -> String {
    "\x01ACTION ".to_string()
}
fn default_command_suffix() -> String {
    "\x01".to_string()
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}
fn default_max_file_size() -> u64 {
    500 * 1024 * 1024 // 500 MB
}
fn default_limit() -> usize {
    100
}
fn default_user_limit() -> usize {
    5
}
fn default_accept_timeout() -> u64 {
    60
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_log_dir() -> String {
    "~/.local/share/crabdcc/logs".to_string()
}
