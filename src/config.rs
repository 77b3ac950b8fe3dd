//! Session configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::utils::Role;
use crate::{
    DEFAULT_CHUNK_SIZE, DEFAULT_DISCOVERY_PORT, DEFAULT_RELAY_ADDR, DEFAULT_RELAY_PORTS,
    MAX_CHUNK_SIZE,
};

/// Everything a session needs before it starts.
#[derive(Debug, Clone)]
pub struct Options {
    /// Code phrase shared out of band by the two users
    pub shared_secret: String,

    pub is_sender: bool,

    /// Relay host name or IP, without a port
    pub relay_address: String,

    /// Candidate relay ports, tried in order
    pub relay_ports: Vec<u16>,

    /// Skip the local network search and go straight to the relay
    pub disable_local: bool,

    /// Accept an incoming offer without asking
    pub no_prompt: bool,

    pub chunk_size: usize,

    pub discovery_port: u16,

    /// Where announces are sent; defaults to the IPv4 broadcast address
    pub discovery_target: Option<std::net::SocketAddr>,

    pub discovery_timeout: Duration,

    pub connect_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            is_sender: false,
            relay_address: DEFAULT_RELAY_ADDR.to_string(),
            relay_ports: DEFAULT_RELAY_PORTS.to_vec(),
            disable_local: false,
            no_prompt: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_target: None,
            discovery_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Options {
    pub fn sender(shared_secret: impl Into<String>) -> Self {
        Self {
            shared_secret: shared_secret.into(),
            is_sender: true,
            ..Self::default()
        }
    }

    pub fn receiver(shared_secret: impl Into<String>) -> Self {
        Self {
            shared_secret: shared_secret.into(),
            is_sender: false,
            ..Self::default()
        }
    }

    pub fn role(&self) -> Role {
        if self.is_sender {
            Role::Sender
        } else {
            Role::Receiver
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shared_secret.trim().is_empty() {
            return Err(Error::InvalidConfig("shared secret is empty".into()));
        }
        if self.relay_ports.is_empty() {
            return Err(Error::InvalidConfig("no relay ports configured".into()));
        }
        if self.relay_ports.contains(&0) {
            return Err(Error::InvalidConfig("relay port 0 is not connectable".into()));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "chunk size must be between 1 and {} bytes, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// What the sender hands to `Session::send`.
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Files or directories to send
    pub paths: Vec<PathBuf>,

    /// Recreate each file's relative path on the receiving side
    pub keep_path: bool,
}

impl TransferOptions {
    pub fn new<P: Into<PathBuf>>(paths: impl IntoIterator<Item = P>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            keep_path: false,
        }
    }
}

/// Parse a comma separated port list such as `9009,9010,9011`.
pub fn parse_ports(list: &str) -> Result<Vec<u16>> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse::<u16>()
                .map_err(|_| Error::InvalidConfig(format!("invalid port: {}", p)))
        })
        .collect()
}
