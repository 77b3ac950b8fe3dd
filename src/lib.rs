pub mod bytes;
pub mod code_phrase;
pub mod commands;
pub mod config;
pub mod cryptography;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod negotiation;
pub mod networking;
pub mod progress;
pub mod relay_utils;
pub mod session;
pub mod transfer;
pub mod utils;

pub use config::{Options, TransferOptions};
pub use error::{Error, Result};
pub use progress::{Phase, ProgressState};
pub use session::{AbortHandle, Consent, Route, Session, TransferSummary};

/// Bumped whenever a frame layout changes; peers and relays reject any other value.
pub const PROTOCOL_VERSION: u8 = 1;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const ENCRYPTION_OVERHEAD: usize = 16;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_FRAME_SIZE: usize = MAX_CHUNK_SIZE + 1024;

/// Resends allowed for a single chunk before the transfer is abandoned.
pub const MAX_CHUNK_RETRIES: u32 = 3;

pub const DEFAULT_RELAY_ADDR: &str = "45.55.102.56";
pub const DEFAULT_RELAY_PORTS: [u16; 5] = [9009, 9010, 9011, 9012, 9013];
pub const DEFAULT_DISCOVERY_PORT: u16 = 9008;
