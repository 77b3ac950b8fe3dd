//! Error taxonomy for sessions, the relay and the transfer engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("resume state error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("relay {address} unreachable on ports {ports:?}")]
    RelayUnreachable { address: String, ports: Vec<u16> },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("handshake failed: the code phrases do not match")]
    HandshakeMismatch,

    #[error("transfer declined by receiver")]
    TransferDeclined,

    #[error("integrity check failed for {file}")]
    IntegrityFailure { file: String },

    #[error("network interrupted: {0}")]
    NetworkInterrupted(String),

    #[error("encryption error")]
    Encryption,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsafe path in offer: {0}")]
    UnsafePath(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("session aborted")]
    Aborted,
}

impl Error {
    /// A declined offer ends the session but is not a protocol failure.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::TransferDeclined)
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

impl From<chacha20poly1305::aead::Error> for Error {
    fn from(_: chacha20poly1305::aead::Error) -> Self {
        Error::Encryption
    }
}

pub type Result<T> = std::result::Result<T, Error>;
