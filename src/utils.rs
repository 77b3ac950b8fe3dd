//! Shared message and descriptor types
//! - Role of a party in a session
//! - Relay introduction (hello) and the relay's replies
//! - FileDescriptor exchanged during negotiation
//! - Chunk ranges requested by the receiver

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::code_phrase::Fingerprint;
use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

/// First frame on any transport, sent to the relay or straight to a discovered peer
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RelayHello {
    pub version: u8,
    pub fingerprint: Fingerprint,
    pub role: Role,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RelayReply {
    /// Registered, the other party has not arrived yet
    Waiting,
    /// Both parties present; from here the stream is a pipe to the peer
    Paired,
    VersionMismatch { expected: u8 },
    Rejected { reason: String },
}

/// One file offered by the sender. Never changes once the offer is sent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Path relative to the receiver's target directory, `/` separated
    pub path: String,
    pub size: u64,
    /// SHA-256 of the whole file
    pub hash: [u8; 32],
    pub keep_path: bool,
}

impl FileDescriptor {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn chunk_count(&self, chunk_size: usize) -> u64 {
        self.size.div_ceil(chunk_size as u64)
    }

    /// First 16 hex characters of the content hash; names resume files.
    pub fn hash_prefix(&self) -> String {
        self.hash[..8].iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Where this file lands under `target_dir`.
    pub fn destination(&self, target_dir: &Path) -> Result<PathBuf> {
        validate_remote_path(&self.path)?;
        if self.keep_path {
            Ok(self.path.split('/').fold(target_dir.to_path_buf(), |acc, part| acc.join(part)))
        } else {
            Ok(target_dir.join(self.file_name()))
        }
    }
}

/// Half-open range of chunk indices `[start, end)`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn new(start: u64, end: u64) -> Self {
        ChunkRange { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> std::ops::Range<u64> {
        self.start..self.end
    }
}

/// Reject anything that could escape the receiver's target directory.
pub fn validate_remote_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::UnsafePath("empty path".into()));
    }
    if path.contains('\0') {
        return Err(Error::UnsafePath(format!("{:?} contains a null byte", path)));
    }
    if path.contains('\\') {
        return Err(Error::UnsafePath(format!("{} contains a backslash", path)));
    }
    if Path::new(path).is_absolute() || path.starts_with('/') {
        return Err(Error::UnsafePath(format!("{} is absolute", path)));
    }

    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => continue,
            Component::ParentDir => {
                return Err(Error::UnsafePath(format!("{} contains ..", path)))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::UnsafePath(format!("{} is absolute", path)))
            }
        }
    }

    Ok(())
}
