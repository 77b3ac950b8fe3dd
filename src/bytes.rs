use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{self, Read, SeekFrom};
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::utils::{ChunkRange, FileDescriptor};

/// Chunks written between two saves of the resume state.
const STATE_FLUSH_INTERVAL: usize = 16;
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// A file the sender will offer, with where it lives locally.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub local: PathBuf,
    pub descriptor: FileDescriptor,
}

/// SHA-256 of a whole file, streamed in 64 KiB reads.
pub fn hash_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Build descriptors for everything under `paths`.
///
/// Plain files are offered under their file name, or under their path
/// relative to the current directory when `keep_path` is set. Directories are
/// walked recursively and always keep their layout, rooted at the
/// directory's own name.
pub fn describe_paths(paths: &[PathBuf], keep_path: bool) -> Result<Vec<SourceFile>> {
    let working_dir = std::env::current_dir()?;
    describe_paths_in(&working_dir, paths, keep_path)
}

/// `describe_paths` with relative inputs resolved against `working_dir`.
pub fn describe_paths_in(working_dir: &Path, paths: &[PathBuf], keep_path: bool) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();

    for path in paths {
        let path = working_dir.join(path);
        let metadata = std::fs::metadata(&path)?;

        if metadata.is_dir() {
            let base = path.parent().unwrap_or_else(|| Path::new(""));
            for entry in WalkDir::new(&path).sort_by_file_name() {
                let entry = entry.map_err(|e| Error::Io(e.into()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(base)
                    .map_err(|_| Error::protocol(format!("{} escapes its root", entry.path().display())))?;
                files.push(describe_file(entry.path(), relative, true)?);
            }
        } else {
            let relative = if keep_path {
                // outside the working directory only the normal components survive
                let relative: PathBuf = path
                    .strip_prefix(working_dir)
                    .unwrap_or(&path)
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(part) => Some(part),
                        _ => None,
                    })
                    .collect();
                if relative.as_os_str().is_empty() {
                    return Err(Error::InvalidConfig(format!("{} has no file name", path.display())));
                }
                relative
            } else {
                PathBuf::from(path.file_name().ok_or_else(|| {
                    Error::InvalidConfig(format!("{} has no file name", path.display()))
                })?)
            };
            files.push(describe_file(&path, &relative, keep_path)?);
        }
    }

    Ok(files)
}

fn describe_file(local: &Path, relative: &Path, keep_path: bool) -> Result<SourceFile> {
    let remote = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    let size = std::fs::metadata(local)?.len();
    debug!("Hashing {} ({} bytes)", local.display(), size);

    Ok(SourceFile {
        local: local.to_path_buf(),
        descriptor: FileDescriptor {
            path: remote,
            size,
            hash: hash_file(local)?,
            keep_path,
        },
    })
}

/// Length of chunk `index` in a file of `size` bytes.
pub fn chunk_len(size: u64, chunk_size: usize, index: u64) -> usize {
    let start = index * chunk_size as u64;
    size.saturating_sub(start).min(chunk_size as u64) as usize
}

/// Read one chunk at its offset.
pub async fn read_chunk_at(
    file: &mut tokio::fs::File,
    size: u64,
    chunk_size: usize,
    index: u64,
) -> io::Result<Vec<u8>> {
    let len = chunk_len(size, chunk_size, index);
    let mut buffer = vec![0u8; len];
    file.seek(SeekFrom::Start(index * chunk_size as u64)).await?;
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}

/// Collapse the chunks absent from `received` into ranges.
pub fn missing_ranges(received: &BTreeSet<u64>, total_chunks: u64) -> Vec<ChunkRange> {
    let mut ranges = Vec::new();
    let mut start: Option<u64> = None;

    for index in 0..total_chunks {
        match (received.contains(&index), start) {
            (false, None) => start = Some(index),
            (true, Some(s)) => {
                ranges.push(ChunkRange::new(s, index));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        ranges.push(ChunkRange::new(s, total_chunks));
    }
    ranges
}

/// Persisted record of which chunks of a partial file are already on disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResumeState {
    pub hash: [u8; 32],
    pub size: u64,
    pub chunk_size: usize,
    pub received: BTreeSet<u64>,
}

/// Partial data and resume state paths for a file headed to `destination`.
///
/// Both carry the content hash prefix, so a later attempt finds them only
/// when it is receiving the same content.
pub fn partial_paths(destination: &Path, descriptor: &FileDescriptor) -> (PathBuf, PathBuf) {
    let dir = destination.parent().unwrap_or_else(|| Path::new("."));
    let name = match destination.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => descriptor.file_name().to_string(),
    };
    let base = format!(".{}.{}.part", name, descriptor.hash_prefix());
    (dir.join(&base), dir.join(format!("{}.json", base)))
}

/// Finds an available path by appending ` (N)` before the extension.
pub fn find_available_path(path: PathBuf) -> PathBuf {
    first_free(path, |candidate| !candidate.exists())
}

/// Claim a destination that no earlier file of the same offer holds.
///
/// Two offered files may resolve to one path (`a/x.txt` and `b/x.txt` sent
/// without `keep_path`); the later one gets the ` (N)` name.
pub fn reserve_destination(path: PathBuf, taken: &mut HashSet<PathBuf>) -> PathBuf {
    let reserved = first_free(path, |candidate| !taken.contains(candidate));
    taken.insert(reserved.clone());
    reserved
}

fn first_free(path: PathBuf, is_free: impl Fn(&Path) -> bool) -> PathBuf {
    if is_free(&path) {
        return path;
    }

    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let extension = path.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();

    let mut counter = 1;
    loop {
        let candidate = parent.join(format!("{} ({}){}", stem, counter, extension));
        if is_free(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Assembles one file from chunks arriving in any order.
///
/// Writes go to the hidden partial file; `finalize` verifies the hash and
/// moves it into place.
pub struct ChunkStorage {
    file: tokio::fs::File,
    destination: PathBuf,
    part_path: PathBuf,
    state_path: PathBuf,
    state: ResumeState,
    expected_chunks: u64,
    unsaved: usize,
}

impl ChunkStorage {
    /// Open storage for `descriptor`, picking up a previous partial attempt
    /// of the same content if one is found.
    pub async fn open(destination: PathBuf, descriptor: &FileDescriptor, chunk_size: usize) -> Result<Self> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let (part_path, state_path) = partial_paths(&destination, descriptor);

        let previous = load_resume_state(&state_path, descriptor, chunk_size);
        let resuming = previous.is_some() && part_path.exists();
        let state = match previous {
            Some(state) if resuming => {
                debug!(
                    "Resuming {} with {} chunk(s) already on disk",
                    descriptor.path,
                    state.received.len()
                );
                state
            }
            _ => ResumeState {
                hash: descriptor.hash,
                size: descriptor.size,
                chunk_size,
                received: BTreeSet::new(),
            },
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(!resuming)
            .open(&part_path)
            .await?;
        file.set_len(descriptor.size).await?;

        Ok(Self {
            file,
            destination,
            part_path,
            state_path,
            state,
            expected_chunks: descriptor.chunk_count(chunk_size),
            unsaved: 0,
        })
    }

    pub fn received(&self) -> &BTreeSet<u64> {
        &self.state.received
    }

    pub fn missing(&self) -> Vec<ChunkRange> {
        missing_ranges(&self.state.received, self.expected_chunks)
    }

    /// Bytes already on disk, counted toward progress when resuming.
    pub fn bytes_present(&self) -> u64 {
        self.state
            .received
            .iter()
            .map(|&i| chunk_len(self.state.size, self.state.chunk_size, i) as u64)
            .sum()
    }

    pub fn is_complete(&self) -> bool {
        self.state.received.len() as u64 == self.expected_chunks
    }

    pub fn has_chunk(&self, index: u64) -> bool {
        self.state.received.contains(&index)
    }

    /// Write chunk `index` at its offset. Returns false for a chunk already stored.
    pub async fn store_chunk(&mut self, index: u64, data: &[u8]) -> Result<bool> {
        if index >= self.expected_chunks {
            return Err(Error::protocol(format!(
                "chunk index {} out of range (file has {} chunks)",
                index, self.expected_chunks
            )));
        }
        let expected = chunk_len(self.state.size, self.state.chunk_size, index);
        if data.len() != expected {
            return Err(Error::protocol(format!(
                "chunk {} is {} bytes, expected {}",
                index,
                data.len(),
                expected
            )));
        }
        if self.has_chunk(index) {
            return Ok(false);
        }

        let offset = index * self.state.chunk_size as u64;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.state.received.insert(index);

        self.unsaved += 1;
        if self.unsaved >= STATE_FLUSH_INTERVAL {
            self.persist_state().await?;
        }
        Ok(true)
    }

    /// Flush written data, then record which chunks it holds.
    pub async fn persist_state(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        tokio::fs::write(&self.state_path, serde_json::to_vec(&self.state)?).await?;
        self.unsaved = 0;
        Ok(())
    }

    /// Verify the assembled file and move it into place.
    pub async fn finalize(mut self, descriptor: &FileDescriptor) -> Result<PathBuf> {
        if !self.is_complete() {
            return Err(Error::protocol(format!(
                "finalize called with {}/{} chunks",
                self.state.received.len(),
                self.expected_chunks
            )));
        }
        self.file.flush().await?;

        let part_path = self.part_path.clone();
        let hash = tokio::task::spawn_blocking(move || hash_file(&part_path))
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))??;

        if hash != descriptor.hash {
            warn!("Hash mismatch for {}, discarding partial data", descriptor.path);
            self.discard().await;
            return Err(Error::IntegrityFailure { file: descriptor.path.clone() });
        }

        let final_path = find_available_path(self.destination.clone());
        drop(self.file);
        tokio::fs::rename(&self.part_path, &final_path).await?;
        let _ = tokio::fs::remove_file(&self.state_path).await;
        Ok(final_path)
    }

    /// Remove partial data and resume state.
    pub async fn discard(&mut self) {
        let _ = tokio::fs::remove_file(&self.part_path).await;
        let _ = tokio::fs::remove_file(&self.state_path).await;
    }
}

fn load_resume_state(state_path: &Path, descriptor: &FileDescriptor, chunk_size: usize) -> Option<ResumeState> {
    let raw = std::fs::read(state_path).ok()?;
    let state: ResumeState = match serde_json::from_slice(&raw) {
        Ok(state) => state,
        Err(e) => {
            warn!("Ignoring unreadable resume state {}: {}", state_path.display(), e);
            return None;
        }
    };
    let total = descriptor.chunk_count(chunk_size);
    let consistent = state.hash == descriptor.hash
        && state.size == descriptor.size
        && state.chunk_size == chunk_size
        && state.received.iter().all(|&i| i < total);
    consistent.then_some(state)
}
