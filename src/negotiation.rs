//! File offer and accept/decline exchange, sealed under the session key.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cryptography::{OpeningHalf, SealingHalf, SecureChannel};
use crate::error::{Error, Result};
use crate::networking::{read_frame, write_frame, PeerFrame};
use crate::progress::{Phase, ProgressReporter};
use crate::utils::{validate_remote_path, ChunkRange, FileDescriptor};
use crate::MAX_CHUNK_SIZE;

/// Control messages, always carried sealed inside `PeerFrame::Control`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Offer { files: Vec<FileDescriptor>, chunk_size: u32 },
    Decision(Decision),
    Ack { file: u32, index: u64 },
    Nack { file: u32, index: u64 },
    FileVerified { file: u32 },
    Abort(AbortReason),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept { plans: Vec<FilePlan> },
    Decline,
}

/// Chunks of one file the receiver still needs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FilePlan {
    pub file: u32,
    pub ranges: Vec<ChunkRange>,
}

impl FilePlan {
    pub fn chunk_total(&self) -> u64 {
        self.ranges.iter().map(ChunkRange::len).sum()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Integrity { file: u32 },
    TooManyRetries { file: u32, index: u64 },
    Failed(String),
}

impl AbortReason {
    pub fn into_error(self, files: &[FileDescriptor]) -> Error {
        match self {
            AbortReason::Integrity { file } => Error::IntegrityFailure {
                file: files
                    .get(file as usize)
                    .map(|f| f.path.clone())
                    .unwrap_or_else(|| format!("file #{}", file)),
            },
            AbortReason::TooManyRetries { file, index } => Error::NetworkInterrupted(format!(
                "chunk {} of file #{} failed after repeated retries",
                index, file
            )),
            AbortReason::Failed(reason) => Error::protocol(format!("peer aborted: {}", reason)),
        }
    }
}

/// What the receiver learned from the offer.
#[derive(Debug, Clone)]
pub struct Offer {
    pub files: Vec<FileDescriptor>,
    pub chunk_size: usize,
}

impl Offer {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

pub async fn write_control<W>(writer: &mut W, sealer: &mut SealingHalf, message: &Control) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = bincode::serialize(message)?;
    write_frame(writer, &PeerFrame::Control(sealer.seal(&encoded)?)).await
}

pub fn open_control(opener: &mut OpeningHalf, sealed: &[u8]) -> Result<Control> {
    Ok(bincode::deserialize(&opener.open(sealed)?)?)
}

pub async fn read_control<R>(reader: &mut R, opener: &mut OpeningHalf) -> Result<Control>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        PeerFrame::Control(sealed) => open_control(opener, &sealed),
        other => Err(Error::protocol(format!("expected control message, got {:?}", frame_kind(&other)))),
    }
}

pub(crate) fn frame_kind(frame: &PeerFrame) -> &'static str {
    match frame {
        PeerFrame::Pake { .. } => "pake",
        PeerFrame::Confirm(_) => "confirm",
        PeerFrame::Control(_) => "control",
        PeerFrame::Chunk { .. } => "chunk",
    }
}

/// Sender side: offer the files and wait for the receiver's decision.
pub async fn offer<S>(
    stream: &mut S,
    channel: &mut SecureChannel,
    files: &[FileDescriptor],
    chunk_size: usize,
    progress: &ProgressReporter,
) -> Result<Vec<FilePlan>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    progress.advance_phase(Phase::Negotiating);

    let message = Control::Offer { files: files.to_vec(), chunk_size: chunk_size as u32 };
    write_control(stream, channel.sealing(), &message).await?;
    debug!("Offered {} file(s)", files.len());

    match read_control(stream, channel.opening()).await? {
        Control::Decision(Decision::Accept { plans }) => {
            validate_plans(&plans, files, chunk_size)?;
            info!("Receiver accepted the transfer");
            Ok(plans)
        }
        Control::Decision(Decision::Decline) => {
            info!("Receiver declined the transfer");
            Err(Error::TransferDeclined)
        }
        Control::Abort(reason) => Err(reason.into_error(files)),
        other => Err(Error::protocol(format!("expected a decision, got {:?}", other))),
    }
}

fn validate_plans(plans: &[FilePlan], files: &[FileDescriptor], chunk_size: usize) -> Result<()> {
    if plans.len() != files.len() {
        return Err(Error::protocol(format!(
            "receiver sent {} plans for {} files",
            plans.len(),
            files.len()
        )));
    }
    for (index, plan) in plans.iter().enumerate() {
        if plan.file as usize != index {
            return Err(Error::protocol("plans out of order"));
        }
        let chunks = files[index].chunk_count(chunk_size);
        if plan.ranges.iter().any(|r| r.start > r.end || r.end > chunks) {
            return Err(Error::protocol(format!("plan for file #{} is out of bounds", index)));
        }
    }
    Ok(())
}

/// Receiver side: wait for the sender's offer and check it is safe to act on.
pub async fn receive_offer<S>(
    stream: &mut S,
    channel: &mut SecureChannel,
    progress: &ProgressReporter,
) -> Result<Offer>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    progress.advance_phase(Phase::Negotiating);

    match read_control(stream, channel.opening()).await? {
        Control::Offer { files, chunk_size } => {
            let chunk_size = chunk_size as usize;
            if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
                return Err(Error::protocol(format!("unacceptable chunk size {}", chunk_size)));
            }
            for file in &files {
                validate_remote_path(&file.path)?;
            }
            info!("Received offer for {} file(s)", files.len());
            Ok(Offer { files, chunk_size })
        }
        other => Err(Error::protocol(format!("expected an offer, got {:?}", other))),
    }
}

pub async fn respond<S>(stream: &mut S, channel: &mut SecureChannel, decision: Decision) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_control(stream, channel.sealing(), &Control::Decision(decision)).await
}
