//! Chunked, encrypted file streaming once both sides agreed on a plan.
//!
//! The sender splits the transport: its main loop writes chunk frames while a
//! reader future consumes acks, nacks and verification results and feeds
//! resend requests back through a channel. The receiver runs a single loop
//! that writes each chunk at its offset and answers every frame.

use std::collections::HashMap;
use std::path::PathBuf;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::bytes::{chunk_len, read_chunk_at, ChunkStorage, SourceFile};
use crate::cryptography::{decrypt_chunk, encrypt_chunk, OpeningHalf, SealingHalf, SecureChannel};
use crate::error::{Error, Result};
use crate::negotiation::{open_control, write_control, AbortReason, Control, FilePlan, Offer};
use crate::networking::{read_frame, write_frame, PeerFrame};
use crate::progress::ProgressReporter;
use crate::utils::FileDescriptor;
use crate::{KEY_SIZE, MAX_CHUNK_RETRIES};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Chunks that crossed the wire, resends included
    pub chunks_sent: u64,
    /// Chunks the receiver already had from an earlier attempt
    pub chunks_skipped: u64,
    pub bytes_transferred: u64,
}

enum SenderEvent {
    Resend { file: u32, index: u64 },
    Complete,
}

/// Bytes covered by the chunks a plan asks for.
pub fn planned_bytes(plan: &FilePlan, descriptor: &FileDescriptor, chunk_size: usize) -> u64 {
    plan.ranges
        .iter()
        .flat_map(|r| r.iter())
        .map(|i| chunk_len(descriptor.size, chunk_size, i) as u64)
        .sum()
}

// ============================================================================
// Sender
// ============================================================================

pub async fn send_files<S>(
    stream: S,
    channel: SecureChannel,
    files: &[SourceFile],
    plans: &[FilePlan],
    chunk_size: usize,
    progress: &ProgressReporter,
) -> Result<TransferStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let descriptors: Vec<FileDescriptor> = files.iter().map(|f| f.descriptor.clone()).collect();
    let total_bytes: u64 = descriptors.iter().map(|d| d.size).sum();
    let pending_bytes: u64 = plans
        .iter()
        .zip(&descriptors)
        .map(|(plan, d)| planned_bytes(plan, d, chunk_size))
        .sum();
    progress.set_totals(total_bytes, total_bytes.saturating_sub(pending_bytes));

    let total_chunks: u64 = descriptors.iter().map(|d| d.chunk_count(chunk_size)).sum();
    let planned_chunks: u64 = plans.iter().map(FilePlan::chunk_total).sum();

    let keys: Vec<[u8; KEY_SIZE]> = (0..files.len() as u32).map(|i| channel.chunk_key(i)).collect();
    let (sealing, opening) = channel.split();
    let (read_half, write_half) = tokio::io::split(stream);
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let writer = ChunkWriter {
        writer: write_half,
        sealing,
        files,
        keys: &keys,
        chunk_size,
        open_file: None,
        retries: HashMap::new(),
        chunks_sent: 0,
        bytes_sent: 0,
    };

    let (stats, ()) = tokio::try_join!(
        writer.run(plans, events_rx),
        read_receipts(read_half, opening, &descriptors, chunk_size, events_tx, progress),
    )?;

    info!("All {} file(s) verified by the receiver", files.len());
    Ok(TransferStats {
        chunks_skipped: total_chunks.saturating_sub(planned_chunks),
        ..stats
    })
}

struct ChunkWriter<'a, S> {
    writer: WriteHalf<S>,
    sealing: SealingHalf,
    files: &'a [SourceFile],
    keys: &'a [[u8; KEY_SIZE]],
    chunk_size: usize,
    open_file: Option<(u32, tokio::fs::File)>,
    retries: HashMap<(u32, u64), u32>,
    chunks_sent: u64,
    bytes_sent: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ChunkWriter<'_, S> {
    async fn run(
        mut self,
        plans: &[FilePlan],
        mut events: mpsc::UnboundedReceiver<SenderEvent>,
    ) -> Result<TransferStats> {
        for plan in plans {
            for range in &plan.ranges {
                for index in range.iter() {
                    self.send_chunk(plan.file, index).await?;

                    while let Ok(event) = events.try_recv() {
                        if self.handle_event(event).await? {
                            return Ok(self.stats());
                        }
                    }
                }
            }
        }
        debug!("Sent every planned chunk, waiting for receipts");

        while let Some(event) = events.recv().await {
            if self.handle_event(event).await? {
                return Ok(self.stats());
            }
        }
        Err(Error::NetworkInterrupted("receipt reader stopped early".into()))
    }

    /// Returns true once the receiver has verified everything.
    async fn handle_event(&mut self, event: SenderEvent) -> Result<bool> {
        match event {
            SenderEvent::Complete => Ok(true),
            SenderEvent::Resend { file, index } => {
                let attempts = {
                    let count = self.retries.entry((file, index)).or_insert(0);
                    *count += 1;
                    *count
                };
                if attempts > MAX_CHUNK_RETRIES {
                    warn!("Chunk {} of file #{} keeps failing, giving up", index, file);
                    let abort = Control::Abort(AbortReason::TooManyRetries { file, index });
                    let _ = write_control(&mut self.writer, &mut self.sealing, &abort).await;
                    return Err(AbortReason::TooManyRetries { file, index }.into_error(&[]));
                }
                debug!("Resending chunk {} of file #{} (attempt {})", index, file, attempts);
                self.send_chunk(file, index).await?;
                Ok(false)
            }
        }
    }

    async fn send_chunk(&mut self, file: u32, index: u64) -> Result<()> {
        let source = self
            .files
            .get(file as usize)
            .ok_or_else(|| Error::protocol(format!("no file #{}", file)))?;

        if self.open_file.as_ref().map(|(i, _)| *i) != Some(file) {
            let handle = tokio::fs::File::open(&source.local).await?;
            self.open_file = Some((file, handle));
        }
        let (_, handle) = self
            .open_file
            .as_mut()
            .ok_or_else(|| Error::protocol("source file is not open"))?;

        let plain = read_chunk_at(handle, source.descriptor.size, self.chunk_size, index).await?;
        let payload = encrypt_chunk(&self.keys[file as usize], &plain, index)?;
        write_frame(&mut self.writer, &PeerFrame::Chunk { file, index, payload }).await?;

        self.chunks_sent += 1;
        self.bytes_sent += plain.len() as u64;
        Ok(())
    }

    fn stats(&self) -> TransferStats {
        TransferStats {
            chunks_sent: self.chunks_sent,
            chunks_skipped: 0,
            bytes_transferred: self.bytes_sent,
        }
    }
}

async fn read_receipts<S>(
    mut reader: ReadHalf<S>,
    mut opening: OpeningHalf,
    files: &[FileDescriptor],
    chunk_size: usize,
    events: mpsc::UnboundedSender<SenderEvent>,
    progress: &ProgressReporter,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut verified = vec![false; files.len()];

    loop {
        let sealed = match read_frame(&mut reader).await? {
            PeerFrame::Control(sealed) => sealed,
            other => {
                return Err(Error::protocol(format!(
                    "unexpected {} frame from receiver",
                    crate::negotiation::frame_kind(&other)
                )))
            }
        };

        match open_control(&mut opening, &sealed)? {
            Control::Ack { file, index } => {
                let descriptor = files
                    .get(file as usize)
                    .ok_or_else(|| Error::protocol(format!("ack for unknown file #{}", file)))?;
                progress.set_current_file(&descriptor.path);
                progress.advance(chunk_len(descriptor.size, chunk_size, index) as u64);
            }
            Control::Nack { file, index } => {
                let _ = events.send(SenderEvent::Resend { file, index });
            }
            Control::FileVerified { file } => {
                let slot = verified
                    .get_mut(file as usize)
                    .ok_or_else(|| Error::protocol(format!("verification for unknown file #{}", file)))?;
                *slot = true;
                debug!("Receiver verified file #{}", file);
                if verified.iter().all(|v| *v) {
                    let _ = events.send(SenderEvent::Complete);
                    return Ok(());
                }
            }
            Control::Abort(reason) => return Err(reason.into_error(files)),
            other => return Err(Error::protocol(format!("unexpected control message {:?}", other))),
        }
    }
}

// ============================================================================
// Receiver
// ============================================================================

/// Receive every planned chunk and verify each file.
///
/// `storages` holds one entry per offered file, in offer order. On failure
/// the resume state of unfinished files is saved so a later attempt can pick
/// up where this one stopped.
pub async fn receive_files<S>(
    stream: &mut S,
    channel: &mut SecureChannel,
    offer: &Offer,
    mut storages: Vec<Option<ChunkStorage>>,
    progress: &ProgressReporter,
) -> Result<(Vec<PathBuf>, TransferStats)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = receive_loop(stream, channel, offer, &mut storages, progress).await;
    if result.is_err() {
        for storage in storages.iter_mut().flatten() {
            if let Err(e) = storage.persist_state().await {
                warn!("Could not save resume state: {}", e);
            }
        }
    }
    result
}

async fn receive_loop<S>(
    stream: &mut S,
    channel: &mut SecureChannel,
    offer: &Offer,
    storages: &mut [Option<ChunkStorage>],
    progress: &ProgressReporter,
) -> Result<(Vec<PathBuf>, TransferStats)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut saved: Vec<Option<PathBuf>> = vec![None; offer.files.len()];
    let mut stats = TransferStats::default();
    let mut failures: HashMap<(u32, u64), u32> = HashMap::new();
    let mut keys: HashMap<u32, [u8; KEY_SIZE]> = HashMap::new();

    for file in 0..offer.files.len() as u32 {
        let skipped = storages[file as usize].as_ref().map_or(0, |s| s.received().len() as u64);
        stats.chunks_skipped += skipped;
        if storages[file as usize].as_ref().is_some_and(ChunkStorage::is_complete) {
            finish_file(stream, channel, offer, storages, &mut saved, file).await?;
        }
    }

    while saved.iter().any(Option::is_none) {
        match read_frame(stream).await? {
            PeerFrame::Chunk { file, index, payload } => {
                let descriptor = offer
                    .files
                    .get(file as usize)
                    .ok_or_else(|| Error::protocol(format!("chunk for unknown file #{}", file)))?;
                let key = *keys.entry(file).or_insert_with(|| channel.chunk_key(file));

                let plain = match decrypt_chunk(&key, &payload, index) {
                    Ok(plain) => plain,
                    Err(_) => {
                        let count = failures.entry((file, index)).or_insert(0);
                        *count += 1;
                        if *count > MAX_CHUNK_RETRIES {
                            let reason = AbortReason::TooManyRetries { file, index };
                            write_control(stream, channel.sealing(), &Control::Abort(reason.clone())).await?;
                            return Err(reason.into_error(&offer.files));
                        }
                        warn!("Chunk {} of {} failed authentication, requesting resend", index, descriptor.path);
                        write_control(stream, channel.sealing(), &Control::Nack { file, index }).await?;
                        continue;
                    }
                };

                let Some(storage) = storages[file as usize].as_mut() else {
                    // already finalized; a late duplicate
                    write_control(stream, channel.sealing(), &Control::Ack { file, index }).await?;
                    continue;
                };
                if storage.store_chunk(index, &plain).await? {
                    stats.bytes_transferred += plain.len() as u64;
                    stats.chunks_sent += 1;
                    progress.set_current_file(&descriptor.path);
                    progress.advance(plain.len() as u64);
                }
                write_control(stream, channel.sealing(), &Control::Ack { file, index }).await?;

                if storage.is_complete() {
                    finish_file(stream, channel, offer, storages, &mut saved, file).await?;
                }
            }
            PeerFrame::Control(sealed) => match open_control(channel.opening(), &sealed)? {
                Control::Abort(reason) => return Err(reason.into_error(&offer.files)),
                other => return Err(Error::protocol(format!("unexpected control message {:?}", other))),
            },
            other => {
                return Err(Error::protocol(format!(
                    "unexpected {} frame during transfer",
                    crate::negotiation::frame_kind(&other)
                )))
            }
        }
    }

    Ok((saved.into_iter().flatten().collect(), stats))
}

async fn finish_file<S>(
    stream: &mut S,
    channel: &mut SecureChannel,
    offer: &Offer,
    storages: &mut [Option<ChunkStorage>],
    saved: &mut [Option<PathBuf>],
    file: u32,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let descriptor = &offer.files[file as usize];
    let Some(storage) = storages[file as usize].take() else {
        return Ok(());
    };

    match storage.finalize(descriptor).await {
        Ok(path) => {
            info!("Saved {}", path.display());
            saved[file as usize] = Some(path);
            write_control(stream, channel.sealing(), &Control::FileVerified { file }).await
        }
        Err(err @ Error::IntegrityFailure { .. }) => {
            let abort = Control::Abort(AbortReason::Integrity { file });
            let _ = write_control(stream, channel.sealing(), &abort).await;
            Err(err)
        }
        Err(err) => Err(err),
    }
}
