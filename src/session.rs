//! One transfer session from connect to the final phase.
//!
//! A `Session` is built from `Options`, observed through `subscribe()` and
//! `transitions()`, and consumed by `send` or `receive`. Every failure is
//! published as `Phase::Failed` with its reason before it is returned.

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};

use crate::bytes::{describe_paths, reserve_destination, ChunkStorage, SourceFile};
use crate::code_phrase::Fingerprint;
use crate::config::{Options, TransferOptions};
use crate::discovery::{broadcast_target, Announce, Announcer, Listener, ANNOUNCE_INTERVAL};
use crate::error::{Error, Result};
use crate::handshake::perform_pake;
use crate::negotiation::{self, Decision, FilePlan};
use crate::networking::{accept_direct, connect_direct, connect_relay};
use crate::progress::{Phase, ProgressReporter, ProgressState};
use crate::transfer::{receive_files, send_files};
use crate::utils::{FileDescriptor, RelayHello, Role};
use crate::PROTOCOL_VERSION;

/// Asked by the receiver before any file bytes are accepted.
pub trait Consent: Send + Sync {
    fn confirm(&self, files: &[FileDescriptor]) -> bool;
}

impl<F> Consent for F
where
    F: Fn(&[FileDescriptor]) -> bool + Send + Sync,
{
    fn confirm(&self, files: &[FileDescriptor]) -> bool {
        self(files)
    }
}

/// Cancels a running session from anywhere. Cloning is cheap.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self { flag: Arc::new(flag) }
    }

    pub fn abort(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.flag.borrow()
    }

    async fn aborted(&self) {
        let mut rx = self.flag.subscribe();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Relay,
    /// Found on the local network
    Direct,
    /// Caller supplied the transport
    Stream,
}

#[derive(Debug, Clone)]
pub struct TransferSummary {
    /// Local paths sent, or saved paths on the receiving side
    pub files: Vec<PathBuf>,
    pub bytes_transferred: u64,
    pub chunks_sent: u64,
    pub chunks_skipped: u64,
    pub route: Route,
}

pub struct Session {
    options: Options,
    fingerprint: Fingerprint,
    progress: ProgressReporter,
    abort: AbortHandle,
    consent: Option<Arc<dyn Consent>>,
}

impl Session {
    pub fn new(options: Options) -> Result<Self> {
        options.validate()?;
        let fingerprint = Fingerprint::from_phrase(&options.shared_secret);
        Ok(Self {
            options,
            fingerprint,
            progress: ProgressReporter::new(),
            abort: AbortHandle::new(),
            consent: None,
        })
    }

    pub fn with_consent(mut self, consent: Arc<dyn Consent>) -> Self {
        self.consent = Some(consent);
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.progress.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<Phase> {
        self.progress.transitions()
    }

    pub fn phase(&self) -> Phase {
        self.progress.phase()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub async fn send(self, transfer: TransferOptions) -> Result<TransferSummary> {
        let run = async {
            self.expect_role(Role::Sender)?;
            let files = prepare_files(transfer).await?;
            let (stream, route) = self.connect_sender().await?;
            self.run_sender(stream, files, route).await
        };
        self.finish(run).await
    }

    pub async fn send_over<S>(self, stream: S, transfer: TransferOptions) -> Result<TransferSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let run = async {
            self.expect_role(Role::Sender)?;
            let files = prepare_files(transfer).await?;
            self.run_sender(stream, files, Route::Stream).await
        };
        self.finish(run).await
    }

    pub async fn receive(self, target_dir: &Path) -> Result<TransferSummary> {
        let run = async {
            self.expect_role(Role::Receiver)?;
            self.check_consent()?;
            let (stream, route) = self.connect_receiver().await?;
            self.run_receiver(stream, target_dir, route).await
        };
        self.finish(run).await
    }

    pub async fn receive_over<S>(self, stream: S, target_dir: &Path) -> Result<TransferSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let run = async {
            self.expect_role(Role::Receiver)?;
            self.check_consent()?;
            self.run_receiver(stream, target_dir, Route::Stream).await
        };
        self.finish(run).await
    }

    /// Race the session against the abort signal and publish the outcome.
    async fn finish<F>(&self, run: F) -> Result<TransferSummary>
    where
        F: std::future::Future<Output = Result<TransferSummary>>,
    {
        let result = tokio::select! {
            result = run => result,
            _ = self.abort.aborted() => Err(Error::Aborted),
        };

        match &result {
            Ok(summary) => {
                self.progress.advance_phase(Phase::Done);
                info!(
                    "Session finished: {} file(s), {} bytes via {:?}",
                    summary.files.len(),
                    summary.bytes_transferred,
                    summary.route
                );
            }
            Err(e) => {
                warn!("Session failed: {}", e);
                self.progress.fail(&e.to_string());
            }
        }
        result
    }

    fn expect_role(&self, role: Role) -> Result<()> {
        if self.options.role() != role {
            return Err(Error::InvalidConfig(format!(
                "session was configured as the {}",
                self.options.role().as_str()
            )));
        }
        Ok(())
    }

    fn check_consent(&self) -> Result<()> {
        if !self.options.no_prompt && self.consent.is_none() {
            return Err(Error::InvalidConfig(
                "no consent handler registered and auto-accept is off".into(),
            ));
        }
        Ok(())
    }

    fn hello(&self) -> RelayHello {
        RelayHello {
            version: PROTOCOL_VERSION,
            fingerprint: self.fingerprint,
            role: self.options.role(),
        }
    }

    // ============================================================================
    // Connecting
    // ============================================================================

    async fn connect_sender(&self) -> Result<(TcpStream, Route)> {
        let hello = self.hello();
        let relay = connect_relay(
            &self.options.relay_address,
            &self.options.relay_ports,
            &hello,
            self.options.connect_timeout,
        );
        if self.options.disable_local {
            return Ok((relay.await?, Route::Relay));
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let port = listener.local_addr()?.port();
        let target = self
            .options
            .discovery_target
            .unwrap_or_else(|| broadcast_target(self.options.discovery_port));
        let _announcer = Announcer::spawn(target, Announce::new(self.fingerprint, port), ANNOUNCE_INTERVAL).await?;
        debug!("Direct listener on port {}", port);

        tokio::pin!(relay);
        tokio::select! {
            direct = accept_direct(&listener, &self.fingerprint) => Ok((direct?, Route::Direct)),
            relayed = &mut relay => match relayed {
                Ok(stream) => Ok((stream, Route::Relay)),
                Err(e @ Error::RelayUnreachable { .. }) => {
                    info!("Relay unreachable, waiting for a local receiver");
                    match tokio::time::timeout(
                        self.options.discovery_timeout,
                        accept_direct(&listener, &self.fingerprint),
                    )
                    .await
                    {
                        Ok(Ok(stream)) => Ok((stream, Route::Direct)),
                        _ => Err(e),
                    }
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn connect_receiver(&self) -> Result<(TcpStream, Route)> {
        let hello = self.hello();
        if !self.options.disable_local {
            if let Some(stream) = self.try_local(&hello).await {
                return Ok((stream, Route::Direct));
            }
        }
        let stream = connect_relay(
            &self.options.relay_address,
            &self.options.relay_ports,
            &hello,
            self.options.connect_timeout,
        )
        .await?;
        Ok((stream, Route::Relay))
    }

    /// Any failure here just means falling back to the relay.
    async fn try_local(&self, hello: &RelayHello) -> Option<TcpStream> {
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.options.discovery_port));
        let listener = match Listener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Local discovery unavailable on {}: {}", bind_addr, e);
                return None;
            }
        };

        let peer = match listener.find(&self.fingerprint, self.options.discovery_timeout).await {
            Ok(Some(peer)) => peer,
            Ok(None) => return None,
            Err(e) => {
                warn!("Local discovery failed: {}", e);
                return None;
            }
        };

        match connect_direct(peer, hello, self.options.connect_timeout).await {
            Ok(stream) => {
                info!("Connected directly to {}", peer);
                Some(stream)
            }
            Err(e) => {
                warn!("Direct connection to {} failed, using the relay: {}", peer, e);
                None
            }
        }
    }

    // ============================================================================
    // Protocol
    // ============================================================================

    async fn run_sender<S>(&self, mut stream: S, files: Vec<SourceFile>, route: Route) -> Result<TransferSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let chunk_size = self.options.chunk_size;
        let mut channel = perform_pake(
            &mut stream,
            &self.options.shared_secret,
            Role::Sender,
            &self.fingerprint,
            &self.progress,
        )
        .await?;

        let descriptors: Vec<FileDescriptor> = files.iter().map(|f| f.descriptor.clone()).collect();
        let plans = negotiation::offer(&mut stream, &mut channel, &descriptors, chunk_size, &self.progress).await?;

        self.progress.advance_phase(Phase::FileTransfer);
        let stats = send_files(stream, channel, &files, &plans, chunk_size, &self.progress).await?;

        Ok(TransferSummary {
            files: files.into_iter().map(|f| f.local).collect(),
            bytes_transferred: stats.bytes_transferred,
            chunks_sent: stats.chunks_sent,
            chunks_skipped: stats.chunks_skipped,
            route,
        })
    }

    async fn run_receiver<S>(&self, mut stream: S, target_dir: &Path, route: Route) -> Result<TransferSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut channel = perform_pake(
            &mut stream,
            &self.options.shared_secret,
            Role::Receiver,
            &self.fingerprint,
            &self.progress,
        )
        .await?;

        let offer = negotiation::receive_offer(&mut stream, &mut channel, &self.progress).await?;
        if !self.accepts(&offer.files).await? {
            negotiation::respond(&mut stream, &mut channel, Decision::Decline).await?;
            info!("Declined the offer");
            return Err(Error::TransferDeclined);
        }

        tokio::fs::create_dir_all(target_dir).await?;
        let mut storages = Vec::with_capacity(offer.files.len());
        let mut plans = Vec::with_capacity(offer.files.len());
        let mut present = 0;
        let mut taken = HashSet::new();
        for (index, descriptor) in offer.files.iter().enumerate() {
            let destination = reserve_destination(descriptor.destination(target_dir)?, &mut taken);
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let storage = ChunkStorage::open(destination, descriptor, offer.chunk_size).await?;
            present += storage.bytes_present();
            plans.push(FilePlan { file: index as u32, ranges: storage.missing() });
            storages.push(Some(storage));
        }
        if present > 0 {
            info!("Resuming: {} bytes already on disk", present);
        }

        negotiation::respond(&mut stream, &mut channel, Decision::Accept { plans }).await?;
        self.progress.set_totals(offer.total_bytes(), present);
        self.progress.advance_phase(Phase::FileTransfer);

        let (saved, stats) = receive_files(&mut stream, &mut channel, &offer, storages, &self.progress).await?;
        Ok(TransferSummary {
            files: saved,
            bytes_transferred: stats.bytes_transferred,
            chunks_sent: stats.chunks_sent,
            chunks_skipped: stats.chunks_skipped,
            route,
        })
    }

    async fn accepts(&self, files: &[FileDescriptor]) -> Result<bool> {
        if self.options.no_prompt {
            return Ok(true);
        }
        let consent = self
            .consent
            .clone()
            .ok_or_else(|| Error::InvalidConfig("no consent handler registered".into()))?;
        let files = files.to_vec();
        let accepted = tokio::task::spawn_blocking(move || consent.confirm(&files))
            .await
            .map_err(io::Error::from)?;
        Ok(accepted)
    }
}

async fn prepare_files(transfer: TransferOptions) -> Result<Vec<SourceFile>> {
    let TransferOptions { paths, keep_path } = transfer;
    let files = tokio::task::spawn_blocking(move || describe_paths(&paths, keep_path))
        .await
        .map_err(io::Error::from)??;
    if files.is_empty() {
        return Err(Error::InvalidConfig("nothing to send".into()));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local_options(phrase: &str, sender: bool) -> Options {
        let mut options = if sender { Options::sender(phrase) } else { Options::receiver(phrase) };
        options.disable_local = true;
        options.no_prompt = true;
        options.chunk_size = 4096;
        options
    }

    // ============================================================================
    // Session lifecycle
    // ============================================================================

    #[tokio::test]
    async fn test_send_over_stream_reaches_done() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(src.path().join("notes.bin"), &data).unwrap();

        let sender = Session::new(local_options("amber-falcon-river-42", true)).unwrap();
        let receiver = Session::new(local_options("amber-falcon-river-42", false)).unwrap();
        let sender_state = sender.subscribe();
        let receiver_state = receiver.subscribe();

        let (a, b) = tokio::io::duplex(128 * 1024);
        let (sent, received) = tokio::join!(
            sender.send_over(a, TransferOptions::new([src.path().join("notes.bin")])),
            receiver.receive_over(b, dst.path()),
        );

        let sent = sent.unwrap();
        let received = received.unwrap();
        assert_eq!(sent.route, Route::Stream);
        assert_eq!(sent.chunks_sent, 5);
        assert_eq!(received.files, vec![dst.path().join("notes.bin")]);
        assert_eq!(std::fs::read(dst.path().join("notes.bin")).unwrap(), data);
        assert_eq!(sender_state.borrow().phase, Phase::Done);
        assert_eq!(receiver_state.borrow().phase, Phase::Done);
        assert_eq!(receiver_state.borrow().bytes_transferred, 20_000);
    }

    #[tokio::test]
    async fn test_identical_files_with_one_name_both_land() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
        for dir in ["a", "b"] {
            std::fs::create_dir_all(src.path().join(dir)).unwrap();
            std::fs::write(src.path().join(dir).join("x.txt"), &data).unwrap();
        }

        let sender = Session::new(local_options("amber-falcon-river-42", true)).unwrap();
        let receiver = Session::new(local_options("amber-falcon-river-42", false)).unwrap();
        let paths = [src.path().join("a").join("x.txt"), src.path().join("b").join("x.txt")];

        let (a, b) = tokio::io::duplex(128 * 1024);
        let (sent, received) = tokio::join!(
            sender.send_over(a, TransferOptions::new(paths)),
            receiver.receive_over(b, dst.path()),
        );

        sent.unwrap();
        let received = received.unwrap();
        assert_eq!(received.files, vec![dst.path().join("x.txt"), dst.path().join("x (1).txt")]);
        assert_eq!(std::fs::read(dst.path().join("x.txt")).unwrap(), data);
        assert_eq!(std::fs::read(dst.path().join("x (1).txt")).unwrap(), data);
        assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_same_path_offered_twice() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::fs::write(src.path().join("twice.txt"), b"twice").unwrap();

        let sender = Session::new(local_options("amber-falcon-river-42", true)).unwrap();
        let receiver = Session::new(local_options("amber-falcon-river-42", false)).unwrap();
        let path = src.path().join("twice.txt");

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (sent, received) = tokio::join!(
            sender.send_over(a, TransferOptions::new([path.clone(), path])),
            receiver.receive_over(b, dst.path()),
        );

        sent.unwrap();
        assert_eq!(received.unwrap().files.len(), 2);
        assert_eq!(std::fs::read(dst.path().join("twice (1).txt")).unwrap(), b"twice");
    }

    #[tokio::test]
    async fn test_consent_decline() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        std::fs::write(src.path().join("secret.txt"), b"no thanks").unwrap();

        let sender = Session::new(local_options("amber-falcon-river-42", true)).unwrap();
        let mut options = local_options("amber-falcon-river-42", false);
        options.no_prompt = false;
        let receiver = Session::new(options)
            .unwrap()
            .with_consent(Arc::new(|_: &[FileDescriptor]| false));
        let sender_state = sender.subscribe();
        let receiver_state = receiver.subscribe();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (sent, received) = tokio::join!(
            sender.send_over(a, TransferOptions::new([src.path().join("secret.txt")])),
            receiver.receive_over(b, dst.path()),
        );

        assert!(matches!(sent, Err(Error::TransferDeclined)));
        assert!(matches!(received, Err(Error::TransferDeclined)));
        assert_eq!(sender_state.borrow().phase, Phase::Failed);
        assert_eq!(receiver_state.borrow().phase, Phase::Failed);
        assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_prompt_without_consent_handler_is_rejected() {
        let mut options = local_options("amber-falcon-river-42", false);
        options.no_prompt = false;
        let receiver = Session::new(options).unwrap();
        let (_a, b) = tokio::io::duplex(1024);
        let result = receiver.receive_over(b, Path::new("unused")).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_wrong_role_is_rejected() {
        let receiver = Session::new(local_options("amber-falcon-river-42", false)).unwrap();
        let (_a, b) = tokio::io::duplex(1024);
        let result = receiver.send_over(b, TransferOptions::new(["whatever"])).await;
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_abort_cancels_waiting_session() {
        let dst = TempDir::new().unwrap();
        let receiver = Session::new(local_options("amber-falcon-river-42", false)).unwrap();
        let handle = receiver.abort_handle();
        let state = receiver.subscribe();

        // the peer never speaks, so only the abort can end this
        let (_a, b) = tokio::io::duplex(1024);
        let run = tokio::spawn({
            let dst = dst.path().to_path_buf();
            async move { receiver.receive_over(b, &dst).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(Error::Aborted)));
        assert!(handle.is_aborted());
        assert_eq!(state.borrow().phase, Phase::Failed);
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(matches!(Session::new(Options::sender("")), Err(Error::InvalidConfig(_))));
    }
}
