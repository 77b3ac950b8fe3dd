// Integration tests for ferry
// These tests run whole sessions end to end: over in-memory pipes, through a
// relay bound to loopback, and through local discovery.

use std::net::{SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ferry::bytes::{describe_paths, ChunkStorage, ResumeState};
use ferry::code_phrase::Fingerprint;
use ferry::networking::{connect_relay, read_frame, write_frame};
use ferry::relay_utils::Relay;
use ferry::session::Route;
use ferry::utils::{FileDescriptor, RelayHello, RelayReply, Role};
use ferry::{Error, Options, Phase, Session, TransferOptions, PROTOCOL_VERSION};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    data
}

fn stream_options(phrase: &str, sender: bool) -> Options {
    let mut options = if sender { Options::sender(phrase) } else { Options::receiver(phrase) };
    options.disable_local = true;
    options.no_prompt = true;
    options
}

fn relay_options(phrase: &str, sender: bool, ports: Vec<u16>) -> Options {
    let mut options = stream_options(phrase, sender);
    options.relay_address = "127.0.0.1".into();
    options.relay_ports = ports;
    options.connect_timeout = Duration::from_secs(2);
    options
}

async fn start_relay() -> u16 {
    let relay = Relay::bind(&["127.0.0.1:0".parse().unwrap()]).await.unwrap();
    let port = relay.local_addrs()[0].port();
    tokio::spawn(relay.run());
    port
}

/// A loopback port with nothing listening on it.
fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(true)
}

// ============================================================================
// Relay Round Trip Tests
// ============================================================================

#[tokio::test]
async fn test_ten_megabytes_through_relay() {
    let port = start_relay().await;
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let data = random_bytes(10 * 1024 * 1024);
    std::fs::write(src.path().join("payload.bin"), &data).unwrap();

    let sender = Session::new(relay_options("correct-horse-battery-42", true, vec![port])).unwrap();
    let receiver = Session::new(relay_options("correct-horse-battery-42", false, vec![port])).unwrap();
    let sender_state = sender.subscribe();
    let receiver_state = receiver.subscribe();

    let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(
            sender.send(TransferOptions::new([src.path().join("payload.bin")])),
            receiver.receive(dst.path()),
        )
    })
    .await
    .unwrap();

    let sent = sent.unwrap();
    let received = received.unwrap();
    assert_eq!(sent.route, Route::Relay);
    assert_eq!(received.route, Route::Relay);
    assert_eq!(sent.bytes_transferred, data.len() as u64);

    let saved = std::fs::read(dst.path().join("payload.bin")).unwrap();
    assert_eq!(Sha256::digest(&saved), Sha256::digest(&data));
    assert_eq!(sender_state.borrow().phase, Phase::Done);
    assert_eq!(receiver_state.borrow().phase, Phase::Done);
    assert_eq!(receiver_state.borrow().bytes_transferred, data.len() as u64);
}

#[tokio::test]
async fn test_relay_port_fallback_in_order() {
    let port = start_relay().await;
    let ports = vec![dead_port(), port];
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    std::fs::write(src.path().join("note.txt"), b"second port wins").unwrap();

    let sender = Session::new(relay_options("amber-falcon-river-42", true, ports.clone())).unwrap();
    let receiver = Session::new(relay_options("amber-falcon-river-42", false, ports)).unwrap();

    let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(
            sender.send(TransferOptions::new([src.path().join("note.txt")])),
            receiver.receive(dst.path()),
        )
    })
    .await
    .unwrap();

    sent.unwrap();
    received.unwrap();
    assert_eq!(std::fs::read(dst.path().join("note.txt")).unwrap(), b"second port wins");
}

#[tokio::test]
async fn test_same_room_wrong_phrase_through_relay() {
    let port = start_relay().await;
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    std::fs::write(src.path().join("secret.txt"), b"for the right person only").unwrap();

    // same first word and suffix, so both land in one room, but the secret differs
    let sender = Session::new(relay_options("correct-horse-battery-42", true, vec![port])).unwrap();
    let receiver = Session::new(relay_options("correct-donkey-staple-42", false, vec![port])).unwrap();

    let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(
            sender.send(TransferOptions::new([src.path().join("secret.txt")])),
            receiver.receive(dst.path()),
        )
    })
    .await
    .unwrap();

    assert!(matches!(sent, Err(Error::HandshakeMismatch)));
    assert!(matches!(received, Err(Error::HandshakeMismatch)));
    assert!(dir_is_empty(dst.path()));
}

// ============================================================================
// Failure Scenario Tests
// ============================================================================

#[tokio::test]
async fn test_wrong_phrase_fails_both_sides() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    std::fs::write(src.path().join("secret.txt"), b"for the right person only").unwrap();

    let sender = Session::new(stream_options("correct-horse-battery-42", true)).unwrap();
    let receiver = Session::new(stream_options("wrong-phrase-99", false)).unwrap();
    let sender_state = sender.subscribe();
    let receiver_state = receiver.subscribe();

    let (a, b) = tokio::io::duplex(64 * 1024);
    let (sent, received) = tokio::join!(
        sender.send_over(a, TransferOptions::new([src.path().join("secret.txt")])),
        receiver.receive_over(b, dst.path()),
    );

    assert!(matches!(sent, Err(Error::HandshakeMismatch)));
    assert!(matches!(received, Err(Error::HandshakeMismatch)));
    assert_eq!(sender_state.borrow().phase, Phase::Failed);
    assert_eq!(receiver_state.borrow().phase, Phase::Failed);
    assert!(receiver_state.borrow().failure.is_some());
    assert!(dir_is_empty(dst.path()));
}

#[tokio::test]
async fn test_relay_unreachable_before_handshake() {
    let src = TempDir::new().unwrap();
    std::fs::write(src.path().join("a.txt"), b"never leaves").unwrap();

    let ports = vec![dead_port(), dead_port()];
    let sender = Session::new(relay_options("amber-falcon-river-42", true, ports.clone())).unwrap();
    let mut transitions = sender.transitions();

    let result = sender.send(TransferOptions::new([src.path().join("a.txt")])).await;

    match result {
        Err(Error::RelayUnreachable { address, ports: tried }) => {
            assert_eq!(address, "127.0.0.1");
            assert_eq!(tried, ports);
        }
        other => panic!("expected RelayUnreachable, got {:?}", other),
    }
    // no handshake phase was ever entered
    assert_eq!(transitions.try_recv().unwrap(), Phase::Failed);
    assert!(transitions.try_recv().is_err());
}

#[tokio::test]
async fn test_receiver_declines() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    std::fs::write(src.path().join("unwanted.iso"), random_bytes(5000)).unwrap();

    let sender = Session::new(stream_options("amber-falcon-river-42", true)).unwrap();
    let mut receiver_options = stream_options("amber-falcon-river-42", false);
    receiver_options.no_prompt = false;
    let receiver = Session::new(receiver_options)
        .unwrap()
        .with_consent(Arc::new(|files: &[FileDescriptor]| {
            !files.iter().any(|f| f.path.ends_with(".iso"))
        }));

    let (a, b) = tokio::io::duplex(64 * 1024);
    let (sent, received) = tokio::join!(
        sender.send_over(a, TransferOptions::new([src.path().join("unwanted.iso")])),
        receiver.receive_over(b, dst.path()),
    );

    assert!(matches!(sent, Err(Error::TransferDeclined)));
    assert!(matches!(received, Err(Error::TransferDeclined)));
    assert!(dir_is_empty(dst.path()));
}

#[tokio::test]
async fn test_corrupt_partial_fails_integrity() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let data = random_bytes(40_000);
    let path = src.path().join("photo.raw");
    std::fs::write(&path, &data).unwrap();

    let chunk_size = 8192;
    let descriptor = describe_paths(&[path.clone()], false).unwrap().remove(0).descriptor;

    // an earlier attempt left a chunk on disk that no longer matches the file
    let mut storage = ChunkStorage::open(descriptor.destination(dst.path()).unwrap(), &descriptor, chunk_size)
        .await
        .unwrap();
    storage.store_chunk(0, &vec![0xEE; chunk_size]).await.unwrap();
    storage.persist_state().await.unwrap();
    drop(storage);

    let mut sender_options = stream_options("amber-falcon-river-42", true);
    sender_options.chunk_size = chunk_size;
    let sender = Session::new(sender_options).unwrap();
    let receiver = Session::new(stream_options("amber-falcon-river-42", false)).unwrap();

    let (a, b) = tokio::io::duplex(256 * 1024);
    let (sent, received) = tokio::join!(
        sender.send_over(a, TransferOptions::new([path])),
        receiver.receive_over(b, dst.path()),
    );

    assert!(matches!(sent, Err(Error::IntegrityFailure { .. })));
    assert!(matches!(received, Err(Error::IntegrityFailure { .. })));
    assert!(!dst.path().join("photo.raw").exists());
}

#[tokio::test]
async fn test_relay_rejects_other_protocol_version() {
    let port = start_relay().await;
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let hello = RelayHello {
        version: PROTOCOL_VERSION + 1,
        fingerprint: Fingerprint::from_phrase("amber-falcon-river-42"),
        role: Role::Sender,
    };
    write_frame(&mut stream, &hello).await.unwrap();

    let reply: RelayReply = read_frame(&mut stream).await.unwrap();
    assert_eq!(reply, RelayReply::VersionMismatch { expected: PROTOCOL_VERSION });

    let result = connect_relay("127.0.0.1", &[port], &hello, Duration::from_secs(2)).await;
    assert!(matches!(result, Err(Error::VersionMismatch { .. })));
}

// ============================================================================
// Resume Tests
// ============================================================================

async fn seed_partial(dst: &Path, descriptor: &FileDescriptor, data: &[u8], chunk_size: usize, chunks: &[u64]) {
    let mut storage = ChunkStorage::open(descriptor.destination(dst).unwrap(), descriptor, chunk_size)
        .await
        .unwrap();
    for &index in chunks {
        let start = index as usize * chunk_size;
        let end = (start + chunk_size).min(data.len());
        storage.store_chunk(index, &data[start..end]).await.unwrap();
    }
    storage.persist_state().await.unwrap();
}

#[tokio::test]
async fn test_resume_sends_only_missing_chunks() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let chunk_size = 4096;
    let data = random_bytes(chunk_size * 9 + 100);
    let path = src.path().join("movie.mkv");
    std::fs::write(&path, &data).unwrap();

    let descriptor = describe_paths(&[path.clone()], false).unwrap().remove(0).descriptor;
    seed_partial(dst.path(), &descriptor, &data, chunk_size, &[0, 1, 2, 5]).await;

    let mut sender_options = stream_options("amber-falcon-river-42", true);
    sender_options.chunk_size = chunk_size;
    let sender = Session::new(sender_options).unwrap();
    let receiver = Session::new(stream_options("amber-falcon-river-42", false)).unwrap();

    let (a, b) = tokio::io::duplex(256 * 1024);
    let (sent, received) = tokio::join!(
        sender.send_over(a, TransferOptions::new([path])),
        receiver.receive_over(b, dst.path()),
    );

    let sent = sent.unwrap();
    let received = received.unwrap();
    assert_eq!(sent.chunks_sent, 6);
    assert_eq!(sent.chunks_skipped, 4);
    assert_eq!(received.chunks_skipped, 4);
    assert_eq!(std::fs::read(dst.path().join("movie.mkv")).unwrap(), data);

    // partial file and resume state are gone
    let leftovers: Vec<_> = std::fs::read_dir(dst.path()).unwrap().collect();
    assert_eq!(leftovers.len(), 1);
}

fn hidden_entry(dir: &Path, suffix: &str) -> Option<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .find(|path| path.to_string_lossy().ends_with(suffix))
}

#[tokio::test]
async fn test_interrupted_transfer_resumes_from_saved_state() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let chunk_size = 4096;
    let total_chunks = 512;
    let data = random_bytes(chunk_size * total_chunks);
    let path = src.path().join("backup.tar");
    std::fs::write(&path, &data).unwrap();

    let session_options = |sender: bool| {
        let mut options = stream_options("amber-falcon-river-42", sender);
        options.chunk_size = chunk_size;
        options
    };

    // first attempt: the sender goes away once ~600 KB have landed
    let sender = Session::new(session_options(true)).unwrap();
    let receiver = Session::new(session_options(false)).unwrap();
    let abort = sender.abort_handle();
    let mut receiver_state = receiver.subscribe();
    let watcher = async move {
        while receiver_state.changed().await.is_ok() {
            if receiver_state.borrow().bytes_transferred >= 600_000 {
                abort.abort();
                break;
            }
        }
    };

    let (a, b) = tokio::io::duplex(64 * 1024);
    let (sent, received, _) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(
            sender.send_over(a, TransferOptions::new([path.clone()])),
            receiver.receive_over(b, dst.path()),
            watcher,
        )
    })
    .await
    .unwrap();

    assert!(matches!(sent, Err(Error::Aborted)));
    assert!(received.is_err());
    assert!(!dst.path().join("backup.tar").exists());

    let part = hidden_entry(dst.path(), ".part").expect("partial data kept");
    let state_path = hidden_entry(dst.path(), ".part.json").expect("resume state kept");
    let state: ResumeState = serde_json::from_slice(&std::fs::read(&state_path).unwrap()).unwrap();
    let persisted = state.received.len();
    assert!(persisted > 0);
    assert!(persisted < total_chunks);
    assert_eq!(std::fs::metadata(&part).unwrap().len(), data.len() as u64);

    // second attempt picks up the saved chunks
    let sender = Session::new(session_options(true)).unwrap();
    let receiver = Session::new(session_options(false)).unwrap();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (sent, received) = tokio::join!(
        sender.send_over(a, TransferOptions::new([path])),
        receiver.receive_over(b, dst.path()),
    );

    let sent = sent.unwrap();
    received.unwrap();
    assert_eq!(sent.chunks_skipped, persisted as u64);
    assert_eq!(sent.chunks_sent, (total_chunks - persisted) as u64);
    let saved = std::fs::read(dst.path().join("backup.tar")).unwrap();
    assert_eq!(Sha256::digest(&saved), Sha256::digest(&data));
    assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_resume_with_everything_present_sends_nothing() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let chunk_size = 1024;
    let data = random_bytes(chunk_size * 3);
    let path = src.path().join("done.bin");
    std::fs::write(&path, &data).unwrap();

    let descriptor = describe_paths(&[path.clone()], false).unwrap().remove(0).descriptor;
    seed_partial(dst.path(), &descriptor, &data, chunk_size, &[2, 0, 1]).await;

    let mut sender_options = stream_options("amber-falcon-river-42", true);
    sender_options.chunk_size = chunk_size;
    let sender = Session::new(sender_options).unwrap();
    let receiver = Session::new(stream_options("amber-falcon-river-42", false)).unwrap();

    let (a, b) = tokio::io::duplex(64 * 1024);
    let (sent, received) = tokio::join!(
        sender.send_over(a, TransferOptions::new([path])),
        receiver.receive_over(b, dst.path()),
    );

    assert_eq!(sent.unwrap().chunks_sent, 0);
    assert_eq!(received.unwrap().files, vec![dst.path().join("done.bin")]);
    assert_eq!(std::fs::read(dst.path().join("done.bin")).unwrap(), data);
}

// ============================================================================
// Out-of-Order Assembly Tests
// ============================================================================

#[tokio::test]
async fn test_shuffled_chunks_assemble_exactly() {
    use rand::seq::SliceRandom;

    let dst = TempDir::new().unwrap();
    let chunk_size = 512;
    let data = random_bytes(chunk_size * 20 + 7);
    let descriptor = FileDescriptor {
        path: "shuffled.bin".into(),
        size: data.len() as u64,
        hash: Sha256::digest(&data).into(),
        keep_path: false,
    };

    let mut order: Vec<u64> = (0..descriptor.chunk_count(chunk_size)).collect();
    order.shuffle(&mut rand::rng());

    let mut storage = ChunkStorage::open(descriptor.destination(dst.path()).unwrap(), &descriptor, chunk_size)
        .await
        .unwrap();
    for index in order {
        let start = index as usize * chunk_size;
        let end = (start + chunk_size).min(data.len());
        assert!(storage.store_chunk(index, &data[start..end]).await.unwrap());
    }
    assert!(storage.is_complete());

    let saved = storage.finalize(&descriptor).await.unwrap();
    assert_eq!(std::fs::read(saved).unwrap(), data);
}

// ============================================================================
// Folder and Observer Tests
// ============================================================================

#[tokio::test]
async fn test_folder_keeps_relative_paths() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let album = src.path().join("album");
    std::fs::create_dir_all(album.join("2024")).unwrap();
    std::fs::write(album.join("cover.jpg"), random_bytes(3000)).unwrap();
    std::fs::write(album.join("2024").join("beach.jpg"), random_bytes(70_000)).unwrap();

    let sender = Session::new(stream_options("amber-falcon-river-42", true)).unwrap();
    let receiver = Session::new(stream_options("amber-falcon-river-42", false)).unwrap();

    let (a, b) = tokio::io::duplex(256 * 1024);
    let (sent, received) = tokio::join!(
        sender.send_over(a, TransferOptions::new([album.clone()])),
        receiver.receive_over(b, dst.path()),
    );

    assert_eq!(sent.unwrap().files.len(), 2);
    assert_eq!(received.unwrap().files.len(), 2);
    assert_eq!(
        std::fs::read(dst.path().join("album").join("2024").join("beach.jpg")).unwrap(),
        std::fs::read(album.join("2024").join("beach.jpg")).unwrap()
    );
    assert_eq!(
        std::fs::read(dst.path().join("album").join("cover.jpg")).unwrap(),
        std::fs::read(album.join("cover.jpg")).unwrap()
    );
}

#[tokio::test]
async fn test_phase_transitions_in_order() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    std::fs::write(src.path().join("a.txt"), b"phases").unwrap();

    let sender = Session::new(stream_options("amber-falcon-river-42", true)).unwrap();
    let receiver = Session::new(stream_options("amber-falcon-river-42", false)).unwrap();
    let mut sender_phases = sender.transitions();
    let mut receiver_phases = receiver.transitions();

    let (a, b) = tokio::io::duplex(64 * 1024);
    let (sent, received) = tokio::join!(
        sender.send_over(a, TransferOptions::new([src.path().join("a.txt")])),
        receiver.receive_over(b, dst.path()),
    );
    sent.unwrap();
    received.unwrap();

    let expected = [
        Phase::ChannelSecuring,
        Phase::ChannelSecured,
        Phase::Negotiating,
        Phase::FileTransfer,
        Phase::Done,
    ];
    for phase in expected {
        assert_eq!(sender_phases.try_recv().unwrap(), phase);
        assert_eq!(receiver_phases.try_recv().unwrap(), phase);
    }
    assert!(sender_phases.try_recv().is_err());
}

// ============================================================================
// Local Discovery Tests
// ============================================================================

#[tokio::test]
async fn test_local_discovery_skips_relay() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let data = random_bytes(100_000);
    std::fs::write(src.path().join("lan.bin"), &data).unwrap();

    let discovery_port = free_udp_port();
    let no_relay = vec![dead_port()];

    let mut sender_options = relay_options("amber-falcon-river-42", true, no_relay.clone());
    sender_options.disable_local = false;
    sender_options.discovery_target = Some(SocketAddr::from(([127, 0, 0, 1], discovery_port)));
    sender_options.discovery_timeout = Duration::from_secs(10);

    let mut receiver_options = relay_options("amber-falcon-river-42", false, no_relay);
    receiver_options.disable_local = false;
    receiver_options.discovery_port = discovery_port;
    receiver_options.discovery_timeout = Duration::from_secs(10);

    let sender = Session::new(sender_options).unwrap();
    let receiver = Session::new(receiver_options).unwrap();

    let (sent, received) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(
            sender.send(TransferOptions::new([src.path().join("lan.bin")])),
            receiver.receive(dst.path()),
        )
    })
    .await
    .unwrap();

    assert_eq!(sent.unwrap().route, Route::Direct);
    assert_eq!(received.unwrap().route, Route::Direct);
    assert_eq!(std::fs::read(dst.path().join("lan.bin")).unwrap(), data);
}
