use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{copy_bidirectional, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::code_phrase::Fingerprint;
use crate::error::{Error, Result};
use crate::networking::{read_frame, write_frame};
use crate::utils::{RelayHello, RelayReply, Role};
use crate::PROTOCOL_VERSION;

/// How long a lone party may wait in a room before it is dropped.
pub const ROOM_TTL: Duration = Duration::from_secs(10 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on a single reply written from the manager loop.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Connection {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub role: Role,
}

pub struct NewConnection {
    pub connection: Connection,
    pub fingerprint: Fingerprint,
}

pub enum Message {
    NewConnection(NewConnection),
    Sweep,
}

/// A room holds the first party to arrive until its peer shows up.
pub struct Room {
    pub waiting: Connection,
    pub opened_at: Instant,
}

pub struct ConnectionManager {
    pub rooms: HashMap<Fingerprint, Room>,
    pub receiver_channel: Receiver<Message>,
}

impl ConnectionManager {
    pub fn new(receiver_channel: Receiver<Message>) -> Self {
        ConnectionManager { rooms: HashMap::new(), receiver_channel }
    }

    pub async fn create_or_assign_room(&mut self, message: NewConnection) {
        let NewConnection { mut connection, fingerprint } = message;

        match self.rooms.entry(fingerprint) {
            Entry::Vacant(e) => {
                if send_reply(&mut connection.stream, &RelayReply::Waiting, REPLY_TIMEOUT).await {
                    let role = connection.role.as_str();
                    info!("Opened room {} for {} at {}", fingerprint.short(), role, connection.addr);
                    e.insert(Room { waiting: connection, opened_at: Instant::now() });
                }
            }
            Entry::Occupied(mut e) => {
                if !is_connection_alive(&e.get().waiting.stream) {
                    info!("Party waiting in room {} left; {} takes its place", fingerprint.short(), connection.addr);
                    if send_reply(&mut connection.stream, &RelayReply::Waiting, REPLY_TIMEOUT).await {
                        e.insert(Room { waiting: connection, opened_at: Instant::now() });
                    } else {
                        e.remove();
                    }
                    return;
                }

                if e.get().waiting.role == connection.role {
                    warn!(
                        "Room {} already has a {}; rejecting {}",
                        fingerprint.short(),
                        connection.role.as_str(),
                        connection.addr
                    );
                    let reason = format!("room already has a {}", connection.role.as_str());
                    tokio::spawn(async move {
                        send_reply(&mut connection.stream, &RelayReply::Rejected { reason }, REPLY_TIMEOUT).await;
                    });
                    return;
                }

                let room = e.remove();
                info!("Pairing room {}", fingerprint.short());
                tokio::spawn(pipe(room.waiting, connection));
            }
        }
    }

    /// Drop rooms whose lone party has waited longer than `ttl`.
    pub fn sweep(&mut self, ttl: Duration) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|fingerprint, room| {
            let keep = room.opened_at.elapsed() < ttl;
            if !keep {
                info!("Room {} expired, dropping {}", fingerprint.short(), room.waiting.addr);
            }
            keep
        });
        before - self.rooms.len()
    }
}

/// Write one reply, giving up on a peer that does not drain its socket.
async fn send_reply<S>(stream: &mut S, reply: &RelayReply, limit: Duration) -> bool
where
    S: AsyncWrite + Unpin,
{
    match tokio::time::timeout(limit, write_frame(stream, reply)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Reply {:?} failed: {}", reply, e);
            false
        }
        Err(_) => {
            warn!("Reply {:?} timed out after {:?}", reply, limit);
            false
        }
    }
}

/// A closed socket reads as EOF right away; a live idle one would block.
fn is_connection_alive(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Ok(0) => false,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(_) => false,
        Ok(_) => true,
    }
}

async fn pipe(first: Connection, second: Connection) {
    let (mut sender, mut receiver) = if first.role == Role::Sender { (first, second) } else { (second, first) };

    for party in [&mut sender, &mut receiver] {
        if let Err(e) = write_frame(&mut party.stream, &RelayReply::Paired).await {
            warn!("Could not tell {} it was paired: {}", party.addr, e);
            return;
        }
    }

    match copy_bidirectional(&mut sender.stream, &mut receiver.stream).await {
        Ok((to_receiver, to_sender)) => info!(
            "Relay session {} <-> {} ended: {} bytes to receiver, {} bytes to sender",
            sender.addr, receiver.addr, to_receiver, to_sender
        ),
        Err(e) => debug!("Relay session {} <-> {} closed: {}", sender.addr, receiver.addr, e),
    }
}

pub async fn relay_manager(mut manager: ConnectionManager) {
    while let Some(message) = manager.receiver_channel.recv().await {
        match message {
            Message::NewConnection(message) => manager.create_or_assign_room(message).await,
            Message::Sweep => {
                let dropped = manager.sweep(ROOM_TTL);
                if dropped > 0 {
                    debug!("Sweep dropped {} room(s), {} open", dropped, manager.rooms.len());
                }
            }
        }
    }
}

/// Read the hello of a fresh connection and hand it to the manager.
pub async fn handle_new_connection(mut stream: TcpStream, addr: SocketAddr, manager_channel: Sender<Message>) {
    let hello: RelayHello = match tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut stream)).await {
        Ok(Ok(hello)) => hello,
        Ok(Err(e)) => {
            debug!("Dropping {}: bad hello: {}", addr, e);
            return;
        }
        Err(_) => {
            debug!("Dropping {}: no hello within {:?}", addr, HELLO_TIMEOUT);
            return;
        }
    };

    if hello.version != PROTOCOL_VERSION {
        warn!("Client {} speaks protocol v{}, expected v{}", addr, hello.version, PROTOCOL_VERSION);
        let _ = write_frame(&mut stream, &RelayReply::VersionMismatch { expected: PROTOCOL_VERSION }).await;
        return;
    }
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
    }

    let message = NewConnection {
        connection: Connection { stream, addr, role: hello.role },
        fingerprint: hello.fingerprint,
    };
    if manager_channel.send(Message::NewConnection(message)).await.is_err() {
        warn!("Relay manager is gone, dropping {}", addr);
    }
}

async fn accept_loop(listener: TcpListener, manager_channel: Sender<Message>) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("Client connected: {}", addr);
        tokio::spawn(handle_new_connection(stream, addr, manager_channel.clone()));
    }
}

/// The relay server: one accept loop per bound port feeding a single room
/// manager.
pub struct Relay {
    listeners: Vec<TcpListener>,
}

impl Relay {
    /// Bind every address. Ports that fail to bind are skipped with a
    /// warning, as long as at least one succeeds.
    pub async fn bind(addrs: &[SocketAddr]) -> Result<Self> {
        let mut listeners = Vec::new();
        for addr in addrs {
            match TcpListener::bind(addr).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => warn!("Could not bind relay port {}: {}", addr, e),
            }
        }
        if listeners.is_empty() {
            return Err(Error::InvalidConfig("relay could not bind any port".into()));
        }
        Ok(Self { listeners })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(|l| l.local_addr().ok()).collect()
    }

    /// Serve until an accept loop fails.
    pub async fn run(self) -> Result<()> {
        let (sender_channel, receiver_channel) = mpsc::channel::<Message>(100);
        tokio::spawn(relay_manager(ConnectionManager::new(receiver_channel)));

        let sweeper = sender_channel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                if sweeper.send(Message::Sweep).await.is_err() {
                    return;
                }
            }
        });

        let mut accept_loops = JoinSet::new();
        for listener in self.listeners {
            let channel = sender_channel.clone();
            accept_loops.spawn(accept_loop(listener, channel));
        }

        match accept_loops.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(std::io::Error::from(e).into()),
            None => Ok(()),
        }
    }
}
