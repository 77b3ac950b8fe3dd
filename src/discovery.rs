//! Local network discovery.
//!
//! The sender announces its direct listener over UDP while it also waits on
//! the relay; a receiver on the same network that hears an announce for its
//! room connects straight to the sender instead.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::code_phrase::Fingerprint;
use crate::error::Result;
use crate::PROTOCOL_VERSION;

pub const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(250);

const MAGIC: &[u8; 4] = b"FRRY";
const MAX_PACKET: usize = 512;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    pub version: u8,
    pub fingerprint: Fingerprint,
    /// TCP port of the sender's direct listener
    pub port: u16,
}

impl Announce {
    pub fn new(fingerprint: Fingerprint, port: u16) -> Self {
        Self { version: PROTOCOL_VERSION, fingerprint, port }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut packet = MAGIC.to_vec();
        packet.extend(bincode::serialize(self)?);
        Ok(packet)
    }

    fn decode(packet: &[u8]) -> Option<Self> {
        let body = packet.strip_prefix(MAGIC.as_slice())?;
        bincode::deserialize(body).ok()
    }
}

/// Default announce destination: IPv4 broadcast on the discovery port.
pub fn broadcast_target(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)
}

/// Periodically sends an announce until dropped.
pub struct Announcer {
    task: JoinHandle<()>,
}

impl Announcer {
    pub async fn spawn(target: SocketAddr, announce: Announce, interval: Duration) -> Result<Self> {
        let bind_addr: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        let packet = announce.encode()?;
        debug!("Announcing room {} on {} every {:?}", announce.fingerprint.short(), target, interval);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = socket.send_to(&packet, target).await {
                    // no route to the broadcast address is common on isolated hosts
                    debug!("Announce to {} failed: {}", target, e);
                }
            }
        });
        Ok(Self { task })
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct Listener {
    socket: UdpSocket,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for an announce carrying `fingerprint`. Returns the sender's
    /// direct address, or `None` when nothing matching arrives in time.
    pub async fn find(&self, fingerprint: &Fingerprint, timeout: Duration) -> Result<Option<SocketAddr>> {
        let deadline = Instant::now() + timeout;
        let mut buffer = [0u8; MAX_PACKET];

        loop {
            let (len, from) = match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buffer)).await {
                Ok(received) => received?,
                Err(_) => {
                    debug!("No local announce for room {} within {:?}", fingerprint.short(), timeout);
                    return Ok(None);
                }
            };

            match Announce::decode(&buffer[..len]) {
                Some(announce) if announce.fingerprint == *fingerprint => {
                    if announce.version != PROTOCOL_VERSION {
                        warn!(
                            "Ignoring local peer at {} speaking protocol v{}",
                            from, announce.version
                        );
                        continue;
                    }
                    let addr = SocketAddr::new(from.ip(), announce.port);
                    debug!("Found local sender at {}", addr);
                    return Ok(Some(addr));
                }
                Some(_) => continue,
                None => debug!("Ignoring stray packet from {}", from),
            }
        }
    }
}
