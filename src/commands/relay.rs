use std::error::Error;
use std::net::{IpAddr, SocketAddr};

use log::{debug, info};

use crate::relay_utils::Relay;

/// Run the relay server that pairs senders with receivers.
///
/// # Overview
/// The relay is a rendezvous point and a blind pipe. It:
/// 1. Accepts connections on every configured port
/// 2. Reads each client's hello (protocol version, room fingerprint, role)
/// 3. Parks the first party of a room until the opposite role arrives
/// 4. Pipes bytes between the pair; the handshake and everything after it is end to end
///
/// # Architecture
/// - Accept tasks: one per port
/// - Connection handler tasks: one per client, reading the hello
/// - Manager task: owns the rooms, pairs parties and expires stale rooms
///
/// # Arguments
/// * `host` - Interface to bind, `0.0.0.0` by default
/// * `ports` - Ports to listen on; clients try them in the same order
pub async fn run(host: IpAddr, ports: Vec<u16>) -> Result<(), Box<dyn Error>> {
    let addrs: Vec<SocketAddr> = ports.iter().map(|port| SocketAddr::new(host, *port)).collect();
    debug!("Attempting to bind to {:?}", addrs);

    let relay = Relay::bind(&addrs).await?;
    for addr in relay.local_addrs() {
        println!("Relay listening on {}", addr);
    }
    info!("Relay server started");

    relay.run().await?;
    Ok(())
}
