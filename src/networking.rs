use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::code_phrase::Fingerprint;
use crate::error::{Error, Result};
use crate::utils::{RelayHello, RelayReply, Role};
use crate::{MAX_FRAME_SIZE, PROTOCOL_VERSION};

/// Frames exchanged between the two parties once a transport exists.
#[derive(Serialize, Deserialize, Debug)]
pub enum PeerFrame {
    Pake { version: u8, role: Role, body: Vec<u8> },
    Confirm(Vec<u8>),
    /// A sealed `Control` message
    Control(Vec<u8>),
    Chunk { file: u32, index: u64, payload: Vec<u8> },
}

/// Write one length-prefixed bincode frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = bincode::serialize(message)?;
    if encoded.len() > MAX_FRAME_SIZE {
        return Err(Error::protocol(format!("frame of {} bytes exceeds limit", encoded.len())));
    }
    writer.write_u32(encoded.len() as u32).await?;
    writer.write_all(&encoded).await?;
    // relays forward whatever arrives, so push it out now
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A clean close before the length prefix yields `None`.
pub async fn read_frame_opt<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(Error::protocol(format!("incoming frame of {} bytes exceeds limit", len)));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::NetworkInterrupted("connection closed mid-frame".into())
        } else {
            Error::Io(e)
        }
    })?;
    Ok(Some(bincode::deserialize(&buffer)?))
}

/// Read one frame, treating a closed connection as an interruption.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    read_frame_opt(reader)
        .await?
        .ok_or_else(|| Error::NetworkInterrupted("peer closed the connection".into()))
}

fn relay_endpoint(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    }
}

/// Connect to the relay, trying each port in order, and wait to be paired.
///
/// Returns the relay stream once the relay reports both parties present; from
/// then on it is an opaque pipe to the peer.
pub async fn connect_relay(
    address: &str,
    ports: &[u16],
    hello: &RelayHello,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    for &port in ports {
        let endpoint = relay_endpoint(address, port);
        debug!("Connecting to relay at {}", endpoint);

        let mut stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Relay port {} unreachable: {}", port, e);
                continue;
            }
            Err(_) => {
                warn!("Relay port {} timed out after {:?}", port, connect_timeout);
                continue;
            }
        };
        stream.set_nodelay(true)?;

        let first_reply = async {
            write_frame(&mut stream, hello).await?;
            read_frame::<_, RelayReply>(&mut stream).await
        };
        let reply = match tokio::time::timeout(connect_timeout, first_reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!("Relay port {} did not complete the hello: {}", port, e);
                continue;
            }
            Err(_) => {
                warn!("Relay port {} did not answer the hello", port);
                continue;
            }
        };

        info!("Connected to relay at {} (room {})", endpoint, hello.fingerprint.short());
        return await_pairing(stream, reply).await;
    }

    Err(Error::RelayUnreachable {
        address: address.to_string(),
        ports: ports.to_vec(),
    })
}

async fn await_pairing(mut stream: TcpStream, mut reply: RelayReply) -> Result<TcpStream> {
    loop {
        match reply {
            RelayReply::Paired => {
                info!("Relay paired us with the peer");
                return Ok(stream);
            }
            RelayReply::Waiting => {
                info!("Waiting for the other party to join");
            }
            RelayReply::VersionMismatch { expected } => {
                return Err(Error::VersionMismatch { expected, got: PROTOCOL_VERSION });
            }
            RelayReply::Rejected { reason } => {
                return Err(Error::protocol(format!("relay rejected session: {}", reason)));
            }
        }
        reply = read_frame(&mut stream).await?;
    }
}

/// Connect straight to a peer found by local discovery.
pub async fn connect_direct(
    addr: SocketAddr,
    hello: &RelayHello,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::NetworkInterrupted(format!("direct connect to {} timed out", addr)))??;
    stream.set_nodelay(true)?;

    write_frame(&mut stream, hello).await?;
    let reply: RelayReply = read_frame(&mut stream).await?;
    await_pairing(stream, reply).await
}

/// Accept a direct peer on the sender's discovery listener.
///
/// Connections presenting another room or role are turned away and the
/// listener keeps waiting.
pub async fn accept_direct(listener: &TcpListener, fingerprint: &Fingerprint) -> Result<TcpStream> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        debug!("Direct connection attempt from {}", addr);

        let hello: RelayHello = match read_frame(&mut stream).await {
            Ok(hello) => hello,
            Err(e) => {
                debug!("Dropping direct connection from {}: {}", addr, e);
                continue;
            }
        };

        if hello.version != PROTOCOL_VERSION {
            let _ = write_frame(&mut stream, &RelayReply::VersionMismatch { expected: PROTOCOL_VERSION }).await;
            continue;
        }
        if hello.fingerprint != *fingerprint || hello.role != Role::Receiver {
            let _ = write_frame(&mut stream, &RelayReply::Rejected { reason: "unknown session".into() }).await;
            continue;
        }

        write_frame(&mut stream, &RelayReply::Paired).await?;
        stream.set_nodelay(true)?;
        info!("Direct peer connected from {}", addr);
        return Ok(stream);
    }
}
