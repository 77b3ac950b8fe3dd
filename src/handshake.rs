//! Password-authenticated key exchange over an established transport.
//!
//! Both sides run SPAKE2 (sender as side A, receiver as side B), derive the
//! session key, then exchange key-confirmation tags. A wrong code phrase on
//! either side surfaces as `HandshakeMismatch` on both.

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::code_phrase::Fingerprint;
use crate::cryptography::{
    confirmation_tag, derive_session_key, generate_initial_pake_message, verify_confirmation,
    SecureChannel,
};
use crate::error::{Error, Result};
use crate::networking::{read_frame, write_frame, PeerFrame};
use crate::progress::{Phase, ProgressReporter};
use crate::utils::Role;
use crate::PROTOCOL_VERSION;

pub async fn perform_pake<S>(
    stream: &mut S,
    phrase: &str,
    role: Role,
    fingerprint: &Fingerprint,
    progress: &ProgressReporter,
) -> Result<SecureChannel>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    progress.advance_phase(Phase::ChannelSecuring);

    let (spake, outbound) = generate_initial_pake_message(phrase, role, fingerprint);
    write_frame(stream, &PeerFrame::Pake { version: PROTOCOL_VERSION, role, body: outbound }).await?;
    debug!("Sent PAKE message as {}", role.as_str());

    let inbound = match read_frame(stream).await? {
        PeerFrame::Pake { version, role: peer_role, body } => {
            if version != PROTOCOL_VERSION {
                return Err(Error::VersionMismatch { expected: PROTOCOL_VERSION, got: version });
            }
            if peer_role != role.peer() {
                return Err(Error::protocol(format!(
                    "both parties claim to be the {}",
                    role.as_str()
                )));
            }
            body
        }
        other => return Err(Error::protocol(format!("expected PAKE message, got {:?}", other))),
    };

    let session_key = derive_session_key(spake, &inbound)?;

    write_frame(stream, &PeerFrame::Confirm(confirmation_tag(&session_key, role)?)).await?;
    match read_frame(stream).await? {
        PeerFrame::Confirm(tag) => verify_confirmation(&session_key, role.peer(), &tag)?,
        other => return Err(Error::protocol(format!("expected key confirmation, got {:?}", other))),
    }

    progress.advance_phase(Phase::ChannelSecured);
    info!("Channel secured");
    Ok(SecureChannel::new(session_key, role))
}
