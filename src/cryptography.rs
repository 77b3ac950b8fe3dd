use chacha20poly1305::aead::Error as AeadError;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};

use crate::code_phrase::{normalize, Fingerprint};
use crate::error::{Error, Result};
use crate::utils::Role;
use crate::{KEY_SIZE, NONCE_SIZE};

const SESSION_KEY_INFO: &[u8] = b"ferry/session-key";
const CHUNK_KEY_INFO: &[u8] = b"ferry/chunk-key";
const CONTROL_KEY_INFO: &[u8] = b"ferry/control-key";
const CONFIRM_KEY_INFO: &[u8] = b"ferry/confirm-key";
const CONFIRM_LABEL: &[u8] = b"ferry key confirmation";

/// SPAKE2 identity for one side of a session, bound to the room fingerprint.
pub fn create_session_id(role: Role, fingerprint: &Fingerprint) -> Identity {
    let mut id = format!("ferry/{}/", role.as_str()).into_bytes();
    id.extend_from_slice(fingerprint.as_bytes());
    Identity::new(&id)
}

/// Start SPAKE2: the sender plays side A, the receiver side B.
pub fn generate_initial_pake_message(
    phrase: &str,
    role: Role,
    fingerprint: &Fingerprint,
) -> (Spake2<Ed25519Group>, Vec<u8>) {
    let normalized = normalize(phrase);
    let pw = Password::new(normalized.as_bytes());
    let id_a = create_session_id(Role::Sender, fingerprint);
    let id_b = create_session_id(Role::Receiver, fingerprint);
    match role {
        Role::Sender => Spake2::<Ed25519Group>::start_a(&pw, &id_a, &id_b),
        Role::Receiver => Spake2::<Ed25519Group>::start_b(&pw, &id_a, &id_b),
    }
}

pub fn derive_session_key(
    spake: Spake2<Ed25519Group>,
    inbound_message: &[u8],
) -> Result<[u8; KEY_SIZE]> {
    let shared_secret = spake
        .finish(inbound_message)
        .map_err(|e| Error::protocol(format!("malformed PAKE message: {:?}", e)))?;

    Ok(expand_key(&shared_secret, SESSION_KEY_INFO, &[]))
}

fn expand_key(ikm: &[u8], info: &[u8], context: &[u8]) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand_multi_info(&[info, context], &mut key)
        .expect("32 bytes is a valid length for HKDF");
    key
}

/// Key for the chunks of one file, so chunk indices never collide across files.
pub fn derive_chunk_key(session_key: &[u8; KEY_SIZE], file_index: u32) -> [u8; KEY_SIZE] {
    expand_key(session_key, CHUNK_KEY_INFO, &file_index.to_be_bytes())
}

fn derive_control_key(session_key: &[u8; KEY_SIZE], from: Role) -> [u8; KEY_SIZE] {
    expand_key(session_key, CONTROL_KEY_INFO, from.as_str().as_bytes())
}

fn derive_confirm_key(session_key: &[u8; KEY_SIZE], from: Role) -> [u8; KEY_SIZE] {
    expand_key(session_key, CONFIRM_KEY_INFO, from.as_str().as_bytes())
}

fn counter_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes[..8].copy_from_slice(&counter.to_le_bytes());
    nonce_bytes
}

fn seal(
    key: &[u8; KEY_SIZE],
    nonce_bytes: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> std::result::Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher.encrypt(Nonce::from_slice(nonce_bytes), plaintext)
}

fn open(
    key: &[u8; KEY_SIZE],
    nonce_bytes: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
) -> std::result::Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    // Fails on any tampering, including a chunk presented under the wrong index.
    cipher.decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
}

pub fn encrypt_chunk(
    key: &[u8; KEY_SIZE],
    chunk: &[u8],
    chunk_index: u64,
) -> std::result::Result<Vec<u8>, AeadError> {
    seal(key, &counter_nonce(chunk_index), chunk)
}

pub fn decrypt_chunk(
    key: &[u8; KEY_SIZE],
    encrypted_chunk: &[u8],
    chunk_index: u64,
) -> std::result::Result<Vec<u8>, AeadError> {
    open(key, &counter_nonce(chunk_index), encrypted_chunk)
}

/// Proof that `role` holds the session key.
pub fn confirmation_tag(session_key: &[u8; KEY_SIZE], role: Role) -> Result<Vec<u8>> {
    Ok(seal(&derive_confirm_key(session_key, role), &[0u8; NONCE_SIZE], CONFIRM_LABEL)?)
}

/// Check the peer's tag; a different phrase on the other side fails here.
pub fn verify_confirmation(session_key: &[u8; KEY_SIZE], peer: Role, tag: &[u8]) -> Result<()> {
    let key = derive_confirm_key(session_key, peer);
    match open(&key, &[0u8; NONCE_SIZE], tag) {
        Ok(label) if label == CONFIRM_LABEL => Ok(()),
        _ => Err(Error::HandshakeMismatch),
    }
}

/// Authenticated control channel established by the handshake.
///
/// Each direction has its own key and a counter nonce, so a dropped, replayed
/// or reordered control message fails to open.
pub struct SecureChannel {
    session_key: [u8; KEY_SIZE],
    sealing: SealingHalf,
    opening: OpeningHalf,
}

impl SecureChannel {
    pub fn new(session_key: [u8; KEY_SIZE], role: Role) -> Self {
        SecureChannel {
            session_key,
            sealing: SealingHalf { key: derive_control_key(&session_key, role), counter: 0 },
            opening: OpeningHalf { key: derive_control_key(&session_key, role.peer()), counter: 0 },
        }
    }

    pub fn session_key(&self) -> &[u8; KEY_SIZE] {
        &self.session_key
    }

    pub fn chunk_key(&self, file_index: u32) -> [u8; KEY_SIZE] {
        derive_chunk_key(&self.session_key, file_index)
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.sealing.seal(plaintext)
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.opening.open(ciphertext)
    }

    pub fn sealing(&mut self) -> &mut SealingHalf {
        &mut self.sealing
    }

    pub fn opening(&mut self) -> &mut OpeningHalf {
        &mut self.opening
    }

    /// Separate halves for a split transport. Each half keeps its own counter.
    pub fn split(self) -> (SealingHalf, OpeningHalf) {
        (self.sealing, self.opening)
    }
}

pub struct SealingHalf {
    key: [u8; KEY_SIZE],
    counter: u64,
}

impl SealingHalf {
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = seal(&self.key, &counter_nonce(self.counter), plaintext)?;
        self.counter += 1;
        Ok(sealed)
    }
}

pub struct OpeningHalf {
    key: [u8; KEY_SIZE],
    counter: u64,
}

impl OpeningHalf {
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plain = open(&self.key, &counter_nonce(self.counter), ciphertext)
            .map_err(|_| Error::protocol("control message failed authentication"))?;
        self.counter += 1;
        Ok(plain)
    }
}
