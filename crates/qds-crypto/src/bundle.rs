//! Key-bundle container: open and seal
//!
//! Bundle format (binary):
//! ```text
//! [32 bytes: KIKEY]
//! [10 x 32 bytes: circle keys]
//! [N x 100 x 32 bytes: session key batches, 1 <= N <= 255]
//! [16 bytes: MAC over every preceding byte, keyed by expand(KIKEY)]
//! ```
//!
//! Everything before the MAC is one OFB stream (all-zero IV) under
//! `expand(derive(password))`. The MAC is keyed by the *decrypted* KIKEY, so a
//! wrong password and a corrupted file fail the same check.

use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::SecretString;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::cipher::BlockCipher;
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::derive_master_key;
use crate::keystore::SessionBatch;
use crate::mac::{compute_tag, verify_tag};
use crate::ofb::Ofb;
use crate::schedule::ExpandedKey;
use crate::{
    BLOCK_SIZE, CIRCLE_KEY_COUNT, KEY_SIZE, MAX_SESSION_BATCHES, SESSION_BATCH_SIZE, TAG_SIZE,
};

const WRAP_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];
const CIRCLE_REGION: usize = CIRCLE_KEY_COUNT * KEY_SIZE;
const SESSION_BATCH_BYTES: usize = SESSION_BATCH_SIZE * KEY_SIZE;

/// Unwrapped contents of a bundle, ready to install into a key store.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct LoadedKeys {
    pub(crate) kikey: [u8; KEY_SIZE],
    pub(crate) circle: [[u8; KEY_SIZE]; CIRCLE_KEY_COUNT],
    pub(crate) sessions: Vec<SessionBatch>,
}

impl LoadedKeys {
    pub(crate) fn new(
        kikey: [u8; KEY_SIZE],
        circle: [[u8; KEY_SIZE]; CIRCLE_KEY_COUNT],
        sessions: Vec<SessionBatch>,
    ) -> Self {
        Self {
            kikey,
            circle,
            sessions,
        }
    }

    pub fn session_batches(&self) -> usize {
        self.sessions.len()
    }
}

impl std::fmt::Debug for LoadedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedKeys")
            .field("keys", &"[REDACTED]")
            .field("session_batches", &self.sessions.len())
            .finish()
    }
}

/// Verify and unwrap a bundle.
///
/// Checks run in order: minimum size, trailing MAC, circle region, session
/// region shape. Nothing is returned unless the MAC verifies.
pub fn open_bundle<C: BlockCipher>(
    password: &SecretString,
    data: &[u8],
) -> CryptoResult<LoadedKeys> {
    if data.len() < KEY_SIZE + TAG_SIZE {
        return Err(CryptoError::ContainerTooShort {
            what: "key bundle",
            needed: KEY_SIZE + TAG_SIZE,
            available: data.len(),
        });
    }

    let (body, tag) = data.split_at(data.len() - TAG_SIZE);

    let wrap_key = ExpandedKey::<C>::from_master(&derive_master_key(password));
    let mut stream = Ofb::new(&wrap_key, &WRAP_IV);

    let mut kikey = Zeroizing::new([0u8; KEY_SIZE]);
    kikey.copy_from_slice(&body[..KEY_SIZE]);
    stream.apply_keystream(&mut kikey[..]);

    let mac_key = ExpandedKey::<C>::expand(&kikey);
    if !verify_tag(&mac_key, body, tag) {
        warn!(bundle_bytes = data.len(), "key bundle MAC mismatch");
        return Err(CryptoError::IntegrityFailure(
            "key bundle tag mismatch (wrong password or corrupted bundle)",
        ));
    }

    let rest = &body[KEY_SIZE..];
    if rest.len() < CIRCLE_REGION {
        return Err(CryptoError::ContainerTooShort {
            what: "circle keys",
            needed: CIRCLE_REGION,
            available: rest.len(),
        });
    }
    let (circle_region, session_region) = rest.split_at(CIRCLE_REGION);

    let mut circle = Zeroizing::new([[0u8; KEY_SIZE]; CIRCLE_KEY_COUNT]);
    for (slot, raw) in circle.iter_mut().zip(circle_region.chunks_exact(KEY_SIZE)) {
        slot.copy_from_slice(raw);
        stream.apply_keystream(slot);
    }

    if session_region.len() % SESSION_BATCH_BYTES != 0 {
        return Err(CryptoError::MalformedLength {
            len: session_region.len(),
            batch: SESSION_BATCH_BYTES,
        });
    }
    let users = session_region.len() / SESSION_BATCH_BYTES;
    if users == 0 || users > MAX_SESSION_BATCHES {
        return Err(CryptoError::SuspiciousUserCount(users));
    }

    let mut sessions = Vec::with_capacity(users);
    for batch in session_region.chunks_exact(SESSION_BATCH_BYTES) {
        let mut keys = Vec::with_capacity(SESSION_BATCH_SIZE);
        for raw in batch.chunks_exact(KEY_SIZE) {
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(raw);
            stream.apply_keystream(&mut key);
            keys.push(key);
            key.zeroize();
        }
        sessions.push(SessionBatch::from_keys(keys));
    }

    debug!(users, "key bundle unwrapped");
    Ok(LoadedKeys::new(*kikey, *circle, sessions))
}

/// Build a bundle from explicit key material.
pub fn seal_bundle<C: BlockCipher>(
    password: &SecretString,
    kikey: &[u8; KEY_SIZE],
    circle: &[[u8; KEY_SIZE]; CIRCLE_KEY_COUNT],
    sessions: &[[[u8; KEY_SIZE]; SESSION_BATCH_SIZE]],
) -> CryptoResult<Vec<u8>> {
    if sessions.is_empty() || sessions.len() > MAX_SESSION_BATCHES {
        return Err(CryptoError::SuspiciousUserCount(sessions.len()));
    }

    let mut body = Zeroizing::new(Vec::with_capacity(
        KEY_SIZE + CIRCLE_REGION + sessions.len() * SESSION_BATCH_BYTES + TAG_SIZE,
    ));
    body.extend_from_slice(kikey);
    for key in circle {
        body.extend_from_slice(key);
    }
    for batch in sessions {
        for key in batch {
            body.extend_from_slice(key);
        }
    }

    Ok(seal_body::<C>(password, kikey, body))
}

/// Encrypt a plaintext body (KIKEY first) and append its MAC.
fn seal_body<C: BlockCipher>(
    password: &SecretString,
    kikey: &[u8; KEY_SIZE],
    mut body: Zeroizing<Vec<u8>>,
) -> Vec<u8> {
    let wrap_key = ExpandedKey::<C>::from_master(&derive_master_key(password));
    Ofb::new(&wrap_key, &WRAP_IV).apply_keystream(&mut body);

    let tag = compute_tag(&ExpandedKey::<C>::expand(kikey), &body);

    let mut out = std::mem::take(&mut *body);
    out.extend_from_slice(&tag);
    out
}

/// Generate a bundle for `users` members filled with fresh OS-random keys.
pub fn generate_bundle<C: BlockCipher>(
    password: &SecretString,
    users: usize,
) -> CryptoResult<Vec<u8>> {
    if users == 0 || users > MAX_SESSION_BATCHES {
        return Err(CryptoError::SuspiciousUserCount(users));
    }

    let mut rng = OsRng;

    let mut kikey = Zeroizing::new([0u8; KEY_SIZE]);
    rng.fill_bytes(&mut kikey[..]);

    let mut circle = Zeroizing::new([[0u8; KEY_SIZE]; CIRCLE_KEY_COUNT]);
    for key in circle.iter_mut() {
        rng.fill_bytes(key);
    }

    let mut sessions = Zeroizing::new(vec![[[0u8; KEY_SIZE]; SESSION_BATCH_SIZE]; users]);
    for batch in sessions.iter_mut() {
        for key in batch.iter_mut() {
            rng.fill_bytes(key);
        }
    }

    debug!(users, "generated fresh key bundle");
    seal_bundle::<C>(password, &kikey, &circle, &sessions)
}
