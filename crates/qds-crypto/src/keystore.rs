//! In-memory key store: circle keys, session-key batches, bundle MAC key
//!
//! One mutex guards the whole state. Every operation that reads or mutates
//! key bytes (load, consume, clear) runs its check-and-mutate sequence under
//! that lock, so a session key is handed out at most once even with
//! concurrent callers, and nobody observes a half-replaced store.
//!
//! Session slots carry an explicit used flag. A consumed slot is also
//! zeroized in place, but the flag is what decides availability: an all-zero
//! key is still a valid key until it has been used.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::bundle::{open_bundle, LoadedKeys};
use crate::cipher::{Aes256Cipher, BlockCipher};
use crate::error::{CryptoError, CryptoResult};
use crate::schedule::ExpandedKey;
use crate::{CIRCLE_KEY_COUNT, KEY_SIZE, SESSION_BATCH_SIZE};

/// Which key tier protects an artifact (header byte 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Circle,
    Session,
}

impl KeyType {
    pub fn to_byte(self) -> u8 {
        match self {
            KeyType::Circle => 0x00,
            KeyType::Session => 0x01,
        }
    }

    pub fn from_byte(b: u8) -> CryptoResult<Self> {
        match b {
            0x00 => Ok(KeyType::Circle),
            0x01 => Ok(KeyType::Session),
            other => Err(CryptoError::UnknownKeyType(other)),
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyType::Circle => f.write_str("circle"),
            KeyType::Session => f.write_str("session"),
        }
    }
}

/// How to pick a session key within the front batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPick {
    /// Exactly this slot; fails if it was already consumed.
    Indexed(u8),
    /// First unconsumed slot scanning forward from this one, wrapping at 100.
    Sequential(u8),
}

/// A key to pull out of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRequest {
    Circle(u8),
    Session(SessionPick),
}

/// An expanded key handed out by the store, with the slot it came from.
#[derive(Debug)]
pub struct ConsumedKey<C: BlockCipher = Aes256Cipher> {
    pub key: ExpandedKey<C>,
    pub key_type: KeyType,
    pub index: u8,
}

/// Point-in-time view of what the store holds. Contains no key material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStoreStatus {
    pub circle_loaded: bool,
    pub session_batches: usize,
    pub front_batch_remaining: usize,
    pub session_keys_remaining: usize,
}

/// One user's batch of 100 single-use session keys.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionBatch {
    keys: Vec<[u8; KEY_SIZE]>,
    // bit i set = slot i consumed
    used: u128,
}

impl SessionBatch {
    pub(crate) fn from_keys(keys: Vec<[u8; KEY_SIZE]>) -> Self {
        debug_assert_eq!(keys.len(), SESSION_BATCH_SIZE);
        Self { keys, used: 0 }
    }

    fn is_used(&self, slot: usize) -> bool {
        self.used & (1u128 << slot) != 0
    }

    fn remaining(&self) -> usize {
        SESSION_BATCH_SIZE - self.used.count_ones() as usize
    }

    fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// First unconsumed slot at or after `start`, wrapping around.
    fn scan_from(&self, start: usize) -> Option<usize> {
        (0..SESSION_BATCH_SIZE)
            .map(|step| (start + step) % SESSION_BATCH_SIZE)
            .find(|&slot| !self.is_used(slot))
    }

    /// Expand the key in `slot`, then wipe the slot and mark it used.
    fn take<C: BlockCipher>(&mut self, slot: usize) -> ExpandedKey<C> {
        let key = ExpandedKey::expand(&self.keys[slot]);
        self.keys[slot].zeroize();
        self.used |= 1u128 << slot;
        key
    }
}

#[derive(Default, Zeroize, ZeroizeOnDrop)]
struct KeyState {
    kikey: Option<[u8; KEY_SIZE]>,
    circle: Option<[[u8; KEY_SIZE]; CIRCLE_KEY_COUNT]>,
    sessions: Vec<SessionBatch>,
    // bumped on every wipe; lets a caller detect a reload between two lock holds
    #[zeroize(skip)]
    generation: u64,
}

impl KeyState {
    fn wipe(&mut self) {
        self.zeroize();
        self.generation = self.generation.wrapping_add(1);
    }

    fn install(&mut self, mut keys: LoadedKeys) {
        self.kikey = Some(keys.kikey);
        self.circle = Some(keys.circle);
        self.sessions = std::mem::take(&mut keys.sessions);
    }

    fn status(&self) -> KeyStoreStatus {
        KeyStoreStatus {
            circle_loaded: self.circle.is_some(),
            session_batches: self.sessions.len(),
            front_batch_remaining: self.sessions.first().map_or(0, SessionBatch::remaining),
            session_keys_remaining: self.sessions.iter().map(SessionBatch::remaining).sum(),
        }
    }

    fn drop_front_batch(&mut self) {
        if !self.sessions.is_empty() {
            // the removed batch wipes itself on drop
            self.sessions.remove(0);
        }
    }

    fn mac_key<C: BlockCipher>(&self) -> CryptoResult<ExpandedKey<C>> {
        let kikey = self
            .kikey
            .as_ref()
            .map(|k| Zeroizing::new(*k))
            .ok_or_else(|| CryptoError::KeyUnavailable("no key bundle loaded".into()))?;
        Ok(ExpandedKey::expand(&kikey))
    }

    fn consume<C: BlockCipher>(&mut self, request: KeyRequest) -> CryptoResult<ConsumedKey<C>> {
        match request {
            KeyRequest::Circle(index) => self.consume_circle(index),
            KeyRequest::Session(pick) => self.consume_session(pick),
        }
    }

    fn consume_circle<C: BlockCipher>(&self, index: u8) -> CryptoResult<ConsumedKey<C>> {
        let slot = usize::from(index);
        if slot >= CIRCLE_KEY_COUNT {
            return Err(CryptoError::KeyUnavailable(format!(
                "circle key index {index} out of range (0..{CIRCLE_KEY_COUNT})"
            )));
        }

        let circle = self
            .circle
            .as_ref()
            .ok_or_else(|| CryptoError::KeyUnavailable("circle keys not loaded".into()))?;

        debug!(index, "circle key expanded");
        Ok(ConsumedKey {
            key: ExpandedKey::expand(&circle[slot]),
            key_type: KeyType::Circle,
            index,
        })
    }

    fn consume_session<C: BlockCipher>(&mut self, pick: SessionPick) -> CryptoResult<ConsumedKey<C>> {
        let batch = self
            .sessions
            .first_mut()
            .ok_or_else(|| CryptoError::KeyUnavailable("no session keys loaded".into()))?;

        let slot = match pick {
            SessionPick::Indexed(index) => {
                let slot = usize::from(index);
                if slot >= SESSION_BATCH_SIZE {
                    return Err(CryptoError::KeyUnavailable(format!(
                        "session key index {index} out of range (0..{SESSION_BATCH_SIZE})"
                    )));
                }
                if batch.is_used(slot) {
                    return Err(CryptoError::KeyUnavailable(format!(
                        "session key {index} already consumed"
                    )));
                }
                slot
            }
            SessionPick::Sequential(start) => {
                match batch.scan_from(usize::from(start) % SESSION_BATCH_SIZE) {
                    Some(slot) => slot,
                    None => {
                        self.drop_front_batch();
                        return Err(CryptoError::KeyUnavailable(
                            "front session batch exhausted".into(),
                        ));
                    }
                }
            }
        };

        let key = batch.take::<C>(slot);
        let remaining = batch.remaining();
        if batch.is_exhausted() {
            self.drop_front_batch();
            debug!(batches_left = self.sessions.len(), "session batch exhausted, dropped");
        }

        debug!(slot, remaining, "session key consumed");
        Ok(ConsumedKey {
            key,
            key_type: KeyType::Session,
            index: slot as u8,
        })
    }
}

/// MAC key tied to the bundle it was derived from.
///
/// Obtained from [`KeyStore::mac_key_snapshot`]; pass it back to
/// [`KeyStore::consume_matching`] so the payload key is guaranteed to come
/// from the same bundle that authenticated the data.
pub struct MacKeySnapshot<C: BlockCipher = Aes256Cipher> {
    pub key: ExpandedKey<C>,
    generation: u64,
}

impl<C: BlockCipher> std::fmt::Debug for MacKeySnapshot<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKeySnapshot")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Owned, internally synchronized key store.
///
/// Created empty, filled wholesale by [`KeyStore::load`], drained by
/// [`KeyStore::consume`]. Share it across threads with `Arc`.
pub struct KeyStore<C: BlockCipher = Aes256Cipher> {
    state: Mutex<KeyState>,
    _cipher: PhantomData<fn() -> C>,
}

impl KeyStore<Aes256Cipher> {
    /// Empty store using the AES-256 reference backend.
    pub fn new() -> Self {
        Self::empty()
    }
}

impl<C: BlockCipher> Default for KeyStore<C> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<C: BlockCipher> KeyStore<C> {
    /// Empty store for any backend.
    pub fn empty() -> Self {
        Self {
            state: Mutex::new(KeyState::default()),
            _cipher: PhantomData,
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeyState> {
        // No code path panics while holding the lock; a poisoned guard still
        // holds a consistent state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Unwrap a key bundle with `password` and replace the whole store.
    ///
    /// The previous keys are wiped before the new ones are installed. If the
    /// bundle is rejected the store ends up empty.
    pub fn load(&self, password: &SecretString, bundle: &[u8]) -> CryptoResult<KeyStoreStatus> {
        let parsed = open_bundle::<C>(password, bundle);

        let mut state = self.lock();
        state.wipe();

        match parsed {
            Ok(keys) => {
                state.install(keys);
                let status = state.status();
                info!(
                    bundle_bytes = bundle.len(),
                    session_batches = status.session_batches,
                    "key bundle loaded"
                );
                Ok(status)
            }
            Err(e) => {
                warn!(error = %e, "key bundle rejected; store cleared");
                Err(e)
            }
        }
    }

    /// Read a bundle file and [`load`](Self::load) it.
    pub fn load_file(&self, password: &SecretString, path: &Path) -> CryptoResult<KeyStoreStatus> {
        let bundle = Zeroizing::new(std::fs::read(path)?);
        self.load(password, &bundle)
    }

    /// Install already-unwrapped keys, wiping whatever was there.
    pub(crate) fn install(&self, keys: LoadedKeys) {
        let mut state = self.lock();
        state.wipe();
        state.install(keys);
    }

    /// Hand out an expanded key.
    ///
    /// Circle keys are reusable and stay in place. Session keys are
    /// single-use: the slot is wiped and flagged before the lock is
    /// released, and the front batch is dropped once all 100 are used.
    pub fn consume(&self, request: KeyRequest) -> CryptoResult<ConsumedKey<C>> {
        self.lock().consume(request)
    }

    /// MAC key and payload key from one lock hold, so both belong to the
    /// same bundle.
    pub fn consume_with_mac(
        &self,
        request: KeyRequest,
    ) -> CryptoResult<(ExpandedKey<C>, ConsumedKey<C>)> {
        let mut state = self.lock();
        let mac_key = state.mac_key()?;
        let consumed = state.consume(request)?;
        Ok((mac_key, consumed))
    }

    /// MAC key for artifact headers and trailers, derived from the bundle's KIKEY.
    pub fn mac_key(&self) -> CryptoResult<ExpandedKey<C>> {
        self.lock().mac_key()
    }

    /// MAC key plus a marker of the bundle it came from.
    pub fn mac_key_snapshot(&self) -> CryptoResult<MacKeySnapshot<C>> {
        let state = self.lock();
        Ok(MacKeySnapshot {
            key: state.mac_key()?,
            generation: state.generation,
        })
    }

    /// [`consume`](Self::consume), refused with `KeyUnavailable` if the store
    /// was reloaded or cleared since `snapshot` was taken.
    pub fn consume_matching(
        &self,
        snapshot: &MacKeySnapshot<C>,
        request: KeyRequest,
    ) -> CryptoResult<ConsumedKey<C>> {
        let mut state = self.lock();
        if state.generation != snapshot.generation {
            warn!("key store replaced after verification; refusing key");
            return Err(CryptoError::KeyUnavailable(
                "key store was reloaded after the artifact was verified".into(),
            ));
        }
        state.consume(request)
    }

    pub fn status(&self) -> KeyStoreStatus {
        self.lock().status()
    }

    /// Wipe every key. The store is empty afterwards.
    pub fn clear(&self) {
        self.lock().wipe();
        debug!("key store cleared");
    }
}

impl<C: BlockCipher> std::fmt::Debug for KeyStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("status", &self.status())
            .finish()
    }
}
