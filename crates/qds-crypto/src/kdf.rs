//! Key derivation: password → master key (iterated SHA-512)
//!
//! The derivation is deterministic and unsalted: every member of the circle
//! who types the same password gets the same key, which is what lets a shared
//! key bundle be unwrapped on any member's machine. It also means identical
//! passwords collide across bundles; there is no per-user salt to fix that.

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// Number of chained SHA-512 rounds applied to the password.
pub const KDF_ROUNDS: usize = 1000;

/// A 256-bit master key derived from a password.
///
/// Zeroized on drop; lives only as long as a bundle load or seal.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Short public fingerprint for comparing passwords out of band.
    ///
    /// First 8 bytes of SHA-512 over the key, hex-encoded. The key itself is
    /// never shown.
    pub fn fingerprint(&self) -> String {
        let digest = Sha512::digest(self.bytes);
        hex::encode(&digest[..8])
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive the master key: SHA-512 applied [`KDF_ROUNDS`] times, each round
/// hashing the previous digest, truncated to 32 bytes.
pub fn derive_master_key(password: &SecretString) -> MasterKey {
    let mut state = [0u8; 64];
    state.copy_from_slice(&Sha512::digest(password.expose_secret().as_bytes()));
    for _ in 1..KDF_ROUNDS {
        let next = Sha512::digest(state);
        state.copy_from_slice(&next);
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&state[..KEY_SIZE]);
    state.zeroize();

    MasterKey::from_bytes(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_deterministic() {
        let key1 = derive_master_key(&SecretString::from("pw1"));
        let key2 = derive_master_key(&SecretString::from("pw1"));

        assert_eq!(
            key1.as_bytes(),
            key2.as_bytes(),
            "KDF must be deterministic"
        );
    }

    #[test]
    fn test_kdf_different_passwords() {
        let key1 = derive_master_key(&SecretString::from("password-a"));
        let key2 = derive_master_key(&SecretString::from("password-b"));

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different passwords must produce different keys"
        );
    }

    #[test]
    fn test_kdf_matches_manual_chain() {
        let mut h: Vec<u8> = b"some_value".to_vec();
        for _ in 0..KDF_ROUNDS {
            h = Sha512::digest(&h).to_vec();
        }

        let key = derive_master_key(&SecretString::from("some_value"));
        assert_eq!(&key.as_bytes()[..], &h[..KEY_SIZE]);
    }

    #[test]
    fn test_empty_password_still_derives() {
        let key = derive_master_key(&SecretString::from(""));
        assert_ne!(key.as_bytes(), &[0u8; KEY_SIZE]);
    }

    #[test]
    fn test_fingerprint_stable_and_short() {
        let key = derive_master_key(&SecretString::from("pw1"));
        let fp = key.fingerprint();
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, derive_master_key(&SecretString::from("pw1")).fingerprint());
    }

    #[test]
    fn test_debug_redacts() {
        let key = MasterKey::from_bytes([0xAB; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("ab"));
    }
}
