//! Key schedule wrapper: raw 256-bit key → expanded round keys

use crate::cipher::{Aes256Cipher, Block, BlockCipher};
use crate::kdf::MasterKey;
use crate::KEY_SIZE;

/// Round-key material for one raw key.
///
/// Owned by whichever operation asked for it and dropped when it finishes;
/// wiping is delegated to the backend's `RoundKeys` drop.
pub struct ExpandedKey<C: BlockCipher = Aes256Cipher> {
    round_keys: C::RoundKeys,
}

impl<C: BlockCipher> ExpandedKey<C> {
    /// Expand a raw key. Identical bytes always give identical material.
    pub fn expand(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            round_keys: C::expand(key),
        }
    }

    /// Expand a password-derived master key.
    pub fn from_master(master: &MasterKey) -> Self {
        Self::expand(master.as_bytes())
    }

    /// Forward-transform one block in place.
    pub fn transform(&self, block: &mut Block) {
        C::transform(block, &self.round_keys);
    }
}

impl<C: BlockCipher> std::fmt::Debug for ExpandedKey<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpandedKey")
            .field("round_keys", &"[REDACTED]")
            .finish()
    }
}
