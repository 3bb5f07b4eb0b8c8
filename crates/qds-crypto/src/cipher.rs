//! Block-cipher seam
//!
//! The key store and both container formats only ever need two things from
//! the underlying cipher: turn a 256-bit key into round-key material, and run
//! the forward transform over one 128-bit block with that material. OFB and
//! the CBC-MAC never call the inverse transform.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;

use crate::{BLOCK_SIZE, KEY_SIZE};

/// One cipher block.
pub type Block = [u8; BLOCK_SIZE];

/// An opaque 128-bit block cipher keyed with 256-bit keys.
pub trait BlockCipher: Send + Sync + 'static {
    /// Expanded round-key material. Implementations should wipe it on drop.
    type RoundKeys: Send + Sync;

    /// Run the key schedule. Must be a pure function of `key`.
    fn expand(key: &[u8; KEY_SIZE]) -> Self::RoundKeys;

    /// Forward-transform `block` in place.
    fn transform(block: &mut Block, round_keys: &Self::RoundKeys);
}

/// Reference backend: AES-256 (FIPS-197) via RustCrypto.
///
/// Round keys are wiped on drop through the `zeroize` feature of `aes`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aes256Cipher;

impl BlockCipher for Aes256Cipher {
    type RoundKeys = Aes256;

    fn expand(key: &[u8; KEY_SIZE]) -> Aes256 {
        Aes256::new(key.into())
    }

    fn transform(block: &mut Block, round_keys: &Aes256) {
        round_keys.encrypt_block(aes::Block::from_mut_slice(block));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes256_fips197_vector() {
        let mut key = [0u8; KEY_SIZE];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut block: Block = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];

        let rk = Aes256Cipher::expand(&key);
        Aes256Cipher::transform(&mut block, &rk);

        assert_eq!(hex::encode(block), "8ea2b7ca516745bfeafc49904b496089");
    }

    #[test]
    fn test_expand_is_pure() {
        let key = [7u8; KEY_SIZE];
        let mut a = [1u8; BLOCK_SIZE];
        let mut b = [1u8; BLOCK_SIZE];

        Aes256Cipher::transform(&mut a, &Aes256Cipher::expand(&key));
        Aes256Cipher::transform(&mut b, &Aes256Cipher::expand(&key));

        assert_eq!(a, b, "same key bytes must yield the same schedule");
    }
}
