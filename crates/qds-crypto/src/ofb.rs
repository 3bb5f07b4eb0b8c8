//! Output-feedback (OFB) stream mode
//!
//! ```text
//! K_0 = IV
//! K_i = transform(K_{i-1})
//! out_i = in_i XOR K_i
//! ```
//!
//! The keystream never depends on the data, so encryption and decryption are
//! the same operation. The stream carries its position across calls, which
//! lets callers feed data in arbitrary slices (including partial blocks) and
//! still get the same bytes as a single pass.

use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

use crate::cipher::{Aes256Cipher, Block, BlockCipher};
use crate::error::{CryptoError, CryptoResult};
use crate::schedule::ExpandedKey;
use crate::BLOCK_SIZE;

/// A running OFB keystream bound to one expanded key.
pub struct Ofb<'k, C: BlockCipher = Aes256Cipher> {
    key: &'k ExpandedKey<C>,
    keystream: Block,
    // bytes of `keystream` already consumed; BLOCK_SIZE means a fresh block is due
    used: usize,
}

impl<'k, C: BlockCipher> Ofb<'k, C> {
    pub fn new(key: &'k ExpandedKey<C>, iv: &Block) -> Self {
        Self {
            key,
            keystream: *iv,
            used: BLOCK_SIZE,
        }
    }

    /// XOR the next `data.len()` keystream bytes into `data`.
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        let mut pos = 0;
        while pos < data.len() {
            if self.used == BLOCK_SIZE {
                self.key.transform(&mut self.keystream);
                self.used = 0;
            }
            let take = (BLOCK_SIZE - self.used).min(data.len() - pos);
            for (d, k) in data[pos..pos + take]
                .iter_mut()
                .zip(&self.keystream[self.used..self.used + take])
            {
                *d ^= k;
            }
            pos += take;
            self.used += take;
        }
    }

    /// Like [`apply_keystream`](Self::apply_keystream), checking `cancel`
    /// before every `chunk_size` bytes.
    ///
    /// On `Cancelled` the buffer is left partially processed; callers must
    /// discard it.
    pub fn apply_keystream_cancellable(
        &mut self,
        data: &mut [u8],
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> CryptoResult<()> {
        let chunk_size = chunk_size.max(BLOCK_SIZE);
        for chunk in data.chunks_mut(chunk_size) {
            if cancel.is_cancelled() {
                return Err(CryptoError::Cancelled);
            }
            self.apply_keystream(chunk);
        }
        Ok(())
    }
}

impl<C: BlockCipher> Drop for Ofb<'_, C> {
    fn drop(&mut self) {
        self.keystream.zeroize();
    }
}

/// One-shot OFB over `data` in place.
pub fn apply_ofb<C: BlockCipher>(key: &ExpandedKey<C>, iv: &Block, data: &mut [u8]) {
    Ofb::new(key, iv).apply_keystream(data);
}
