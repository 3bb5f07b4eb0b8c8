//! Integrity tag: CBC-MAC over the block cipher
//!
//! ```text
//! S_0 = transform(L)                   L = len(data) as u128, big-endian
//! S_i = transform(S_{i-1} XOR M_i)      (last block zero-padded)
//! tag = S_n
//! ```
//!
//! The length block makes the MAC prefix-free: inputs that differ only in
//! trailing zero bytes, or whose lengths are not multiples of the block
//! size, never share a tag.
//!
//! Tags are only ever compared with [`verify_tag`], which runs in constant
//! time over the full tag regardless of where the first difference is.

use subtle::ConstantTimeEq;

use crate::cipher::{Block, BlockCipher};
use crate::schedule::ExpandedKey;
use crate::{BLOCK_SIZE, TAG_SIZE};

/// Compute the tag over exactly `data`.
pub fn compute_tag<C: BlockCipher>(key: &ExpandedKey<C>, data: &[u8]) -> [u8; TAG_SIZE] {
    let mut state: Block = (data.len() as u128).to_be_bytes();
    key.transform(&mut state);

    for chunk in data.chunks(BLOCK_SIZE) {
        for (s, m) in state.iter_mut().zip(chunk) {
            *s ^= m;
        }
        key.transform(&mut state);
    }

    state
}

/// Recompute the tag over `data` and compare it with `expected`.
pub fn verify_tag<C: BlockCipher>(key: &ExpandedKey<C>, data: &[u8], expected: &[u8]) -> bool {
    let computed = compute_tag(key, data);
    ct_eq(&computed, expected)
}

/// Constant-time equality; slices of different length are unequal.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
