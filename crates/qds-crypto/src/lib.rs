//! qds-crypto: key lifecycle and authenticated containers for a closed group
//!
//! Two key tiers protect files and messages:
//!
//! ```text
//! Password
//!   └── MasterKey (SHA-512 x1000, truncated to 256 bits)
//!         └── expand → unwraps the key bundle (OFB, zero IV)
//!               ├── KIKEY → expand → MAC key (bundle tag, artifact header + trailing tags)
//!               ├── Circle keys [10]       (shared, reusable)
//!               └── Session batches [N][100] (single use, zeroized after use)
//! ```
//!
//! The block cipher itself sits behind [`BlockCipher`]; everything above it
//! (OFB stream, CBC-MAC, key store, bundle and artifact codecs) is generic
//! over that seam. [`Aes256Cipher`] is the bundled reference backend.

pub mod bundle;
pub mod cipher;
pub mod container;
pub mod error;
pub mod kdf;
pub mod keystore;
pub mod mac;
pub mod ofb;
pub mod schedule;

pub use bundle::{generate_bundle, open_bundle, seal_bundle, LoadedKeys};
pub use cipher::{Aes256Cipher, Block, BlockCipher};
pub use container::{
    decrypt_artifact, decrypt_artifact_cancellable, encrypt_artifact, encrypt_artifact_cancellable,
    inspect_artifact, ArtifactHeader, ArtifactInfo, ArtifactMeta, DecryptedArtifact, FileType,
    KeySelector, KeyType,
};
pub use error::{CryptoError, CryptoResult};
pub use kdf::{derive_master_key, MasterKey};
pub use keystore::{ConsumedKey, KeyRequest, KeyStore, KeyStoreStatus, MacKeySnapshot, SessionPick};
pub use mac::{compute_tag, verify_tag};
pub use ofb::Ofb;
pub use schedule::ExpandedKey;

/// Cipher block size in bytes (128-bit)
pub const BLOCK_SIZE: usize = 16;

/// Size of every raw key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an integrity tag (one cipher block)
pub const TAG_SIZE: usize = BLOCK_SIZE;

/// Size of an artifact IV (one cipher block)
pub const IV_SIZE: usize = BLOCK_SIZE;

/// Number of circle key slots in a bundle
pub const CIRCLE_KEY_COUNT: usize = 10;

/// Number of session keys in one user batch
pub const SESSION_BATCH_SIZE: usize = 100;

/// Upper bound on session batches accepted from a bundle
pub const MAX_SESSION_BATCHES: usize = 255;
