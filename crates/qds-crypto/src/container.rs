//! Encrypted artifact container
//!
//! Artifact format (binary):
//! ```text
//! [16 bytes: metadata header]
//! [16 bytes: header MAC]
//! [2 bytes: name length, big-endian, <= 255][name bytes][8 bytes: original size, big-endian]
//! [16 bytes: random IV]
//! [N bytes: OFB ciphertext]
//! [16 bytes: trailing MAC over every preceding byte]
//! ```
//!
//! Metadata header:
//! ```text
//! 0: 0x00   1: user number   2: 0x04   3: 0x20
//! 4: file type (0x77 file, 0x88 photo, 0x66 text, 0x55 audio)
//! 5: key type (0x00 circle, 0x01 session)
//! 6: circle key index   7: session key index   8..16: 0x00
//! ```
//!
//! Both MACs are keyed by the bundle's KIKEY. Decryption verifies the trailing
//! MAC, then the header MAC, and only then touches the key store, so a
//! tampered artifact never consumes a session key.
//!
//! Artifacts written before the name header existed carry the IV directly
//! after the header MAC. The decoder falls back to that layout whenever the
//! name header does not parse, and names the output from the file type.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cipher::{Block, BlockCipher};
use crate::error::{CryptoError, CryptoResult};
use crate::keystore::{KeyRequest, KeyStore, MacKeySnapshot, SessionPick};
use crate::mac::{compute_tag, verify_tag};
use crate::ofb::Ofb;
use crate::{IV_SIZE, TAG_SIZE};

pub use crate::keystore::KeyType;

/// Size of the metadata header.
pub const HEADER_SIZE: usize = 16;

/// Longest filename carried in the name header, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Bytes processed between cancellation checks by default.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

const HEADER_MARKER: [u8; 2] = [0x04, 0x20];
const NAME_LEN_SIZE: usize = 2;
const ORIGINAL_SIZE_SIZE: usize = 8;
const PAYLOAD_OFFSET: usize = HEADER_SIZE + TAG_SIZE;
const MIN_ARTIFACT_LEN: usize = PAYLOAD_OFFSET + IV_SIZE + TAG_SIZE;

/// Key used to encrypt an artifact. Same shape as a store request.
pub type KeySelector = KeyRequest;

/// What an artifact contains (header byte 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Photo,
    Text,
    Audio,
}

impl FileType {
    pub fn to_byte(self) -> u8 {
        match self {
            FileType::File => 0x77,
            FileType::Photo => 0x88,
            FileType::Text => 0x66,
            FileType::Audio => 0x55,
        }
    }

    /// Parse header byte 4. `0x00` is accepted as an older spelling of `File`.
    pub fn from_byte(b: u8) -> CryptoResult<Self> {
        match b {
            0x77 | 0x00 => Ok(FileType::File),
            0x88 => Ok(FileType::Photo),
            0x66 => Ok(FileType::Text),
            0x55 => Ok(FileType::Audio),
            other => Err(CryptoError::UnknownFileType(other)),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Photo => "photo",
            FileType::Text => "text",
            FileType::Audio => "audio",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            FileType::File => "bin",
            FileType::Photo => "jpg",
            FileType::Text => "txt",
            FileType::Audio => "wav",
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(FileType::File),
            "photo" => Ok(FileType::Photo),
            "text" => Ok(FileType::Text),
            "audio" => Ok(FileType::Audio),
            other => Err(format!("unknown file type '{other}' (file, photo, text, audio)")),
        }
    }
}

/// Caller-supplied metadata for a new artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMeta {
    pub user_number: u8,
    pub file_type: FileType,
    /// Original filename; truncated to 255 bytes on a character boundary.
    pub filename: Option<String>,
}

/// Decoded 16-byte metadata header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub user_number: u8,
    pub file_type: FileType,
    pub key_type: KeyType,
    pub circle_index: u8,
    pub session_index: u8,
}

impl ArtifactHeader {
    /// Index of the key named by `key_type`.
    pub fn key_index(&self) -> u8 {
        match self.key_type {
            KeyType::Circle => self.circle_index,
            KeyType::Session => self.session_index,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut h = [0u8; HEADER_SIZE];
        h[1] = self.user_number;
        h[2..4].copy_from_slice(&HEADER_MARKER);
        h[4] = self.file_type.to_byte();
        h[5] = self.key_type.to_byte();
        h[6] = self.circle_index;
        h[7] = self.session_index;
        h
    }

    pub fn decode(h: &[u8; HEADER_SIZE]) -> CryptoResult<Self> {
        Ok(Self {
            user_number: h[1],
            file_type: FileType::from_byte(h[4])?,
            key_type: KeyType::from_byte(h[5])?,
            circle_index: h[6],
            session_index: h[7],
        })
    }

    fn key_request(&self) -> KeyRequest {
        match self.key_type {
            KeyType::Circle => KeyRequest::Circle(self.circle_index),
            KeyType::Session => KeyRequest::Session(SessionPick::Indexed(self.session_index)),
        }
    }
}

/// Result of a successful decryption.
#[derive(Debug, Clone)]
pub struct DecryptedArtifact {
    pub plaintext: Vec<u8>,
    /// Safe to use as a file name: never contains a path separator.
    pub filename: String,
    pub header: ArtifactHeader,
    /// Size recorded by the sender; absent for the legacy layout.
    pub original_size: Option<u64>,
    /// Set to `TruncatedNameHeader` when the name header was unusable and the
    /// legacy layout plus a default filename were substituted.
    pub recovered: Option<CryptoError>,
}

/// Authenticated metadata of an artifact, read without any key consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub header: ArtifactHeader,
    pub filename: Option<String>,
    pub original_size: Option<u64>,
    pub ciphertext_len: usize,
    pub total_len: usize,
    /// Name header was unusable; offsets follow the `[IV][ciphertext]` layout.
    pub legacy_layout: bool,
}

struct Layout<'a> {
    name: Option<String>,
    original_size: Option<u64>,
    iv: Block,
    ciphertext: &'a [u8],
}

/// Encrypt `plaintext` into a new artifact.
pub fn encrypt_artifact<C: BlockCipher>(
    store: &KeyStore<C>,
    plaintext: &[u8],
    selector: KeySelector,
    meta: &ArtifactMeta,
) -> CryptoResult<Vec<u8>> {
    encrypt_artifact_cancellable(
        store,
        plaintext,
        selector,
        meta,
        DEFAULT_CHUNK_SIZE,
        &CancellationToken::new(),
    )
}

/// [`encrypt_artifact`] with a cancellation check every `chunk_size` bytes.
///
/// The key is taken from the store once, before any bulk work. A cancelled
/// run returns `Cancelled` and no bytes; a session key taken for it stays
/// consumed.
pub fn encrypt_artifact_cancellable<C: BlockCipher>(
    store: &KeyStore<C>,
    plaintext: &[u8],
    selector: KeySelector,
    meta: &ArtifactMeta,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> CryptoResult<Vec<u8>> {
    if cancel.is_cancelled() {
        return Err(CryptoError::Cancelled);
    }

    let (mac_key, consumed) = store.consume_with_mac(selector)?;

    let mut iv: Block = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let header = ArtifactHeader {
        user_number: meta.user_number,
        file_type: meta.file_type,
        key_type: consumed.key_type,
        circle_index: if consumed.key_type == KeyType::Circle {
            consumed.index
        } else {
            0
        },
        session_index: if consumed.key_type == KeyType::Session {
            consumed.index
        } else {
            0
        },
    };
    let header_bytes = header.encode();

    let name = truncate_name(meta.filename.as_deref().unwrap_or(""));

    let mut out = Vec::with_capacity(
        PAYLOAD_OFFSET
            + NAME_LEN_SIZE
            + name.len()
            + ORIGINAL_SIZE_SIZE
            + IV_SIZE
            + plaintext.len()
            + TAG_SIZE,
    );
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&compute_tag(&mac_key, &header_bytes));
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&(plaintext.len() as u64).to_be_bytes());
    out.extend_from_slice(&iv);

    let start = out.len();
    out.extend_from_slice(plaintext);
    Ofb::new(&consumed.key, &iv).apply_keystream_cancellable(&mut out[start..], chunk_size, cancel)?;

    let tag = compute_tag(&mac_key, &out);
    out.extend_from_slice(&tag);

    debug!(
        key_type = %header.key_type,
        key_index = header.key_index(),
        file_type = %header.file_type,
        plaintext_len = plaintext.len(),
        artifact_len = out.len(),
        "artifact encrypted"
    );
    Ok(out)
}

/// Verify and decrypt an artifact.
pub fn decrypt_artifact<C: BlockCipher>(
    store: &KeyStore<C>,
    data: &[u8],
) -> CryptoResult<DecryptedArtifact> {
    decrypt_artifact_cancellable(store, data, DEFAULT_CHUNK_SIZE, &CancellationToken::new())
}

/// [`decrypt_artifact`] with a cancellation check every `chunk_size` bytes.
pub fn decrypt_artifact_cancellable<C: BlockCipher>(
    store: &KeyStore<C>,
    data: &[u8],
    chunk_size: usize,
    cancel: &CancellationToken,
) -> CryptoResult<DecryptedArtifact> {
    let (header, snapshot) = verify_artifact(store, data)?;
    let body = &data[..data.len() - TAG_SIZE];

    if cancel.is_cancelled() {
        return Err(CryptoError::Cancelled);
    }
    let consumed = store.consume_matching(&snapshot, header.key_request())?;

    let (layout, recovered) = match parse_name_header(&body[PAYLOAD_OFFSET..]) {
        Ok(layout) => (layout, None),
        Err(e) => {
            warn!("artifact name header unusable, using legacy layout");
            (legacy_layout(&body[PAYLOAD_OFFSET..]), Some(e))
        }
    };

    let mut plaintext = layout.ciphertext.to_vec();
    Ofb::new(&consumed.key, &layout.iv).apply_keystream_cancellable(
        &mut plaintext,
        chunk_size,
        cancel,
    )?;

    let filename = layout
        .name
        .as_deref()
        .and_then(sanitize_filename)
        .unwrap_or_else(|| default_filename(header.file_type));

    debug!(
        key_type = %header.key_type,
        key_index = header.key_index(),
        file_type = %header.file_type,
        plaintext_len = plaintext.len(),
        "artifact decrypted"
    );
    Ok(DecryptedArtifact {
        plaintext,
        filename,
        header,
        original_size: layout.original_size,
        recovered,
    })
}

/// Verify both MACs and report the artifact's metadata. Consumes no key.
pub fn inspect_artifact<C: BlockCipher>(
    store: &KeyStore<C>,
    data: &[u8],
) -> CryptoResult<ArtifactInfo> {
    let (header, _) = verify_artifact(store, data)?;
    let body = &data[..data.len() - TAG_SIZE];

    let (layout, legacy_layout_used) = match parse_name_header(&body[PAYLOAD_OFFSET..]) {
        Ok(layout) => (layout, false),
        Err(_) => (legacy_layout(&body[PAYLOAD_OFFSET..]), true),
    };

    Ok(ArtifactInfo {
        header,
        filename: layout.name.as_deref().and_then(sanitize_filename),
        original_size: layout.original_size,
        ciphertext_len: layout.ciphertext.len(),
        total_len: data.len(),
        legacy_layout: legacy_layout_used,
    })
}

/// Length check, trailing MAC, header MAC, header decode, in that order.
///
/// Returns the snapshot of the MAC key used so the payload key can be taken
/// from the same bundle.
fn verify_artifact<C: BlockCipher>(
    store: &KeyStore<C>,
    data: &[u8],
) -> CryptoResult<(ArtifactHeader, MacKeySnapshot<C>)> {
    if data.len() < MIN_ARTIFACT_LEN {
        return Err(CryptoError::ContainerTooShort {
            what: "artifact",
            needed: MIN_ARTIFACT_LEN,
            available: data.len(),
        });
    }

    let snapshot = store.mac_key_snapshot()?;
    let mac_key = &snapshot.key;

    let (body, tag) = data.split_at(data.len() - TAG_SIZE);
    if !verify_tag(mac_key, body, tag) {
        warn!(artifact_len = data.len(), "artifact trailing MAC mismatch");
        return Err(CryptoError::IntegrityFailure("artifact tag mismatch"));
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&body[..HEADER_SIZE]);
    if !verify_tag(mac_key, &header_bytes, &body[HEADER_SIZE..PAYLOAD_OFFSET]) {
        warn!("artifact header MAC mismatch");
        return Err(CryptoError::IntegrityFailure("artifact header tag mismatch"));
    }

    let header = ArtifactHeader::decode(&header_bytes)?;
    Ok((header, snapshot))
}

/// Parse `[len][name][size][IV][ciphertext]`; the recorded size must match
/// the ciphertext actually present.
fn parse_name_header(region: &[u8]) -> CryptoResult<Layout<'_>> {
    let len_bytes: [u8; NAME_LEN_SIZE] = region
        .get(..NAME_LEN_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or(CryptoError::TruncatedNameHeader)?;
    let name_len = usize::from(u16::from_be_bytes(len_bytes));
    if name_len > MAX_NAME_LEN {
        return Err(CryptoError::TruncatedNameHeader);
    }

    let size_at = NAME_LEN_SIZE + name_len;
    let iv_at = size_at + ORIGINAL_SIZE_SIZE;
    let payload_at = iv_at + IV_SIZE;
    if region.len() < payload_at {
        return Err(CryptoError::TruncatedNameHeader);
    }

    let mut size_bytes = [0u8; ORIGINAL_SIZE_SIZE];
    size_bytes.copy_from_slice(&region[size_at..iv_at]);
    let original_size = u64::from_be_bytes(size_bytes);

    let ciphertext = &region[payload_at..];
    if original_size != ciphertext.len() as u64 {
        return Err(CryptoError::TruncatedNameHeader);
    }

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&region[iv_at..payload_at]);

    let name = String::from_utf8_lossy(&region[NAME_LEN_SIZE..size_at]).into_owned();

    Ok(Layout {
        name: Some(name),
        original_size: Some(original_size),
        iv,
        ciphertext,
    })
}

/// `[IV][ciphertext]` with no name header. `region` is at least one IV long.
fn legacy_layout(region: &[u8]) -> Layout<'_> {
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&region[..IV_SIZE]);
    Layout {
        name: None,
        original_size: None,
        iv,
        ciphertext: &region[IV_SIZE..],
    }
}

fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Keep only the last path component, drop control characters.
fn sanitize_filename(name: &str) -> Option<String> {
    let last = name.rsplit(|c: char| c == '/' || c == '\\').next()?;
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    match cleaned.trim() {
        "" | "." | ".." => None,
        _ => Some(cleaned),
    }
}

fn default_filename(file_type: FileType) -> String {
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M");
    format!(
        "decrypted_{}_{}.{}",
        file_type.label(),
        stamp,
        file_type.extension()
    )
}
