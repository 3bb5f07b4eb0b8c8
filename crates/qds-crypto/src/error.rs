use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Every failure the key store and the container codecs can report.
///
/// Malformed or hostile input always lands in one of these variants; none of
/// the decoding paths panic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("container too short: {what} needs {needed} bytes, {available} available")]
    ContainerTooShort {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("malformed session key region: {len} bytes is not a multiple of {batch} bytes")]
    MalformedLength { len: usize, batch: usize },

    #[error("suspicious user count in key bundle: {0} (expected 1..=255)")]
    SuspiciousUserCount(usize),

    #[error("integrity check failed: {0}")]
    IntegrityFailure(&'static str),

    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("unknown file type: 0x{0:02X}")]
    UnknownFileType(u8),

    #[error("unknown key type: 0x{0:02X}")]
    UnknownKeyType(u8),

    #[error("truncated name header")]
    TruncatedNameHeader,

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    IoFailure(String),
}

impl From<std::io::Error> for CryptoError {
    fn from(e: std::io::Error) -> Self {
        CryptoError::IoFailure(e.to_string())
    }
}
