use thiserror::Error;

pub type QdsResult<T> = Result<T, QdsError>;

#[derive(Debug, Error)]
pub enum QdsError {
    #[error("config error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] qds_crypto::CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
