//! Locating and opening the key bundle shared by every command.

use std::path::{Path, PathBuf};

use qds_crypto::KeyStore;
use secrecy::SecretString;

use crate::config::{expand_tilde, QdsConfig};
use crate::error::{QdsError, QdsResult};

/// Bundle path: explicit flag first, then `keys.bundle` from the config.
pub fn resolve_bundle_path(config: &QdsConfig, flag: Option<&Path>) -> QdsResult<PathBuf> {
    flag.map(Path::to_path_buf)
        .or_else(|| config.keys.bundle.clone())
        .map(|p| expand_tilde(&p))
        .ok_or_else(|| {
            QdsError::Config("no key bundle given; use --bundle or set keys.bundle in config".into())
        })
}

/// Read and unwrap the bundle at `path` into a fresh store.
pub fn open_key_store(path: &Path, password: &SecretString) -> QdsResult<KeyStore> {
    let store = KeyStore::new();
    let status = store.load_file(password, path)?;
    tracing::info!(
        bundle = %path.display(),
        session_keys = status.session_keys_remaining,
        "key store ready"
    );
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qds_crypto::{generate_bundle, Aes256Cipher, CryptoError};

    #[test]
    fn test_flag_beats_config() {
        let mut config = QdsConfig::default();
        config.keys.bundle = Some(PathBuf::from("/from/config.bin"));

        assert_eq!(
            resolve_bundle_path(&config, Some(Path::new("/from/flag.bin"))).unwrap(),
            PathBuf::from("/from/flag.bin")
        );
        assert_eq!(
            resolve_bundle_path(&config, None).unwrap(),
            PathBuf::from("/from/config.bin")
        );
    }

    #[test]
    fn test_no_bundle_is_config_error() {
        assert!(matches!(
            resolve_bundle_path(&QdsConfig::default(), None),
            Err(QdsError::Config(_))
        ));
    }

    #[test]
    fn test_missing_bundle_file_is_io_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = open_key_store(&tmp.path().join("keys.bin"), &SecretString::from("pw")).unwrap_err();
        assert!(matches!(err, QdsError::Crypto(CryptoError::IoFailure(_))));
    }

    #[test]
    fn test_wrong_password_is_crypto_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("keys.bin");
        std::fs::write(&path, generate_bundle::<Aes256Cipher>(&SecretString::from("right"), 1).unwrap()).unwrap();

        assert!(open_key_store(&path, &SecretString::from("right")).is_ok());
        assert!(matches!(
            open_key_store(&path, &SecretString::from("wrong")),
            Err(QdsError::Crypto(CryptoError::IntegrityFailure(_)))
        ));
    }
}
