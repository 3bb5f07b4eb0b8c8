//! End-to-end tests through the public API: bundle on disk format, key store
//! load, artifact encrypt/decrypt between two group members.

use qds_crypto::{
    decrypt_artifact, encrypt_artifact, generate_bundle, inspect_artifact, seal_bundle,
    ArtifactMeta, CryptoError, FileType, KeySelector, KeyStore, KeyType, SessionPick,
    CIRCLE_KEY_COUNT, KEY_SIZE, SESSION_BATCH_SIZE, TAG_SIZE,
};
use secrecy::SecretString;

fn password() -> SecretString {
    SecretString::from("pw1")
}

fn group_bundle(users: usize) -> Vec<u8> {
    let mut circle = [[0u8; KEY_SIZE]; CIRCLE_KEY_COUNT];
    for (i, k) in circle.iter_mut().enumerate() {
        k.iter_mut()
            .enumerate()
            .for_each(|(j, b)| *b = (i * 17 + j) as u8);
    }
    let sessions: Vec<[[u8; KEY_SIZE]; SESSION_BATCH_SIZE]> = (0..users)
        .map(|u| {
            let mut batch = [[0u8; KEY_SIZE]; SESSION_BATCH_SIZE];
            for (i, k) in batch.iter_mut().enumerate() {
                *k = [(u * 101 + i) as u8; KEY_SIZE];
            }
            batch
        })
        .collect();
    seal_bundle::<qds_crypto::Aes256Cipher>(&password(), &[0x6B; KEY_SIZE], &circle, &sessions)
        .expect("seal bundle")
}

fn member(bundle: &[u8]) -> KeyStore {
    let store = KeyStore::new();
    store.load(&password(), bundle).expect("load bundle");
    store
}

#[test]
fn circle_text_message_roundtrip() {
    let bundle = group_bundle(1);
    let alice = member(&bundle);
    let bob = member(&bundle);

    let plaintext = vec![b'A'; 100];
    let artifact = encrypt_artifact(
        &alice,
        &plaintext,
        KeySelector::Circle(3),
        &ArtifactMeta {
            user_number: 1,
            file_type: FileType::Text,
            filename: Some("hello.txt".into()),
        },
    )
    .expect("encrypt");

    assert_eq!(&artifact[..8], &[0x00, 1, 0x04, 0x20, 0x66, 0x00, 3, 0]);
    assert!(artifact[8..16].iter().all(|&b| b == 0));
    // header + header tag + name header + IV + ciphertext + trailing tag
    assert_eq!(artifact.len(), 16 + 16 + (2 + 9 + 8) + 16 + 100 + TAG_SIZE);

    let out = decrypt_artifact(&bob, &artifact).expect("decrypt");
    assert_eq!(out.plaintext, plaintext);
    assert_eq!(out.filename, "hello.txt");
    assert_eq!(out.header.file_type, FileType::Text);
    assert_eq!(out.header.key_type, KeyType::Circle);
    assert_eq!(out.header.circle_index, 3);

    // circle keys are reusable
    assert!(decrypt_artifact(&bob, &artifact).is_ok());
}

#[test]
fn wrong_password_leaves_store_empty() {
    let bundle = group_bundle(2);
    let store = KeyStore::new();
    let result = store.load(&SecretString::from("pw2"), &bundle);
    assert!(matches!(result, Err(CryptoError::IntegrityFailure(_))));

    let status = store.status();
    assert!(!status.circle_loaded);
    assert_eq!(status.session_keys_remaining, 0);
    assert!(store.mac_key().is_err());
}

#[test]
fn failed_reload_clears_previous_keys() {
    let bundle = group_bundle(1);
    let store = member(&bundle);
    assert!(store.status().circle_loaded);

    let mut corrupted = bundle.clone();
    corrupted[40] ^= 0x01;
    assert!(store.load(&password(), &corrupted).is_err());
    assert!(!store.status().circle_loaded);
}

#[test]
fn tampering_anywhere_is_detected() {
    let bundle = group_bundle(1);
    let alice = member(&bundle);
    let bob = member(&bundle);

    let artifact = encrypt_artifact(
        &alice,
        b"attack at dawn",
        KeySelector::Session(SessionPick::Sequential(0)),
        &ArtifactMeta {
            user_number: 1,
            file_type: FileType::File,
            filename: None,
        },
    )
    .unwrap();

    for i in [0, 1, 5, 7, 16, 31, 32, 40, artifact.len() - 20, artifact.len() - 1] {
        let mut tampered = artifact.clone();
        tampered[i] ^= 0x04;
        assert!(
            matches!(
                decrypt_artifact(&bob, &tampered),
                Err(CryptoError::IntegrityFailure(_))
            ),
            "flip at byte {i} must be rejected"
        );
    }

    assert_eq!(bob.status().front_batch_remaining, SESSION_BATCH_SIZE);
    let out = decrypt_artifact(&bob, &artifact).unwrap();
    assert_eq!(out.plaintext, b"attack at dawn");
}

#[test]
fn resizing_the_artifact_is_detected() {
    let bundle = group_bundle(1);
    let alice = member(&bundle);
    let bob = member(&bundle);

    let artifact = encrypt_artifact(
        &alice,
        b"attack at dawn",
        KeySelector::Session(SessionPick::Sequential(0)),
        &ArtifactMeta {
            user_number: 1,
            file_type: FileType::File,
            filename: Some("orders".into()),
        },
    )
    .unwrap();
    let split = artifact.len() - TAG_SIZE;

    let mut variants = Vec::new();
    for extra in [&[0x00u8][..], &[0x00, 0x00], &[0x41]] {
        let mut grown = artifact[..split].to_vec();
        grown.extend_from_slice(extra);
        grown.extend_from_slice(&artifact[split..]);
        variants.push(grown);
    }
    let mut shrunk = artifact[..split - 1].to_vec();
    shrunk.extend_from_slice(&artifact[split..]);
    variants.push(shrunk);

    for (i, tampered) in variants.iter().enumerate() {
        assert!(
            matches!(
                decrypt_artifact(&bob, tampered),
                Err(CryptoError::IntegrityFailure(_))
            ),
            "variant {i} must be rejected"
        );
        assert!(matches!(
            inspect_artifact(&bob, tampered),
            Err(CryptoError::IntegrityFailure(_))
        ));
    }

    assert_eq!(bob.status().front_batch_remaining, SESSION_BATCH_SIZE);
    assert_eq!(decrypt_artifact(&bob, &artifact).unwrap().plaintext, b"attack at dawn");
}

#[test]
fn session_keys_are_single_use_across_batches() {
    let bundle = group_bundle(2);
    let sender = member(&bundle);

    let meta = ArtifactMeta {
        user_number: 0,
        file_type: FileType::File,
        filename: None,
    };
    for _ in 0..SESSION_BATCH_SIZE {
        encrypt_artifact(
            &sender,
            b"x",
            KeySelector::Session(SessionPick::Sequential(0)),
            &meta,
        )
        .unwrap();
    }

    let status = sender.status();
    assert_eq!(status.session_batches, 1, "exhausted front batch is dropped");
    assert_eq!(status.session_keys_remaining, SESSION_BATCH_SIZE);
}

#[test]
fn inspect_reports_metadata_without_keys() {
    let bundle = generate_bundle::<qds_crypto::Aes256Cipher>(&password(), 3).unwrap();
    let alice = member(&bundle);
    let bob = member(&bundle);

    let artifact = encrypt_artifact(
        &alice,
        &[0u8; 1000],
        KeySelector::Session(SessionPick::Indexed(42)),
        &ArtifactMeta {
            user_number: 9,
            file_type: FileType::Audio,
            filename: Some("memo.wav".into()),
        },
    )
    .unwrap();

    let info = inspect_artifact(&bob, &artifact).unwrap();
    assert_eq!(info.header.user_number, 9);
    assert_eq!(info.header.session_index, 42);
    assert_eq!(info.filename.as_deref(), Some("memo.wav"));
    assert_eq!(info.ciphertext_len, 1000);
    assert!(!info.legacy_layout);
    assert_eq!(bob.status().front_batch_remaining, SESSION_BATCH_SIZE);

    let out = decrypt_artifact(&bob, &artifact).unwrap();
    assert_eq!(out.plaintext, vec![0u8; 1000]);
    assert_eq!(bob.status().front_batch_remaining, SESSION_BATCH_SIZE - 1);
}
