//! Concurrent access to one key store: every session key is handed out at
//! most once no matter how many threads race for it.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use qds_crypto::{generate_bundle, Aes256Cipher, KeyRequest, KeyStore, SessionPick, SESSION_BATCH_SIZE};
use secrecy::SecretString;

#[test]
fn concurrent_indexed_consumption_hands_out_each_slot_once() {
    let password = SecretString::from("race");
    let bundle = generate_bundle::<Aes256Cipher>(&password, 1).unwrap();
    let store = Arc::new(KeyStore::new());
    store.load(&password, &bundle).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                (0..SESSION_BATCH_SIZE as u8)
                    .filter(|&i| {
                        store
                            .consume(KeyRequest::Session(SessionPick::Indexed(i)))
                            .is_ok()
                    })
                    .collect::<Vec<u8>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for slot in handle.join().unwrap() {
            total += 1;
            assert!(seen.insert(slot), "slot {slot} handed out twice");
        }
    }

    assert_eq!(total, SESSION_BATCH_SIZE);
    assert_eq!(store.status().session_batches, 0);
}

#[test]
fn concurrent_sequential_consumption_never_repeats() {
    let password = SecretString::from("race");
    let bundle = generate_bundle::<Aes256Cipher>(&password, 1).unwrap();
    let store = Arc::new(KeyStore::new());
    store.load(&password, &bundle).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let mut got = Vec::new();
                while let Ok(k) =
                    store.consume(KeyRequest::Session(SessionPick::Sequential(t * 25)))
                {
                    got.push(k.index);
                }
                got
            })
        })
        .collect();

    let mut all: Vec<u8> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    assert_eq!(all, (0..SESSION_BATCH_SIZE as u8).collect::<Vec<_>>());
    assert_eq!(store.status().session_batches, 0);
}
