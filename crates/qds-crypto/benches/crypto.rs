use qds_crypto::{
    decrypt_artifact, encrypt_artifact, generate_bundle, Aes256Cipher, ArtifactMeta,
    ExpandedKey, FileType, KeySelector, KeyStore, Ofb, BLOCK_SIZE,
};
use secrecy::SecretString;

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn loaded_store() -> KeyStore {
    let password = SecretString::from("bench");
    let bundle = generate_bundle::<Aes256Cipher>(&password, 1).unwrap();
    let store = KeyStore::new();
    store.load(&password, &bundle).unwrap();
    store
}

fn meta() -> ArtifactMeta {
    ArtifactMeta {
        user_number: 0,
        file_type: FileType::File,
        filename: Some("bench.bin".into()),
    }
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_ofb_keystream(bencher: divan::Bencher, size: usize) {
    let key: ExpandedKey = ExpandedKey::expand(&[0x5Au8; 32]);
    let iv = [0x11u8; BLOCK_SIZE];
    let mut data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench_local(|| {
            Ofb::new(divan::black_box(&key), &iv).apply_keystream(divan::black_box(&mut data));
        });
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_artifact(bencher: divan::Bencher, size: usize) {
    let store = loaded_store();
    let data = make_data(size);
    let meta = meta();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            encrypt_artifact(
                divan::black_box(&store),
                divan::black_box(&data),
                KeySelector::Circle(0),
                &meta,
            )
            .unwrap()
        });
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt_artifact(bencher: divan::Bencher, size: usize) {
    let store = loaded_store();
    let artifact = encrypt_artifact(&store, &make_data(size), KeySelector::Circle(0), &meta())
        .unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| decrypt_artifact(divan::black_box(&store), divan::black_box(&artifact)).unwrap());
}

#[divan::bench]
fn bench_load_bundle(bencher: divan::Bencher) {
    let password = SecretString::from("bench");
    let bundle = generate_bundle::<Aes256Cipher>(&password, 16).unwrap();
    let store = KeyStore::new();
    bencher.bench_local(|| store.load(&password, divan::black_box(&bundle)).unwrap());
}

fn main() {
    divan::main();
}
