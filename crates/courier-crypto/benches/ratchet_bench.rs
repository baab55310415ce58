//! Benchmarks for courier cryptographic operations

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use courier_crypto::{
    aead::{Aead, AeadKey},
    identity::IdentityKeyPair,
    kdf::derive_message_keys,
    ratchet::RatchetState,
    x3dh::{PreKeyManager, X3DHKeyAgreement},
    DEFAULT_MAX_SKIP,
};

fn session_pair() -> (RatchetState, RatchetState) {
    let alice_identity = IdentityKeyPair::generate();
    let mut bob_prekeys = PreKeyManager::new(IdentityKeyPair::generate(), 1);
    let bundle = bob_prekeys.issue_bundle();

    let (alice_secret, header) = X3DHKeyAgreement::initiate(&alice_identity, &bundle).unwrap();
    let spk = bob_prekeys.signed_prekey_secret(header.signed_prekey_id).unwrap();
    let opk = header
        .one_time_prekey_id
        .and_then(|id| bob_prekeys.one_time_prekey_secret(id));
    let bob_secret =
        X3DHKeyAgreement::respond(bob_prekeys.identity(), &spk, opk.as_ref(), &header).unwrap();

    (
        RatchetState::init_initiator(&alice_secret, &bundle.signed_prekey.public_key, DEFAULT_MAX_SKIP)
            .unwrap(),
        RatchetState::init_responder(&bob_secret, &spk, DEFAULT_MAX_SKIP),
    )
}

fn bench_handshake(c: &mut Criterion) {
    let alice = IdentityKeyPair::generate();
    let mut bob = PreKeyManager::new(IdentityKeyPair::generate(), 0);
    let bundle = bob.issue_bundle();

    c.bench_function("x3dh_initiate", |b| {
        b.iter(|| black_box(X3DHKeyAgreement::initiate(&alice, &bundle).unwrap()))
    });
}

fn bench_chain_step(c: &mut Criterion) {
    let chain_key = [0x42u8; 32];
    c.bench_function("chain_step", |b| b.iter(|| black_box(derive_message_keys(&chain_key))));
}

fn bench_aead(c: &mut Criterion) {
    let mut group = c.benchmark_group("AEAD");
    let cipher = Aead::new();
    let key = AeadKey::from_bytes([0x42; 32]);

    for size in [64usize, 1024, 16384] {
        let plaintext = vec![0x42u8; size];
        group.bench_with_input(BenchmarkId::new("xchacha_encrypt", size), &plaintext, |b, p| {
            b.iter(|| black_box(cipher.encrypt(&key, p, b"aad").unwrap()))
        });
    }

    group.finish();
}

fn bench_ratchet(c: &mut Criterion) {
    let mut group = c.benchmark_group("Ratchet");

    group.bench_function("encrypt_decrypt_1k", |b| {
        let (mut alice, mut bob) = session_pair();
        let plaintext = vec![0x42u8; 1024];
        b.iter(|| {
            let msg = alice.encrypt(&plaintext).unwrap();
            black_box(bob.decrypt(&msg).unwrap())
        })
    });

    group.bench_function("state_serialize", |b| {
        let (alice, _) = session_pair();
        b.iter(|| black_box(bincode::serialize(&alice).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_handshake, bench_chain_step, bench_aead, bench_ratchet);
criterion_main!(benches);
