//! Cryptographic operation benchmarks.
//!
//! Measures the primitives a handshake and the per-direction stream
//! cipher are built from.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use pipetun::crypto::{
    CipherKeys, Credentials, EphemeralSecret, Hkdf, PublicKey, SecureRandom, StreamCipher, NONCE_SIZE,
};
use pipetun::layer::HandshakePacket;

fn bench_x25519_keygen(c: &mut Criterion) {
    c.bench_function("x25519_keygen", |b| {
        b.iter(|| {
            let secret = EphemeralSecret::random();
            black_box(PublicKey::from(&secret))
        })
    });
}

fn bench_x25519_dh(c: &mut Criterion) {
    let bob_secret = EphemeralSecret::random();
    let bob_public = PublicKey::from(&bob_secret);

    c.bench_function("x25519_dh", |b| {
        b.iter(|| {
            let alice_secret = EphemeralSecret::random();
            black_box(alice_secret.diffie_hellman(&bob_public).unwrap())
        })
    });
}

fn bench_chacha20_keystream(c: &mut Criterion) {
    let keys = CipherKeys::from_bytes([0x42u8; 32], [0x24u8; 12]);
    let mut cipher = StreamCipher::new(&keys);
    let mut buf = vec![0u8; 16 * 1024]; // One socket read

    let mut group = c.benchmark_group("chacha20_keystream");
    group.throughput(Throughput::Bytes(buf.len() as u64));

    group.bench_function("16k_bytes", |b| {
        b.iter(|| {
            cipher.apply(&mut buf).unwrap();
            black_box(&buf);
        })
    });

    group.finish();
}

fn bench_hkdf_derive(c: &mut Criterion) {
    let ikm = [0x42u8; 32];
    let salt = [0x00u8; 32];

    c.bench_function("hkdf_derive_32_bytes", |b| {
        b.iter(|| {
            let hkdf = Hkdf::new(Some(&salt), &ikm);
            black_box(hkdf.expand_fixed::<32>(b"test_context").unwrap())
        })
    });
}

fn bench_credentials(c: &mut Criterion) {
    let credentials = Credentials::new("default-username", "default-password");

    c.bench_function("password_key", |b| {
        b.iter(|| black_box(credentials.password_key(credentials.user_id())))
    });
}

fn bench_packet_seal_and_verify(c: &mut Criterion) {
    let credentials = Credentials::new("default-username", "default-password");
    let key = credentials.password_key(credentials.user_id());
    let secret = EphemeralSecret::random();
    let public = PublicKey::from(&secret);
    let nonce: [u8; NONCE_SIZE] = SecureRandom::bytes();

    c.bench_function("handshake_packet_seal_verify", |b| {
        b.iter(|| {
            let mut packet = HandshakePacket::new(*credentials.user_id(), public.as_bytes(), &nonce);
            let raw = packet.seal(&key[..]).unwrap();
            let (decoded, _) = HandshakePacket::decode(&raw).unwrap();
            black_box(decoded.verify(&raw, &key[..]))
        })
    });
}

fn bench_full_handshake_crypto(c: &mut Criterion) {
    c.bench_function("full_handshake_crypto", |b| {
        b.iter(|| {
            let client_secret = EphemeralSecret::random();
            let client_public = PublicKey::from(&client_secret);
            let client_nonce: [u8; NONCE_SIZE] = SecureRandom::bytes();

            let server_secret = EphemeralSecret::random();
            let server_public = PublicKey::from(&server_secret);
            let server_nonce: [u8; NONCE_SIZE] = SecureRandom::bytes();

            let client_shared = client_secret.diffie_hellman(&server_public).unwrap();
            let server_shared = server_secret.diffie_hellman(&client_public).unwrap();

            // Each side derives both directions
            let _client_out = CipherKeys::derive(&client_shared, client_public.as_bytes(), &client_nonce);
            let _client_in = CipherKeys::derive(&client_shared, server_public.as_bytes(), &server_nonce);
            let _server_out = CipherKeys::derive(&server_shared, server_public.as_bytes(), &server_nonce);
            let _server_in = CipherKeys::derive(&server_shared, client_public.as_bytes(), &client_nonce);

            black_box(())
        })
    });
}

criterion_group!(
    benches,
    bench_x25519_keygen,
    bench_x25519_dh,
    bench_chacha20_keystream,
    bench_hkdf_derive,
    bench_credentials,
    bench_packet_seal_and_verify,
    bench_full_handshake_crypto,
);

criterion_main!(benches);
