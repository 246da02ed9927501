use std::io::Cursor;

use lockstream_crypto::{
    gen_cipher_key, gen_signing_key, stream_decipher, CipherAlg, CipherDataInfo, CipherResult,
    Decipher, Encipher, EParams, UserCred, CURRENT_VERSION, ICOUNT_MIN, USERCRED_BYTES,
};
use secrecy::SecretString;

fn provider(_info: &CipherDataInfo) -> CipherResult<(SecretString, Option<String>)> {
    Ok((SecretString::from("a benchmark pwd"), None))
}

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn cred() -> UserCred {
    UserCred::from_bytes([0xABu8; USERCRED_BYTES])
}

fn params(alg: CipherAlg) -> EParams {
    EParams {
        alg,
        ic: ICOUNT_MIN,
        lp: 1,
        lp_end: 1,
    }
}

#[divan::bench]
fn bench_cipher_key_stretch(bencher: divan::Bencher) {
    let user_cred = cred();
    let pwd = SecretString::from("a benchmark pwd");
    let salt = [7u8; 16];
    bencher.bench(|| {
        gen_cipher_key(
            divan::black_box(ICOUNT_MIN),
            divan::black_box(&pwd),
            &user_cred,
            &salt,
        )
        .unwrap()
    });
}

#[divan::bench]
fn bench_signing_key(bencher: divan::Bencher) {
    let user_cred = cred();
    let salt = [7u8; 16];
    bencher.bench(|| {
        gen_signing_key(divan::black_box(&user_cred), &salt, CURRENT_VERSION).unwrap()
    });
}

#[divan::bench(args = [65536, 1048576])]
fn bench_encrypt_stream(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut enc = Encipher::new(cred(), Cursor::new(divan::black_box(&data)));
            let mut total = 0usize;
            while let Some(block) = enc
                .encrypt_block(&params(CipherAlg::XChaCha20Poly1305), &mut provider)
                .unwrap()
            {
                total += block.len();
            }
            total
        });
}

#[divan::bench(args = [65536, 1048576])]
fn bench_decrypt_stream(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    let mut enc = Encipher::new(cred(), Cursor::new(data));
    let mut stream = Vec::new();
    while let Some(block) = enc
        .encrypt_block(&params(CipherAlg::XChaCha20Poly1305), &mut provider)
        .unwrap()
    {
        block.write_to(&mut stream).unwrap();
    }

    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut dec =
                stream_decipher(cred(), Cursor::new(divan::black_box(&stream))).unwrap();
            let mut total = dec.decrypt_block0(&mut provider).unwrap().len();
            loop {
                let next = dec.decrypt_block_n().unwrap();
                if next.is_empty() {
                    break;
                }
                total += next.len();
            }
            total
        });
}

fn main() {
    divan::main();
}
