//! End-to-end behavior through the public API: roundtrips for every
//! algorithm, tamper detection, credential/password failure modes, block
//! ordering and terminal-block enforcement.

use std::io::Cursor;

use lockstream_crypto::{
    stream_decipher, CipherAlg, CipherDataBlock, CipherDataInfo, CipherError, CipherResult,
    Decipher, Encipher, EngineState, UserCred, ALL_ALGS, CURRENT_VERSION, ICOUNT_MIN, SALT_BYTES,
    USERCRED_BYTES,
};
use secrecy::SecretString;

const PWD: &str = "a good pwd";
const HINT: &str = "not really";

fn cred() -> UserCred {
    UserCred::from_bytes([42u8; USERCRED_BYTES])
}

fn params(alg: CipherAlg) -> lockstream_crypto::EParams {
    lockstream_crypto::EParams {
        alg,
        ic: ICOUNT_MIN,
        lp: 1,
        lp_end: 1,
    }
}

fn enc_provider(info: &CipherDataInfo) -> CipherResult<(SecretString, Option<String>)> {
    assert_eq!(info.ver, CURRENT_VERSION);
    assert_eq!(info.salt.len(), SALT_BYTES);
    assert!(info.hint.is_none());
    Ok((SecretString::from(PWD), Some(HINT.to_string())))
}

fn dec_provider(info: &CipherDataInfo) -> CipherResult<(SecretString, Option<String>)> {
    assert_eq!(info.hint.as_deref(), Some(HINT));
    Ok((SecretString::from(PWD), None))
}

fn encrypt_all(clear: &[u8], alg: CipherAlg, chunk: usize) -> Vec<CipherDataBlock> {
    let mut enc = Encipher::new(cred(), Cursor::new(clear.to_vec())).with_read_target(chunk);
    let mut blocks = Vec::new();
    while let Some(block) = enc.encrypt_block(&params(alg), &mut enc_provider).unwrap() {
        blocks.push(block);
    }
    assert_eq!(enc.state(), EngineState::Finished);
    blocks
}

fn stream_of(blocks: &[CipherDataBlock]) -> Vec<u8> {
    let mut out = Vec::new();
    for block in blocks {
        out.extend_from_slice(&block.to_bytes());
    }
    out
}

fn decrypt_all(stream: Vec<u8>) -> CipherResult<Vec<u8>> {
    let mut dec = stream_decipher(cred(), Cursor::new(stream))?;
    let mut clear = dec.decrypt_block0(&mut dec_provider)?;
    loop {
        let next = dec.decrypt_block_n()?;
        if next.is_empty() {
            return Ok(clear);
        }
        clear.extend_from_slice(&next);
    }
}

#[test]
fn test_roundtrip_single_block_all_algs() {
    for alg in ALL_ALGS {
        let clear = format!("This is a secret 🦆 via {:?}", alg).into_bytes();
        let blocks = encrypt_all(&clear, alg, 4096);
        assert_eq!(blocks.len(), 1);
        assert_eq!(decrypt_all(stream_of(&blocks)).unwrap(), clear);
    }
}

#[test]
fn test_roundtrip_single_byte() {
    let blocks = encrypt_all(b"x", CipherAlg::AesGcm256, 4096);
    assert_eq!(decrypt_all(stream_of(&blocks)).unwrap(), b"x");
}

#[test]
fn test_roundtrip_multi_block_all_algs() {
    let clear: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    for alg in ALL_ALGS {
        let blocks = encrypt_all(&clear, alg, 100);
        assert_eq!(blocks.len(), 10);
        assert_eq!(decrypt_all(stream_of(&blocks)).unwrap(), clear);
    }
}

#[test]
fn test_hint_readable_without_password() {
    let blocks = encrypt_all(b"hinted data", CipherAlg::AesGcm256, 4096);
    let mut dec = stream_decipher(cred(), Cursor::new(stream_of(&blocks))).unwrap();
    let info = dec.get_cipher_data_info().unwrap();
    assert_eq!(info.hint.as_deref(), Some(HINT));
    assert_eq!(info.ic, ICOUNT_MIN);
    assert_eq!(info.ver, CURRENT_VERSION);
}

#[test]
fn test_every_flipped_header_byte_detected() {
    let blocks = encrypt_all(b"tamper the header", CipherAlg::AesGcm256, 4096);
    let clean = stream_of(&blocks);

    // MAC, version (through the factory), size and the flags byte opening
    // the payload; flipping any one must never yield plaintext
    for idx in [0, 12, 31, 34, 37] {
        let mut stream = clean.clone();
        stream[idx] ^= 0x01;
        let result = stream_decipher(cred(), Cursor::new(stream))
            .and_then(|mut dec| dec.decrypt_block0(&mut dec_provider));
        assert!(result.is_err(), "header byte {idx} tamper went unnoticed");
    }
}

#[test]
fn test_flipped_additional_data_detected() {
    for alg in ALL_ALGS {
        let blocks = encrypt_all(b"tamper the ad", alg, 4096);
        let mut blocks = blocks;
        let last = blocks[0].additional_data.len() - 4;
        blocks[0].additional_data[last] ^= 0x01;

        let mut dec = stream_decipher(cred(), Cursor::new(stream_of(&blocks))).unwrap();
        let err = dec.decrypt_block0(&mut dec_provider).unwrap_err();
        assert!(matches!(err, CipherError::InvalidMac | CipherError::Structural(_)));
    }
}

#[test]
fn test_flipped_encrypted_data_detected() {
    for alg in ALL_ALGS {
        let mut blocks = encrypt_all(b"tamper the edata", alg, 4096);
        blocks[0].encrypted_data[5] ^= 0x01;

        let mut dec = stream_decipher(cred(), Cursor::new(stream_of(&blocks))).unwrap();
        let err = dec.decrypt_block0(&mut dec_provider).unwrap_err();
        assert!(matches!(err, CipherError::InvalidMac));
    }
}

#[test]
fn test_wrong_user_cred_fails_with_correct_password() {
    let blocks = encrypt_all(b"cred bound", CipherAlg::XChaCha20Poly1305, 4096);
    let mut dec = stream_decipher(
        UserCred::from_bytes([43u8; USERCRED_BYTES]),
        Cursor::new(stream_of(&blocks)),
    )
    .unwrap();

    // even the correct password cannot help without the credential
    let err = dec.decrypt_block0(&mut dec_provider).unwrap_err();
    assert!(matches!(err, CipherError::InvalidMac));
}

#[test]
fn test_wrong_password_retryable_exactly_once() {
    let blocks = encrypt_all(b"password bound", CipherAlg::AesGcm256, 4096);

    // first failure leaves the instance usable and the retry succeeds
    let mut dec = stream_decipher(cred(), Cursor::new(stream_of(&blocks))).unwrap();
    let err = dec
        .decrypt_block0(&mut |_info| Ok((SecretString::from("a bad pwd"), None)))
        .unwrap_err();
    assert!(matches!(err, CipherError::AeadFailure));
    assert!(err.is_retryable());

    let clear = dec.decrypt_block0(&mut dec_provider).unwrap();
    assert_eq!(clear, b"password bound");

    // two failures poison the instance
    let mut dec = stream_decipher(cred(), Cursor::new(stream_of(&blocks))).unwrap();
    for _ in 0..2 {
        let err = dec
            .decrypt_block0(&mut |_info| Ok((SecretString::from("a bad pwd"), None)))
            .unwrap_err();
        assert!(matches!(err, CipherError::AeadFailure));
    }
    let err = dec.decrypt_block0(&mut dec_provider).unwrap_err();
    assert!(matches!(err, CipherError::InvalidState(_, "invalid")));
}

#[test]
fn test_block_reorder_detected() {
    let clear: Vec<u8> = (0..60u8).collect();
    let blocks = encrypt_all(&clear, CipherAlg::XChaCha20Poly1305, 20);
    assert_eq!(blocks.len(), 3);

    let swapped = stream_of(&[blocks[0].clone(), blocks[2].clone(), blocks[1].clone()]);
    let mut dec = stream_decipher(cred(), Cursor::new(swapped)).unwrap();
    let block0 = dec.decrypt_block0(&mut dec_provider).unwrap();
    assert_eq!(block0, &clear[..20]);

    // the chained MAC no longer lines up
    let err = dec.decrypt_block_n().unwrap_err();
    assert!(matches!(err, CipherError::InvalidMac));
}

#[test]
fn test_block0_swapped_to_back_detected() {
    let clear: Vec<u8> = (0..40u8).collect();
    let blocks = encrypt_all(&clear, CipherAlg::AesGcm256, 20);
    assert_eq!(blocks.len(), 2);

    let rotated = stream_of(&[blocks[1].clone(), blocks[0].clone()]);
    let result = stream_decipher(cred(), Cursor::new(rotated))
        .and_then(|mut dec| dec.decrypt_block0(&mut dec_provider));
    assert!(result.is_err());
}

#[test]
fn test_cancelling_provider_poisons_decipher() {
    let blocks = encrypt_all(b"cancel me", CipherAlg::AesGcm256, 4096);
    let mut dec = stream_decipher(cred(), Cursor::new(stream_of(&blocks))).unwrap();

    let err = dec
        .decrypt_block0(&mut |_info| Err(CipherError::Cancelled))
        .unwrap_err();
    assert!(matches!(err, CipherError::Cancelled));

    let err = dec.decrypt_block0(&mut dec_provider).unwrap_err();
    assert!(matches!(err, CipherError::InvalidState(_, "invalid")));
}

#[test]
fn test_emitted_parts_concatenation_is_the_contract() {
    // feeding the parts through a writer or concatenating them by hand
    // must give the same stream
    let blocks = encrypt_all(b"ordered parts", CipherAlg::AesGcm256, 4096);
    let mut via_writer = Vec::new();
    for block in &blocks {
        block.write_to(&mut via_writer).unwrap();
    }
    assert_eq!(via_writer, stream_of(&blocks));
    assert_eq!(decrypt_all(via_writer).unwrap(), b"ordered parts");
}
