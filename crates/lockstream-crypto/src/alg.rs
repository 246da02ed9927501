//! Cipher algorithm registry and the uniform AEAD adapter.
//!
//! All three algorithms are normalized behind one pair of functions:
//! 256-bit key, caller-supplied nonce only (never generated here), and the
//! algorithm-native tag appended to the ciphertext.

use aegis::aegis256::Aegis256;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

use crate::error::{CipherError, CipherResult};
use crate::KEY_BYTES;

/// Wire algorithm ids. The numeric values are part of the format and must
/// never be reused or renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlg {
    /// AES-256-GCM, 12-byte nonce, 16-byte tag
    AesGcm256,
    /// XChaCha20-Poly1305, 24-byte nonce, 16-byte tag
    XChaCha20Poly1305,
    /// AEGIS-256, 32-byte nonce, 32-byte tag
    Aegis256,
}

/// All algorithms, in wire-id order.
pub const ALL_ALGS: [CipherAlg; 3] = [
    CipherAlg::AesGcm256,
    CipherAlg::XChaCha20Poly1305,
    CipherAlg::Aegis256,
];

impl CipherAlg {
    pub fn id(self) -> u16 {
        match self {
            CipherAlg::AesGcm256 => 1,
            CipherAlg::XChaCha20Poly1305 => 2,
            CipherAlg::Aegis256 => 3,
        }
    }

    pub fn from_id(id: u16) -> CipherResult<Self> {
        match id {
            1 => Ok(CipherAlg::AesGcm256),
            2 => Ok(CipherAlg::XChaCha20Poly1305),
            3 => Ok(CipherAlg::Aegis256),
            _ => Err(CipherError::Structural(format!("invalid alg id of {id}"))),
        }
    }

    pub fn iv_bytes(self) -> usize {
        match self {
            CipherAlg::AesGcm256 => 12,
            CipherAlg::XChaCha20Poly1305 => 24,
            CipherAlg::Aegis256 => 32,
        }
    }

    pub fn tag_bytes(self) -> usize {
        match self {
            CipherAlg::AesGcm256 => 16,
            CipherAlg::XChaCha20Poly1305 => 16,
            CipherAlg::Aegis256 => 32,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            CipherAlg::AesGcm256 => "AES 256 GCM",
            CipherAlg::XChaCha20Poly1305 => "XChaCha20 Poly1305",
            CipherAlg::Aegis256 => "AEGIS 256",
        }
    }
}

fn check_iv(alg: CipherAlg, iv: &[u8]) -> CipherResult<()> {
    if iv.len() != alg.iv_bytes() {
        return Err(CipherError::Parameter(format!(
            "incorrect iv length of {} for {:?}",
            iv.len(),
            alg
        )));
    }
    Ok(())
}

/// Encrypt `clear` under `alg`, returning `ciphertext ‖ tag`.
pub fn aead_encrypt(
    alg: CipherAlg,
    key: &[u8; KEY_BYTES],
    iv: &[u8],
    aad: &[u8],
    clear: &[u8],
) -> CipherResult<Vec<u8>> {
    check_iv(alg, iv)?;

    match alg {
        CipherAlg::AesGcm256 => {
            let cipher = Aes256Gcm::new(key.into());
            cipher
                .encrypt(Nonce::from_slice(iv), Payload { msg: clear, aad })
                .map_err(|_| CipherError::AeadFailure)
        }
        CipherAlg::XChaCha20Poly1305 => {
            let cipher = XChaCha20Poly1305::new(key.into());
            cipher
                .encrypt(XNonce::from_slice(iv), Payload { msg: clear, aad })
                .map_err(|_| CipherError::AeadFailure)
        }
        CipherAlg::Aegis256 => {
            let mut nonce = [0u8; 32];
            nonce.copy_from_slice(iv);
            let (mut ct, tag) = Aegis256::<32>::new(key, &nonce).encrypt(clear, aad);
            ct.extend_from_slice(&tag);
            Ok(ct)
        }
    }
}

/// Decrypt `ciphertext ‖ tag` produced by [`aead_encrypt`].
///
/// A tag mismatch maps to [`CipherError::AeadFailure`], which callers treat
/// differently from a block MAC failure.
pub fn aead_decrypt(
    alg: CipherAlg,
    key: &[u8; KEY_BYTES],
    iv: &[u8],
    aad: &[u8],
    encrypted: &[u8],
) -> CipherResult<Vec<u8>> {
    check_iv(alg, iv)?;
    if encrypted.len() < alg.tag_bytes() {
        return Err(CipherError::Structural(format!(
            "encrypted data too short: {}",
            encrypted.len()
        )));
    }

    match alg {
        CipherAlg::AesGcm256 => {
            let cipher = Aes256Gcm::new(key.into());
            cipher
                .decrypt(Nonce::from_slice(iv), Payload { msg: encrypted, aad })
                .map_err(|_| CipherError::AeadFailure)
        }
        CipherAlg::XChaCha20Poly1305 => {
            let cipher = XChaCha20Poly1305::new(key.into());
            cipher
                .decrypt(XNonce::from_slice(iv), Payload { msg: encrypted, aad })
                .map_err(|_| CipherError::AeadFailure)
        }
        CipherAlg::Aegis256 => {
            let mut nonce = [0u8; 32];
            nonce.copy_from_slice(iv);
            let (ct, tag_slice) = encrypted.split_at(encrypted.len() - 32);
            let mut tag = [0u8; 32];
            tag.copy_from_slice(tag_slice);
            Aegis256::<32>::new(key, &nonce)
                .decrypt(ct, &tag, aad)
                .map_err(|_| CipherError::AeadFailure)
        }
    }
}
