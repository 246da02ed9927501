//! Key derivation: password + user credential → cipher, signing and hint keys.
//!
//! Three independent secrets come out of one root credential:
//!
//! ```text
//! password ‖ userCred ──PBKDF2-HMAC-SHA-512(ic, salt)──▶ CipherKey (256-bit)
//! userCred ──keyed BLAKE2b(salt=1, personal="cipherda", msg=salt)──▶ SigningKey
//! userCred ──keyed BLAKE2b(salt=1, personal="hint enc", msg=salt‖iv)──▶ HintKey ‖ HintIV
//! ```
//!
//! The v6 and pre-v6 variants reproduce deprecated formulas bit-for-bit.
//! They are frozen: old ciphertext can only be opened with the exact bytes
//! those formulas produced, so they must never be "fixed".

use blake2::digest::consts::{U32, U56};
use blake2::digest::Mac;
use blake2::Blake2bMac;
use hkdf::Hkdf;
use hmac::Hmac;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha512;
use zeroize::Zeroize;

use crate::error::{CipherError, CipherResult};
use crate::{
    ICOUNT_DEFAULT, ICOUNT_MAX, ICOUNT_MIN, IV_MAX_BYTES, IV_MIN_BYTES, KEY_BYTES, SALT_BYTES,
    USERCRED_BYTES, VERSION6, VERSION7,
};

/// HKDF info strings of the pre-v6 derivations. Frozen.
const HKDF_INFO_SIGNING: &[u8] = b"cipherdata signing key";
const HKDF_INFO_HINT: &[u8] = b"hint encryption key";

/// BLAKE2b personalization of the v6+ derivations. Frozen.
const PERSONAL_SIGNING: &[u8; 16] = b"cipherda\0\0\0\0\0\0\0\0";
const PERSONAL_HINT: &[u8; 16] = b"hint enc\0\0\0\0\0\0\0\0";

/// BLAKE2b salt slot of the v6+ derivations: subkey id 1, little-endian,
/// zero-padded. Frozen.
const SUBKEY_SALT: &[u8; 16] = &[1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];

/// Number of bytes the v7 hint derivation produces: 32-byte key followed
/// by a 24-byte XChaCha20 nonce.
const HINT_OKM_BYTES: usize = KEY_BYTES + 24;

/// The 32-byte secret obtained through passkey authentication.
///
/// Owned by the external auth layer; this crate only ever borrows it into
/// derivations and never persists it. Zeroized on drop.
#[derive(Clone)]
pub struct UserCred {
    bytes: [u8; USERCRED_BYTES],
}

impl UserCred {
    pub fn from_bytes(bytes: [u8; USERCRED_BYTES]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> CipherResult<Self> {
        if bytes.len() != USERCRED_BYTES {
            return Err(CipherError::Parameter(format!(
                "invalid userCred length of {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; USERCRED_BYTES];
        out.copy_from_slice(bytes);
        Ok(Self { bytes: out })
    }

    pub fn as_bytes(&self) -> &[u8; USERCRED_BYTES] {
        &self.bytes
    }
}

impl Drop for UserCred {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for UserCred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCred").field("bytes", &"[REDACTED]").finish()
    }
}

macro_rules! key_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone)]
        pub struct $name {
            bytes: [u8; KEY_BYTES],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
                Self { bytes }
            }

            pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

key_newtype!(CipherKey, "256-bit AEAD key stretched from password ‖ userCred. Zeroized on drop.");
key_newtype!(SigningKey, "256-bit keyed-BLAKE2b / HMAC key for block MACs. Zeroized on drop.");
key_newtype!(HintKey, "256-bit key that encrypts only the password hint. Zeroized on drop.");

fn check_salt(salt: &[u8]) -> CipherResult<()> {
    if salt.len() != SALT_BYTES {
        return Err(CipherError::Parameter(format!(
            "invalid salt length of {}",
            salt.len()
        )));
    }
    Ok(())
}

fn check_ver(ver: u16) -> CipherResult<()> {
    if ver != VERSION6 && ver != VERSION7 {
        return Err(CipherError::Parameter(format!("invalid version of {ver}")));
    }
    Ok(())
}

/// Stretch `password ‖ userCred` into the 256-bit cipher key.
///
/// PBKDF2-HMAC-SHA-512 with `ic` rounds over the salt. The output is
/// algorithm-agnostic: the same bytes key whichever AEAD consumes them.
/// `ic` can legitimately take minutes at the top of its range; no timeout
/// lives at this layer.
pub fn gen_cipher_key(
    ic: u32,
    pwd: &SecretString,
    user_cred: &UserCred,
    salt: &[u8],
) -> CipherResult<CipherKey> {
    if !(ICOUNT_MIN..=ICOUNT_MAX).contains(&ic) {
        return Err(CipherError::Parameter(format!("invalid ic of {ic}")));
    }
    check_salt(salt)?;
    if pwd.expose_secret().is_empty() {
        return Err(CipherError::Parameter("empty password".into()));
    }

    let mut material = Vec::with_capacity(pwd.expose_secret().len() + USERCRED_BYTES);
    material.extend_from_slice(pwd.expose_secret().as_bytes());
    material.extend_from_slice(user_cred.as_bytes());

    let mut key = [0u8; KEY_BYTES];
    pbkdf2::pbkdf2::<Hmac<Sha512>>(&material, salt, ic, &mut key)
        .map_err(|e| CipherError::Parameter(format!("PBKDF2 failed: {e}")))?;
    material.zeroize();

    Ok(CipherKey::from_bytes(key))
}

fn subkey(
    personal: &[u8; 16],
    user_cred: &UserCred,
    message: &[&[u8]],
    out: &mut [u8],
) -> CipherResult<()> {
    // Single dispatch on the two output sizes the format uses.
    match out.len() {
        KEY_BYTES => {
            let mut mac =
                Blake2bMac::<U32>::new_with_salt_and_personal(user_cred.as_bytes(), SUBKEY_SALT, personal)
                    .map_err(|e| CipherError::Parameter(format!("BLAKE2b params: {e}")))?;
            for part in message {
                Mac::update(&mut mac, part);
            }
            out.copy_from_slice(&mac.finalize().into_bytes());
        }
        HINT_OKM_BYTES => {
            let mut mac =
                Blake2bMac::<U56>::new_with_salt_and_personal(user_cred.as_bytes(), SUBKEY_SALT, personal)
                    .map_err(|e| CipherError::Parameter(format!("BLAKE2b params: {e}")))?;
            for part in message {
                Mac::update(&mut mac, part);
            }
            out.copy_from_slice(&mac.finalize().into_bytes());
        }
        len => return Err(CipherError::Parameter(format!("bad subkey length {len}"))),
    }
    Ok(())
}

/// Derive the block-MAC signing key. No password, no stretching: the key
/// comes straight from `userCred`, so MACs can be checked before any
/// password is known.
///
/// v6 froze a formula that ignores the salt; v7 mixes it in.
pub fn gen_signing_key(user_cred: &UserCred, salt: &[u8], ver: u16) -> CipherResult<SigningKey> {
    check_salt(salt)?;
    check_ver(ver)?;

    let mut key = [0u8; KEY_BYTES];
    if ver >= VERSION7 {
        subkey(PERSONAL_SIGNING, user_cred, &[salt], &mut key)?;
    } else {
        subkey(PERSONAL_SIGNING, user_cred, &[], &mut key)?;
    }
    Ok(SigningKey::from_bytes(key))
}

/// Derive the hint key and hint nonce.
///
/// The hint is encrypted under a key independent of the cipher key so a UI
/// may reveal it once `userCred` is proven but before the password exists.
/// v7 derives both key and a 24-byte XChaCha20 nonce from salt ‖ iv; the
/// frozen v6 formula ignores both and echoes the block iv back.
pub fn gen_hint_cipher_key_and_iv(
    user_cred: &UserCred,
    iv: &[u8],
    salt: &[u8],
    ver: u16,
) -> CipherResult<(HintKey, Vec<u8>)> {
    check_salt(salt)?;
    check_ver(ver)?;
    if iv.len() < IV_MIN_BYTES || iv.len() > IV_MAX_BYTES {
        return Err(CipherError::Parameter(format!(
            "invalid iv length of {}",
            iv.len()
        )));
    }

    if ver >= VERSION7 {
        let mut okm = [0u8; HINT_OKM_BYTES];
        subkey(PERSONAL_HINT, user_cred, &[salt, iv], &mut okm)?;
        let mut key = [0u8; KEY_BYTES];
        key.copy_from_slice(&okm[..KEY_BYTES]);
        let hint_iv = okm[KEY_BYTES..].to_vec();
        okm.zeroize();
        Ok((HintKey::from_bytes(key), hint_iv))
    } else {
        let mut key = [0u8; KEY_BYTES];
        subkey(PERSONAL_HINT, user_cred, &[], &mut key)?;
        Ok((HintKey::from_bytes(key), iv.to_vec()))
    }
}

fn hkdf_sha512(user_cred: &UserCred, salt: &[u8], info: &[u8]) -> CipherResult<[u8; KEY_BYTES]> {
    let hk = Hkdf::<Sha512>::new(Some(salt), user_cred.as_bytes());
    let mut okm = [0u8; KEY_BYTES];
    hk.expand(info, &mut okm)
        .map_err(|e| CipherError::Parameter(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Pre-v6 signing key: HKDF-SHA-512. Frozen, decode-only.
pub fn gen_signing_key_old(user_cred: &UserCred, salt: &[u8]) -> CipherResult<SigningKey> {
    check_salt(salt)?;
    Ok(SigningKey::from_bytes(hkdf_sha512(
        user_cred,
        salt,
        HKDF_INFO_SIGNING,
    )?))
}

/// Pre-v6 hint key: HKDF-SHA-512; the hint nonce is the block iv. Frozen,
/// decode-only.
pub fn gen_hint_cipher_key_old(user_cred: &UserCred, salt: &[u8]) -> CipherResult<HintKey> {
    check_salt(salt)?;
    Ok(HintKey::from_bytes(hkdf_sha512(
        user_cred,
        salt,
        HKDF_INFO_HINT,
    )?))
}

/// Probe the machine's PBKDF2 hash rate and recommend an iteration count.
///
/// Returns `(ic, ic_max, hash_rate)` where `ic` targets `target_millis` of
/// stretching (never below [`ICOUNT_DEFAULT`]), `ic_max` caps the count at
/// roughly `max_millis` rounded to millions, and `hash_rate` is iterations
/// per millisecond.
pub fn benchmark_icount(
    test_size: u32,
    target_millis: u64,
    max_millis: u64,
) -> CipherResult<(u32, u32, f64)> {
    if test_size == 0 {
        return Err(CipherError::Parameter("test_size must be nonzero".into()));
    }

    let mut cred = [0u8; USERCRED_BYTES];
    rand::thread_rng().fill_bytes(&mut cred);

    let start = std::time::Instant::now();
    let mut probe = [0u8; KEY_BYTES];
    pbkdf2::pbkdf2::<Hmac<Sha512>>(b"AVeryBogusPwd", &cred, test_size, &mut probe)
        .map_err(|e| CipherError::Parameter(format!("PBKDF2 failed: {e}")))?;
    probe.zeroize();
    cred.zeroize();

    let millis = start.elapsed().as_millis().max(1) as f64;
    let hash_rate = test_size as f64 / millis;

    let ic_max = (((max_millis as f64 * hash_rate) / 1_000_000.0).round() * 1_000_000.0)
        .min(ICOUNT_MAX as f64) as u32;
    let target = ((hash_rate * target_millis as f64 / 100_000.0).round() * 100_000.0) as u64;
    // The probe tends to run cold and report low, so pad the target.
    let ic = (target + ICOUNT_MIN as u64)
        .max(ICOUNT_DEFAULT as u64)
        .min(ICOUNT_MAX as u64) as u32;

    Ok((ic, ic_max, hash_rate))
}
