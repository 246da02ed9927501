//! Whole-stream helpers over the block engines: pump a source through one
//! or more encryption passes, and unwind them again.
//!
//! A stream may be wrapped in up to [`LP_MAX`](crate::LP_MAX) passes, one
//! per configured algorithm; each pass records its loop index and the loop
//! end in block0, which is how decryption knows how far to unwind.

use std::io::{Cursor, Read, Write};

use tracing::debug;

use crate::alg::CipherAlg;
use crate::decipher::{stream_decipher, Decipher};
use crate::encipher::Encipher;
use crate::error::{CipherError, CipherResult};
use crate::kdf::UserCred;
use crate::types::{CipherDataInfo, EParams, PwdProvider};
use crate::LP_MAX;

/// Encryption context: one pass per algorithm, all with the same
/// iteration count.
#[derive(Debug, Clone)]
pub struct EContext {
    pub algs: Vec<CipherAlg>,
    pub ic: u32,
}

fn pass_params(ectx: &EContext, lp: u8) -> EParams {
    EParams {
        alg: ectx.algs[lp as usize - 1],
        ic: ectx.ic,
        lp,
        lp_end: ectx.algs.len() as u8,
    }
}

fn pump_encrypt<R: Read, W: Write>(
    params: &EParams,
    provider: &mut PwdProvider<'_>,
    user_cred: &UserCred,
    source: R,
    dest: &mut W,
) -> CipherResult<u64> {
    let mut encipher = Encipher::new(user_cred.clone(), source);
    let mut written = 0u64;
    while let Some(block) = encipher.encrypt_block(params, provider)? {
        written += block.write_to(dest)? as u64;
    }
    Ok(written)
}

fn pump_decrypt<W: Write>(
    decipher: &mut dyn Decipher,
    provider: &mut PwdProvider<'_>,
    dest: &mut W,
) -> CipherResult<u64> {
    let mut written = 0u64;
    loop {
        let clear = decipher.decrypt_block(provider)?;
        if clear.is_empty() {
            return Ok(written);
        }
        dest.write_all(&clear)?;
        written += clear.len() as u64;
    }
}

/// Encrypt `source` into `dest`, one pass per algorithm in `ectx`.
///
/// The provider is consulted once per pass. Single-pass streams hold at
/// most one chunk in memory; additional passes buffer the intermediate
/// ciphertext of the pass below them.
pub fn encrypt_stream<R: Read, W: Write>(
    ectx: &EContext,
    provider: &mut PwdProvider<'_>,
    user_cred: &UserCred,
    source: R,
    dest: &mut W,
) -> CipherResult<u64> {
    if ectx.algs.is_empty() || ectx.algs.len() > LP_MAX as usize {
        return Err(CipherError::Parameter(format!(
            "invalid loop end of {}",
            ectx.algs.len()
        )));
    }

    let lp_end = ectx.algs.len() as u8;
    if lp_end == 1 {
        return pump_encrypt(&pass_params(ectx, 1), provider, user_cred, source, dest);
    }

    debug!(passes = lp_end, "loop encryption");
    let mut wrapped = Vec::new();
    pump_encrypt(&pass_params(ectx, 1), provider, user_cred, source, &mut wrapped)?;

    for lp in 2..lp_end {
        let mut next = Vec::new();
        pump_encrypt(
            &pass_params(ectx, lp),
            provider,
            user_cred,
            Cursor::new(wrapped),
            &mut next,
        )?;
        wrapped = next;
    }

    pump_encrypt(
        &pass_params(ectx, lp_end),
        provider,
        user_cred,
        Cursor::new(wrapped),
        dest,
    )
}

/// Decode and MAC-verify the stream's parameters without decrypting any
/// payload.
pub fn get_cipher_stream_info<R: Read>(
    user_cred: &UserCred,
    source: R,
) -> CipherResult<CipherDataInfo> {
    let mut decipher = stream_decipher(user_cred.clone(), source)?;
    decipher.get_cipher_data_info()
}

/// Decrypt `source` into `dest`, unwinding however many encryption passes
/// the stream was wrapped in.
pub fn decrypt_stream<R: Read, W: Write>(
    provider: &mut PwdProvider<'_>,
    user_cred: &UserCred,
    source: R,
    dest: &mut W,
) -> CipherResult<u64> {
    let mut decipher = stream_decipher(user_cred.clone(), source)?;
    let info = decipher.get_cipher_data_info()?;

    if info.lp == 1 {
        return pump_decrypt(decipher.as_mut(), provider, dest);
    }

    debug!(lp = info.lp, "unwinding loop encryption");
    let mut inner = Vec::new();
    pump_decrypt(decipher.as_mut(), provider, &mut inner)?;
    let mut lp = info.lp;

    loop {
        let mut decipher = stream_decipher(user_cred.clone(), Cursor::new(inner))?;
        let info = decipher.get_cipher_data_info()?;
        if info.lp != lp - 1 {
            return Err(CipherError::Structural(format!(
                "invalid loop of {}",
                info.lp
            )));
        }
        lp = info.lp;

        if lp == 1 {
            return pump_decrypt(decipher.as_mut(), provider, dest);
        }
        let mut next = Vec::new();
        pump_decrypt(decipher.as_mut(), provider, &mut next)?;
        inner = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CipherResult, ICOUNT_MIN, USERCRED_BYTES};
    use secrecy::SecretString;

    fn cred() -> UserCred {
        UserCred::from_bytes([77u8; USERCRED_BYTES])
    }

    fn provider(info: &CipherDataInfo) -> CipherResult<(SecretString, Option<String>)> {
        // both passes of a looped stream surface their own loop index
        assert!(info.lp >= 1 && info.lp <= info.lp_end);
        Ok((SecretString::from("a looping pwd"), None))
    }

    #[test]
    fn test_single_pass_roundtrip() {
        let clear = b"stream helper roundtrip".to_vec();
        let ectx = EContext {
            algs: vec![CipherAlg::XChaCha20Poly1305],
            ic: ICOUNT_MIN,
        };

        let mut cipher = Vec::new();
        let written =
            encrypt_stream(&ectx, &mut provider, &cred(), &clear[..], &mut cipher).unwrap();
        assert_eq!(written, cipher.len() as u64);

        let info = get_cipher_stream_info(&cred(), &cipher[..]).unwrap();
        assert_eq!(info.alg, CipherAlg::XChaCha20Poly1305);
        assert_eq!((info.lp, info.lp_end), (1, 1));

        let mut decrypted = Vec::new();
        decrypt_stream(&mut provider, &cred(), &cipher[..], &mut decrypted).unwrap();
        assert_eq!(decrypted, clear);
    }

    #[test]
    fn test_two_pass_loop_roundtrip() {
        let clear = b"wrapped twice over".to_vec();
        let ectx = EContext {
            algs: vec![CipherAlg::AesGcm256, CipherAlg::XChaCha20Poly1305],
            ic: ICOUNT_MIN,
        };

        let mut cipher = Vec::new();
        encrypt_stream(&ectx, &mut provider, &cred(), &clear[..], &mut cipher).unwrap();

        // the outermost pass is the last algorithm with lp == lp_end
        let info = get_cipher_stream_info(&cred(), &cipher[..]).unwrap();
        assert_eq!(info.alg, CipherAlg::XChaCha20Poly1305);
        assert_eq!((info.lp, info.lp_end), (2, 2));

        let mut decrypted = Vec::new();
        decrypt_stream(&mut provider, &cred(), &cipher[..], &mut decrypted).unwrap();
        assert_eq!(decrypted, clear);
    }

    #[test]
    fn test_empty_alg_list_rejected() {
        let ectx = EContext {
            algs: Vec::new(),
            ic: ICOUNT_MIN,
        };
        let mut out = Vec::new();
        let err = encrypt_stream(&ectx, &mut provider, &cred(), &b"x"[..], &mut out).unwrap_err();
        assert!(matches!(err, CipherError::Parameter(_)));
    }
}
