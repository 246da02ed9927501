//! Block codec: field-level packing and unpacking of the wire format.
//!
//! Decoding treats every field as untrusted until the block MAC verifies;
//! the reader range-checks each value as it is sliced out, and a minimum
//! length check precedes all fixed-width reads. Nothing a reader returns
//! may be shown to a user or acted on before signature verification.

use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;

use crate::alg::CipherAlg;
use crate::error::{CipherError, CipherResult};
use crate::kdf::SigningKey;
use crate::{
    ENCRYPTED_HINT_MAX_BYTES, FLAGS_BYTES, HEADER_BYTES_CURRENT, ICOUNT_MAX, ICOUNT_MIN, LP_MAX,
    MAC_BYTES, PAYLOAD_SIZE_BYTES, PAYLOAD_SIZE_MAX, PAYLOAD_SIZE_MIN, SALT_BYTES, VER_BYTES,
    VERSION1, VERSION4, VERSION5, VERSION6, VERSION7,
};

/// Sequential reader over untrusted encoded bytes.
pub(crate) struct FieldReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn extract(&mut self, what: &str, len: usize) -> CipherResult<&'a [u8]> {
        if self.data.len() - self.offset < len {
            return Err(CipherError::Structural(format!(
                "invalid {what}, length {}",
                self.data.len() - self.offset
            )));
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    /// Everything left. Zero remaining bytes is an encoding error.
    pub fn remainder(&mut self, what: &str) -> CipherResult<&'a [u8]> {
        let out = &self.data[self.offset..];
        if out.is_empty() {
            return Err(CipherError::Structural(format!("invalid {what}, length 0")));
        }
        self.offset = self.data.len();
        Ok(out)
    }

    pub fn mac(&mut self) -> CipherResult<[u8; MAC_BYTES]> {
        let raw = self.extract("mac", MAC_BYTES)?;
        let mut mac = [0u8; MAC_BYTES];
        mac.copy_from_slice(raw);
        Ok(mac)
    }

    pub fn alg(&mut self) -> CipherResult<CipherAlg> {
        let raw = self.extract("alg", 2)?;
        CipherAlg::from_id(u16::from_le_bytes([raw[0], raw[1]]))
    }

    pub fn iv(&mut self, alg: CipherAlg) -> CipherResult<&'a [u8]> {
        self.extract("iv", alg.iv_bytes())
    }

    pub fn salt(&mut self) -> CipherResult<[u8; SALT_BYTES]> {
        let raw = self.extract("salt", SALT_BYTES)?;
        let mut salt = [0u8; SALT_BYTES];
        salt.copy_from_slice(raw);
        Ok(salt)
    }

    pub fn ic(&mut self) -> CipherResult<u32> {
        let raw = self.extract("ic", 4)?;
        let ic = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if !(ICOUNT_MIN..=ICOUNT_MAX).contains(&ic) {
            return Err(CipherError::Structural(format!("invalid ic of {ic}")));
        }
        Ok(ic)
    }

    /// Loop index and loop end, packed one nibble each.
    pub fn lpp(&mut self) -> CipherResult<(u8, u8)> {
        let raw = self.extract("lpp", 1)?[0];
        Ok(((raw & 0x0f) + 1, (raw >> 4) + 1))
    }

    pub fn ver(&mut self) -> CipherResult<u16> {
        let raw = self.extract("ver", VER_BYTES)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    /// Encrypted hint, preceded by its one-byte length. May be empty.
    pub fn hint(&mut self) -> CipherResult<&'a [u8]> {
        let len = self.extract("hint length", 1)?[0] as usize;
        self.extract("hint", len)
    }

    /// Three-byte payload size, range checked.
    pub fn size(&mut self) -> CipherResult<usize> {
        let raw = self.extract("size", PAYLOAD_SIZE_BYTES)?;
        let size = u32::from_le_bytes([raw[0], raw[1], raw[2], 0]) as usize;
        if !(PAYLOAD_SIZE_MIN..=PAYLOAD_SIZE_MAX).contains(&size) {
            return Err(CipherError::Structural(format!(
                "invalid payload size of {size}"
            )));
        }
        Ok(size)
    }

    pub fn flags(&mut self) -> CipherResult<u8> {
        Ok(self.extract("flags", FLAGS_BYTES)?[0])
    }
}

/// Sequential writer that validates every field before packing it.
pub(crate) struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn mac(&mut self, mac: &[u8; MAC_BYTES]) {
        self.buf.extend_from_slice(mac);
    }

    pub fn alg(&mut self, alg: CipherAlg) {
        self.buf.extend_from_slice(&alg.id().to_le_bytes());
    }

    pub fn iv(&mut self, alg: CipherAlg, iv: &[u8]) -> CipherResult<()> {
        if iv.len() != alg.iv_bytes() {
            return Err(CipherError::Parameter(format!(
                "invalid iv length of {}",
                iv.len()
            )));
        }
        self.buf.extend_from_slice(iv);
        Ok(())
    }

    pub fn salt(&mut self, salt: &[u8]) -> CipherResult<()> {
        if salt.len() != SALT_BYTES {
            return Err(CipherError::Parameter(format!(
                "invalid salt length of {}",
                salt.len()
            )));
        }
        self.buf.extend_from_slice(salt);
        Ok(())
    }

    pub fn ic(&mut self, ic: u32) -> CipherResult<()> {
        if !(ICOUNT_MIN..=ICOUNT_MAX).contains(&ic) {
            return Err(CipherError::Parameter(format!("invalid ic of {ic}")));
        }
        self.buf.extend_from_slice(&ic.to_le_bytes());
        Ok(())
    }

    pub fn lpp(&mut self, lp: u8, lp_end: u8) -> CipherResult<()> {
        if lp < 1 || lp > LP_MAX || lp_end < 1 || lp_end > LP_MAX || lp > lp_end {
            return Err(CipherError::Parameter(format!(
                "invalid loop of {lp}/{lp_end}"
            )));
        }
        self.buf.push((lp - 1) | ((lp_end - 1) << 4));
        Ok(())
    }

    pub fn ver(&mut self, ver: u16) {
        self.buf.extend_from_slice(&ver.to_le_bytes());
    }

    pub fn hint(&mut self, encrypted_hint: &[u8]) -> CipherResult<()> {
        if encrypted_hint.len() > ENCRYPTED_HINT_MAX_BYTES {
            return Err(CipherError::Parameter(format!(
                "invalid hint length of {}",
                encrypted_hint.len()
            )));
        }
        self.buf.push(encrypted_hint.len() as u8);
        self.buf.extend_from_slice(encrypted_hint);
        Ok(())
    }

    pub fn size(&mut self, payload_size: usize) -> CipherResult<()> {
        if !(PAYLOAD_SIZE_MIN..=PAYLOAD_SIZE_MAX).contains(&payload_size) {
            return Err(CipherError::Parameter(format!(
                "invalid payload size of {payload_size}"
            )));
        }
        self.buf
            .extend_from_slice(&(payload_size as u32).to_le_bytes()[..PAYLOAD_SIZE_BYTES]);
        Ok(())
    }
}

/// Additional-data layout for a block. `salt`/`ic`/`lp` and the hint only
/// appear in block0.
pub(crate) struct AdParams<'a> {
    pub alg: CipherAlg,
    pub iv: &'a [u8],
    pub salt: Option<&'a [u8]>,
    pub ic: Option<u32>,
    pub lp: Option<(u8, u8)>,
    pub encrypted_hint: Option<&'a [u8]>,
}

pub(crate) fn encode_additional_data(p: &AdParams<'_>) -> CipherResult<Vec<u8>> {
    if p.salt.is_some() && p.ic.is_none() {
        return Err(CipherError::Parameter("missing ic".into()));
    }

    let mut w = FieldWriter::new(crate::ADDITIONAL_DATA_MAX_BYTES);
    w.alg(p.alg);
    w.iv(p.alg, p.iv)?;
    if let Some(salt) = p.salt {
        w.salt(salt)?;
    }
    if let Some(ic) = p.ic {
        w.ic(ic)?;
    }
    if let Some((lp, lp_end)) = p.lp {
        w.lpp(lp, lp_end)?;
    }
    if let Some(hint) = p.encrypted_hint {
        w.hint(hint)?;
    }
    Ok(w.into_bytes())
}

/// Pick the decoder era from the fixed 37-byte prefix of a stream.
///
/// The u16 after the MAC is the discriminator. The v1 encoding put its
/// version in the middle of the block, so a value of 1..=3 is actually a
/// v1 algorithm id; v1 algorithm ids and later version numbers were kept
/// disjoint exactly so this one read settles the era.
pub(crate) fn version_from_prefix(prefix: &[u8]) -> CipherResult<u16> {
    if prefix.len() < HEADER_BYTES_CURRENT {
        return Err(CipherError::Structural(format!(
            "invalid cipher stream length of {}",
            prefix.len()
        )));
    }
    let ver_or_alg = u16::from_le_bytes([prefix[MAC_BYTES], prefix[MAC_BYTES + 1]]);
    match ver_or_alg {
        v if v == VERSION7 || v == VERSION6 || v == VERSION5 || v == VERSION4 => Ok(v),
        a if a >= 1 && a < VERSION4 => Ok(VERSION1),
        v => Err(CipherError::Structural(format!("invalid version of {v}"))),
    }
}

/// Keyed BLAKE2b-256 over the given parts, in order.
pub(crate) fn compute_block_mac(
    sk: &SigningKey,
    parts: &[&[u8]],
) -> CipherResult<[u8; MAC_BYTES]> {
    let mut mac = Blake2bMac::<U32>::new_from_slice(sk.as_bytes())
        .map_err(|e| CipherError::Parameter(format!("MAC key: {e}")))?;
    for part in parts {
        Mac::update(&mut mac, part);
    }
    let mut out = [0u8; MAC_BYTES];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time comparison against an expected MAC.
pub(crate) fn verify_block_mac(
    sk: &SigningKey,
    parts: &[&[u8]],
    expected: &[u8],
) -> CipherResult<bool> {
    let mut mac = Blake2bMac::<U32>::new_from_slice(sk.as_bytes())
        .map_err(|e| CipherError::Parameter(format!("MAC key: {e}")))?;
    for part in parts {
        Mac::update(&mut mac, part);
    }
    Ok(mac.verify_slice(expected).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_block0_ad_roundtrip() {
        let iv = [7u8; 24];
        let salt = [8u8; SALT_BYTES];
        let hint = vec![9u8; 23];
        let ad = encode_additional_data(&AdParams {
            alg: CipherAlg::XChaCha20Poly1305,
            iv: &iv,
            salt: Some(&salt),
            ic: Some(1_800_000),
            lp: Some((2, 3)),
            encrypted_hint: Some(&hint),
        })
        .unwrap();

        let mut r = FieldReader::new(&ad);
        let alg = r.alg().unwrap();
        assert_eq!(alg, CipherAlg::XChaCha20Poly1305);
        assert_eq!(r.iv(alg).unwrap(), &iv);
        assert_eq!(r.salt().unwrap(), salt);
        assert_eq!(r.ic().unwrap(), 1_800_000);
        assert_eq!(r.lpp().unwrap(), (2, 3));
        assert_eq!(r.hint().unwrap(), &hint[..]);
        assert_eq!(r.offset(), ad.len());
    }

    #[test]
    fn test_short_input_rejected() {
        let mut r = FieldReader::new(&[1, 0, 2]);
        let alg = r.alg().unwrap();
        assert!(matches!(r.iv(alg), Err(CipherError::Structural(_))));
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        // ic below minimum
        let mut bad_ic = vec![1, 0];
        bad_ic.extend_from_slice(&[0u8; 12]);
        bad_ic.extend_from_slice(&100u32.to_le_bytes());
        let mut r = FieldReader::new(&bad_ic);
        let alg = r.alg().unwrap();
        r.iv(alg).unwrap();
        assert!(r.ic().is_err());

        // hint over the wire maximum
        let mut w = FieldWriter::new(0);
        assert!(w.hint(&[0u8; ENCRYPTED_HINT_MAX_BYTES + 1]).is_err());

        // nonsense loop values
        let mut w = FieldWriter::new(0);
        assert!(w.lpp(0, 1).is_err());
        assert!(w.lpp(3, 2).is_err());
        assert!(w.lpp(1, 17).is_err());
    }

    #[test]
    fn test_salt_requires_ic() {
        let iv = [0u8; 12];
        let salt = [0u8; SALT_BYTES];
        let err = encode_additional_data(&AdParams {
            alg: CipherAlg::AesGcm256,
            iv: &iv,
            salt: Some(&salt),
            ic: None,
            lp: None,
            encrypted_hint: None,
        })
        .unwrap_err();
        assert!(matches!(err, CipherError::Parameter(_)));
    }

    #[test]
    fn test_version_discrimination() {
        let mut prefix = [0u8; HEADER_BYTES_CURRENT];
        for (tag, expect) in [
            (1u16, VERSION1),
            (2, VERSION1),
            (3, VERSION1),
            (4, VERSION4),
            (5, VERSION5),
            (6, VERSION6),
            (7, VERSION7),
        ] {
            prefix[MAC_BYTES..MAC_BYTES + 2].copy_from_slice(&tag.to_le_bytes());
            assert_eq!(version_from_prefix(&prefix).unwrap(), expect);
        }

        prefix[MAC_BYTES..MAC_BYTES + 2].copy_from_slice(&0u16.to_le_bytes());
        assert!(version_from_prefix(&prefix).is_err());
        prefix[MAC_BYTES..MAC_BYTES + 2].copy_from_slice(&8u16.to_le_bytes());
        assert!(version_from_prefix(&prefix).is_err());
        assert!(version_from_prefix(&prefix[..HEADER_BYTES_CURRENT - 1]).is_err());
    }

    #[test]
    fn test_mac_chain_sensitivity() {
        let sk = SigningKey::from_bytes([5u8; 32]);
        let a = compute_block_mac(&sk, &[b"header", b"payload", &[0u8]]).unwrap();
        let b = compute_block_mac(&sk, &[b"header", b"payload", &a]).unwrap();
        assert_ne!(a, b);
        assert!(verify_block_mac(&sk, &[b"header", b"payload", &[0u8]], &a).unwrap());
        assert!(!verify_block_mac(&sk, &[b"header", b"payload", &[0u8]], &b).unwrap());
    }

    proptest! {
        #[test]
        fn prop_lpp_roundtrip(lp in 1u8..=16, extra in 0u8..=15) {
            let lp_end = lp.saturating_add(extra).min(16);
            let mut w = FieldWriter::new(1);
            w.lpp(lp, lp_end).unwrap();
            let bytes = w.into_bytes();
            let mut r = FieldReader::new(&bytes);
            prop_assert_eq!(r.lpp().unwrap(), (lp, lp_end));
        }

        #[test]
        fn prop_size_roundtrip(size in PAYLOAD_SIZE_MIN..=PAYLOAD_SIZE_MAX) {
            let mut w = FieldWriter::new(3);
            w.size(size).unwrap();
            let bytes = w.into_bytes();
            let mut r = FieldReader::new(&bytes);
            prop_assert_eq!(r.size().unwrap(), size);
        }

        #[test]
        fn prop_hint_roundtrip(hint in proptest::collection::vec(any::<u8>(), 0..=255)) {
            let mut w = FieldWriter::new(hint.len() + 1);
            w.hint(&hint).unwrap();
            let bytes = w.into_bytes();
            let mut r = FieldReader::new(&bytes);
            prop_assert_eq!(r.hint().unwrap(), &hint[..]);
        }
    }
}
