//! Version-dispatched decryption. One factory peeks the stream prefix and
//! hands back the decoder that owns the rest of the stream.

use std::io::Read;

use secrecy::ExposeSecret;
use tracing::debug;

use crate::alg::{aead_decrypt, CipherAlg};
use crate::error::{CipherError, CipherResult};
use crate::kdf::{
    gen_cipher_key, gen_hint_cipher_key_and_iv, gen_signing_key, CipherKey, SigningKey, UserCred,
};
use crate::reader::ByteStreamReader;
use crate::types::{CipherDataInfo, EngineState, PwdProvider};
use crate::wire::{verify_block_mac, version_from_prefix, FieldReader};
use crate::{
    decipher_old::{DecipherV1, DecipherV45},
    FLAG_TERMINAL, HEADER_BYTES_CURRENT, MAC_BYTES, SALT_BYTES, VERSION1, VERSION4, VERSION5,
    VERSION6, VERSION7,
};

/// Shared contract of every decoder era.
///
/// `get_cipher_data_info` exposes the authenticated parameters (and the
/// decrypted hint) before any password exists; `decrypt_block0` is the only
/// operation a caller may retry, and only after an AEAD failure.
pub trait Decipher: std::fmt::Debug {
    /// Wire version this instance is decoding.
    fn protocol_version(&self) -> u16;

    /// Decode and MAC-verify block0 without touching its payload, so a UI
    /// can show algorithm, iteration count and hint before asking for a
    /// password. A MAC failure poisons the instance.
    fn get_cipher_data_info(&mut self) -> CipherResult<CipherDataInfo>;

    /// Ask the provider for the password (passing it the trusted hint) and
    /// decrypt block0. An [`CipherError::AeadFailure`] here almost always
    /// means a wrong password; the instance stays usable for exactly one
    /// further attempt.
    fn decrypt_block0(&mut self, provider: &mut PwdProvider<'_>) -> CipherResult<Vec<u8>>;

    /// Decrypt the next continuation block. Returns an empty vector once,
    /// at clean end of stream.
    fn decrypt_block_n(&mut self) -> CipherResult<Vec<u8>>;

    /// Pump wrapper: block0 first, then continuation blocks, empty when
    /// done.
    fn decrypt_block(&mut self, provider: &mut PwdProvider<'_>) -> CipherResult<Vec<u8>>;
}

/// Inspect the fixed prefix of `source` and return the decoder for its
/// wire-format era.
pub fn stream_decipher<'a, R: Read + 'a>(
    user_cred: UserCred,
    source: R,
) -> CipherResult<Box<dyn Decipher + 'a>> {
    let mut reader = ByteStreamReader::new(source);
    let mut prefix = vec![0u8; HEADER_BYTES_CURRENT];
    let (filled, eof) = reader.read_fill(&mut prefix)?;
    if filled != HEADER_BYTES_CURRENT || eof {
        reader.cleanup();
        return Err(CipherError::Structural(format!(
            "invalid cipher stream length of {filled}"
        )));
    }

    let ver = version_from_prefix(&prefix)?;
    debug!(ver, "selected decipher");

    Ok(match ver {
        VERSION6 | VERSION7 => Box::new(DecipherV67::new(user_cred, reader, prefix)),
        VERSION5 | VERSION4 => Box::new(DecipherV45::new(user_cred, reader, prefix, ver)),
        VERSION1 => Box::new(DecipherV1::new(user_cred, reader, prefix)),
        v => return Err(CipherError::Structural(format!("invalid version of {v}"))),
    })
}

/// One decoded-but-not-yet-decrypted block.
pub(crate) struct PendingBlock {
    pub alg: CipherAlg,
    pub iv: Vec<u8>,
    /// raw payload bytes; AD and EDATA are ranges into it
    pub payload: Vec<u8>,
    pub ad_start: usize,
    pub ad_end: usize,
}

impl PendingBlock {
    pub fn additional_data(&self) -> &[u8] {
        &self.payload[self.ad_start..self.ad_end]
    }

    pub fn encrypted_data(&self) -> &[u8] {
        &self.payload[self.ad_end..]
    }
}

/// Decoder for the v6/v7 era: 37-byte header, flags leading the payload,
/// MAC chaining across blocks.
pub(crate) struct DecipherV67<R: Read> {
    state: EngineState,
    user_cred: UserCred,
    reader: ByteStreamReader<R>,
    prefix: Option<Vec<u8>>,
    ver: u16,
    salt: [u8; SALT_BYTES],
    ic: u32,
    lp: u8,
    lp_end: u8,
    hint: Option<String>,
    block: Option<PendingBlock>,
    sk: Option<SigningKey>,
    ek: Option<CipherKey>,
    last_mac: Vec<u8>,
    last_flags: u8,
    pwd_retried: bool,
}

impl<R: Read> std::fmt::Debug for DecipherV67<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecipherV67")
            .field("state", &self.state)
            .field("ver", &self.ver)
            .finish_non_exhaustive()
    }
}

impl<R: Read> DecipherV67<R> {
    pub fn new(user_cred: UserCred, reader: ByteStreamReader<R>, prefix: Vec<u8>) -> Self {
        let ver = u16::from_le_bytes([prefix[MAC_BYTES], prefix[MAC_BYTES + 1]]);
        Self {
            state: EngineState::Fresh,
            user_cred,
            reader,
            prefix: Some(prefix),
            ver,
            salt: [0u8; SALT_BYTES],
            ic: 0,
            lp: 1,
            lp_end: 1,
            hint: None,
            block: None,
            sk: None,
            ek: None,
            last_mac: vec![0u8],
            last_flags: 0,
            pwd_retried: false,
        }
    }

    fn poison(&mut self) {
        self.state = EngineState::Invalid;
        self.sk = None;
        self.ek = None;
        self.block = None;
        self.hint = None;
        self.reader.cleanup();
    }

    fn info(&self) -> CipherDataInfo {
        let block = self.block.as_ref();
        CipherDataInfo {
            ver: self.ver,
            alg: block.map(|b| b.alg).unwrap_or(CipherAlg::AesGcm256),
            ic: self.ic,
            lp: self.lp,
            lp_end: self.lp_end,
            iv: block.map(|b| b.iv.clone()).unwrap_or_default(),
            salt: self.salt,
            hint: self.hint.clone(),
        }
    }

    /// Decode and MAC-verify block0. Idempotent; every field stays
    /// untrusted until the MAC check passes.
    fn decode_block0(&mut self) -> CipherResult<()> {
        match self.state {
            EngineState::Block0Decoded => return Ok(()),
            EngineState::Fresh => {}
            state => {
                self.poison();
                return Err(CipherError::InvalidState("Decipher", state.name()));
            }
        }
        let result = self.decode_block0_inner();
        if result.is_err() {
            self.poison();
        }
        result
    }

    fn decode_block0_inner(&mut self) -> CipherResult<()> {
        let prefix = self
            .prefix
            .take()
            .ok_or_else(|| CipherError::InvalidState("Decipher", "missing header"))?;

        let mut header = FieldReader::new(&prefix);
        let mac = header.mac()?;
        let ver = header.ver()?;
        if ver != VERSION6 && ver != VERSION7 {
            return Err(CipherError::Structural(format!("invalid version of {ver}")));
        }
        let payload_size = header.size()?;

        let mut payload = vec![0u8; payload_size];
        let (filled, _) = self.reader.read_fill(&mut payload)?;
        if filled != payload_size {
            return Err(CipherError::LengthMismatch(filled));
        }

        let flags = payload[0];
        let mut fields = FieldReader::new(&payload[1..]);
        let alg = fields.alg()?;
        let iv = fields.iv(alg)?.to_vec();
        let salt = fields.salt()?;
        let ic = fields.ic()?;
        let (lp, lp_end) = fields.lpp()?;
        let encrypted_hint = fields.hint()?.to_vec();
        let ad_len = fields.offset();
        fields.remainder("edata")?;
        let ad_end = 1 + ad_len;

        let sk = gen_signing_key(&self.user_cred, &salt, ver)?;

        // Verify before trusting or revealing anything decoded above.
        let verified = verify_block_mac(
            &sk,
            &[&prefix[MAC_BYTES..], &payload, &self.last_mac],
            &mac,
        )?;
        if !verified {
            return Err(CipherError::InvalidMac);
        }
        self.last_mac = mac.to_vec();

        if !encrypted_hint.is_empty() {
            let (hk, hint_iv) = gen_hint_cipher_key_and_iv(&self.user_cred, &iv, &salt, ver)?;
            let hint_alg = if ver >= VERSION7 {
                CipherAlg::XChaCha20Poly1305
            } else {
                alg
            };
            // The MAC already covered the encrypted hint, so a failure here
            // means inconsistent cipher data rather than a wrong password.
            let hint_clear = aead_decrypt(hint_alg, hk.as_bytes(), &hint_iv, &[], &encrypted_hint)
                .map_err(|_| CipherError::Structural("hint decryption failed".into()))?;
            self.hint = Some(String::from_utf8_lossy(&hint_clear).into_owned());
        }

        self.sk = Some(sk);
        self.salt = salt;
        self.ic = ic;
        self.lp = lp;
        self.lp_end = lp_end;
        self.last_flags = flags;
        // the flags byte opens the additional data
        self.block = Some(PendingBlock {
            alg,
            iv,
            payload,
            ad_start: 0,
            ad_end,
        });
        self.state = EngineState::Block0Decoded;
        Ok(())
    }

    fn read_block_n(&mut self) -> CipherResult<Option<Vec<u8>>> {
        let mut header_buf = vec![0u8; HEADER_BYTES_CURRENT];
        let (filled, _) = self.reader.read_fill(&mut header_buf)?;

        if filled == 0 {
            if self.last_flags & FLAG_TERMINAL == 0 {
                return Err(CipherError::MissingTerminalBlock);
            }
            self.reader.cleanup();
            self.state = EngineState::Finished;
            return Ok(None);
        }
        if filled < HEADER_BYTES_CURRENT {
            return Err(CipherError::Structural("missing cipher data header".into()));
        }
        if self.last_flags & FLAG_TERMINAL != 0 {
            return Err(CipherError::ExtraDataBlock);
        }

        let mut header = FieldReader::new(&header_buf);
        let mac = header.mac()?;
        let ver = header.ver()?;
        if ver != self.ver {
            return Err(CipherError::Structural(format!("invalid version of {ver}")));
        }
        let payload_size = header.size()?;

        let mut payload = vec![0u8; payload_size];
        let (filled, _) = self.reader.read_fill(&mut payload)?;
        if filled != payload_size {
            return Err(CipherError::LengthMismatch(filled));
        }

        let flags = payload[0];
        let mut fields = FieldReader::new(&payload[1..]);
        let alg = fields.alg()?;
        let iv = fields.iv(alg)?.to_vec();
        let ad_len = fields.offset();
        fields.remainder("edata")?;
        let ad_end = 1 + ad_len;

        let sk = self
            .sk
            .as_ref()
            .ok_or_else(|| CipherError::InvalidState("Decipher", "keys not initialized"))?;
        let verified = verify_block_mac(
            sk,
            &[&header_buf[MAC_BYTES..], &payload, &self.last_mac],
            &mac,
        )?;
        if !verified {
            return Err(CipherError::InvalidMac);
        }
        self.last_mac = mac.to_vec();
        self.last_flags = flags;

        let block = PendingBlock {
            alg,
            iv,
            payload,
            ad_start: 0,
            ad_end,
        };
        let ek = self
            .ek
            .as_ref()
            .ok_or_else(|| CipherError::InvalidState("Decipher", "keys not initialized"))?;
        let clear = aead_decrypt(
            block.alg,
            ek.as_bytes(),
            &block.iv,
            block.additional_data(),
            block.encrypted_data(),
        )?;
        Ok(Some(clear))
    }
}

impl<R: Read> Decipher for DecipherV67<R> {
    fn protocol_version(&self) -> u16 {
        self.ver
    }

    fn get_cipher_data_info(&mut self) -> CipherResult<CipherDataInfo> {
        self.decode_block0()?;
        Ok(self.info())
    }

    fn decrypt_block0(&mut self, provider: &mut PwdProvider<'_>) -> CipherResult<Vec<u8>> {
        self.decode_block0()?;

        let info = self.info();
        let (pwd, _) = match provider(&info) {
            Ok(answer) => answer,
            Err(err) => {
                self.poison();
                return Err(err);
            }
        };
        if pwd.expose_secret().is_empty() {
            self.poison();
            return Err(CipherError::Parameter("empty password".into()));
        }

        let ek = match gen_cipher_key(self.ic, &pwd, &self.user_cred, &self.salt) {
            Ok(ek) => ek,
            Err(err) => {
                self.poison();
                return Err(err);
            }
        };

        let block = self
            .block
            .as_ref()
            .ok_or_else(|| CipherError::InvalidState("Decipher", "missing block"))?;
        match aead_decrypt(
            block.alg,
            ek.as_bytes(),
            &block.iv,
            block.additional_data(),
            block.encrypted_data(),
        ) {
            Ok(clear) => {
                self.ek = Some(ek);
                self.block = None;
                self.state = EngineState::Block0Done;
                Ok(clear)
            }
            Err(CipherError::AeadFailure) => {
                // Structural parsing and the MAC already verified, so this
                // is almost certainly a mistyped password. One more try.
                if self.pwd_retried {
                    self.poison();
                } else {
                    self.pwd_retried = true;
                }
                Err(CipherError::AeadFailure)
            }
            Err(err) => {
                self.poison();
                Err(err)
            }
        }
    }

    fn decrypt_block_n(&mut self) -> CipherResult<Vec<u8>> {
        if self.state != EngineState::Block0Done && self.state != EngineState::BlockNDone {
            let state = self.state.name();
            self.poison();
            return Err(CipherError::InvalidState("Decipher", state));
        }
        match self.read_block_n() {
            Ok(Some(clear)) => {
                self.state = EngineState::BlockNDone;
                Ok(clear)
            }
            Ok(None) => Ok(Vec::new()),
            Err(err) => {
                self.poison();
                Err(err)
            }
        }
    }

    fn decrypt_block(&mut self, provider: &mut PwdProvider<'_>) -> CipherResult<Vec<u8>> {
        match self.state {
            EngineState::Fresh | EngineState::Block0Decoded => self.decrypt_block0(provider),
            EngineState::Block0Done | EngineState::BlockNDone => self.decrypt_block_n(),
            EngineState::Finished => Ok(Vec::new()),
            state => Err(CipherError::InvalidState("Decipher", state.name())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encipher::Encipher;
    use crate::types::EParams;
    use crate::wire::compute_block_mac;
    use crate::{CipherDataBlock, ICOUNT_MIN, USERCRED_BYTES};
    use secrecy::SecretString;
    use std::io::Cursor;

    fn cred() -> UserCred {
        UserCred::from_bytes([23u8; USERCRED_BYTES])
    }

    fn params() -> EParams {
        EParams {
            alg: CipherAlg::AesGcm256,
            ic: ICOUNT_MIN,
            lp: 1,
            lp_end: 1,
        }
    }

    fn provider(
        pwd: &'static str,
    ) -> impl FnMut(&CipherDataInfo) -> CipherResult<(SecretString, Option<String>)> {
        move |_info| Ok((SecretString::from(pwd), None))
    }

    fn encrypt_blocks(clear: &[u8], chunk: usize) -> Vec<CipherDataBlock> {
        let mut enc = Encipher::new(cred(), Cursor::new(clear.to_vec())).with_read_target(chunk);
        let mut blocks = Vec::new();
        let mut prov = provider("a good pwd");
        while let Some(block) = enc.encrypt_block(&params(), &mut prov).unwrap() {
            blocks.push(block);
        }
        blocks
    }

    fn stream_of(blocks: &[CipherDataBlock]) -> Vec<u8> {
        let mut out = Vec::new();
        for b in blocks {
            out.extend_from_slice(&b.to_bytes());
        }
        out
    }

    fn salt_of(block0: &CipherDataBlock) -> Vec<u8> {
        // block0 AD: flags(1) alg(2) iv(12, AES) salt(16)
        block0.additional_data[1 + 2 + 12..1 + 2 + 12 + 16].to_vec()
    }

    /// Rebuild a block with a chosen flags byte the way a tampered writer
    /// would: re-encrypt the chunk under the changed additional data and
    /// re-sign with the chained MAC.
    fn forge_block(
        block: &CipherDataBlock,
        salt: &[u8],
        clear: &[u8],
        chain: &[u8],
        flags: u8,
    ) -> CipherDataBlock {
        let sk = gen_signing_key(&cred(), salt, crate::CURRENT_VERSION).unwrap();
        let ek = gen_cipher_key(
            ICOUNT_MIN,
            &SecretString::from("a good pwd"),
            &cred(),
            salt,
        )
        .unwrap();

        let mut additional_data = block.additional_data.clone();
        additional_data[0] = flags;
        let alg = CipherAlg::from_id(u16::from_le_bytes([
            additional_data[1],
            additional_data[2],
        ]))
        .unwrap();
        let iv = additional_data[3..3 + alg.iv_bytes()].to_vec();
        let encrypted_data =
            crate::alg::aead_encrypt(alg, ek.as_bytes(), &iv, &additional_data, clear).unwrap();

        let tail = block.header[MAC_BYTES..].to_vec();
        let mac =
            compute_block_mac(&sk, &[&tail, &additional_data, &encrypted_data, chain]).unwrap();
        let mut header = mac.to_vec();
        header.extend_from_slice(&tail);
        CipherDataBlock {
            header,
            additional_data,
            encrypted_data,
        }
    }

    #[test]
    fn test_missing_terminal_block_detected() {
        let blocks = encrypt_blocks(&[5u8; 30], 40);
        assert_eq!(blocks.len(), 1);
        let salt = salt_of(&blocks[0]);
        let unflagged = forge_block(&blocks[0], &salt, &[5u8; 30], &[0u8], 0);

        let mut dec = stream_decipher(cred(), Cursor::new(unflagged.to_bytes())).unwrap();
        let clear = dec.decrypt_block0(&mut provider("a good pwd")).unwrap();
        assert_eq!(clear, vec![5u8; 30]);

        // the missing marker is only detectable at end of stream
        let err = dec.decrypt_block_n().unwrap_err();
        assert!(matches!(err, CipherError::MissingTerminalBlock));
    }

    #[test]
    fn test_extra_data_block_detected() {
        let clear = [6u8; 50];
        let blocks = encrypt_blocks(&clear, 20);
        assert_eq!(blocks.len(), 3);
        let salt = salt_of(&blocks[0]);

        // flag the middle block terminal; the last block then reads as
        // trailing data
        let early_terminal = forge_block(
            &blocks[1],
            &salt,
            &clear[20..40],
            &blocks[0].header[..MAC_BYTES],
            FLAG_TERMINAL,
        );

        let stream = stream_of(&[blocks[0].clone(), early_terminal, blocks[2].clone()]);
        let mut dec = stream_decipher(cred(), Cursor::new(stream)).unwrap();
        dec.decrypt_block0(&mut provider("a good pwd")).unwrap();
        dec.decrypt_block_n().unwrap();

        let err = dec.decrypt_block_n().unwrap_err();
        assert!(matches!(err, CipherError::ExtraDataBlock));
    }

    #[test]
    fn test_truncated_payload_reports_length_mismatch() {
        let blocks = encrypt_blocks(&[7u8; 30], 40);
        let mut stream = stream_of(&blocks);
        stream.truncate(stream.len() - 4);

        let mut dec = stream_decipher(cred(), Cursor::new(stream)).unwrap();
        let err = dec.decrypt_block0(&mut provider("a good pwd")).unwrap_err();
        assert!(matches!(err, CipherError::LengthMismatch(_)));
    }

    #[test]
    fn test_poisoned_instance_rejects_everything() {
        let blocks = encrypt_blocks(&[8u8; 30], 40);
        let mut stream = stream_of(&blocks);
        stream[10] ^= 0x01; // corrupt the MAC

        let mut dec = stream_decipher(cred(), Cursor::new(stream)).unwrap();
        let err = dec.get_cipher_data_info().unwrap_err();
        assert!(matches!(err, CipherError::InvalidMac));

        let err = dec.decrypt_block0(&mut provider("a good pwd")).unwrap_err();
        assert!(matches!(err, CipherError::InvalidState(_, "invalid")));
        let err = dec.decrypt_block_n().unwrap_err();
        assert!(matches!(err, CipherError::InvalidState(_, "invalid")));
    }
}
