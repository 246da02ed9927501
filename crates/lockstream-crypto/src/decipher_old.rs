//! Frozen decoders for the pre-v6 wire formats. Decode only; nothing here
//! is reachable from the encrypting path.
//!
//! These formats carry known, documented weaknesses (v1/v4 have no
//! terminal marker, v5 has no MAC chaining, all three derive keys with the
//! deprecated formulas). They are preserved exactly so old ciphertext
//! stays readable, and must not be modernized.

use std::io::Read;

use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::Sha256;

use crate::alg::aead_decrypt;
use crate::decipher::{Decipher, PendingBlock};
use crate::error::{CipherError, CipherResult};
use crate::kdf::{
    gen_cipher_key, gen_hint_cipher_key_old, gen_signing_key_old, CipherKey, SigningKey, UserCred,
};
use crate::reader::ByteStreamReader;
use crate::types::{CipherDataInfo, EngineState, PwdProvider};
use crate::wire::{verify_block_mac, FieldReader, FieldWriter};
use crate::{
    FLAG_TERMINAL, HEADER_BYTES_CURRENT, HEADER_BYTES_OLD, MAC_BYTES, PAYLOAD_SIZE_MAX,
    PAYLOAD_SIZE_MIN, SALT_BYTES, VERSION1, VERSION5,
};

/// v4/v5 decoder. The two formats share their block layout; v5 added the
/// flags byte (terminal marker) that v4 reserved as a fourth size byte.
pub(crate) struct DecipherV45<R: Read> {
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
    last_flags: u8,
    pwd_retried: bool,
}

impl<R: Read> std::fmt::Debug for DecipherV45<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecipherV45")
            .field("state", &self.state)
            .field("ver", &self.ver)
            .finish_non_exhaustive()
    }
}

impl<R: Read> DecipherV45<R> {
    pub fn new(
        user_cred: UserCred,
        reader: ByteStreamReader<R>,
        prefix: Vec<u8>,
        ver: u16,
    ) -> Self {
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
            alg: block
                .map(|b| b.alg)
                .unwrap_or(crate::alg::CipherAlg::AesGcm256),
            ic: self.ic,
            lp: self.lp,
            lp_end: self.lp_end,
            iv: block.map(|b| b.iv.clone()).unwrap_or_default(),
            salt: self.salt,
            hint: self.hint.clone(),
        }
    }

    /// Read a 38-byte header, completing the 37-byte factory prefix with
    /// one more byte for block0. Returns None at clean end of stream.
    fn read_header(&mut self) -> CipherResult<Option<([u8; MAC_BYTES], Vec<u8>, usize, u8)>> {
        let mut buf = vec![0u8; HEADER_BYTES_OLD];
        let filled = if let Some(prefix) = self.prefix.take() {
            buf[..HEADER_BYTES_CURRENT].copy_from_slice(&prefix);
            let (extra, _) = self
                .reader
                .read_fill(&mut buf[HEADER_BYTES_CURRENT..])?;
            HEADER_BYTES_CURRENT + extra
        } else {
            let (filled, _) = self.reader.read_fill(&mut buf)?;
            filled
        };

        if filled == 0 {
            return Ok(None);
        }
        if filled < HEADER_BYTES_OLD {
            return Err(CipherError::Structural("missing cipher data header".into()));
        }

        let mut header = FieldReader::new(&buf);
        let mac = header.mac()?;
        let ver = header.ver()?;
        if ver != self.ver {
            return Err(CipherError::Structural(format!("invalid version of {ver}")));
        }
        let size = header.size()?;
        let flags = header.flags()?;

        Ok(Some((mac, buf, size, flags)))
    }

    /// The MAC input of the header portion. v4 reserved the flags byte as
    /// a fourth size byte and always signed it as zero.
    fn header_mac_portion(&self, header: &[u8]) -> Vec<u8> {
        let mut portion = header[MAC_BYTES..HEADER_BYTES_OLD].to_vec();
        if self.ver < VERSION5 {
            let last = portion.len() - 1;
            portion[last] = 0;
        }
        portion
    }

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
        let (mac, header, payload_size, flags) = self
            .read_header()?
            .ok_or_else(|| CipherError::Structural("missing cipher data header".into()))?;

        let mut payload = vec![0u8; payload_size];
        let (filled, _) = self.reader.read_fill(&mut payload)?;
        if filled != payload_size {
            return Err(CipherError::LengthMismatch(filled));
        }

        let mut fields = FieldReader::new(&payload);
        let alg = fields.alg()?;
        let iv = fields.iv(alg)?.to_vec();
        let salt = fields.salt()?;
        let ic = fields.ic()?;
        let (lp, lp_end) = fields.lpp()?;
        let encrypted_hint = fields.hint()?.to_vec();
        let ad_end = fields.offset();
        fields.remainder("edata")?;

        let sk = gen_signing_key_old(&self.user_cred, &salt)?;
        let portion = self.header_mac_portion(&header);
        if !verify_block_mac(&sk, &[&portion, &payload], &mac)? {
            return Err(CipherError::InvalidMac);
        }

        if !encrypted_hint.is_empty() {
            let hk = gen_hint_cipher_key_old(&self.user_cred, &salt)?;
            let hint_clear = aead_decrypt(alg, hk.as_bytes(), &iv, &[], &encrypted_hint)
                .map_err(|_| CipherError::Structural("hint decryption failed".into()))?;
            self.hint = Some(String::from_utf8_lossy(&hint_clear).into_owned());
        }

        self.sk = Some(sk);
        self.salt = salt;
        self.ic = ic;
        self.lp = lp;
        self.lp_end = lp_end;
        self.last_flags = flags;
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
        let Some((mac, header, payload_size, flags)) = self.read_header()? else {
            // v5 knows whether the last block was really the last one;
            // v4 has nothing to check.
            if self.ver >= VERSION5 && self.last_flags & FLAG_TERMINAL == 0 {
                return Err(CipherError::MissingTerminalBlock);
            }
            self.reader.cleanup();
            self.state = EngineState::Finished;
            return Ok(None);
        };

        if self.ver >= VERSION5 && self.last_flags & FLAG_TERMINAL != 0 {
            return Err(CipherError::ExtraDataBlock);
        }

        let mut payload = vec![0u8; payload_size];
        let (filled, _) = self.reader.read_fill(&mut payload)?;
        if filled != payload_size {
            return Err(CipherError::LengthMismatch(filled));
        }

        let mut fields = FieldReader::new(&payload);
        let alg = fields.alg()?;
        let iv = fields.iv(alg)?.to_vec();
        let ad_end = fields.offset();
        fields.remainder("edata")?;

        let sk = self
            .sk
            .as_ref()
            .ok_or_else(|| CipherError::InvalidState("Decipher", "keys not initialized"))?;
        let portion = self.header_mac_portion(&header);
        if !verify_block_mac(sk, &[&portion, &payload], &mac)? {
            return Err(CipherError::InvalidMac);
        }
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

impl<R: Read> Decipher for DecipherV45<R> {
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

/// v1 decoder. The format was a single block covering the whole stream,
/// with the version field in the middle and an HMAC-SHA-256 signature.
pub(crate) struct DecipherV1<R: Read> {
    state: EngineState,
    user_cred: UserCred,
    reader: ByteStreamReader<R>,
    prefix: Option<Vec<u8>>,
    salt: [u8; SALT_BYTES],
    ic: u32,
    hint: Option<String>,
    block: Option<PendingBlock>,
    pwd_retried: bool,
}

impl<R: Read> std::fmt::Debug for DecipherV1<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecipherV1")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<R: Read> DecipherV1<R> {
    pub fn new(user_cred: UserCred, reader: ByteStreamReader<R>, prefix: Vec<u8>) -> Self {
        Self {
            state: EngineState::Fresh,
            user_cred,
            reader,
            prefix: Some(prefix),
            salt: [0u8; SALT_BYTES],
            ic: 0,
            hint: None,
            block: None,
            pwd_retried: false,
        }
    }

    fn poison(&mut self) {
        self.state = EngineState::Invalid;
        self.block = None;
        self.hint = None;
        self.reader.cleanup();
    }

    fn info(&self) -> CipherDataInfo {
        let block = self.block.as_ref();
        CipherDataInfo {
            ver: VERSION1,
            alg: block
                .map(|b| b.alg)
                .unwrap_or(crate::alg::CipherAlg::AesGcm256),
            ic: self.ic,
            lp: 1,
            lp_end: 1,
            iv: block.map(|b| b.iv.clone()).unwrap_or_default(),
            salt: self.salt,
            hint: self.hint.clone(),
        }
    }

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
        // v1 never had a real header; the factory prefix is just the first
        // bytes of the one block, recombined with the rest of the stream.
        let mut data = self
            .prefix
            .take()
            .ok_or_else(|| CipherError::InvalidState("Decipher", "missing header"))?;
        data.extend(self.reader.read_remaining(PAYLOAD_SIZE_MAX)?);

        if data.len() < MAC_BYTES + PAYLOAD_SIZE_MIN {
            return Err(CipherError::Structural(format!(
                "invalid cipher data length of {}",
                data.len()
            )));
        }

        let mut fields = FieldReader::new(&data);
        let mac = fields.mac()?;
        let alg = fields.alg()?;
        let iv = fields.iv(alg)?.to_vec();
        let salt = fields.salt()?;
        let ic = fields.ic()?;
        let ver = fields.ver()?;
        if ver != VERSION1 {
            return Err(CipherError::Structural(format!("invalid version of {ver}")));
        }
        let encrypted_hint = fields.hint()?.to_vec();
        let encrypted_data = fields.remainder("edata")?.to_vec();

        // Repack the additional data contiguously; the MAC and the AEAD
        // both take it without the leading MAC bytes.
        let mut ad = FieldWriter::new(data.len() - MAC_BYTES - encrypted_data.len());
        ad.alg(alg);
        ad.iv(alg, &iv)?;
        ad.salt(&salt)?;
        ad.ic(ic)?;
        ad.ver(ver);
        ad.hint(&encrypted_hint)?;
        let ad = ad.into_bytes();

        let sk = gen_signing_key_old(&self.user_cred, &salt)?;
        let mut hmac = Hmac::<Sha256>::new_from_slice(sk.as_bytes())
            .map_err(|e| CipherError::Parameter(format!("HMAC key: {e}")))?;
        hmac.update(&ad);
        hmac.update(&encrypted_data);
        if hmac.verify_slice(&mac).is_err() {
            return Err(CipherError::InvalidMac);
        }

        if !encrypted_hint.is_empty() {
            let hk = gen_hint_cipher_key_old(&self.user_cred, &salt)?;
            let hint_clear = aead_decrypt(alg, hk.as_bytes(), &iv, &[], &encrypted_hint)
                .map_err(|_| CipherError::Structural("hint decryption failed".into()))?;
            self.hint = Some(String::from_utf8_lossy(&hint_clear).into_owned());
        }

        let ad_end = ad.len();
        let mut payload = ad;
        payload.extend_from_slice(&encrypted_data);

        self.salt = salt;
        self.ic = ic;
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
}

impl<R: Read> Decipher for DecipherV1<R> {
    fn protocol_version(&self) -> u16 {
        VERSION1
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
                self.block = None;
                self.state = EngineState::Block0Done;
                Ok(clear)
            }
            Err(CipherError::AeadFailure) => {
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
        // v1 only ever has block0; an empty result is the end-of-stream
        // signal shared with the newer decoders.
        if self.state != EngineState::Block0Done {
            let state = self.state.name();
            self.poison();
            return Err(CipherError::InvalidState("Decipher", state));
        }
        self.state = EngineState::Finished;
        Ok(Vec::new())
    }

    fn decrypt_block(&mut self, provider: &mut PwdProvider<'_>) -> CipherResult<Vec<u8>> {
        match self.state {
            EngineState::Fresh | EngineState::Block0Decoded => self.decrypt_block0(provider),
            EngineState::Block0Done => self.decrypt_block_n(),
            EngineState::Finished => Ok(Vec::new()),
            state => Err(CipherError::InvalidState("Decipher", state.name())),
        }
    }
}
