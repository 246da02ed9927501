//! Encrypting state machine. Emits current-version blocks only; older
//! formats are decode-only.

use std::io::Read;

use rand::RngCore;
use secrecy::ExposeSecret;

use crate::alg::{aead_encrypt, CipherAlg};
use crate::error::{CipherError, CipherResult};
use crate::kdf::{gen_cipher_key, gen_hint_cipher_key_and_iv, gen_signing_key, CipherKey, SigningKey, UserCred};
use crate::reader::ByteStreamReader;
use crate::types::{CipherDataBlock, CipherDataInfo, EParams, EngineState, PwdProvider};
use crate::wire::{compute_block_mac, encode_additional_data, AdParams, FieldWriter};
use crate::{
    AUTH_TAG_MAX_BYTES, CLEAR_DATA_MAX_BYTES, CURRENT_VERSION, ENCRYPTED_HINT_MAX_BYTES,
    FLAGS_BYTES, FLAG_TERMINAL, HINT_MAX_LEN, MAC_BYTES, READ_TARGET_DEFAULT, SALT_BYTES,
};

/// Block-by-block encryption of one cleartext stream.
///
/// States: Fresh → Block0Done → BlockNDone* → Finished. Any violation or
/// failed validation drives the instance to Invalid, which is sticky. Not
/// reentrant; one instance per encryption.
pub struct Encipher<R: Read> {
    state: EngineState,
    user_cred: UserCred,
    reader: ByteStreamReader<R>,
    read_target: usize,
    chunk: Vec<u8>,
    ek: Option<CipherKey>,
    sk: Option<SigningKey>,
    // MAC-chain input for the next block: 0x00 before block0, then the
    // previous block's MAC. Kept internal so callers cannot forge chain
    // continuations.
    last_mac: Vec<u8>,
}

impl<R: Read> Encipher<R> {
    pub fn new(user_cred: UserCred, source: R) -> Self {
        Self {
            state: EngineState::Fresh,
            user_cred,
            reader: ByteStreamReader::new(source),
            read_target: READ_TARGET_DEFAULT,
            chunk: Vec::new(),
            ek: None,
            sk: None,
            last_mac: vec![0u8],
        }
    }

    /// Tune the cleartext chunk target per block (clamped to the format's
    /// per-block maximum). Mostly useful for tests and small-memory hosts.
    pub fn with_read_target(mut self, read_target: usize) -> Self {
        self.read_target = read_target.clamp(1, CLEAR_DATA_MAX_BYTES);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    fn poison(&mut self) {
        self.state = EngineState::Invalid;
        self.ek = None;
        self.sk = None;
        self.reader.cleanup();
        self.chunk.clear();
    }

    /// Encrypt the first block. Reads one chunk, generates fresh salt and
    /// iv, asks the provider for the password (the only suspension point),
    /// derives all keys and emits the fully signed block. A provider error
    /// aborts with zero bytes produced.
    pub fn encrypt_block0(
        &mut self,
        params: &EParams,
        provider: &mut PwdProvider<'_>,
    ) -> CipherResult<CipherDataBlock> {
        if self.state != EngineState::Fresh {
            let state = self.state.name();
            self.poison();
            return Err(CipherError::InvalidState("Encipher", state));
        }
        let result = self.encrypt_block0_inner(params, provider);
        if result.is_err() {
            self.poison();
        }
        result
    }

    fn encrypt_block0_inner(
        &mut self,
        params: &EParams,
        provider: &mut PwdProvider<'_>,
    ) -> CipherResult<CipherDataBlock> {
        params.validate()?;

        let (clear_len, eof) = self.read_chunk()?;
        if clear_len == 0 {
            return Err(CipherError::Parameter("no data to encrypt".into()));
        }

        // Fresh salt and iv for every key derivation from the password.
        let mut random = [0u8; SALT_BYTES + 32];
        rand::thread_rng().fill_bytes(&mut random);
        let mut salt = [0u8; SALT_BYTES];
        salt.copy_from_slice(&random[..SALT_BYTES]);
        let iv = random[SALT_BYTES..SALT_BYTES + params.alg.iv_bytes()].to_vec();

        let info = CipherDataInfo {
            ver: CURRENT_VERSION,
            alg: params.alg,
            ic: params.ic,
            lp: params.lp,
            lp_end: params.lp_end,
            iv: iv.clone(),
            salt,
            hint: None,
        };
        let (pwd, hint) = provider(&info)?;
        if pwd.expose_secret().is_empty() {
            return Err(CipherError::Parameter("empty password".into()));
        }

        self.sk = Some(gen_signing_key(&self.user_cred, &salt, CURRENT_VERSION)?);
        self.ek = Some(gen_cipher_key(params.ic, &pwd, &self.user_cred, &salt)?);

        let mut encrypted_hint = Vec::new();
        if let Some(hint) = hint.as_deref().filter(|h| !h.is_empty()) {
            let (hk, hint_iv) =
                gen_hint_cipher_key_and_iv(&self.user_cred, &iv, &salt, CURRENT_VERSION)?;
            encrypted_hint = aead_encrypt(
                CipherAlg::XChaCha20Poly1305,
                hk.as_bytes(),
                &hint_iv,
                &[],
                truncate_hint(hint),
            )?;
        }

        let additional_data = encode_additional_data(&AdParams {
            alg: params.alg,
            iv: &iv,
            salt: Some(&salt),
            ic: Some(params.ic),
            lp: Some((params.lp, params.lp_end)),
            encrypted_hint: Some(&encrypted_hint),
        })?;

        let block = self.encrypt_and_sign(params.alg, &iv, additional_data, clear_len, eof)?;
        self.state = if eof {
            EngineState::Finished
        } else {
            EngineState::Block0Done
        };
        Ok(block)
    }

    /// Encrypt a continuation block with a fresh iv, reusing the derived
    /// keys. Legal only between block0 and the terminal block.
    pub fn encrypt_block_n(&mut self, params: &EParams) -> CipherResult<CipherDataBlock> {
        if self.state != EngineState::Block0Done && self.state != EngineState::BlockNDone {
            let state = self.state.name();
            self.poison();
            return Err(CipherError::InvalidState("Encipher", state));
        }
        let result = self.encrypt_block_n_inner(params);
        if result.is_err() {
            self.poison();
        }
        result
    }

    fn encrypt_block_n_inner(&mut self, params: &EParams) -> CipherResult<CipherDataBlock> {
        params.validate()?;

        let (clear_len, eof) = self.read_chunk()?;
        if clear_len == 0 {
            return Err(CipherError::Parameter("no data to encrypt".into()));
        }

        let mut iv = vec![0u8; params.alg.iv_bytes()];
        rand::thread_rng().fill_bytes(&mut iv);

        let additional_data = encode_additional_data(&AdParams {
            alg: params.alg,
            iv: &iv,
            salt: None,
            ic: None,
            lp: None,
            encrypted_hint: None,
        })?;

        let block = self.encrypt_and_sign(params.alg, &iv, additional_data, clear_len, eof)?;
        self.state = if eof {
            EngineState::Finished
        } else {
            EngineState::BlockNDone
        };
        Ok(block)
    }

    /// Pump wrapper for stream drivers: block0 first, then continuation
    /// blocks, `None` once the terminal block has been emitted.
    pub fn encrypt_block(
        &mut self,
        params: &EParams,
        provider: &mut PwdProvider<'_>,
    ) -> CipherResult<Option<CipherDataBlock>> {
        match self.state {
            EngineState::Fresh => self.encrypt_block0(params, provider).map(Some),
            EngineState::Block0Done | EngineState::BlockNDone => {
                self.encrypt_block_n(params).map(Some)
            }
            EngineState::Finished => Ok(None),
            _ => {
                let state = self.state.name();
                self.poison();
                Err(CipherError::InvalidState("Encipher", state))
            }
        }
    }

    fn read_chunk(&mut self) -> CipherResult<(usize, bool)> {
        self.chunk.resize(self.read_target, 0);
        self.reader.read_fill(&mut self.chunk)
    }

    fn encrypt_and_sign(
        &mut self,
        alg: CipherAlg,
        iv: &[u8],
        ad_fields: Vec<u8>,
        clear_len: usize,
        terminal: bool,
    ) -> CipherResult<CipherDataBlock> {
        let ek = self.ek.as_ref().ok_or_else(|| {
            CipherError::InvalidState("Encipher", "keys not initialized")
        })?;
        let sk = self.sk.as_ref().ok_or_else(|| {
            CipherError::InvalidState("Encipher", "keys not initialized")
        })?;

        // The flags byte leads the additional data; the payload size field
        // counts it.
        let flags = if terminal { FLAG_TERMINAL } else { 0 };
        let mut additional_data = Vec::with_capacity(FLAGS_BYTES + ad_fields.len());
        additional_data.push(flags);
        additional_data.extend_from_slice(&ad_fields);

        let encrypted_data = aead_encrypt(
            alg,
            ek.as_bytes(),
            iv,
            &additional_data,
            &self.chunk[..clear_len],
        )?;

        let payload_size = additional_data.len() + encrypted_data.len();

        let mut tail = FieldWriter::new(crate::VER_BYTES + crate::PAYLOAD_SIZE_BYTES);
        tail.ver(CURRENT_VERSION);
        tail.size(payload_size)?;
        let tail = tail.into_bytes();

        let mac = compute_block_mac(
            sk,
            &[&tail, &additional_data, &encrypted_data, &self.last_mac],
        )?;
        self.last_mac = mac.to_vec();

        let mut header = FieldWriter::new(MAC_BYTES + tail.len());
        header.mac(&mac);
        header.raw(&tail);

        Ok(CipherDataBlock {
            header: header.into_bytes(),
            additional_data,
            encrypted_data,
        })
    }
}

/// Clip a hint to the character limit, then clip its UTF-8 encoding on a
/// character boundary so the ciphertext (tag included) fits the one-byte
/// wire length.
fn truncate_hint(hint: &str) -> &[u8] {
    let mut end = 0;
    for (chars, (idx, ch)) in hint.char_indices().enumerate() {
        if chars >= HINT_MAX_LEN || idx + ch.len_utf8() > ENCRYPTED_HINT_MAX_BYTES - AUTH_TAG_MAX_BYTES
        {
            break;
        }
        end = idx + ch.len_utf8();
    }
    &hint.as_bytes()[..end]
}
