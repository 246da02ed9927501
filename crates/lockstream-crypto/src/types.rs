//! Shared engine types: parameters, block parts, decoded info, states.

use std::io::Write;

use secrecy::SecretString;

use crate::alg::CipherAlg;
use crate::error::{CipherError, CipherResult};
use crate::{ICOUNT_MAX, ICOUNT_MIN, LP_MAX, SALT_BYTES};

/// Parameters a caller supplies for one encryption pass.
#[derive(Debug, Clone)]
pub struct EParams {
    pub alg: CipherAlg,
    /// PBKDF2 iteration count
    pub ic: u32,
    /// 1-based loop index of this pass
    pub lp: u8,
    /// total number of passes
    pub lp_end: u8,
}

impl EParams {
    pub fn validate(&self) -> CipherResult<()> {
        if !(ICOUNT_MIN..=ICOUNT_MAX).contains(&self.ic) {
            return Err(CipherError::Parameter(format!("invalid ic of {}", self.ic)));
        }
        if self.lp < 1 || self.lp_end < 1 || self.lp > LP_MAX || self.lp_end > LP_MAX || self.lp > self.lp_end {
            return Err(CipherError::Parameter(format!(
                "invalid loop of {}/{}",
                self.lp, self.lp_end
            )));
        }
        Ok(())
    }
}

/// Everything block0 reveals about a stream once its MAC has verified.
///
/// During encryption this is handed to the password provider before any
/// secret exists (`hint` is `None` there); during decryption the provider
/// receives it with the decrypted hint filled in.
#[derive(Debug, Clone)]
pub struct CipherDataInfo {
    pub ver: u16,
    pub alg: CipherAlg,
    pub ic: u32,
    pub lp: u8,
    pub lp_end: u8,
    pub iv: Vec<u8>,
    pub salt: [u8; SALT_BYTES],
    pub hint: Option<String>,
}

/// One emitted cipher block: ordered parts whose concatenation is the only
/// contract with whatever armor layer sits above.
#[derive(Debug, Clone)]
pub struct CipherDataBlock {
    /// header incl. MAC and flags
    pub header: Vec<u8>,
    pub additional_data: Vec<u8>,
    pub encrypted_data: Vec<u8>,
}

impl CipherDataBlock {
    pub fn len(&self) -> usize {
        self.header.len() + self.additional_data.len() + self.encrypted_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parts(&self) -> [&[u8]; 3] {
        [&self.header, &self.additional_data, &self.encrypted_data]
    }

    pub fn write_to<W: Write>(&self, dest: &mut W) -> std::io::Result<usize> {
        for part in self.parts() {
            dest.write_all(part)?;
        }
        Ok(self.len())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for part in self.parts() {
            out.extend_from_slice(part);
        }
        out
    }
}

/// Password callback, the engines' only suspension point. Returns the
/// password and, when encrypting, an optional hint to embed. Returning an
/// error (conventionally [`CipherError::Cancelled`]) aborts the in-flight
/// block with nothing written.
pub type PwdProvider<'a> =
    dyn FnMut(&CipherDataInfo) -> CipherResult<(SecretString, Option<String>)> + 'a;

/// Engine lifecycle. `Invalid` is terminal and sticky: once any validation
/// fails the instance rejects every further call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Fresh,
    /// block0 decoded and MAC-verified, payload not yet decrypted
    Block0Decoded,
    Block0Done,
    BlockNDone,
    Finished,
    Invalid,
}

impl EngineState {
    pub fn name(self) -> &'static str {
        match self {
            EngineState::Fresh => "fresh",
            EngineState::Block0Decoded => "block0-decoded",
            EngineState::Block0Done => "block0-done",
            EngineState::BlockNDone => "blockn-done",
            EngineState::Finished => "finished",
            EngineState::Invalid => "invalid",
        }
    }
}
