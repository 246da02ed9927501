use thiserror::Error;

pub type CipherResult<T> = Result<T, CipherError>;

/// Error taxonomy for the cipher engines.
///
/// Callers care about three groups: bad input (`Parameter`), broken or
/// forged cipher data (`Structural`, `InvalidMac`, the terminal-block
/// variants), and a wrong password (`AeadFailure`, the only error that
/// leaves a decipher usable for another attempt at block0).
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid parameter: {0}")]
    Parameter(String),

    #[error("malformed cipher data: {0}")]
    Structural(String),

    /// Keyed MAC over the block did not verify. Fatal: the instance is
    /// poisoned because nothing decoded from the block can be trusted.
    #[error("invalid MAC signature")]
    InvalidMac,

    /// AEAD tag mismatch. The block structure and MAC already verified,
    /// so this nearly always means a wrong password.
    #[error("AEAD authentication failed")]
    AeadFailure,

    /// Out-of-sequence engine call, or a call on a poisoned instance.
    #[error("{0} invalid state {1}")]
    InvalidState(&'static str, &'static str),

    #[error("missing terminal data block")]
    MissingTerminalBlock,

    #[error("extra data block after terminal")]
    ExtraDataBlock,

    #[error("cipher data length mismatch: {0}")]
    LengthMismatch(usize),

    /// The password provider declined. Expected control flow, not a defect.
    #[error("cancelled by password provider")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CipherError {
    /// True only for the one error a caller may recover from on the same
    /// decipher instance: an AEAD failure in block0 (wrong password).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CipherError::AeadFailure)
    }
}
