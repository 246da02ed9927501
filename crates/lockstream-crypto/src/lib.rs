//! lockstream-crypto: streaming, versioned, authenticated-encryption codec
//!
//! A password combined with a high-entropy 32-byte credential (obtained
//! through an external passkey-authenticated session) encrypts and decrypts
//! arbitrary-length byte streams as an ordered list of self-authenticating
//! blocks. Decoders for five wire-format eras are kept alive; only the
//! current version is ever written.
//!
//! Current block layout (v7; v6 is identical, older eras differ, see the
//! decoder modules):
//! ```text
//! <Block0>
//!   <Header>  MAC(32) VER(2) PAYLOAD_SIZE(3)  </Header>
//!   <Payload>
//!     <Additional Data>
//!       FLAGS(1) ALG(2) IV(12|24|32) SALT(16) IC(4) LPP(1) HINT_LEN(1) HINT(0-255)
//!     </Additional Data>
//!     EDATA(variable)
//!   </Payload>
//! </Block0>
//! <BlockN>  same header; AD is FLAGS + ALG + IV only  </BlockN> ...
//! ```
//! The additional data authenticates the payload twice over: it is the AEAD
//! associated data and part of the MAC input.
//! Each MAC is a keyed BLAKE2b-256 over the header tail, the payload and
//! the previous block's MAC (0x00 for block0), so substituting, dropping or
//! reordering blocks is detectable. Exactly one block carries the terminal
//! flag and it must be the last one read.

pub mod alg;
pub mod error;
pub mod kdf;
pub mod reader;
pub mod types;

mod decipher;
mod decipher_old;
mod encipher;
mod streams;
mod wire;

pub use alg::{aead_decrypt, aead_encrypt, CipherAlg, ALL_ALGS};
pub use decipher::{stream_decipher, Decipher};
pub use encipher::Encipher;
pub use error::{CipherError, CipherResult};
pub use kdf::{
    benchmark_icount, gen_cipher_key, gen_hint_cipher_key_and_iv, gen_hint_cipher_key_old,
    gen_signing_key, gen_signing_key_old, CipherKey, HintKey, SigningKey, UserCred,
};
pub use reader::ByteStreamReader;
pub use streams::{decrypt_stream, encrypt_stream, get_cipher_stream_info, EContext};
pub use types::{CipherDataBlock, CipherDataInfo, EParams, EngineState, PwdProvider};

/// Size of every derived key in bytes (256-bit)
pub const KEY_BYTES: usize = 32;

/// Size of the externally supplied user credential
pub const USERCRED_BYTES: usize = 32;

/// Size of the keyed BLAKE2b block MAC
pub const MAC_BYTES: usize = 32;

pub const VER_BYTES: usize = 2;
pub const PAYLOAD_SIZE_BYTES: usize = 3;
pub const FLAGS_BYTES: usize = 1;
pub const ALG_BYTES: usize = 2;
pub const SALT_BYTES: usize = 16;
pub const IC_BYTES: usize = 4;
pub const LPP_BYTES: usize = 1;
pub const HINT_LEN_BYTES: usize = 1;

/// Fixed prefix the version dispatcher peeks: everything before the flags
/// byte of a v6+ header. Older headers are one byte longer.
pub const HEADER_BYTES_CURRENT: usize = MAC_BYTES + VER_BYTES + PAYLOAD_SIZE_BYTES;
pub const HEADER_BYTES_OLD: usize = HEADER_BYTES_CURRENT + FLAGS_BYTES;

pub const IV_MIN_BYTES: usize = 12;
pub const IV_MAX_BYTES: usize = 32;
pub const AUTH_TAG_MIN_BYTES: usize = 16;
pub const AUTH_TAG_MAX_BYTES: usize = 32;

pub const ENCRYPTED_HINT_MAX_BYTES: usize = 255;
/// Hints are limited to this many characters before encoding
pub const HINT_MAX_LEN: usize = 128;

pub const PAYLOAD_SIZE_MIN: usize = IV_MIN_BYTES + ALG_BYTES + AUTH_TAG_MIN_BYTES + 1;
/// Payload size must fit three bytes
pub const PAYLOAD_SIZE_MAX: usize = 16_777_215;

pub const ADDITIONAL_DATA_MAX_BYTES: usize =
    ALG_BYTES + IV_MAX_BYTES + SALT_BYTES + IC_BYTES + LPP_BYTES + HINT_LEN_BYTES + ENCRYPTED_HINT_MAX_BYTES;

/// Largest cleartext chunk a single block may carry
pub const CLEAR_DATA_MAX_BYTES: usize =
    PAYLOAD_SIZE_MAX - FLAGS_BYTES - ADDITIONAL_DATA_MAX_BYTES - AUTH_TAG_MAX_BYTES;

/// Password-stretch iteration bounds. The maximum is limited to four
/// unsigned bytes rounded down to millions.
pub const ICOUNT_MIN: u32 = 420_000;
pub const ICOUNT_DEFAULT: u32 = 1_000_000;
pub const ICOUNT_MAX: u32 = 4_294_000_000;

/// Most encryption passes a stream may be wrapped in (one nibble each for
/// loop index and loop end)
pub const LP_MAX: u8 = 16;

// Change the version when the encoding changes or an algorithm is added.
// V1's version field sat in the middle of the block; versions 2 and 3 are
// reserved so the leading u16 discriminates every era (see `wire`).
pub const VERSION1: u16 = 1;
pub const VERSION4: u16 = 4;
pub const VERSION5: u16 = 5;
pub const VERSION6: u16 = 6;
pub const VERSION7: u16 = 7;
pub const CURRENT_VERSION: u16 = VERSION7;

/// Terminal-block bit of the header flags byte
pub const FLAG_TERMINAL: u8 = 1;

/// Default cleartext chunk target per block (1 MiB)
pub const READ_TARGET_DEFAULT: usize = 1_048_576;
