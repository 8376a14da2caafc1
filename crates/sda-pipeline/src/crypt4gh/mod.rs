//! Crypt4GH v1 container
//!
//! An encrypted object is a self-describing header followed by a body of
//! authenticated segments:
//!
//! ```text
//! header  = "crypt4gh" | version u32 | packet count u32 | packet*
//! packet  = length u32 | method u32 | writer pk [32] | nonce [12] | ciphertext+tag
//! body    = (nonce [12] | ciphertext [<= 65536] | tag [16])*
//! ```
//!
//! All integers are little endian. Header packets are encrypted per
//! recipient with a key derived from X25519 and BLAKE2b; the decrypted
//! packets carry the data key (and optionally an edit list) used for the
//! ChaCha20-Poly1305 body segments.

use thiserror::Error;

pub mod header;
pub mod keys;
pub mod stream;

pub use header::{decrypt_header, encrypt_header, read_header, reencrypt_header, DecryptedHeader};
pub use keys::{KeyPair, PublicKey};
pub use stream::{decrypt_body, encrypt, BodyDecryptor};

pub const MAGIC: &[u8; 8] = b"crypt4gh";
pub const VERSION: u32 = 1;

/// Plaintext bytes per body segment
pub const SEGMENT_SIZE: usize = 65_536;
pub const NONCE_LEN: usize = 12;
pub const MAC_LEN: usize = 16;
/// Encrypted bytes per full body segment
pub const CIPHER_SEGMENT_SIZE: usize = NONCE_LEN + SEGMENT_SIZE + MAC_LEN;

#[derive(Error, Debug)]
pub enum Crypt4ghError {
    #[error("Not a Crypt4GH stream")]
    InvalidMagic,

    #[error("Unsupported Crypt4GH version {0}")]
    UnsupportedVersion(u32),

    #[error("Unsupported encryption method {0}")]
    UnsupportedMethod(u32),

    #[error("Truncated {0}")]
    Truncated(&'static str),

    #[error("Malformed header packet: {0}")]
    InvalidPacket(String),

    #[error("No header packet could be decrypted with the given key")]
    NoMatchingPacket,

    #[error("Header carries no data encryption key")]
    MissingDataKey,

    #[error("Body segment {0} failed authentication")]
    Authentication(u64),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Crypt4ghError {
    /// Failures caused by the bytes themselves rather than by I/O
    pub fn is_data_error(&self) -> bool {
        !matches!(self, Crypt4ghError::Io(_))
    }
}

pub type Crypt4ghResult<T> = Result<T, Crypt4ghError>;
