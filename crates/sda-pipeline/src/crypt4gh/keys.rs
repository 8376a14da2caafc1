//! Crypt4GH key files
//!
//! Public keys are PEM armoured raw X25519 keys. Private keys use the
//! `c4gh-v1` container: a KDF name and options, a cipher name, and the key
//! material, each as a big endian `u16` length-prefixed string.

use super::{Crypt4ghError, Crypt4ghResult, NONCE_LEN};
use base64::Engine;
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use std::path::Path;
use x25519_dalek::StaticSecret;

pub use x25519_dalek::PublicKey;

const PRIVATE_MAGIC: &[u8] = b"c4gh-v1";
const PUBLIC_LABEL: &str = "CRYPT4GH PUBLIC KEY";
const PRIVATE_LABEL: &str = "CRYPT4GH PRIVATE KEY";
const ENCRYPTED_PRIVATE_LABEL: &str = "CRYPT4GH ENCRYPTED PRIVATE KEY";

/// scrypt cost: N = 2^14, r = 8, p = 1
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SALT_LEN: usize = 16;

/// An X25519 key pair
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret_bytes(rand::random::<[u8; 32]>())
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

fn armor(label: &str, data: &[u8]) -> String {
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        base64::engine::general_purpose::STANDARD.encode(data)
    )
}

/// Return the label and decoded payload of a PEM block
fn unarmor(pem: &str) -> Crypt4ghResult<(String, Vec<u8>)> {
    let mut lines = pem.lines().map(str::trim).filter(|l| !l.is_empty());
    let label = lines
        .next()
        .and_then(|l| l.strip_prefix("-----BEGIN "))
        .and_then(|l| l.strip_suffix("-----"))
        .ok_or_else(|| Crypt4ghError::InvalidKey("missing PEM begin line".into()))?
        .to_string();

    let end = format!("-----END {label}-----");
    let mut body = String::new();
    let mut terminated = false;
    for line in lines {
        if line == end {
            terminated = true;
            break;
        }
        body.push_str(line);
    }
    if !terminated {
        return Err(Crypt4ghError::InvalidKey("missing PEM end line".into()));
    }

    let data = base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| Crypt4ghError::InvalidKey(format!("bad base64: {e}")))?;
    Ok((label, data))
}

fn key_array(bytes: &[u8]) -> Crypt4ghResult<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| Crypt4ghError::InvalidKey(format!("expected 32 key bytes, got {}", bytes.len())))
}

pub fn encode_public_key(key: &PublicKey) -> String {
    armor(PUBLIC_LABEL, key.as_bytes())
}

pub fn parse_public_key(pem: &str) -> Crypt4ghResult<PublicKey> {
    let (label, data) = unarmor(pem)?;
    if label != PUBLIC_LABEL {
        return Err(Crypt4ghError::InvalidKey(format!("unexpected PEM label {label}")));
    }
    Ok(PublicKey::from(key_array(&data)?))
}

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Crypt4ghResult<&'a [u8]> {
        if self.data.len() < n {
            return Err(Crypt4ghError::InvalidKey("private key truncated".into()));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn string(&mut self) -> Crypt4ghResult<&'a [u8]> {
        let len = self.take(2)?;
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        self.take(len)
    }
}

fn push_string(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Crypt4ghResult<[u8; 32]> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32)
        .map_err(|e| Crypt4ghError::InvalidKey(e.to_string()))?;
    let mut key = [0u8; 32];
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut key)
        .map_err(|e| Crypt4ghError::InvalidKey(e.to_string()))?;
    Ok(key)
}

/// Parse a `c4gh-v1` private key, decrypting it with `passphrase` when it
/// is protected
pub fn parse_private_key(pem: &str, passphrase: &str) -> Crypt4ghResult<KeyPair> {
    let (label, data) = unarmor(pem)?;
    if label != PRIVATE_LABEL && label != ENCRYPTED_PRIVATE_LABEL {
        return Err(Crypt4ghError::InvalidKey(format!("unexpected PEM label {label}")));
    }

    let mut cursor = Cursor { data: &data };
    if cursor.take(PRIVATE_MAGIC.len())? != PRIVATE_MAGIC {
        return Err(Crypt4ghError::InvalidKey("not a c4gh-v1 private key".into()));
    }

    let kdf = cursor.string()?;
    let salt = match kdf {
        b"none" => None,
        b"scrypt" => {
            let options = cursor.string()?;
            // rounds (u32) precede the salt; scrypt ignores them
            if options.len() < 4 {
                return Err(Crypt4ghError::InvalidKey("kdf options truncated".into()));
            }
            Some(options[4..].to_vec())
        },
        other => {
            return Err(Crypt4ghError::InvalidKey(format!(
                "unsupported kdf {}",
                String::from_utf8_lossy(other)
            )))
        },
    };

    let cipher = cursor.string()?;
    let material = cursor.string()?;

    let secret = match (cipher, salt) {
        (b"none", _) => key_array(material)?,
        (b"chacha20_poly1305", Some(salt)) => {
            if material.len() < NONCE_LEN {
                return Err(Crypt4ghError::InvalidKey("encrypted key truncated".into()));
            }
            let (nonce, encrypted) = material.split_at(NONCE_LEN);
            let key = derive_key(passphrase, &salt)?;
            let plain = ChaCha20Poly1305::new(Key::from_slice(&key))
                .decrypt(Nonce::from_slice(nonce), encrypted)
                .map_err(|_| Crypt4ghError::InvalidKey("wrong passphrase".into()))?;
            key_array(&plain)?
        },
        (b"chacha20_poly1305", None) => {
            return Err(Crypt4ghError::InvalidKey("encrypted key without kdf".into()))
        },
        (other, _) => {
            return Err(Crypt4ghError::InvalidKey(format!(
                "unsupported cipher {}",
                String::from_utf8_lossy(other)
            )))
        },
    };

    Ok(KeyPair::from_secret_bytes(secret))
}

/// Serialise a private key, protecting it with scrypt and
/// ChaCha20-Poly1305 when a passphrase is given
pub fn encode_private_key(key: &KeyPair, passphrase: Option<&str>) -> Crypt4ghResult<String> {
    let mut out = PRIVATE_MAGIC.to_vec();
    let secret = key.secret.to_bytes();

    match passphrase {
        None => {
            push_string(&mut out, b"none");
            push_string(&mut out, b"none");
            push_string(&mut out, &secret);
            Ok(armor(PRIVATE_LABEL, &out))
        },
        Some(passphrase) => {
            let salt: [u8; SALT_LEN] = rand::random();
            let nonce: [u8; NONCE_LEN] = rand::random();
            let derived = derive_key(passphrase, &salt)?;
            let encrypted = ChaCha20Poly1305::new(Key::from_slice(&derived))
                .encrypt(Nonce::from_slice(&nonce), secret.as_slice())
                .map_err(|_| Crypt4ghError::InvalidKey("key encryption failed".into()))?;

            let mut options = 0u32.to_be_bytes().to_vec();
            options.extend_from_slice(&salt);
            let mut material = nonce.to_vec();
            material.extend_from_slice(&encrypted);

            push_string(&mut out, b"scrypt");
            push_string(&mut out, &options);
            push_string(&mut out, b"chacha20_poly1305");
            push_string(&mut out, &material);
            Ok(armor(ENCRYPTED_PRIVATE_LABEL, &out))
        },
    }
}

pub async fn load_private_key(path: &Path, passphrase: &str) -> Crypt4ghResult<KeyPair> {
    let pem = tokio::fs::read_to_string(path).await?;
    parse_private_key(&pem, passphrase)
}

pub async fn load_public_key(path: &Path) -> Crypt4ghResult<PublicKey> {
    let pem = tokio::fs::read_to_string(path).await?;
    parse_public_key(&pem)
}
