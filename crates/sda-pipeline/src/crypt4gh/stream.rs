//! Body segment decryption and in-memory encryption

use super::header::{encrypt_header, DecryptedHeader};
use super::keys::{KeyPair, PublicKey};
use super::{Crypt4ghError, Crypt4ghResult, CIPHER_SEGMENT_SIZE, MAC_LEN, NONCE_LEN, SEGMENT_SIZE};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Applies an edit list to a plaintext stream
#[derive(Debug, Clone)]
struct EditCursor {
    lengths: VecDeque<u64>,
    keeping: bool,
}

impl EditCursor {
    fn new(lengths: &[u64]) -> Self {
        Self {
            lengths: lengths.iter().copied().collect(),
            keeping: false,
        }
    }

    /// Emit the kept parts of `plain`.
    ///
    /// Once the list is exhausted, a list of odd length keeps the rest of
    /// the stream and a list of even length drops it.
    fn apply(&mut self, mut plain: &[u8], sink: &mut dyn FnMut(&[u8])) -> u64 {
        let mut emitted = 0u64;
        while !plain.is_empty() {
            let Some(current) = self.lengths.front_mut() else {
                if self.keeping {
                    sink(plain);
                    emitted += plain.len() as u64;
                }
                break;
            };

            let take = (*current).min(plain.len() as u64) as usize;
            if self.keeping && take > 0 {
                sink(&plain[..take]);
                emitted += take as u64;
            }
            *current -= take as u64;
            plain = &plain[take..];

            if *current == 0 {
                self.lengths.pop_front();
                self.keeping = !self.keeping;
            }
        }
        emitted
    }
}

/// Incremental body decryptor.
///
/// Feed ciphertext in arbitrary blocks with [`BodyDecryptor::update`];
/// complete segments are decrypted as soon as they are buffered and the
/// final, shorter segment is handled by [`BodyDecryptor::finish`].
pub struct BodyDecryptor {
    ciphers: Vec<ChaCha20Poly1305>,
    edits: Option<EditCursor>,
    pending: Vec<u8>,
    segment: u64,
    emitted: u64,
}

impl BodyDecryptor {
    pub fn new(header: &DecryptedHeader) -> Crypt4ghResult<Self> {
        if header.data_keys.is_empty() {
            return Err(Crypt4ghError::MissingDataKey);
        }
        Ok(Self {
            ciphers: header
                .data_keys
                .iter()
                .map(|key| ChaCha20Poly1305::new(Key::from_slice(key)))
                .collect(),
            edits: header.edit_list.as_deref().map(EditCursor::new),
            pending: Vec::with_capacity(CIPHER_SEGMENT_SIZE),
            segment: 0,
            emitted: 0,
        })
    }

    pub fn update(&mut self, mut data: &[u8], sink: &mut dyn FnMut(&[u8])) -> Crypt4ghResult<()> {
        while !data.is_empty() {
            let room = CIPHER_SEGMENT_SIZE - self.pending.len();
            let take = room.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() == CIPHER_SEGMENT_SIZE {
                let segment = std::mem::take(&mut self.pending);
                self.decrypt_segment(&segment, sink)?;
                self.pending = segment;
                self.pending.clear();
            }
        }
        Ok(())
    }

    /// Decrypt the trailing segment and return the plaintext bytes emitted
    pub fn finish(mut self, sink: &mut dyn FnMut(&[u8])) -> Crypt4ghResult<u64> {
        if !self.pending.is_empty() {
            let segment = std::mem::take(&mut self.pending);
            self.decrypt_segment(&segment, sink)?;
        }
        Ok(self.emitted)
    }

    fn decrypt_segment(&mut self, segment: &[u8], sink: &mut dyn FnMut(&[u8])) -> Crypt4ghResult<()> {
        if segment.len() <= NONCE_LEN + MAC_LEN {
            return Err(Crypt4ghError::Truncated("body segment"));
        }
        let (nonce, ciphertext) = segment.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce);

        let plain = self
            .ciphers
            .iter()
            .find_map(|cipher| cipher.decrypt(nonce, ciphertext).ok())
            .ok_or(Crypt4ghError::Authentication(self.segment))?;
        self.segment += 1;

        self.emitted += match self.edits.as_mut() {
            Some(edits) => edits.apply(&plain, sink),
            None => {
                sink(&plain);
                plain.len() as u64
            },
        };
        Ok(())
    }
}

/// Decrypt the body read from `reader`, handing plaintext blocks to `sink`.
///
/// Returns the number of plaintext bytes emitted. Plaintext is never
/// buffered beyond one segment.
pub async fn decrypt_body<R>(
    reader: &mut R,
    header: &DecryptedHeader,
    mut sink: impl FnMut(&[u8]),
) -> Crypt4ghResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut decryptor = BodyDecryptor::new(header)?;
    let mut buffer = vec![0u8; CIPHER_SEGMENT_SIZE];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        decryptor.update(&buffer[..read], &mut sink)?;
    }
    decryptor.finish(&mut sink)
}

/// Encrypt `plaintext` for `recipients` with a fresh data key
pub fn encrypt(
    plaintext: &[u8],
    writer: &KeyPair,
    recipients: &[PublicKey],
    edit_list: Option<&[u64]>,
) -> Crypt4ghResult<Vec<u8>> {
    let data_key: [u8; 32] = rand::random();
    let mut out = encrypt_header(&data_key, edit_list, writer, recipients)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&data_key));

    for chunk in plaintext.chunks(SEGMENT_SIZE) {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), chunk)
            .map_err(|_| Crypt4ghError::InvalidPacket("segment encryption failed".into()))?;
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
    }
    Ok(out)
}
