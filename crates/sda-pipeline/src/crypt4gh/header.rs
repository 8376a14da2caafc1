//! Header packets: splitting a header off a stream, decrypting it with a
//! reader key, and building or re-encrypting headers for recipients

use super::keys::{KeyPair, PublicKey};
use super::{Crypt4ghError, Crypt4ghResult, MAC_LEN, MAGIC, NONCE_LEN, VERSION};
use blake2::{Blake2b512, Digest};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use tokio::io::{AsyncRead, AsyncReadExt};

/// X25519 + ChaCha20-IETF-Poly1305, the only method defined for v1
const METHOD_X25519_CHACHA20: u32 = 0;

const PACKET_DATA_ENC: u32 = 0;
const PACKET_EDIT_LIST: u32 = 1;

/// Packet prelude: length, method, writer public key, nonce
const PACKET_PRELUDE: usize = 4 + 4 + 32 + NONCE_LEN;

/// Upper bounds that keep a hostile header from exhausting memory
const MAX_PACKETS: u32 = 1024;
const MAX_PACKET_LEN: u32 = 1 << 20;

/// Everything a reader learns from the packets it can open
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecryptedHeader {
    pub data_keys: Vec<[u8; 32]>,
    /// Alternating skip/keep lengths over the plaintext
    pub edit_list: Option<Vec<u64>>,
    /// Decrypted packet payloads, kept for re-encryption
    packets: Vec<Vec<u8>>,
}

impl DecryptedHeader {
    pub fn data_key(&self) -> Crypt4ghResult<&[u8; 32]> {
        self.data_keys.first().ok_or(Crypt4ghError::MissingDataKey)
    }
}

fn u32_at(bytes: &[u8], offset: usize) -> Option<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn u64_at(bytes: &[u8], offset: usize) -> Option<u64> {
    bytes
        .get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
}

async fn read_exact_or_truncated<R>(
    reader: &mut R,
    buf: &mut [u8],
    what: &'static str,
) -> Crypt4ghResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Crypt4ghError::Truncated(what)),
        Err(e) => Err(e.into()),
    }
}

fn check_preamble(preamble: &[u8]) -> Crypt4ghResult<u32> {
    if &preamble[..8] != MAGIC {
        return Err(Crypt4ghError::InvalidMagic);
    }
    let version = u32_at(preamble, 8).ok_or(Crypt4ghError::Truncated("header preamble"))?;
    if version != VERSION {
        return Err(Crypt4ghError::UnsupportedVersion(version));
    }
    let count = u32_at(preamble, 12).ok_or(Crypt4ghError::Truncated("header preamble"))?;
    if count == 0 || count > MAX_PACKETS {
        return Err(Crypt4ghError::InvalidPacket(format!("implausible packet count {count}")));
    }
    Ok(count)
}

fn check_packet_len(len: u32) -> Crypt4ghResult<()> {
    if (len as usize) < PACKET_PRELUDE + MAC_LEN || len > MAX_PACKET_LEN {
        return Err(Crypt4ghError::InvalidPacket(format!("implausible packet length {len}")));
    }
    Ok(())
}

/// Consume exactly the header from `reader` and return its bytes.
///
/// The header is self-describing: the packet count and each packet's length
/// are read as they arrive, so the reader is left positioned at the first
/// body byte.
pub async fn read_header<R>(reader: &mut R) -> Crypt4ghResult<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = vec![0u8; 16];
    read_exact_or_truncated(reader, &mut header, "header preamble").await?;
    let count = check_preamble(&header)?;

    for _ in 0..count {
        let mut len = [0u8; 4];
        read_exact_or_truncated(reader, &mut len, "header packet").await?;
        let packet_len = u32::from_le_bytes(len);
        check_packet_len(packet_len)?;

        let start = header.len();
        header.extend_from_slice(&len);
        header.resize(start + packet_len as usize, 0);
        read_exact_or_truncated(reader, &mut header[start + 4..], "header packet").await?;
    }

    Ok(header)
}

/// A raw packet as found in a header
struct RawPacket<'a> {
    method: u32,
    writer: [u8; 32],
    nonce: &'a [u8],
    ciphertext: &'a [u8],
}

fn split_packets(header: &[u8]) -> Crypt4ghResult<Vec<RawPacket<'_>>> {
    if header.len() < 16 {
        return Err(Crypt4ghError::Truncated("header preamble"));
    }
    let count = check_preamble(header)?;

    let mut packets = Vec::with_capacity(count as usize);
    let mut offset = 16;
    for _ in 0..count {
        let len = u32_at(header, offset).ok_or(Crypt4ghError::Truncated("header packet"))?;
        check_packet_len(len)?;
        let packet = header
            .get(offset..offset + len as usize)
            .ok_or(Crypt4ghError::Truncated("header packet"))?;

        let method = u32_at(packet, 4).ok_or(Crypt4ghError::Truncated("header packet"))?;
        let mut writer = [0u8; 32];
        writer.copy_from_slice(&packet[8..40]);
        packets.push(RawPacket {
            method,
            writer,
            nonce: &packet[40..40 + NONCE_LEN],
            ciphertext: &packet[PACKET_PRELUDE..],
        });
        offset += len as usize;
    }

    if offset != header.len() {
        return Err(Crypt4ghError::InvalidPacket(format!(
            "{} trailing bytes after header packets",
            header.len() - offset
        )));
    }
    Ok(packets)
}

/// Session key shared between a reader and a writer.
///
/// BLAKE2b-512 over the X25519 result followed by the reader's and then the
/// writer's public key; the first half is the key in both directions used
/// here.
fn session_key(dh: &[u8; 32], reader: &PublicKey, writer: &PublicKey) -> [u8; 32] {
    let mut hasher = Blake2b512::new();
    hasher.update(dh);
    hasher.update(reader.as_bytes());
    hasher.update(writer.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    key
}

fn open_packet(packet: &RawPacket<'_>, reader: &KeyPair) -> Option<Vec<u8>> {
    if packet.method != METHOD_X25519_CHACHA20 {
        return None;
    }
    let writer = PublicKey::from(packet.writer);
    let dh = reader.secret().diffie_hellman(&writer);
    let key = session_key(dh.as_bytes(), &reader.public_key(), &writer);
    ChaCha20Poly1305::new(Key::from_slice(&key))
        .decrypt(Nonce::from_slice(packet.nonce), packet.ciphertext)
        .ok()
}

fn seal_packet(plain: &[u8], writer: &KeyPair, recipient: &PublicKey) -> Crypt4ghResult<Vec<u8>> {
    let dh = writer.secret().diffie_hellman(recipient);
    let key = session_key(dh.as_bytes(), recipient, &writer.public_key());
    let nonce: [u8; NONCE_LEN] = rand::random();
    let ciphertext = ChaCha20Poly1305::new(Key::from_slice(&key))
        .encrypt(Nonce::from_slice(&nonce), plain)
        .map_err(|_| Crypt4ghError::InvalidPacket("packet encryption failed".into()))?;

    let len = (PACKET_PRELUDE + ciphertext.len()) as u32;
    let mut packet = Vec::with_capacity(len as usize);
    packet.extend_from_slice(&len.to_le_bytes());
    packet.extend_from_slice(&METHOD_X25519_CHACHA20.to_le_bytes());
    packet.extend_from_slice(writer.public_key().as_bytes());
    packet.extend_from_slice(&nonce);
    packet.extend_from_slice(&ciphertext);
    Ok(packet)
}

fn assemble(packets: Vec<Vec<u8>>) -> Vec<u8> {
    let mut header = MAGIC.to_vec();
    header.extend_from_slice(&VERSION.to_le_bytes());
    header.extend_from_slice(&(packets.len() as u32).to_le_bytes());
    for packet in packets {
        header.extend_from_slice(&packet);
    }
    header
}

fn interpret(plain: &[u8], decrypted: &mut DecryptedHeader) -> Crypt4ghResult<()> {
    let kind = u32_at(plain, 0).ok_or(Crypt4ghError::Truncated("packet payload"))?;
    match kind {
        PACKET_DATA_ENC => {
            let method = u32_at(plain, 4).ok_or(Crypt4ghError::Truncated("packet payload"))?;
            if method != METHOD_X25519_CHACHA20 {
                return Err(Crypt4ghError::UnsupportedMethod(method));
            }
            let key: [u8; 32] = plain
                .get(8..40)
                .and_then(|k| k.try_into().ok())
                .ok_or(Crypt4ghError::Truncated("data key"))?;
            decrypted.data_keys.push(key);
        },
        PACKET_EDIT_LIST => {
            if decrypted.edit_list.is_some() {
                return Err(Crypt4ghError::InvalidPacket("more than one edit list".into()));
            }
            let count = u32_at(plain, 4).ok_or(Crypt4ghError::Truncated("edit list"))? as usize;
            if plain.len() != 8 + count * 8 {
                return Err(Crypt4ghError::InvalidPacket("edit list length mismatch".into()));
            }
            let lengths = (0..count)
                .map(|i| u64_at(plain, 8 + i * 8).ok_or(Crypt4ghError::Truncated("edit list")))
                .collect::<Crypt4ghResult<Vec<_>>>()?;
            decrypted.edit_list = Some(lengths);
        },
        other => {
            return Err(Crypt4ghError::InvalidPacket(format!("unknown packet type {other}")));
        },
    }
    decrypted.packets.push(plain.to_vec());
    Ok(())
}

/// Open every packet addressed to `reader`.
///
/// Packets for other recipients are skipped. Fails with
/// [`Crypt4ghError::NoMatchingPacket`] when none could be opened.
pub fn decrypt_header(header: &[u8], reader: &KeyPair) -> Crypt4ghResult<DecryptedHeader> {
    let mut decrypted = DecryptedHeader::default();
    let mut opened = 0usize;

    for packet in split_packets(header)? {
        if let Some(plain) = open_packet(&packet, reader) {
            interpret(&plain, &mut decrypted)?;
            opened += 1;
        }
    }

    if opened == 0 {
        return Err(Crypt4ghError::NoMatchingPacket);
    }
    if decrypted.data_keys.is_empty() {
        return Err(Crypt4ghError::MissingDataKey);
    }
    Ok(decrypted)
}

fn data_packet(key: &[u8; 32]) -> Vec<u8> {
    let mut plain = Vec::with_capacity(40);
    plain.extend_from_slice(&PACKET_DATA_ENC.to_le_bytes());
    plain.extend_from_slice(&METHOD_X25519_CHACHA20.to_le_bytes());
    plain.extend_from_slice(key);
    plain
}

fn edit_packet(lengths: &[u64]) -> Vec<u8> {
    let mut plain = Vec::with_capacity(8 + lengths.len() * 8);
    plain.extend_from_slice(&PACKET_EDIT_LIST.to_le_bytes());
    plain.extend_from_slice(&(lengths.len() as u32).to_le_bytes());
    for length in lengths {
        plain.extend_from_slice(&length.to_le_bytes());
    }
    plain
}

/// Build a header carrying `data_key` (and an optional edit list) for each
/// recipient
pub fn encrypt_header(
    data_key: &[u8; 32],
    edit_list: Option<&[u64]>,
    writer: &KeyPair,
    recipients: &[PublicKey],
) -> Crypt4ghResult<Vec<u8>> {
    let mut plains = vec![data_packet(data_key)];
    if let Some(lengths) = edit_list {
        plains.push(edit_packet(lengths));
    }
    seal_for(&plains, writer, recipients)
}

fn seal_for(plains: &[Vec<u8>], writer: &KeyPair, recipients: &[PublicKey]) -> Crypt4ghResult<Vec<u8>> {
    if recipients.is_empty() {
        return Err(Crypt4ghError::InvalidKey("no recipients".into()));
    }
    let mut packets = Vec::with_capacity(plains.len() * recipients.len());
    for recipient in recipients {
        for plain in plains {
            packets.push(seal_packet(plain, writer, recipient)?);
        }
    }
    Ok(assemble(packets))
}

/// Open `header` with `service_key` and seal the same packets for
/// `recipients`, written by the service key.
///
/// The body is untouched: the data key does not change.
pub fn reencrypt_header(
    header: &[u8],
    service_key: &KeyPair,
    recipients: &[PublicKey],
) -> Crypt4ghResult<Vec<u8>> {
    let decrypted = decrypt_header(header, service_key)?;
    seal_for(&decrypted.packets, service_key, recipients)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_header_leaves_body() {
        let writer = KeyPair::generate();
        let reader = KeyPair::generate();
        let header = encrypt_header(&[7u8; 32], None, &writer, &[reader.public_key()]).unwrap();

        let mut stream = header.clone();
        stream.extend_from_slice(b"BODY");
        let mut cursor: &[u8] = &stream;

        let read = read_header(&mut cursor).await.unwrap();
        assert_eq!(read, header);
        assert_eq!(cursor, b"BODY");
    }

    #[tokio::test]
    async fn test_read_header_rejects_garbage() {
        let mut cursor: &[u8] = b"not-crypt4gh-at-all";
        assert!(matches!(
            read_header(&mut cursor).await,
            Err(Crypt4ghError::InvalidMagic)
        ));

        let mut short: &[u8] = b"crypt4gh";
        assert!(matches!(
            read_header(&mut short).await,
            Err(Crypt4ghError::Truncated(_))
        ));
    }

    #[tokio::test]
    async fn test_read_header_truncated_packet() {
        let writer = KeyPair::generate();
        let header = encrypt_header(&[1u8; 32], None, &writer, &[writer.public_key()]).unwrap();
        let mut cursor: &[u8] = &header[..header.len() - 3];
        assert!(matches!(
            read_header(&mut cursor).await,
            Err(Crypt4ghError::Truncated("header packet"))
        ));
    }

    #[test]
    fn test_decrypt_with_recipient_key() {
        let writer = KeyPair::generate();
        let reader = KeyPair::generate();
        let header =
            encrypt_header(&[9u8; 32], Some(&[10, 20]), &writer, &[reader.public_key()]).unwrap();

        let decrypted = decrypt_header(&header, &reader).unwrap();
        assert_eq!(decrypted.data_key().unwrap(), &[9u8; 32]);
        assert_eq!(decrypted.edit_list, Some(vec![10, 20]));
    }

    #[test]
    fn test_wrong_key_has_no_matching_packet() {
        let writer = KeyPair::generate();
        let header =
            encrypt_header(&[9u8; 32], None, &writer, &[KeyPair::generate().public_key()]).unwrap();
        assert!(matches!(
            decrypt_header(&header, &KeyPair::generate()),
            Err(Crypt4ghError::NoMatchingPacket)
        ));
    }

    #[test]
    fn test_single_flipped_byte_fails() {
        let writer = KeyPair::generate();
        let reader = KeyPair::generate();
        let mut header = encrypt_header(&[9u8; 32], None, &writer, &[reader.public_key()]).unwrap();
        let last = header.len() - 1;
        header[last] ^= 0x01;
        assert!(decrypt_header(&header, &reader).is_err());
    }

    #[test]
    fn test_reencrypt_for_new_recipient() {
        let submitter = KeyPair::generate();
        let service = KeyPair::generate();
        let backup = KeyPair::generate();
        let header =
            encrypt_header(&[3u8; 32], Some(&[0, 5]), &submitter, &[service.public_key()]).unwrap();

        let reencrypted = reencrypt_header(&header, &service, &[backup.public_key()]).unwrap();
        let decrypted = decrypt_header(&reencrypted, &backup).unwrap();
        assert_eq!(decrypted.data_key().unwrap(), &[3u8; 32]);
        assert_eq!(decrypted.edit_list, Some(vec![0, 5]));
        assert!(decrypt_header(&reencrypted, &service).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let writer = KeyPair::generate();
        let mut header = encrypt_header(&[1u8; 32], None, &writer, &[writer.public_key()]).unwrap();
        header.push(0);
        assert!(matches!(
            decrypt_header(&header, &writer),
            Err(Crypt4ghError::InvalidPacket(_))
        ));
    }
}
