//! Checksum utilities for object verification
//!
//! Objects flowing through the pipeline are never held in memory, so digests
//! are computed incrementally with a [`Digester`] fed block by block.

use crate::error::{Result, SdaError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;

/// Checksum algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Md5 => "md5",
        }
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = SdaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "md5" => Ok(ChecksumAlgorithm::Md5),
            other => Err(SdaError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// A checksum pair as carried in messages and stored in the catalogue.
///
/// The value is always lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    #[serde(rename = "type")]
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into().to_lowercase(),
        }
    }

    pub fn sha256(value: impl Into<String>) -> Self {
        Self::new(ChecksumAlgorithm::Sha256, value)
    }

    /// Compare against `other`, failing with [`SdaError::ChecksumMismatch`]
    pub fn verify(&self, other: &Checksum) -> Result<()> {
        if self.algorithm == other.algorithm && self.value == other.value {
            Ok(())
        } else {
            Err(SdaError::ChecksumMismatch {
                expected: self.to_string(),
                actual: other.to_string(),
            })
        }
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

/// Pick the checksum with the given algorithm out of a list
pub fn find(checksums: &[Checksum], algorithm: ChecksumAlgorithm) -> Option<&Checksum> {
    checksums.iter().find(|c| c.algorithm == algorithm)
}

/// Incremental digest over a single algorithm
pub enum Digester {
    Sha256(Sha256),
    Md5(md5::Context),
}

impl Digester {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Digester::Sha256(Sha256::new()),
            ChecksumAlgorithm::Md5 => Digester::Md5(md5::Context::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Sha256(hasher) => hasher.update(data),
            Digester::Md5(ctx) => ctx.consume(data),
        }
    }

    pub fn finalize(self) -> Checksum {
        match self {
            Digester::Sha256(hasher) => {
                Checksum::new(ChecksumAlgorithm::Sha256, hex::encode(hasher.finalize()))
            },
            Digester::Md5(ctx) => Checksum::new(ChecksumAlgorithm::Md5, format!("{:x}", ctx.compute())),
        }
    }
}

/// Digest over several algorithms at once, plus a running byte count
pub struct MultiDigester {
    digesters: Vec<Digester>,
    bytes: u64,
}

impl MultiDigester {
    pub fn new(algorithms: &[ChecksumAlgorithm]) -> Self {
        Self {
            digesters: algorithms.iter().map(|a| Digester::new(*a)).collect(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.bytes += data.len() as u64;
        for digester in &mut self.digesters {
            digester.update(data);
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> Vec<Checksum> {
        self.digesters.into_iter().map(Digester::finalize).collect()
    }
}

/// Compute checksum for any readable source
pub fn compute_checksum<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> Result<Checksum> {
    let mut digester = Digester::new(algorithm);
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        digester.update(&buffer[..bytes_read]);
    }

    Ok(digester.finalize())
}

/// Compute the checksum of an in-memory buffer
pub fn checksum_of(data: &[u8], algorithm: ChecksumAlgorithm) -> Checksum {
    let mut digester = Digester::new(algorithm);
    digester.update(data);
    digester.finalize()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_compute_checksum_sha256() {
        let mut cursor = Cursor::new(b"hello world");
        let checksum = compute_checksum(&mut cursor, ChecksumAlgorithm::Sha256).unwrap();
        assert_eq!(
            checksum.value,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_compute_checksum_md5() {
        let checksum = checksum_of(b"hello world", ChecksumAlgorithm::Md5);
        assert_eq!(checksum.value, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_multi_digester_counts_and_hashes() {
        let mut digest = MultiDigester::new(&[ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Md5]);
        digest.update(b"hello ");
        digest.update(b"world");
        assert_eq!(digest.bytes(), 11);

        let sums = digest.finalize();
        assert_eq!(sums.len(), 2);
        assert_eq!(sums[0], checksum_of(b"hello world", ChecksumAlgorithm::Sha256));
        assert_eq!(sums[1], checksum_of(b"hello world", ChecksumAlgorithm::Md5));
    }

    #[test]
    fn test_checksum_wire_format() {
        let checksum = Checksum::sha256("ABCDEF");
        let json = serde_json::to_value(&checksum).unwrap();
        assert_eq!(json, serde_json::json!({"type": "sha256", "value": "abcdef"}));
    }

    #[test]
    fn test_verify_mismatch() {
        let a = Checksum::sha256("00");
        let b = Checksum::sha256("01");
        assert!(matches!(a.verify(&b), Err(SdaError::ChecksumMismatch { .. })));
        assert!(a.verify(&a.clone()).is_ok());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("SHA256".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Sha256);
        assert!("crc32".parse::<ChecksumAlgorithm>().is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_split_updates_match_single_update(
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..4096),
            split in 0usize..4096,
        ) {
            let split = split.min(data.len());
            let mut digest = MultiDigester::new(&[ChecksumAlgorithm::Sha256, ChecksumAlgorithm::Md5]);
            digest.update(&data[..split]);
            digest.update(&data[split..]);
            proptest::prop_assert_eq!(digest.bytes(), data.len() as u64);

            let sums = digest.finalize();
            proptest::prop_assert_eq!(&sums[0], &checksum_of(&data, ChecksumAlgorithm::Sha256));
            proptest::prop_assert_eq!(&sums[1], &checksum_of(&data, ChecksumAlgorithm::Md5));
        }
    }
}
