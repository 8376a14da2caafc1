use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest multipart part S3 accepts, in MiB.
pub const MIN_CHUNK_SIZE_MIB: u64 = 5;

/// Largest multipart part S3 accepts, in MiB.
pub const MAX_CHUNK_SIZE_MIB: u64 = 5120;

/// One storage location (inbox, archive or backup)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Posix {
        location: PathBuf,
        /// Octal permission bits for directories created on demand
        #[serde(default = "default_dir_mode")]
        mode: String,
    },
    S3 {
        url: String,
        #[serde(default)]
        port: Option<u16>,
        accesskey: String,
        secretkey: String,
        bucket: String,
        #[serde(default = "default_region")]
        region: String,
        /// Multipart part size in MiB
        #[serde(default = "default_chunk_size")]
        chunksize: u64,
        /// Extra PEM bundle trusted in addition to the system roots
        #[serde(default)]
        cacert: Option<PathBuf>,
        #[serde(default = "default_path_style")]
        pathstyle: bool,
    },
}

impl StorageConfig {
    pub fn for_posix(location: impl Into<PathBuf>) -> Self {
        StorageConfig::Posix {
            location: location.into(),
            mode: default_dir_mode(),
        }
    }

    pub fn for_minio(url: impl Into<String>, bucket: impl Into<String>) -> Self {
        StorageConfig::S3 {
            url: url.into(),
            port: None,
            accesskey: "minioadmin".to_string(),
            secretkey: "minioadmin".to_string(),
            bucket: bucket.into(),
            region: default_region(),
            chunksize: default_chunk_size(),
            cacert: None,
            pathstyle: true,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Posix { mode, .. } => parse_mode(mode).map(|_| ()),
            StorageConfig::S3 {
                url,
                bucket,
                chunksize,
                ..
            } => {
                if url.is_empty() {
                    return Err("s3 url cannot be empty".into());
                }
                if bucket.is_empty() {
                    return Err("s3 bucket cannot be empty".into());
                }
                if !(MIN_CHUNK_SIZE_MIB..=MAX_CHUNK_SIZE_MIB).contains(chunksize) {
                    return Err(format!(
                        "chunksize {chunksize} MiB outside {MIN_CHUNK_SIZE_MIB}..={MAX_CHUNK_SIZE_MIB}"
                    ));
                }
                Ok(())
            },
        }
    }

    /// Endpoint URL including the optional explicit port
    pub fn endpoint(&self) -> Option<String> {
        match self {
            StorageConfig::S3 { url, port, .. } => Some(match port {
                Some(port) => format!("{}:{}", url.trim_end_matches('/'), port),
                None => url.clone(),
            }),
            StorageConfig::Posix { .. } => None,
        }
    }
}

/// Parse an octal permission string such as `0750` or `0o750`
pub fn parse_mode(mode: &str) -> Result<u32, String> {
    let digits = mode.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8).map_err(|_| format!("invalid directory mode: {mode}"))
}

fn default_dir_mode() -> String {
    "0750".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_chunk_size() -> u64 {
    MIN_CHUNK_SIZE_MIB
}

fn default_path_style() -> bool {
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000", "archive");
        assert_eq!(config.endpoint().as_deref(), Some("http://localhost:9000"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chunk_size_floor() {
        let mut config = StorageConfig::for_minio("http://localhost", "archive");
        if let StorageConfig::S3 { chunksize, port, .. } = &mut config {
            *chunksize = 4;
            *port = Some(9000);
        }
        assert!(config.validate().is_err());
        assert_eq!(config.endpoint().as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("0750").unwrap(), 0o750);
        assert_eq!(parse_mode("0o700").unwrap(), 0o700);
        assert!(parse_mode("rwx").is_err());
    }
}
