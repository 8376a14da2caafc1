//! SDA Common Library
//!
//! Shared types, utilities, and error handling for the SDA ingestion pipeline.
//!
//! # Overview
//!
//! This crate provides functionality used by every pipeline service:
//!
//! - **Error Handling**: Common error type and result alias
//! - **Checksums**: Incremental digests for streamed objects
//! - **Messages**: The JSON bodies exchanged over the message bus
//! - **Logging**: Centralised `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use sda_common::checksum::{ChecksumAlgorithm, Digester};
//!
//! let mut digest = Digester::new(ChecksumAlgorithm::Sha256);
//! digest.update(b"ciphertext");
//! let checksum = digest.finalize();
//! assert_eq!(checksum.value.len(), 64);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod messages;

// Re-export commonly used types
pub use checksum::{Checksum, ChecksumAlgorithm};
pub use error::{Result, SdaError};
