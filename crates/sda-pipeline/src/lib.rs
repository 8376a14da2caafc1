//! Sensitive data archive ingestion pipeline
//!
//! A set of message-driven services that take Crypt4GH-encrypted
//! submissions from an inbox into a long-term archive:
//!
//! ```text
//! inbox ─► ingest ─► verify ─► finalize ─► backup ─► mapper
//!            ▲          ▲          ▲                    ▲
//!            └──────────┴── orchestrate / intercept ────┘
//! ```
//!
//! - **ingest** copies the body to the archive and stores the header
//! - **verify** decrypts the archived object and records its digests
//! - **finalize** assigns the stable accession identifier
//! - **backup** copies the archived object to the backup location
//! - **mapper** groups accessions into datasets and tracks their lifecycle
//! - **intercept** and **orchestrate** route messages between stages
//! - **notify** mails submitters about errors and completions
//! - **sync API** accepts dataset mappings from a mirrored deployment
//!
//! Every stage consumes one queue and publishes onto one exchange. The
//! [`service`] module carries the common consume loop, reconnection and
//! start-up; a stage only implements [`service::Stage::handle`].
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod api;
pub mod broker;
pub mod catalogue;
pub mod config;
pub mod crypt4gh;
pub mod error;
pub mod schema;
pub mod service;
pub mod stages;
pub mod storage;

pub use error::{ApiError, Disposition, ServiceError, StageError, StageResult};
