//! Typed persistence of files, headers, digests, lifecycle state, accessions
//! and dataset mappings
//!
//! [`Catalogue`] is the seam every stage talks to. The PostgreSQL
//! implementation is used in production; [`MemoryCatalogue`] backs the
//! pipeline tests and enforces the same lifecycle rules.

use async_trait::async_trait;
use sda_common::Checksum;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;
pub mod types;

pub use memory::MemoryCatalogue;
pub use postgres::PgCatalogue;
pub use types::*;

/// Catalogue operation errors
#[derive(Error, Debug)]
pub enum CatalogueError {
    /// Referenced row does not exist (yet)
    #[error("{0}")]
    NotFound(String),

    /// Row exists but has not reached the state the operation needs
    #[error("{0}")]
    NotReady(String),

    /// Accession or mapping would violate uniqueness
    #[error("{0}")]
    Collision(String),

    /// Stored data cannot be decoded
    #[error("Invalid catalogue data: {0}")]
    InvalidData(String),

    /// Database unreachable or connection dropped
    #[error("Catalogue transport failure: {0}")]
    Transport(String),

    /// Query rejected by the database
    #[error("Catalogue query failed: {0}")]
    Query(String),
}

impl CatalogueError {
    pub fn not_found(resource_type: &str, identifier: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{resource_type} '{identifier}' not found in catalogue"))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, CatalogueError::Transport(_))
    }
}

impl From<sqlx::Error> for CatalogueError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => CatalogueError::NotFound(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => CatalogueError::Transport(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CatalogueError::Collision(db.message().to_string())
            },
            _ => CatalogueError::Query(err.to_string()),
        }
    }
}

pub type CatalogueResult<T> = Result<T, CatalogueError>;

#[async_trait]
pub trait Catalogue: Send + Sync {
    /// Create (or find) the row for a submission; idempotent per (path, user)
    async fn register_file(&self, path: &str, user: &str) -> CatalogueResult<Uuid>;

    async fn file(&self, file_id: Uuid) -> CatalogueResult<FileRecord>;

    /// Overwrite the stored container header
    async fn store_header(&self, file_id: Uuid, header: &[u8]) -> CatalogueResult<()>;

    async fn get_header(&self, file_id: Uuid) -> CatalogueResult<Vec<u8>>;

    async fn get_header_by_accession(&self, accession: &str) -> CatalogueResult<Vec<u8>>;

    /// Record the archive copy and move the row to at least `archived`
    async fn set_archived(
        &self,
        file_id: Uuid,
        object: &ArchivedObject,
        correlation_id: &str,
    ) -> CatalogueResult<()>;

    /// Record digests and decrypted size; move the row to at least `verified`
    async fn set_verified(
        &self,
        file_id: Uuid,
        object: &VerifiedObject,
        correlation_id: &str,
    ) -> CatalogueResult<()>;

    /// Assign the stable accession to the verified row identified by
    /// `(user, path, decrypted sha256)` and move it to `completed`.
    ///
    /// Replaying with the same accession is a no-op; a different accession
    /// for a row that already has one, or an accession taken by another row,
    /// is a [`CatalogueError::Collision`].
    async fn set_accession(
        &self,
        accession: &str,
        user: &str,
        path: &str,
        decrypted_checksum: &Checksum,
        correlation_id: &str,
    ) -> CatalogueResult<Uuid>;

    /// Map every accession to the dataset in one transaction. Any unknown
    /// accession rolls the whole mapping back.
    async fn map_files_to_dataset(
        &self,
        dataset_id: &str,
        accessions: &[String],
    ) -> CatalogueResult<()>;

    /// Record a dataset event and fan it out to every mapped file
    async fn update_dataset_event(
        &self,
        dataset_id: &str,
        event: DatasetEvent,
        message: &serde_json::Value,
    ) -> CatalogueResult<()>;

    async fn dataset_accessions(&self, dataset_id: &str) -> CatalogueResult<Vec<String>>;

    /// Submission path for an accession
    async fn get_inbox_path(&self, accession: &str) -> CatalogueResult<String>;

    /// Archive location of the verified row for `(user, path, decrypted sha256)`
    async fn find_verified(
        &self,
        user: &str,
        path: &str,
        decrypted_checksum: &Checksum,
    ) -> CatalogueResult<ArchiveLocation>;

    async fn checksums(&self, file_id: Uuid) -> CatalogueResult<Vec<(ChecksumSource, Checksum)>>;

    async fn log_event(
        &self,
        file_id: Uuid,
        event: FileEvent,
        correlation_id: Option<&str>,
        user: Option<&str>,
        details: &serde_json::Value,
    ) -> CatalogueResult<()>;

    async fn file_events(&self, file_id: Uuid) -> CatalogueResult<Vec<FileEventRecord>>;

    /// Liveness probe
    async fn ping(&self) -> CatalogueResult<()>;

    async fn close(&self);
}

/// Decode a header stored as lowercase hex
pub(crate) fn decode_header(file_id: impl std::fmt::Display, stored: &str) -> CatalogueResult<Vec<u8>> {
    hex::decode(stored)
        .map_err(|e| CatalogueError::InvalidData(format!("header of {file_id} is not hex: {e}")))
}
