//! Pipeline stages
//!
//! Each stage is a [`Stage`](crate::service::Stage) implementation owning
//! the catalogue and storage handles it needs. Default output routing keys
//! live here; `broker.routingkey` overrides them per deployment.

use crate::error::{StageError, StageResult};
use sda_common::checksum::{find, MultiDigester};
use sda_common::{Checksum, ChecksumAlgorithm};

pub mod backup;
pub mod finalize;
pub mod ingest;
pub mod intercept;
pub mod mapper;
pub mod notify;
pub mod orchestrate;
pub mod verify;

pub use backup::{Backup, BackupInput, HeaderCopy};
pub use finalize::Finalize;
pub use ingest::Ingest;
pub use intercept::Intercept;
pub use mapper::Mapper;
pub use notify::{Mailer, Notify, SmtpMailer};
pub use orchestrate::Orchestrate;
pub use verify::Verify;

pub const ROUTE_INGEST: &str = "ingest";
pub const ROUTE_ARCHIVED: &str = "archived";
pub const ROUTE_VERIFIED: &str = "verified";
pub const ROUTE_ACCESSION: &str = "accession";
pub const ROUTE_COMPLETED: &str = "completed";
pub const ROUTE_BACKUP: &str = "backup";
pub const ROUTE_MAPPINGS: &str = "mappings";
pub const ROUTE_METADATA: &str = "metadata";

/// The sha256 value out of a finished digester
pub(crate) fn sha256_of(digest: MultiDigester) -> StageResult<Checksum> {
    let checksums = digest.finalize();
    find(&checksums, ChecksumAlgorithm::Sha256)
        .cloned()
        .ok_or_else(|| StageError::PermanentData("sha256 digest was not computed".into()))
}

/// The sha256 entry a message must carry to identify a decrypted file
pub(crate) fn required_sha256(checksums: &[Checksum]) -> StageResult<&Checksum> {
    find(checksums, ChecksumAlgorithm::Sha256)
        .ok_or_else(|| StageError::BadMessage("decrypted_checksums carries no sha256".into()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod testing {
    //! Fixtures shared by the stage tests

    use crate::broker::{Delivery, MemoryBroker};
    use crate::catalogue::MemoryCatalogue;
    use crate::crypt4gh::{self, KeyPair};
    use crate::schema::SchemaRegistry;
    use crate::service::StageContext;
    use crate::storage::{self, config::StorageConfig, Backend};
    use std::sync::Arc;
    use tempfile::TempDir;

    pub struct Fixture {
        pub broker: Arc<MemoryBroker>,
        pub catalogue: Arc<MemoryCatalogue>,
        pub inbox: Arc<dyn Backend>,
        pub archive: Arc<dyn Backend>,
        pub backup: Arc<dyn Backend>,
        pub key: KeyPair,
        pub submitter: KeyPair,
        pub ctx: StageContext,
        _dirs: Vec<TempDir>,
    }

    impl Fixture {
        pub async fn new() -> Self {
            let dirs: Vec<TempDir> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
            let backend = |dir: &TempDir| {
                let config = StorageConfig::for_posix(dir.path());
                async move { storage::init(&config).await.unwrap() }
            };
            let broker = Arc::new(MemoryBroker::new());
            let schemas = Arc::new(SchemaRegistry::bundled().unwrap());
            Self {
                ctx: StageContext::new(broker.clone(), schemas, "sda"),
                broker,
                catalogue: Arc::new(MemoryCatalogue::new()),
                inbox: backend(&dirs[0]).await,
                archive: backend(&dirs[1]).await,
                backup: backend(&dirs[2]).await,
                key: KeyPair::generate(),
                submitter: KeyPair::generate(),
                _dirs: dirs,
            }
        }

        /// Encrypt `plain` for the service key and place it in the inbox
        pub async fn upload(&self, path: &str, plain: &[u8]) -> Vec<u8> {
            let encrypted =
                crypt4gh::encrypt(plain, &self.submitter, &[self.key.public_key()], None).unwrap();
            put(self.inbox.as_ref(), path, &encrypted).await;
            encrypted
        }

        pub fn delivery(&self, queue: &str, body: Vec<u8>) -> Delivery {
            Delivery {
                delivery_tag: 1,
                correlation_id: "corr-1".into(),
                routing_key: queue.into(),
                queue: queue.into(),
                redelivered: false,
                body,
            }
        }
    }

    pub async fn put(backend: &dyn Backend, path: &str, data: &[u8]) {
        let mut writer = backend.open_write(path).await.unwrap();
        writer.write(data).await.unwrap();
        writer.finish().await.unwrap();
    }

    pub async fn read_all(backend: &dyn Backend, path: &str) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut reader = backend.open_read(path).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }
}
