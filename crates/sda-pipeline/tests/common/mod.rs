//! Shared harness for the pipeline integration tests
//!
//! [`Pipeline`] wires every stage to one [`MemoryBroker`] and one
//! [`MemoryCatalogue`] with POSIX storage in temporary directories. Each
//! routing key is bound to a queue of the same name, so a message published by
//! one stage is waiting on the next stage's queue; [`Pipeline::step`] pulls it
//! and settles it through a real [`Consumer`].
//!
//! The container helpers at the bottom need Docker and are only used by the
//! `#[ignore = "requires Docker"]` suites.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use futures::StreamExt;
use sda_common::messages::IngestionTrigger;
use sda_common::Checksum;
use sda_pipeline::broker::{Delivery, DeliveryStream, MemoryBroker, MessageBroker};
use sda_pipeline::catalogue::MemoryCatalogue;
use sda_pipeline::crypt4gh::{self, KeyPair};
use sda_pipeline::schema::SchemaRegistry;
use sda_pipeline::service::{Consumer, ConsumerSettings, Stage, StageContext, Verdict};
use sda_pipeline::stages::{
    Backup, BackupInput, Finalize, HeaderCopy, Ingest, Mapper, Orchestrate, Verify, ROUTE_ACCESSION,
    ROUTE_ARCHIVED, ROUTE_BACKUP, ROUTE_COMPLETED, ROUTE_INGEST, ROUTE_MAPPINGS, ROUTE_VERIFIED,
};
use sda_pipeline::storage::{self, config::StorageConfig, Backend};
use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::{minio::MinIO, postgres::Postgres};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::info;

pub const ERROR_ROUTE: &str = "error";

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

static TRACING: Once = Once::new();

/// Install a test subscriber once per binary; `RUST_LOG` controls the level
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn settings() -> ConsumerSettings {
    ConsumerSettings {
        workers: 1,
        requeue_delay: Duration::from_millis(10),
        max_transient: 5,
        drain_window: Duration::from_secs(1),
        error_routing_key: ERROR_ROUTE.to_string(),
    }
}

/// Every stage of the standalone deployment, sharing one catalogue
pub struct Stages {
    pub ingest: Arc<Ingest>,
    pub verify: Arc<Verify>,
    pub orchestrate: Arc<Orchestrate>,
    pub finalize: Arc<Finalize>,
    pub backup: Arc<Backup>,
    pub mapper: Arc<Mapper>,
}

pub struct Pipeline {
    pub broker: Arc<MemoryBroker>,
    pub catalogue: Arc<MemoryCatalogue>,
    pub schemas: Arc<SchemaRegistry>,
    pub inbox: Arc<dyn Backend>,
    pub archive: Arc<dyn Backend>,
    pub backup: Arc<dyn Backend>,
    pub key: KeyPair,
    pub submitter: KeyPair,
    streams: Mutex<HashMap<String, DeliveryStream>>,
    _dirs: Vec<TempDir>,
}

impl Pipeline {
    pub async fn new() -> Self {
        init_test_tracing();
        let dirs: Vec<TempDir> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let mut backends = Vec::new();
        for dir in &dirs {
            backends.push(storage::init(&StorageConfig::for_posix(dir.path())).await.unwrap());
        }
        let backup = backends.pop().unwrap();
        let archive = backends.pop().unwrap();
        let inbox = backends.pop().unwrap();

        let broker = Arc::new(MemoryBroker::new());
        for route in [
            ROUTE_INGEST,
            ROUTE_ARCHIVED,
            ROUTE_VERIFIED,
            ROUTE_ACCESSION,
            ROUTE_COMPLETED,
            ROUTE_BACKUP,
            ROUTE_MAPPINGS,
            ERROR_ROUTE,
        ] {
            broker.bind(route, route).await;
        }

        Self {
            broker,
            catalogue: Arc::new(MemoryCatalogue::new()),
            schemas: Arc::new(SchemaRegistry::bundled().unwrap()),
            inbox,
            archive,
            backup,
            key: KeyPair::generate(),
            submitter: KeyPair::generate(),
            streams: Mutex::new(HashMap::new()),
            _dirs: dirs,
        }
    }

    pub fn context(&self) -> StageContext {
        StageContext::new(self.broker.clone(), self.schemas.clone(), "sda")
    }

    pub fn stages(&self, header_copy: Option<HeaderCopy>) -> Stages {
        Stages {
            ingest: Arc::new(Ingest::new(
                self.catalogue.clone(),
                self.inbox.clone(),
                self.archive.clone(),
                self.key.clone(),
                None,
            )),
            verify: Arc::new(Verify::new(
                self.catalogue.clone(),
                self.archive.clone(),
                self.key.clone(),
                None,
            )),
            orchestrate: Arc::new(Orchestrate::new()),
            finalize: Arc::new(Finalize::new(self.catalogue.clone(), None)),
            backup: Arc::new(Backup::new(
                self.catalogue.clone(),
                self.archive.clone(),
                self.backup.clone(),
                BackupInput::for_queue(ROUTE_COMPLETED),
                header_copy,
                None,
            )),
            mapper: Arc::new(Mapper::new(self.catalogue.clone())),
        }
    }

    /// Encrypt `plain` for the archive key and place it in the inbox
    pub async fn upload(&self, path: &str, plain: &[u8]) -> Vec<u8> {
        let encrypted = crypt4gh::encrypt(plain, &self.submitter, &[self.key.public_key()], None).unwrap();
        let mut writer = self.inbox.open_write(path).await.unwrap();
        writer.write(&encrypted).await.unwrap();
        writer.finish().await.unwrap();
        encrypted
    }

    /// Upload a file and queue its ingestion trigger
    pub async fn submit(&self, user: &str, path: &str, plain: &[u8], correlation_id: &str) -> Vec<u8> {
        let encrypted = self.upload(path, plain).await;
        let checksum = sda_common::checksum::checksum_of(&encrypted, sda_common::ChecksumAlgorithm::Sha256);
        let trigger = IngestionTrigger::new(user, path, vec![checksum]);
        self.broker
            .deliver(ROUTE_INGEST, correlation_id, ROUTE_INGEST, serde_json::to_vec(&trigger).unwrap())
            .await;
        encrypted
    }

    /// Next delivery waiting on `queue`
    pub async fn next(&self, queue: &str) -> Delivery {
        let mut streams = self.streams.lock().await;
        if !streams.contains_key(queue) {
            let stream = self.broker.consume(queue).await.unwrap();
            streams.insert(queue.to_string(), stream);
        }
        let stream = streams.get_mut(queue).unwrap();
        tokio::time::timeout(STEP_TIMEOUT, stream.next())
            .await
            .unwrap_or_else(|_| panic!("nothing arrived on {queue}"))
            .expect("queue closed")
            .unwrap()
    }

    /// Handle and settle one delivery with `stage`
    pub async fn handle<S: Stage>(&self, stage: &Arc<S>, delivery: Delivery) -> Verdict {
        Consumer::new(stage.clone(), self.context(), settings())
            .handle_delivery(delivery)
            .await
    }

    /// Pull the next delivery from `queue` and run it through `stage`
    pub async fn step<S: Stage>(&self, stage: &Arc<S>, queue: &str) -> (Delivery, Verdict) {
        let delivery = self.next(queue).await;
        let verdict = self.handle(stage, delivery.clone()).await;
        (delivery, verdict)
    }

    /// Put a delivery back on its queue, as the broker does after a requeue
    pub async fn redeliver(&self, delivery: &Delivery) {
        self.broker
            .deliver(
                &delivery.queue,
                &delivery.correlation_id,
                &delivery.routing_key,
                delivery.body.clone(),
            )
            .await;
    }

    /// Run one submission from trigger to dataset mapping, returning each
    /// stage's input in order
    pub async fn run_to_ready(&self, stages: &Stages) -> Vec<(Step, Delivery)> {
        let mut seen = Vec::new();
        for step in Step::ALL {
            let (delivery, verdict) = match step {
                Step::Ingest => self.step(&stages.ingest, ROUTE_INGEST).await,
                Step::Verify => self.step(&stages.verify, ROUTE_ARCHIVED).await,
                Step::Accession => self.step(&stages.orchestrate, ROUTE_VERIFIED).await,
                Step::Finalize => self.step(&stages.finalize, ROUTE_ACCESSION).await,
                Step::Backup => self.step(&stages.backup, ROUTE_COMPLETED).await,
                Step::Mapping => self.step(&stages.orchestrate, ROUTE_BACKUP).await,
                Step::Mapper => self.step(&stages.mapper, ROUTE_MAPPINGS).await,
            };
            assert_eq!(verdict, Verdict::Ack, "{step:?} did not ack");
            seen.push((step, delivery));
        }
        seen
    }

    /// Replay `delivery` into the stage that owns `step`
    pub async fn replay(&self, stages: &Stages, step: Step, delivery: Delivery) -> Verdict {
        match step {
            Step::Ingest => self.handle(&stages.ingest, delivery).await,
            Step::Verify => self.handle(&stages.verify, delivery).await,
            Step::Accession | Step::Mapping => self.handle(&stages.orchestrate, delivery).await,
            Step::Finalize => self.handle(&stages.finalize, delivery).await,
            Step::Backup => self.handle(&stages.backup, delivery).await,
            Step::Mapper => self.handle(&stages.mapper, delivery).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ingest,
    Verify,
    Accession,
    Finalize,
    Backup,
    Mapping,
    Mapper,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::Ingest,
        Step::Verify,
        Step::Accession,
        Step::Finalize,
        Step::Backup,
        Step::Mapping,
        Step::Mapper,
    ];
}

pub async fn read_all(backend: &dyn Backend, path: &str) -> Vec<u8> {
    let mut reader = backend.open_read(path).await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

pub fn sha256(data: &[u8]) -> Checksum {
    sda_common::checksum::checksum_of(data, sda_common::ChecksumAlgorithm::Sha256)
}

// ============================================================================
// Containers
// ============================================================================

/// PostgreSQL with the catalogue migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    url: String,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432.tcp()).await?;
        Ok(Self {
            _container: container,
            url: format!("postgresql://postgres:postgres@{host}:{port}/postgres"),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

pub const TEST_BUCKET: &str = "sda-test";

/// MinIO with an empty test bucket
pub struct TestMinio {
    _container: ContainerAsync<MinIO>,
    endpoint: String,
    client: aws_sdk_s3::Client,
}

impl TestMinio {
    pub async fn start() -> Result<Self> {
        info!("Starting MinIO test container...");
        let container = MinIO::default()
            .start()
            .await
            .context("Failed to start MinIO container")?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(9000.tcp()).await?;
        let endpoint = format!("http://{host}:{port}");

        let config = aws_sdk_s3::Config::builder()
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                "minioadmin",
                "minioadmin",
                None,
                None,
                "static",
            ))
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .endpoint_url(&endpoint)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(config);
        client
            .create_bucket()
            .bucket(TEST_BUCKET)
            .send()
            .await
            .context("Failed to create S3 bucket")?;

        Ok(Self {
            _container: container,
            endpoint,
            client,
        })
    }

    /// Multipart uploads started in the test bucket and never completed or aborted
    pub async fn pending_uploads(&self) -> usize {
        self.client
            .list_multipart_uploads()
            .bucket(TEST_BUCKET)
            .send()
            .await
            .unwrap()
            .uploads()
            .len()
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::for_minio(&self.endpoint, TEST_BUCKET)
    }
}
