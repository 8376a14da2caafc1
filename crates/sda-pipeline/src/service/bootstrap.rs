//! Start-up shared by the service binaries
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> ExitCode {
//!     bootstrap::exit(run().await)
//! }
//! ```

use super::signals::shutdown_token;
use super::supervisor::{AmqpConnector, Supervisor};
use super::Stage;
use crate::catalogue::{Catalogue, PgCatalogue};
use crate::config::Config;
use crate::crypt4gh::{self, KeyPair, PublicKey};
use crate::error::ServiceError;
use crate::schema::SchemaRegistry;
use crate::storage::{self, config::StorageConfig, Backend};
use clap::Parser;
use sda_common::logging::init_logging;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Command line shared by every service
#[derive(Parser, Debug)]
#[command(version, about = "Sensitive data archive pipeline service")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<PathBuf>,
}

/// Everything a service needs before it builds its stage
pub struct Runtime {
    pub service: &'static str,
    pub config: Arc<Config>,
    pub schemas: Arc<SchemaRegistry>,
    pub shutdown: CancellationToken,
}

/// Parse the command line, load configuration, install logging and
/// signal handling, and load the message schemas
pub async fn init(service: &'static str) -> Result<Runtime, ServiceError> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let log_config = config.log.to_log_config(service).map_err(ServiceError::init)?;
    init_logging(&log_config).map_err(ServiceError::init)?;
    info!(service, version = env!("CARGO_PKG_VERSION"), "Starting");

    let schemas = SchemaRegistry::load(&config.schema.path).map_err(ServiceError::init)?;
    info!(path = %config.schema.path.display(), "Message schemas loaded");

    Ok(Runtime {
        service,
        config: Arc::new(config),
        schemas: Arc::new(schemas),
        shutdown: shutdown_token(),
    })
}

impl Runtime {
    pub async fn catalogue(&self) -> Result<Arc<dyn Catalogue>, ServiceError> {
        let catalogue = PgCatalogue::connect(&self.config.db)
            .await
            .map_err(ServiceError::init)?;
        Ok(Arc::new(catalogue))
    }

    pub async fn storage(&self, name: &str, config: &StorageConfig) -> Result<Arc<dyn Backend>, ServiceError> {
        let backend = storage::init(config)
            .await
            .map_err(|e| ServiceError::Init(format!("{name} storage: {e}")))?;
        info!(storage = name, backend = %backend.describe(), "Storage ready");
        Ok(backend)
    }

    /// The archive's private key; an unreadable key or wrong passphrase
    /// stops the service
    pub async fn service_key(&self) -> Result<KeyPair, ServiceError> {
        let c4gh = self.config.require_c4gh()?;
        crypt4gh::keys::load_private_key(&c4gh.filepath, &c4gh.passphrase)
            .await
            .map_err(|e| ServiceError::Init(format!("c4gh key {}: {e}", c4gh.filepath.display())))
    }

    /// Public key that header copies are re-encrypted for
    pub async fn backup_recipient(&self) -> Result<Option<PublicKey>, ServiceError> {
        let Some(c4gh) = self.config.c4gh.as_ref().filter(|c| c.copyheader) else {
            return Ok(None);
        };
        let Some(path) = &c4gh.backuppubkey else {
            return Ok(None);
        };
        crypt4gh::keys::load_public_key(path)
            .await
            .map(Some)
            .map_err(|e| ServiceError::Init(format!("backup public key {}: {e}", path.display())))
    }

    /// Consume the configured queue with `stage` until shutdown
    pub async fn run_stage<S: Stage>(self, stage: S) -> Result<(), ServiceError> {
        self.config.require_queue()?;
        let connector = Arc::new(AmqpConnector::new(self.config.broker.clone(), self.service));
        let supervisor = Supervisor::new(Arc::new(stage), connector, self.schemas, &self.config.broker);
        supervisor.run(self.shutdown).await
    }
}

/// Map the service outcome to the process exit status
pub fn exit(result: Result<(), ServiceError>) -> ExitCode {
    match result {
        Ok(()) => {
            info!("Service stopped");
            ExitCode::SUCCESS
        },
        Err(e) => {
            error!(error = %e, "Service failed");
            // Logging may not be installed yet
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        },
    }
}
