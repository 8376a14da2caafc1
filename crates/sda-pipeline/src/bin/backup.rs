//! Copy archived files to the backup storage, optionally with a header
//! re-encrypted for the backup key

use sda_pipeline::service::bootstrap;
use sda_pipeline::stages::{Backup, BackupInput, HeaderCopy};
use sda_pipeline::ServiceError;
use std::process::ExitCode;
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    bootstrap::exit(run().await)
}

async fn run() -> Result<(), ServiceError> {
    let rt = bootstrap::init("backup").await?;
    let header_copy = match rt.backup_recipient().await? {
        Some(recipient) => Some(HeaderCopy {
            service_key: rt.service_key().await?,
            recipient,
        }),
        None => None,
    };
    let catalogue = rt.catalogue().await?;
    let archive = rt.storage("archive", rt.config.require_archive()?).await?;
    let backup = rt.storage("backup", rt.config.require_backup()?).await?;

    let input = BackupInput::for_queue(rt.config.require_queue()?);
    info!(?input, header_copy = header_copy.is_some(), "Backup mode selected");

    let stage = Backup::new(
        catalogue,
        archive,
        backup,
        input,
        header_copy,
        rt.config.broker.routingkey.as_deref(),
    );
    rt.run_stage(stage).await
}
