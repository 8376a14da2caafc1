//! Archive uploaded files: copy the body out of the inbox and record the
//! header in the catalogue

use sda_pipeline::service::bootstrap;
use sda_pipeline::stages::Ingest;
use sda_pipeline::ServiceError;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    bootstrap::exit(run().await)
}

async fn run() -> Result<(), ServiceError> {
    let rt = bootstrap::init("ingest").await?;
    let key = rt.service_key().await?;
    let catalogue = rt.catalogue().await?;
    let inbox = rt.storage("inbox", rt.config.require_inbox()?).await?;
    let archive = rt.storage("archive", rt.config.require_archive()?).await?;

    let stage = Ingest::new(catalogue, inbox, archive, key, rt.config.broker.routingkey.as_deref());
    rt.run_stage(stage).await
}
