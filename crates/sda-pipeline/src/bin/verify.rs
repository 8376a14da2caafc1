//! Decrypt archived files end to end and record their plaintext checksums

use sda_pipeline::service::bootstrap;
use sda_pipeline::stages::Verify;
use sda_pipeline::ServiceError;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    bootstrap::exit(run().await)
}

async fn run() -> Result<(), ServiceError> {
    let rt = bootstrap::init("verify").await?;
    let key = rt.service_key().await?;
    let catalogue = rt.catalogue().await?;
    let archive = rt.storage("archive", rt.config.require_archive()?).await?;

    let stage = Verify::new(catalogue, archive, key, rt.config.broker.routingkey.as_deref());
    rt.run_stage(stage).await
}
