//! Record stable accession identifiers

use sda_pipeline::service::bootstrap;
use sda_pipeline::stages::Finalize;
use sda_pipeline::ServiceError;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    bootstrap::exit(run().await)
}

async fn run() -> Result<(), ServiceError> {
    let rt = bootstrap::init("finalize").await?;
    let catalogue = rt.catalogue().await?;
    let stage = Finalize::new(catalogue, rt.config.broker.routingkey.as_deref());
    rt.run_stage(stage).await
}
