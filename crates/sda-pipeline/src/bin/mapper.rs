//! Map accessions into datasets and record dataset lifecycle events

use sda_pipeline::service::bootstrap;
use sda_pipeline::stages::Mapper;
use sda_pipeline::ServiceError;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    bootstrap::exit(run().await)
}

async fn run() -> Result<(), ServiceError> {
    let rt = bootstrap::init("mapper").await?;
    let catalogue = rt.catalogue().await?;
    rt.run_stage(Mapper::new(catalogue)).await
}
