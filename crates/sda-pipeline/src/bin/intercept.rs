//! Route federated messages onto the internal routing keys

use sda_pipeline::service::bootstrap;
use sda_pipeline::stages::Intercept;
use sda_pipeline::ServiceError;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    bootstrap::exit(run().await)
}

async fn run() -> Result<(), ServiceError> {
    let rt = bootstrap::init("intercept").await?;
    let routes = rt.config.broker.routes.clone();
    rt.run_stage(Intercept::with_routes(routes)).await
}
