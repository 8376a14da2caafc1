//! Drive submissions through the pipeline without a federated front end

use sda_pipeline::service::bootstrap;
use sda_pipeline::stages::Orchestrate;
use sda_pipeline::ServiceError;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    bootstrap::exit(run().await)
}

async fn run() -> Result<(), ServiceError> {
    let rt = bootstrap::init("orchestrate").await?;
    let routes = rt.config.broker.routes.clone();
    rt.run_stage(Orchestrate::with_routes(routes)).await
}
