//! Mail submitters about failed and finished files

use sda_pipeline::service::bootstrap;
use sda_pipeline::stages::{Notify, SmtpMailer};
use sda_pipeline::ServiceError;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    bootstrap::exit(run().await)
}

async fn run() -> Result<(), ServiceError> {
    let rt = bootstrap::init("notify").await?;
    let smtp = rt.config.require_notify()?;
    let mailer = SmtpMailer::new(smtp).map_err(ServiceError::init)?;
    let stage = Notify::new(Arc::new(mailer), smtp);
    rt.run_stage(stage).await
}
