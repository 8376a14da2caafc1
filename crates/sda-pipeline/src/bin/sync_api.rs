//! HTTP ingress for dataset re-publication

use sda_pipeline::api::{self, AppState};
use sda_pipeline::service::bootstrap;
use sda_pipeline::service::supervisor::connect_with_retry;
use sda_pipeline::service::{AmqpConnector, BrokerHandle, Connector};
use sda_pipeline::ServiceError;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    bootstrap::exit(run().await)
}

async fn run() -> Result<(), ServiceError> {
    let rt = bootstrap::init("sync-api").await?;
    let catalogue = rt.catalogue().await?;

    let broker_config = &rt.config.broker;
    let connector: Arc<dyn Connector> = Arc::new(AmqpConnector::new(broker_config.clone(), rt.service));
    let broker = connect_with_retry(
        connector.as_ref(),
        broker_config.reconnectattempts,
        broker_config.reconnect_delay(),
        true,
        &rt.shutdown,
    )
    .await?;
    let handle = BrokerHandle::new(broker);

    // Losing the broker for good stops the server as well
    let maintain = tokio::spawn({
        let shutdown = rt.shutdown.clone();
        let maintained = handle.clone().maintain(
            connector,
            broker_config.reconnectattempts,
            broker_config.reconnect_delay(),
            shutdown.clone(),
        );
        async move {
            let result = maintained.await;
            shutdown.cancel();
            result
        }
    });

    let state = AppState::new(&rt.config, handle, catalogue.clone(), rt.schemas.clone());
    let served = api::serve(&rt.config.server, state, rt.shutdown.clone()).await;
    rt.shutdown.cancel();
    catalogue.close().await;

    served.map_err(|e| ServiceError::Server(e.to_string()))?;
    match maintain.await {
        Ok(result) => result,
        Err(e) => Err(ServiceError::Server(format!("broker maintenance task: {e}"))),
    }
}
