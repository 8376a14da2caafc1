//! Sync API: HTTP ingress for externally triggered dataset re-publication
//!
//! `GET /ready` answers 200 only while the broker connection, the broker
//! channel and the catalogue are all reachable. `POST /dataset` fans a
//! `file-sync` body out into trigger, accession and mapping messages;
//! `POST /metadata` forwards a `metadata-sync` body unchanged.

use crate::catalogue::Catalogue;
use crate::config::{Config, ServerConfig};
use crate::error::ApiError;
use crate::schema::SchemaRegistry;
use crate::service::{BrokerHandle, StageContext};
use crate::stages::{ROUTE_ACCESSION, ROUTE_INGEST, ROUTE_MAPPINGS, ROUTE_METADATA};
use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sda_common::messages::{DatasetMessage, FileSync, IngestionAccession, IngestionTrigger, MetadataSync, SchemaName};
use sda_common::Checksum;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

/// Grace period for open connections once shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<BrokerHandle>,
    pub catalogue: Arc<dyn Catalogue>,
    pub schemas: Arc<SchemaRegistry>,
    pub exchange: String,
    pub ping_timeout: Duration,
    pub auth: Option<(String, String)>,
}

impl AppState {
    pub fn new(
        config: &Config,
        broker: Arc<BrokerHandle>,
        catalogue: Arc<dyn Catalogue>,
        schemas: Arc<SchemaRegistry>,
    ) -> Self {
        Self {
            broker,
            catalogue,
            schemas,
            exchange: config.broker.exchange.clone(),
            ping_timeout: config.db.ping_timeout(),
            auth: config
                .server
                .basic_auth()
                .map(|(user, password)| (user.to_string(), password.to_string())),
        }
    }

    async fn context(&self) -> StageContext {
        StageContext::new(self.broker.get().await, self.schemas.clone(), self.exchange.clone())
    }
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/dataset", post(dataset))
        .route("/metadata", post(metadata))
        .route_layer(middleware::from_fn_with_state(state.clone(), basic_auth));

    Router::new()
        .route("/ready", get(ready))
        .merge(protected)
        .with_state(state)
}

/// Serve until `shutdown` fires. HTTPS when both a certificate and a key
/// are configured.
pub async fn serve(server: &ServerConfig, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = router(state)
        .layer(TimeoutLayer::new(server.request_timeout()))
        .layer(TraceLayer::new_for_http());
    let addr: SocketAddr = format!("{}:{}", server.host, server.port).parse()?;

    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown.cancelled().await;
            info!("Shutting down sync API");
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        }
    });

    match (&server.cert, &server.key) {
        (Some(cert), Some(key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key).await?;
            info!(%addr, "Sync API listening with TLS");
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        },
        _ => {
            info!(%addr, "Sync API listening");
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        },
    }
    Ok(())
}

async fn basic_auth(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, ApiError> {
    let Some((user, password)) = &state.auth else {
        return Ok(next.run(request).await);
    };
    let supplied = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok());

    match supplied.as_deref().and_then(|s| s.split_once(':')) {
        Some((u, p)) if u == user && p == password => Ok(next.run(request).await),
        _ => {
            warn!("Rejected sync API request with bad credentials");
            Err(ApiError::Unauthorized)
        },
    }
}

async fn ready(State(state): State<AppState>) -> Response {
    let broker = state.broker.is_healthy().await;
    let catalogue = matches!(
        tokio::time::timeout(state.ping_timeout, state.catalogue.ping()).await,
        Ok(Ok(()))
    );
    let status = if broker && catalogue {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "broker": broker, "catalogue": catalogue }))).into_response()
}

async fn dataset(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let sync: FileSync = state.schemas.decode(SchemaName::FileSync, &body)?;
    let ctx = state.context().await;

    let mut accession_ids = Vec::with_capacity(sync.dataset_files.len());
    for file in &sync.dataset_files {
        let correlation_id = Uuid::new_v4().to_string();
        let trigger = IngestionTrigger::new(sync.user.as_str(), file.filepath.as_str(), Vec::new());
        ctx.publish(&correlation_id, ROUTE_INGEST, SchemaName::IngestionTrigger, &trigger)
            .await?;

        let accession = IngestionAccession::new(
            sync.user.as_str(),
            file.filepath.as_str(),
            file.file_id.as_str(),
            vec![Checksum::sha256(file.sha256.as_str())],
        );
        ctx.publish(&correlation_id, ROUTE_ACCESSION, SchemaName::IngestionAccession, &accession)
            .await?;
        accession_ids.push(file.file_id.clone());
    }

    let mapping = DatasetMessage::Mapping {
        dataset_id: sync.dataset_id.clone(),
        accession_ids,
    };
    ctx.publish(&Uuid::new_v4().to_string(), ROUTE_MAPPINGS, SchemaName::DatasetMapping, &mapping)
        .await?;

    info!(dataset_id = %sync.dataset_id, files = sync.dataset_files.len(), "Dataset re-published");
    Ok(StatusCode::OK)
}

async fn metadata(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    let sync: MetadataSync = state.schemas.decode(SchemaName::MetadataSync, &body)?;
    state
        .context()
        .await
        .publish_raw(&Uuid::new_v4().to_string(), ROUTE_METADATA, body.to_vec())
        .await?;
    info!(dataset_id = %sync.dataset_id, "Metadata forwarded");
    Ok(StatusCode::OK)
}
