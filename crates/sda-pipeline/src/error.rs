//! Stage and service level errors
//!
//! Every layer has its own `thiserror` enum. A stage handler returns a
//! [`StageError`]; the consume loop only looks at its [`Disposition`] to
//! decide between ack, nack with requeue, and nack without requeue.

use crate::broker::BrokerError;
use crate::catalogue::CatalogueError;
use crate::config::ConfigError;
use crate::crypt4gh::Crypt4ghError;
use crate::schema::SchemaError;
use crate::storage::StorageError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// How a failed delivery is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Invalid JSON, schema violation, unknown message type
    BadMessage,
    /// A referenced row may still appear; requeue after a delay
    MissingPrecondition,
    /// Broker, catalogue or storage unreachable; requeue
    Transient,
    /// The data itself is wrong and will never succeed
    PermanentData,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::BadMessage => "bad-message",
            Disposition::MissingPrecondition => "missing-precondition",
            Disposition::Transient => "transient",
            Disposition::PermanentData => "permanent-data",
        }
    }

    /// Whether the message is dropped and reported through `info-error`
    pub fn is_final(&self) -> bool {
        matches!(self, Disposition::BadMessage | Disposition::PermanentData)
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one stage handler
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Catalogue(#[from] CatalogueError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Crypt4gh(#[from] Crypt4ghError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Malformed message: {0}")]
    BadMessage(String),

    #[error("{what} size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        what: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("Precondition not met: {0}")]
    MissingPrecondition(String),

    #[error("{0}")]
    PermanentData(String),

    #[error("Notification not sent: {0}")]
    Notification(String),
}

impl StageError {
    pub fn disposition(&self) -> Disposition {
        match self {
            StageError::Schema(err) => match err {
                SchemaError::InvalidJson(_) | SchemaError::Violation { .. } => Disposition::BadMessage,
                SchemaError::Io { .. } | SchemaError::InvalidSchema { .. } | SchemaError::Missing(_) => {
                    Disposition::PermanentData
                },
            },
            StageError::Storage(err) => match err {
                StorageError::NotFound(_) => Disposition::MissingPrecondition,
                StorageError::InvalidPath(_) => Disposition::BadMessage,
                StorageError::PermissionDenied(_)
                | StorageError::Transport(_)
                | StorageError::SizeUnknown(_) => Disposition::Transient,
            },
            StageError::Catalogue(err) => match err {
                CatalogueError::NotFound(_) | CatalogueError::NotReady(_) => {
                    Disposition::MissingPrecondition
                },
                CatalogueError::Collision(_) | CatalogueError::InvalidData(_) => {
                    Disposition::PermanentData
                },
                CatalogueError::Transport(_) | CatalogueError::Query(_) => Disposition::Transient,
            },
            StageError::Broker(_) => Disposition::Transient,
            StageError::Crypt4gh(err) if err.is_data_error() => Disposition::PermanentData,
            StageError::Crypt4gh(_) => Disposition::Transient,
            StageError::Config(_) => Disposition::PermanentData,
            StageError::BadMessage(_) => Disposition::BadMessage,
            StageError::SizeMismatch { .. } => Disposition::Transient,
            StageError::MissingPrecondition(_) => Disposition::MissingPrecondition,
            StageError::PermanentData(_) => Disposition::PermanentData,
            StageError::Notification(_) => Disposition::Transient,
        }
    }
}

pub type StageResult<T> = Result<T, StageError>;

/// Failure that ends a service
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Initialisation failed: {0}")]
    Init(String),

    #[error("Broker unavailable after {attempts} connection attempts: {source}")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("{0} consecutive transient failures, giving up")]
    TooManyTransient(u32),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Server error: {0}")]
    Server(String),
}

impl ServiceError {
    /// `1` for initialisation failures, `2` for supervision failures
    pub fn exit_code(&self) -> u8 {
        match self {
            ServiceError::Init(_) => 1,
            _ => 2,
        }
    }

    pub fn init(err: impl std::fmt::Display) -> Self {
        ServiceError::Init(err.to_string())
    }
}

impl From<ConfigError> for ServiceError {
    fn from(err: ConfigError) -> Self {
        ServiceError::Init(err.to_string())
    }
}

/// Errors returned by the sync API handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<SchemaError> for ApiError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::InvalidJson(_) | SchemaError::Violation { .. } => {
                ApiError::BadRequest(err.to_string())
            },
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::Schema(e) => e.into(),
            StageError::Broker(e) => ApiError::Unavailable(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::Unavailable(message) => {
                tracing::warn!("Sync API dependency unavailable: {}", message);
                (StatusCode::SERVICE_UNAVAILABLE, message.clone())
            },
            ApiError::Internal(message) => {
                tracing::error!("Internal error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            },
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "status": status.as_u16(),
            }
        }));

        let mut response = (status, body).into_response();
        if matches!(self, ApiError::Unauthorized) {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Basic realm=\"sda\""),
            );
        }
        response
    }
}
