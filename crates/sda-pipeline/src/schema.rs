//! Compile-once JSON schema validation by logical name

use sda_common::messages::SchemaName;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to read schema {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema {name} is not valid: {message}")]
    InvalidSchema { name: SchemaName, message: String },

    #[error("No schema registered for {0}")]
    Missing(SchemaName),

    #[error("Body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Body does not conform to {schema}: {}", .errors.join("; "))]
    Violation {
        schema: SchemaName,
        errors: Vec<String>,
    },
}

pub type SchemaResult<T> = Result<T, SchemaError>;

/// Every schema compiled once at start-up
pub struct SchemaRegistry {
    validators: HashMap<SchemaName, jsonschema::Validator>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schemas", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

macro_rules! bundled {
    ($($name:ident => $file:literal),* $(,)?) => {
        [$((SchemaName::$name, include_str!(concat!("../../../schemas/", $file)))),*]
    };
}

impl SchemaRegistry {
    /// Load `<name>.json` for every known schema from `root`
    pub fn load(root: &Path) -> SchemaResult<Self> {
        let mut documents = Vec::with_capacity(SchemaName::ALL.len());
        for name in SchemaName::ALL {
            let path = root.join(format!("{}.json", name.as_str()));
            let text = std::fs::read_to_string(&path).map_err(|source| SchemaError::Io {
                path: path.clone(),
                source,
            })?;
            documents.push((name, text));
        }
        let registry = Self::from_documents(documents.iter().map(|(n, t)| (*n, t.as_str())))?;
        info!(root = %root.display(), schemas = registry.validators.len(), "Schemas compiled");
        Ok(registry)
    }

    /// The schemas shipped with the workspace
    pub fn bundled() -> SchemaResult<Self> {
        Self::from_documents(bundled![
            IngestionTrigger => "ingestion-trigger.json",
            IngestionVerification => "ingestion-verification.json",
            IngestionAccessionRequest => "ingestion-accession-request.json",
            IngestionAccession => "ingestion-accession.json",
            IngestionCompletion => "ingestion-completion.json",
            DatasetMapping => "dataset-mapping.json",
            DatasetRelease => "dataset-release.json",
            DatasetDeprecate => "dataset-deprecate.json",
            InboxUpload => "inbox-upload.json",
            InboxRename => "inbox-rename.json",
            InboxRemove => "inbox-remove.json",
            InfoError => "info-error.json",
            FileSync => "file-sync.json",
            MetadataSync => "metadata-sync.json",
        ])
    }

    pub fn from_documents<'a>(
        documents: impl IntoIterator<Item = (SchemaName, &'a str)>,
    ) -> SchemaResult<Self> {
        let mut validators = HashMap::new();
        for (name, text) in documents {
            let schema: Value = serde_json::from_str(text).map_err(|e| SchemaError::InvalidSchema {
                name,
                message: e.to_string(),
            })?;
            let validator = jsonschema::options()
                .build(&schema)
                .map_err(|e| SchemaError::InvalidSchema {
                    name,
                    message: e.to_string(),
                })?;
            debug!(schema = %name, "compiled schema");
            validators.insert(name, validator);
        }
        Ok(Self { validators })
    }

    pub fn validate_value(&self, name: SchemaName, value: &Value) -> SchemaResult<()> {
        let validator = self.validators.get(&name).ok_or(SchemaError::Missing(name))?;
        let errors: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Violation {
                schema: name,
                errors,
            })
        }
    }

    /// Parse `body` and check it against `name`
    pub fn validate(&self, name: SchemaName, body: &[u8]) -> SchemaResult<Value> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
        self.validate_value(name, &value)?;
        Ok(value)
    }

    /// Validate and deserialize in one step
    pub fn decode<T: DeserializeOwned>(&self, name: SchemaName, body: &[u8]) -> SchemaResult<T> {
        let value = self.validate(name, body)?;
        serde_json::from_value(value).map_err(|e| SchemaError::Violation {
            schema: name,
            errors: vec![e.to_string()],
        })
    }

    /// Serialize an outgoing body and check it before it is published
    pub fn encode<T: serde::Serialize>(&self, name: SchemaName, message: &T) -> SchemaResult<Vec<u8>> {
        let value = serde_json::to_value(message).map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
        self.validate_value(name, &value)?;
        serde_json::to_vec(&value).map_err(|e| SchemaError::InvalidJson(e.to_string()))
    }
}
