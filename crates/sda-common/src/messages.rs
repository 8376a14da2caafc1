//! Message bodies exchanged between pipeline stages
//!
//! Every body is JSON and validated against the schema named by
//! [`SchemaName`] before it is deserialized into one of these types. Stages
//! never mutate an incoming body; they build the next one from these structs.

use crate::checksum::Checksum;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Logical schema names, matching `<name>.json` under the schema root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaName {
    IngestionTrigger,
    IngestionVerification,
    IngestionAccessionRequest,
    IngestionAccession,
    IngestionCompletion,
    DatasetMapping,
    DatasetRelease,
    DatasetDeprecate,
    InboxUpload,
    InboxRename,
    InboxRemove,
    InfoError,
    FileSync,
    MetadataSync,
}

impl SchemaName {
    pub const ALL: [SchemaName; 14] = [
        SchemaName::IngestionTrigger,
        SchemaName::IngestionVerification,
        SchemaName::IngestionAccessionRequest,
        SchemaName::IngestionAccession,
        SchemaName::IngestionCompletion,
        SchemaName::DatasetMapping,
        SchemaName::DatasetRelease,
        SchemaName::DatasetDeprecate,
        SchemaName::InboxUpload,
        SchemaName::InboxRename,
        SchemaName::InboxRemove,
        SchemaName::InfoError,
        SchemaName::FileSync,
        SchemaName::MetadataSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaName::IngestionTrigger => "ingestion-trigger",
            SchemaName::IngestionVerification => "ingestion-verification",
            SchemaName::IngestionAccessionRequest => "ingestion-accession-request",
            SchemaName::IngestionAccession => "ingestion-accession",
            SchemaName::IngestionCompletion => "ingestion-completion",
            SchemaName::DatasetMapping => "dataset-mapping",
            SchemaName::DatasetRelease => "dataset-release",
            SchemaName::DatasetDeprecate => "dataset-deprecate",
            SchemaName::InboxUpload => "inbox-upload",
            SchemaName::InboxRename => "inbox-rename",
            SchemaName::InboxRemove => "inbox-remove",
            SchemaName::InfoError => "info-error",
            SchemaName::FileSync => "file-sync",
            SchemaName::MetadataSync => "metadata-sync",
        }
    }

    /// Schema used for a federated message carrying the given `type` field
    pub fn for_message_type(kind: &str) -> Option<SchemaName> {
        match kind {
            "ingest" => Some(SchemaName::IngestionTrigger),
            "accession" => Some(SchemaName::IngestionAccession),
            "mapping" => Some(SchemaName::DatasetMapping),
            "release" => Some(SchemaName::DatasetRelease),
            "deprecate" => Some(SchemaName::DatasetDeprecate),
            _ => None,
        }
    }
}

impl std::fmt::Display for SchemaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SchemaName {
    type Err = crate::SdaError;

    fn from_str(s: &str) -> crate::Result<Self> {
        SchemaName::ALL
            .iter()
            .find(|name| name.as_str() == s)
            .copied()
            .ok_or_else(|| crate::SdaError::InvalidMessage(format!("unknown schema: {s}")))
    }
}

fn ingest_type() -> String {
    "ingest".to_string()
}

fn accession_type() -> String {
    "accession".to_string()
}

/// `ingestion-trigger`: inbox (or intercept) asks ingest to archive a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionTrigger {
    #[serde(rename = "type", default = "ingest_type")]
    pub kind: String,
    pub user: String,
    pub filepath: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encrypted_checksums: Vec<Checksum>,
}

impl IngestionTrigger {
    pub fn new(user: impl Into<String>, filepath: impl Into<String>, checksums: Vec<Checksum>) -> Self {
        Self {
            kind: ingest_type(),
            user: user.into(),
            filepath: filepath.into(),
            encrypted_checksums: checksums,
        }
    }
}

/// `ingestion-verification`: ingest hands an archived file to verify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionVerification {
    pub user: String,
    pub filepath: String,
    pub file_id: Uuid,
    pub archive_path: String,
    #[serde(default)]
    pub encrypted_checksums: Vec<Checksum>,
    #[serde(default)]
    pub re_verify: bool,
}

/// `ingestion-accession-request`: verify asks for a stable identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionAccessionRequest {
    pub user: String,
    pub filepath: String,
    pub decrypted_checksums: Vec<Checksum>,
}

/// `ingestion-accession`: a stable identifier assigned to a verified file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionAccession {
    #[serde(rename = "type", default = "accession_type")]
    pub kind: String,
    pub user: String,
    pub filepath: String,
    pub accession_id: String,
    pub decrypted_checksums: Vec<Checksum>,
}

impl IngestionAccession {
    pub fn new(
        user: impl Into<String>,
        filepath: impl Into<String>,
        accession_id: impl Into<String>,
        decrypted_checksums: Vec<Checksum>,
    ) -> Self {
        Self {
            kind: accession_type(),
            user: user.into(),
            filepath: filepath.into(),
            accession_id: accession_id.into(),
            decrypted_checksums,
        }
    }
}

/// `ingestion-completion`: finalize and backup report a finished file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionCompletion {
    pub user: String,
    pub filepath: String,
    pub accession_id: String,
    pub decrypted_checksums: Vec<Checksum>,
}

impl From<IngestionAccession> for IngestionCompletion {
    fn from(msg: IngestionAccession) -> Self {
        Self {
            user: msg.user,
            filepath: msg.filepath,
            accession_id: msg.accession_id,
            decrypted_checksums: msg.decrypted_checksums,
        }
    }
}

/// Dataset level messages consumed by the mapper, discriminated by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatasetMessage {
    Mapping {
        dataset_id: String,
        accession_ids: Vec<String>,
    },
    Release {
        dataset_id: String,
    },
    Deprecate {
        dataset_id: String,
    },
}

impl DatasetMessage {
    pub fn dataset_id(&self) -> &str {
        match self {
            DatasetMessage::Mapping { dataset_id, .. }
            | DatasetMessage::Release { dataset_id }
            | DatasetMessage::Deprecate { dataset_id } => dataset_id,
        }
    }
}

/// Inbox notifications, discriminated by `operation`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum InboxMessage {
    Upload {
        user: String,
        filepath: String,
        #[serde(default)]
        filesize: Option<u64>,
        #[serde(default)]
        file_last_modified: Option<i64>,
        #[serde(default)]
        encrypted_checksums: Vec<Checksum>,
    },
    Rename {
        user: String,
        filepath: String,
        oldpath: String,
    },
    Remove {
        user: String,
        filepath: String,
    },
}

impl InboxMessage {
    pub fn schema(&self) -> SchemaName {
        match self {
            InboxMessage::Upload { .. } => SchemaName::InboxUpload,
            InboxMessage::Rename { .. } => SchemaName::InboxRename,
            InboxMessage::Remove { .. } => SchemaName::InboxRemove,
        }
    }
}

/// `info-error`: a user visible failure, carrying the offending body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoError {
    pub error: String,
    pub reason: String,
    #[serde(rename = "original-message")]
    pub original_message: String,
}

impl InfoError {
    pub fn new(error: impl Into<String>, reason: impl Into<String>, original: &[u8]) -> Self {
        Self {
            error: error.into(),
            reason: reason.into(),
            original_message: base64::engine::general_purpose::STANDARD.encode(original),
        }
    }

    /// Decode the embedded original body
    pub fn original_bytes(&self) -> crate::Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.original_message)
            .map_err(|e| crate::SdaError::Decode(e.to_string()))
    }

    /// The `user` field of the original body, when it was a JSON object
    pub fn original_user(&self) -> Option<String> {
        let bytes = self.original_bytes().ok()?;
        let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        value.get("user")?.as_str().map(str::to_string)
    }
}

/// One file entry in a `file-sync` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFile {
    pub filepath: String,
    pub file_id: String,
    pub sha256: String,
}

/// `file-sync`: an externally triggered dataset re-publication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSync {
    pub dataset_id: String,
    pub dataset_files: Vec<SyncFile>,
    pub user: String,
}

/// `metadata-sync`: dataset metadata forwarded to the catalogue side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataSync {
    pub dataset_id: String,
    pub metadata: serde_json::Value,
}
