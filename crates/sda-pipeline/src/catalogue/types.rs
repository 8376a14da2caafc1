use chrono::{DateTime, Utc};
use sda_common::Checksum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a file row.
///
/// The main chain is ordered; `Disabled` and `Error` rank above it so that
/// nothing automatic ever moves a row out of the side branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Init,
    Archived,
    Verified,
    Completed,
    Ready,
    Disabled,
    Error,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Init => "init",
            FileState::Archived => "archived",
            FileState::Verified => "verified",
            FileState::Completed => "completed",
            FileState::Ready => "ready",
            FileState::Disabled => "disabled",
            FileState::Error => "error",
        }
    }

    /// The state after attempting to move to `target`; never a regression
    pub fn advance(self, target: FileState) -> FileState {
        self.max(target)
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(FileState::Init),
            "archived" => Ok(FileState::Archived),
            "verified" => Ok(FileState::Verified),
            "completed" => Ok(FileState::Completed),
            "ready" => Ok(FileState::Ready),
            "disabled" => Ok(FileState::Disabled),
            "error" => Ok(FileState::Error),
            other => Err(format!("unknown file state: {other}")),
        }
    }
}

/// Where a stored checksum was computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumSource {
    /// Whole encrypted object as uploaded (header and body)
    Uploaded,
    /// Ciphertext body as stored in the archive
    Archived,
    /// Decrypted content
    Unencrypted,
}

impl ChecksumSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumSource::Uploaded => "uploaded",
            ChecksumSource::Archived => "archived",
            ChecksumSource::Unencrypted => "unencrypted",
        }
    }
}

impl FromStr for ChecksumSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(ChecksumSource::Uploaded),
            "archived" => Ok(ChecksumSource::Archived),
            "unencrypted" => Ok(ChecksumSource::Unencrypted),
            other => Err(format!("unknown checksum source: {other}")),
        }
    }
}

/// Entries of the per-file event log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileEvent {
    Registered,
    Started,
    Archived,
    Verified,
    ChecksumMismatch,
    Completed,
    BackedUp,
    Ready,
    Released,
    Deprecated,
    Disabled,
    Error,
}

impl FileEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEvent::Registered => "registered",
            FileEvent::Started => "started",
            FileEvent::Archived => "archived",
            FileEvent::Verified => "verified",
            FileEvent::ChecksumMismatch => "checksum-mismatch",
            FileEvent::Completed => "completed",
            FileEvent::BackedUp => "backed-up",
            FileEvent::Ready => "ready",
            FileEvent::Released => "released",
            FileEvent::Deprecated => "deprecated",
            FileEvent::Disabled => "disabled",
            FileEvent::Error => "error",
        }
    }
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(FileEvent::Registered),
            "started" => Ok(FileEvent::Started),
            "archived" => Ok(FileEvent::Archived),
            "verified" => Ok(FileEvent::Verified),
            "checksum-mismatch" => Ok(FileEvent::ChecksumMismatch),
            "completed" => Ok(FileEvent::Completed),
            "backed-up" => Ok(FileEvent::BackedUp),
            "ready" => Ok(FileEvent::Ready),
            "released" => Ok(FileEvent::Released),
            "deprecated" => Ok(FileEvent::Deprecated),
            "disabled" => Ok(FileEvent::Disabled),
            "error" => Ok(FileEvent::Error),
            other => Err(format!("unknown file event: {other}")),
        }
    }
}

/// Dataset level events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetEvent {
    /// Files were mapped; every mapped file becomes `ready`
    Registered,
    Released,
    Deprecated,
}

impl DatasetEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetEvent::Registered => "registered",
            DatasetEvent::Released => "released",
            DatasetEvent::Deprecated => "deprecated",
        }
    }

    /// Event fanned out to each file of the dataset
    pub fn file_event(&self) -> FileEvent {
        match self {
            DatasetEvent::Registered => FileEvent::Ready,
            DatasetEvent::Released => FileEvent::Released,
            DatasetEvent::Deprecated => FileEvent::Deprecated,
        }
    }
}

impl fmt::Display for DatasetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful ingest copy
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedObject {
    pub path: String,
    pub size: u64,
    /// Digest over the whole inbox stream
    pub inbox_checksum: Checksum,
    /// Digest over the ciphertext body written to the archive
    pub archive_checksum: Checksum,
}

/// Result of a successful verification
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedObject {
    pub encrypted_checksum: Checksum,
    pub decrypted_checksums: Vec<Checksum>,
    pub decrypted_size: u64,
}

/// One row of `files`
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: Uuid,
    pub submission_user: String,
    pub submission_file_path: String,
    pub stable_id: Option<String>,
    pub archive_file_path: Option<String>,
    pub archive_file_size: Option<u64>,
    pub decrypted_file_size: Option<u64>,
    pub state: FileState,
}

/// Archive location of a verified file, as needed by backup
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveLocation {
    pub file_id: Uuid,
    pub stable_id: Option<String>,
    pub submission_user: String,
    pub submission_file_path: String,
    pub archive_file_path: String,
    pub archive_file_size: u64,
}

/// One row of `file_event_log`
#[derive(Debug, Clone, PartialEq)]
pub struct FileEventRecord {
    pub id: i64,
    pub file_id: Uuid,
    pub event: FileEvent,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
