//! In-process catalogue with the same lifecycle rules as the database

use super::{
    ArchiveLocation, ArchivedObject, Catalogue, CatalogueError, CatalogueResult, ChecksumSource,
    DatasetEvent, FileEvent, FileEventRecord, FileRecord, FileState, VerifiedObject,
};
use async_trait::async_trait;
use chrono::Utc;
use sda_common::{Checksum, ChecksumAlgorithm};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct FileRow {
    record: FileRecord,
    header: Option<String>,
    checksums: HashMap<(ChecksumSource, ChecksumAlgorithm), String>,
}

#[derive(Debug, Default)]
struct State {
    files: HashMap<Uuid, FileRow>,
    events: Vec<FileEventRecord>,
    datasets: HashMap<String, BTreeSet<Uuid>>,
    dataset_events: Vec<(String, DatasetEvent, serde_json::Value)>,
}

impl State {
    fn row(&self, file_id: Uuid) -> CatalogueResult<&FileRow> {
        self.files
            .get(&file_id)
            .ok_or_else(|| CatalogueError::not_found("file", file_id))
    }

    fn row_mut(&mut self, file_id: Uuid) -> CatalogueResult<&mut FileRow> {
        self.files
            .get_mut(&file_id)
            .ok_or_else(|| CatalogueError::not_found("file", file_id))
    }

    fn by_accession(&self, accession: &str) -> CatalogueResult<&FileRow> {
        self.files
            .values()
            .find(|row| row.record.stable_id.as_deref() == Some(accession))
            .ok_or_else(|| CatalogueError::not_found("accession", accession))
    }

    fn by_decrypted(&self, user: &str, path: &str, checksum: &Checksum) -> Option<&FileRow> {
        self.files.values().find(|row| {
            row.record.submission_user == user
                && row.record.submission_file_path == path
                && row
                    .checksums
                    .get(&(ChecksumSource::Unencrypted, checksum.algorithm))
                    .is_some_and(|v| *v == checksum.value)
        })
    }

    fn push_event(
        &mut self,
        file_id: Uuid,
        event: FileEvent,
        correlation_id: Option<&str>,
        user: Option<&str>,
        details: serde_json::Value,
    ) {
        let id = self.events.len() as i64 + 1;
        self.events.push(FileEventRecord {
            id,
            file_id,
            event,
            correlation_id: correlation_id.map(str::to_string),
            user_id: user.map(str::to_string),
            details,
            created_at: Utc::now(),
        });
    }
}

/// Catalogue kept in memory; used by the pipeline tests
#[derive(Debug, Default)]
pub struct MemoryCatalogue {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the database connection
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Overwrite a stored header with arbitrary bytes
    pub async fn corrupt_header(&self, file_id: Uuid, header: &[u8]) -> CatalogueResult<()> {
        let mut state = self.state.lock().await;
        state.row_mut(file_id)?.header = Some(hex::encode(header));
        Ok(())
    }

    pub async fn find_by_path(&self, user: &str, path: &str) -> Option<FileRecord> {
        let state = self.state.lock().await;
        state
            .files
            .values()
            .find(|row| row.record.submission_user == user && row.record.submission_file_path == path)
            .map(|row| row.record.clone())
    }

    pub async fn file_count(&self) -> usize {
        self.state.lock().await.files.len()
    }

    pub async fn dataset_events(&self, dataset_id: &str) -> Vec<DatasetEvent> {
        let state = self.state.lock().await;
        state
            .dataset_events
            .iter()
            .filter(|(id, _, _)| id == dataset_id)
            .map(|(_, event, _)| *event)
            .collect()
    }

    fn check(&self) -> CatalogueResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CatalogueError::Transport("catalogue unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Catalogue for MemoryCatalogue {
    async fn register_file(&self, path: &str, user: &str) -> CatalogueResult<Uuid> {
        self.check()?;
        let mut state = self.state.lock().await;
        if let Some(row) = state
            .files
            .values()
            .find(|row| row.record.submission_user == user && row.record.submission_file_path == path)
        {
            return Ok(row.record.id);
        }

        let id = Uuid::new_v4();
        state.files.insert(
            id,
            FileRow {
                record: FileRecord {
                    id,
                    submission_user: user.to_string(),
                    submission_file_path: path.to_string(),
                    stable_id: None,
                    archive_file_path: None,
                    archive_file_size: None,
                    decrypted_file_size: None,
                    state: FileState::Init,
                },
                header: None,
                checksums: HashMap::new(),
            },
        );
        state.push_event(id, FileEvent::Registered, None, Some(user), serde_json::Value::Null);
        Ok(id)
    }

    async fn file(&self, file_id: Uuid) -> CatalogueResult<FileRecord> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.row(file_id)?.record.clone())
    }

    async fn store_header(&self, file_id: Uuid, header: &[u8]) -> CatalogueResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.row_mut(file_id)?.header = Some(hex::encode(header));
        Ok(())
    }

    async fn get_header(&self, file_id: Uuid) -> CatalogueResult<Vec<u8>> {
        self.check()?;
        let state = self.state.lock().await;
        let stored = state
            .row(file_id)?
            .header
            .as_deref()
            .ok_or_else(|| CatalogueError::not_found("header of file", file_id))?;
        super::decode_header(file_id, stored)
    }

    async fn get_header_by_accession(&self, accession: &str) -> CatalogueResult<Vec<u8>> {
        self.check()?;
        let state = self.state.lock().await;
        let row = state.by_accession(accession)?;
        let stored = row
            .header
            .as_deref()
            .ok_or_else(|| CatalogueError::not_found("header of accession", accession))?;
        super::decode_header(accession, stored)
    }

    async fn set_archived(
        &self,
        file_id: Uuid,
        object: &ArchivedObject,
        correlation_id: &str,
    ) -> CatalogueResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        let row = state.row_mut(file_id)?;
        row.record.archive_file_path = Some(object.path.clone());
        row.record.archive_file_size = Some(object.size);
        row.record.state = row.record.state.advance(FileState::Archived);
        for (source, checksum) in [
            (ChecksumSource::Uploaded, &object.inbox_checksum),
            (ChecksumSource::Archived, &object.archive_checksum),
        ] {
            row.checksums
                .insert((source, checksum.algorithm), checksum.value.clone());
        }
        let user = row.record.submission_user.clone();
        state.push_event(
            file_id,
            FileEvent::Archived,
            Some(correlation_id),
            Some(&user),
            serde_json::json!({ "archive_path": object.path, "size": object.size }),
        );
        Ok(())
    }

    async fn set_verified(
        &self,
        file_id: Uuid,
        object: &VerifiedObject,
        correlation_id: &str,
    ) -> CatalogueResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        let row = state.row_mut(file_id)?;
        row.record.decrypted_file_size = Some(object.decrypted_size);
        row.record.state = row.record.state.advance(FileState::Verified);
        row.checksums.insert(
            (ChecksumSource::Uploaded, object.encrypted_checksum.algorithm),
            object.encrypted_checksum.value.clone(),
        );
        for checksum in &object.decrypted_checksums {
            row.checksums.insert(
                (ChecksumSource::Unencrypted, checksum.algorithm),
                checksum.value.clone(),
            );
        }
        let user = row.record.submission_user.clone();
        state.push_event(
            file_id,
            FileEvent::Verified,
            Some(correlation_id),
            Some(&user),
            serde_json::json!({ "decrypted_size": object.decrypted_size }),
        );
        Ok(())
    }

    async fn set_accession(
        &self,
        accession: &str,
        user: &str,
        path: &str,
        decrypted_checksum: &Checksum,
        correlation_id: &str,
    ) -> CatalogueResult<Uuid> {
        self.check()?;
        let mut state = self.state.lock().await;
        let (file_id, current, current_state) = {
            let row = state
                .by_decrypted(user, path, decrypted_checksum)
                .ok_or_else(|| CatalogueError::not_found("verified file", path))?;
            (row.record.id, row.record.stable_id.clone(), row.record.state)
        };

        if current_state < FileState::Verified {
            return Err(CatalogueError::NotReady(format!(
                "file {file_id} is {current_state}, accession requires verified"
            )));
        }
        match current.as_deref() {
            Some(existing) if existing == accession => return Ok(file_id),
            Some(existing) => {
                return Err(CatalogueError::Collision(format!(
                    "file {file_id} already has accession {existing}"
                )))
            },
            None => {},
        }
        if state
            .files
            .values()
            .any(|row| row.record.stable_id.as_deref() == Some(accession))
        {
            return Err(CatalogueError::Collision(format!(
                "accession {accession} already assigned"
            )));
        }

        let row = state.row_mut(file_id)?;
        row.record.stable_id = Some(accession.to_string());
        row.record.state = row.record.state.advance(FileState::Completed);
        state.push_event(
            file_id,
            FileEvent::Completed,
            Some(correlation_id),
            Some(user),
            serde_json::json!({ "accession_id": accession }),
        );
        Ok(file_id)
    }

    async fn map_files_to_dataset(
        &self,
        dataset_id: &str,
        accessions: &[String],
    ) -> CatalogueResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        let ids = accessions
            .iter()
            .map(|accession| state.by_accession(accession).map(|row| row.record.id))
            .collect::<CatalogueResult<Vec<_>>>()?;

        state
            .datasets
            .entry(dataset_id.to_string())
            .or_default()
            .extend(ids);
        Ok(())
    }

    async fn update_dataset_event(
        &self,
        dataset_id: &str,
        event: DatasetEvent,
        message: &serde_json::Value,
    ) -> CatalogueResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        let files: Vec<Uuid> = state
            .datasets
            .get(dataset_id)
            .ok_or_else(|| CatalogueError::not_found("dataset", dataset_id))?
            .iter()
            .copied()
            .collect();

        let latest = state
            .dataset_events
            .iter()
            .rev()
            .find(|(id, _, _)| id == dataset_id)
            .map(|(_, logged, _)| *logged);
        if latest != Some(event) {
            state
                .dataset_events
                .push((dataset_id.to_string(), event, message.clone()));
        }

        let details = serde_json::json!({ "dataset_id": dataset_id });
        for file_id in files {
            let row = state.row_mut(file_id)?;
            if event == DatasetEvent::Registered {
                row.record.state = row.record.state.advance(FileState::Ready);
            }
            let user = row.record.submission_user.clone();
            let repeated = state
                .events
                .iter()
                .rev()
                .find(|e| e.file_id == file_id)
                .is_some_and(|e| e.event == event.file_event() && e.details == details);
            if !repeated {
                state.push_event(file_id, event.file_event(), None, Some(&user), details.clone());
            }
        }
        Ok(())
    }

    async fn dataset_accessions(&self, dataset_id: &str) -> CatalogueResult<Vec<String>> {
        self.check()?;
        let state = self.state.lock().await;
        let files = state
            .datasets
            .get(dataset_id)
            .ok_or_else(|| CatalogueError::not_found("dataset", dataset_id))?;
        let mut accessions: Vec<String> = files
            .iter()
            .filter_map(|id| state.files.get(id))
            .filter_map(|row| row.record.stable_id.clone())
            .collect();
        accessions.sort();
        Ok(accessions)
    }

    async fn get_inbox_path(&self, accession: &str) -> CatalogueResult<String> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.by_accession(accession)?.record.submission_file_path.clone())
    }

    async fn find_verified(
        &self,
        user: &str,
        path: &str,
        decrypted_checksum: &Checksum,
    ) -> CatalogueResult<ArchiveLocation> {
        self.check()?;
        let state = self.state.lock().await;
        let row = state
            .by_decrypted(user, path, decrypted_checksum)
            .filter(|row| row.record.state >= FileState::Verified)
            .ok_or_else(|| CatalogueError::not_found("verified file", path))?;

        match (&row.record.archive_file_path, row.record.archive_file_size) {
            (Some(archive_path), Some(size)) => Ok(ArchiveLocation {
                file_id: row.record.id,
                stable_id: row.record.stable_id.clone(),
                submission_user: row.record.submission_user.clone(),
                submission_file_path: row.record.submission_file_path.clone(),
                archive_file_path: archive_path.clone(),
                archive_file_size: size,
            }),
            _ => Err(CatalogueError::InvalidData(format!(
                "verified file {} has no archive location",
                row.record.id
            ))),
        }
    }

    async fn checksums(&self, file_id: Uuid) -> CatalogueResult<Vec<(ChecksumSource, Checksum)>> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .row(file_id)?
            .checksums
            .iter()
            .map(|((source, algorithm), value)| (*source, Checksum::new(*algorithm, value.clone())))
            .collect())
    }

    async fn log_event(
        &self,
        file_id: Uuid,
        event: FileEvent,
        correlation_id: Option<&str>,
        user: Option<&str>,
        details: &serde_json::Value,
    ) -> CatalogueResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.row(file_id)?;
        state.push_event(file_id, event, correlation_id, user, details.clone());
        Ok(())
    }

    async fn file_events(&self, file_id: Uuid) -> CatalogueResult<Vec<FileEventRecord>> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.file_id == file_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> CatalogueResult<()> {
        self.check()
    }

    async fn close(&self) {}
}
