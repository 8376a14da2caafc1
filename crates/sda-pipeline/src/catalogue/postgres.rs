//! PostgreSQL catalogue
//!
//! Lifecycle ordering is enforced in SQL: every transition is written as
//! `state = GREATEST(state, '<target>'::file_state)` so a replayed or late
//! message can never move a row backwards. Connection-level failures are
//! retried with a linear back-off before surfacing as
//! [`CatalogueError::Transport`].

use super::{
    decode_header, ArchiveLocation, ArchivedObject, Catalogue, CatalogueError, CatalogueResult,
    ChecksumSource, DatasetEvent, FileEvent, FileEventRecord, FileRecord, FileState,
    VerifiedObject,
};
use crate::config::DatabaseConfig;
use async_trait::async_trait;
use sda_common::Checksum;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Base delay between retries; attempt `n` waits `n` times this.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct PgCatalogue {
    pool: PgPool,
    retries: u32,
    ping_timeout: Duration,
}

impl std::fmt::Debug for PgCatalogue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgCatalogue")
            .field("retries", &self.retries)
            .field("ping_timeout", &self.ping_timeout)
            .finish()
    }
}

fn connect_options(config: &DatabaseConfig) -> CatalogueResult<PgConnectOptions> {
    if let Some(url) = &config.url {
        return PgConnectOptions::from_str(url)
            .map_err(|e| CatalogueError::Query(format!("invalid database url: {e}")));
    }

    let ssl_mode = PgSslMode::from_str(&config.sslmode)
        .map_err(|e| CatalogueError::Query(format!("invalid db.sslmode: {e}")))?;

    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.database)
        .ssl_mode(ssl_mode);

    if let Some(cacert) = &config.cacert {
        options = options.ssl_root_cert(cacert);
    }
    Ok(options)
}

impl PgCatalogue {
    /// Open the connection pool and check it answers
    pub async fn connect(config: &DatabaseConfig) -> CatalogueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.maxconnections)
            .acquire_timeout(Duration::from_secs(config.connecttimeout))
            .connect_with(connect_options(config)?)
            .await
            .map_err(|e| CatalogueError::Transport(e.to_string()))?;

        info!(
            host = %config.host,
            database = %config.database,
            max_connections = config.maxconnections,
            "Catalogue connection pool created"
        );

        Ok(Self::from_pool(pool, config.retries, config.ping_timeout()))
    }

    pub fn from_pool(pool: PgPool, retries: u32, ping_timeout: Duration) -> Self {
        Self {
            pool,
            retries,
            ping_timeout,
        }
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> CatalogueResult<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CatalogueError::Query(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> CatalogueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CatalogueResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transport() && attempt < self.retries => {
                    attempt += 1;
                    warn!(operation, attempt, error = %e, "catalogue connection failure, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                },
                other => return other,
            }
        }
    }

    async fn register_once(&self, path: &str, user: &str) -> CatalogueResult<Uuid> {
        let mut tx = self.pool.begin().await?;
        let (id, inserted): (Uuid, bool) = sqlx::query_as(
            r#"
            INSERT INTO files (submission_file_path, submission_user)
            VALUES ($1, $2)
            ON CONFLICT (submission_file_path, submission_user)
            DO UPDATE SET last_modified = now()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(path)
        .bind(user)
        .fetch_one(&mut *tx)
        .await?;

        if inserted {
            insert_event(&mut tx, id, FileEvent::Registered, None, Some(user), &serde_json::Value::Null)
                .await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    async fn file_once(&self, file_id: Uuid) -> CatalogueResult<FileRecord> {
        let row = sqlx::query(
            r#"
            SELECT id, submission_user, submission_file_path, stable_id,
                   archive_file_path, archive_file_size, decrypted_file_size,
                   state::text AS state
            FROM files WHERE id = $1
            "#,
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CatalogueError::not_found("file", file_id))?;

        file_record(&row)
    }

    async fn store_header_once(&self, file_id: Uuid, header: &str) -> CatalogueResult<()> {
        let result = sqlx::query("UPDATE files SET header = $2, last_modified = now() WHERE id = $1")
            .bind(file_id)
            .bind(header)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogueError::not_found("file", file_id));
        }
        Ok(())
    }

    async fn header_once(&self, column: &str, key: &str) -> CatalogueResult<Vec<u8>> {
        let query = format!("SELECT header FROM files WHERE {column} = $1");
        let stored: Option<Option<String>> = sqlx::query_scalar(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match stored {
            None => Err(CatalogueError::not_found("file", key)),
            Some(None) => Err(CatalogueError::not_found("header of file", key)),
            Some(Some(hex)) => decode_header(key, &hex),
        }
    }

    async fn set_archived_once(
        &self,
        file_id: Uuid,
        object: &ArchivedObject,
        correlation_id: &str,
    ) -> CatalogueResult<()> {
        let mut tx = self.pool.begin().await?;
        let user: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE files
            SET archive_file_path = $2,
                archive_file_size = $3,
                state = GREATEST(state, 'archived'::file_state),
                last_modified = now()
            WHERE id = $1
            RETURNING submission_user
            "#,
        )
        .bind(file_id)
        .bind(&object.path)
        .bind(object.size as i64)
        .fetch_optional(&mut *tx)
        .await?;
        let user = user.ok_or_else(|| CatalogueError::not_found("file", file_id))?;

        upsert_checksum(&mut tx, file_id, ChecksumSource::Uploaded, &object.inbox_checksum).await?;
        upsert_checksum(&mut tx, file_id, ChecksumSource::Archived, &object.archive_checksum).await?;
        insert_event(
            &mut tx,
            file_id,
            FileEvent::Archived,
            Some(correlation_id),
            Some(&user),
            &serde_json::json!({ "archive_path": object.path, "size": object.size }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_verified_once(
        &self,
        file_id: Uuid,
        object: &VerifiedObject,
        correlation_id: &str,
    ) -> CatalogueResult<()> {
        let mut tx = self.pool.begin().await?;
        let user: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE files
            SET decrypted_file_size = $2,
                state = GREATEST(state, 'verified'::file_state),
                last_modified = now()
            WHERE id = $1
            RETURNING submission_user
            "#,
        )
        .bind(file_id)
        .bind(object.decrypted_size as i64)
        .fetch_optional(&mut *tx)
        .await?;
        let user = user.ok_or_else(|| CatalogueError::not_found("file", file_id))?;

        upsert_checksum(&mut tx, file_id, ChecksumSource::Uploaded, &object.encrypted_checksum)
            .await?;
        for checksum in &object.decrypted_checksums {
            upsert_checksum(&mut tx, file_id, ChecksumSource::Unencrypted, checksum).await?;
        }
        insert_event(
            &mut tx,
            file_id,
            FileEvent::Verified,
            Some(correlation_id),
            Some(&user),
            &serde_json::json!({ "decrypted_size": object.decrypted_size }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_accession_once(
        &self,
        accession: &str,
        user: &str,
        path: &str,
        checksum: &Checksum,
        correlation_id: &str,
    ) -> CatalogueResult<Uuid> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT f.id, f.stable_id, f.state::text AS state
            FROM files f
            JOIN checksums c ON c.file_id = f.id
            WHERE f.submission_user = $1
              AND f.submission_file_path = $2
              AND c.source = 'unencrypted'
              AND c.type = $3
              AND c.checksum = $4
            FOR UPDATE OF f
            "#,
        )
        .bind(user)
        .bind(path)
        .bind(checksum.algorithm.as_str())
        .bind(&checksum.value)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CatalogueError::not_found("verified file", path))?;

        let file_id: Uuid = row.try_get("id")?;
        let current: Option<String> = row.try_get("stable_id")?;
        let state = parse_state(&row)?;

        if state < FileState::Verified {
            return Err(CatalogueError::NotReady(format!(
                "file {file_id} is {state}, accession requires verified"
            )));
        }
        match current.as_deref() {
            Some(existing) if existing == accession => {
                debug!(%file_id, accession, "accession already assigned");
                return Ok(file_id);
            },
            Some(existing) => {
                return Err(CatalogueError::Collision(format!(
                    "file {file_id} already has accession {existing}"
                )))
            },
            None => {},
        }

        sqlx::query(
            r#"
            UPDATE files
            SET stable_id = $2,
                state = GREATEST(state, 'completed'::file_state),
                last_modified = now()
            WHERE id = $1
            "#,
        )
        .bind(file_id)
        .bind(accession)
        .execute(&mut *tx)
        .await?;

        insert_event(
            &mut tx,
            file_id,
            FileEvent::Completed,
            Some(correlation_id),
            Some(user),
            &serde_json::json!({ "accession_id": accession }),
        )
        .await?;

        tx.commit().await?;
        Ok(file_id)
    }

    async fn map_once(&self, dataset_id: &str, accessions: &[String]) -> CatalogueResult<()> {
        let mut tx = self.pool.begin().await?;
        let dataset_pk: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO datasets (stable_id) VALUES ($1)
            ON CONFLICT (stable_id) DO UPDATE SET stable_id = EXCLUDED.stable_id
            RETURNING id
            "#,
        )
        .bind(dataset_id)
        .fetch_one(&mut *tx)
        .await?;

        for accession in accessions {
            let file_id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM files WHERE stable_id = $1")
                .bind(accession)
                .fetch_optional(&mut *tx)
                .await?;
            // dropping the transaction rolls back the mappings made so far
            let file_id = file_id.ok_or_else(|| CatalogueError::not_found("accession", accession))?;

            sqlx::query(
                r#"
                INSERT INTO file_dataset (file_id, dataset_id) VALUES ($1, $2)
                ON CONFLICT (file_id, dataset_id) DO NOTHING
                "#,
            )
            .bind(file_id)
            .bind(dataset_pk)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn dataset_event_once(
        &self,
        dataset_id: &str,
        event: DatasetEvent,
        message: &serde_json::Value,
    ) -> CatalogueResult<()> {
        let mut tx = self.pool.begin().await?;
        let dataset_pk: i32 = sqlx::query_scalar("SELECT id FROM datasets WHERE stable_id = $1")
            .bind(dataset_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CatalogueError::not_found("dataset", dataset_id))?;

        // A replayed event is not logged twice in a row
        sqlx::query(
            r#"
            INSERT INTO dataset_event_log (dataset_id, event, message)
            SELECT $1, $2::text, $3::jsonb
            WHERE $2::text IS DISTINCT FROM (
                SELECT event FROM dataset_event_log
                WHERE dataset_id = $1
                ORDER BY id DESC
                LIMIT 1
            )
            "#,
        )
        .bind(dataset_id)
        .bind(event.as_str())
        .bind(Json(message))
        .execute(&mut *tx)
        .await?;

        if event == DatasetEvent::Registered {
            sqlx::query(
                r#"
                UPDATE files
                SET state = GREATEST(state, 'ready'::file_state), last_modified = now()
                WHERE id IN (SELECT file_id FROM file_dataset WHERE dataset_id = $1)
                "#,
            )
            .bind(dataset_pk)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO file_event_log (file_id, event, user_id, details)
            SELECT f.id, $2, f.submission_user, $3
            FROM files f
            JOIN file_dataset fd ON fd.file_id = f.id
            WHERE fd.dataset_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM (
                      SELECT l.event, l.details FROM file_event_log l
                      WHERE l.file_id = f.id
                      ORDER BY l.id DESC
                      LIMIT 1
                  ) latest
                  WHERE latest.event = $2 AND latest.details = $3
              )
            ORDER BY f.id
            "#,
        )
        .bind(dataset_pk)
        .bind(event.file_event().as_str())
        .bind(Json(serde_json::json!({ "dataset_id": dataset_id })))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_checksum(
    tx: &mut Transaction<'_, Postgres>,
    file_id: Uuid,
    source: ChecksumSource,
    checksum: &Checksum,
) -> CatalogueResult<()> {
    sqlx::query(
        r#"
        INSERT INTO checksums (file_id, checksum, type, source)
        VALUES ($1, $2, $3, $4::checksum_source)
        ON CONFLICT (file_id, source, type) DO UPDATE SET checksum = EXCLUDED.checksum
        "#,
    )
    .bind(file_id)
    .bind(&checksum.value)
    .bind(checksum.algorithm.as_str())
    .bind(source.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    file_id: Uuid,
    event: FileEvent,
    correlation_id: Option<&str>,
    user: Option<&str>,
    details: &serde_json::Value,
) -> CatalogueResult<()> {
    sqlx::query(
        r#"
        INSERT INTO file_event_log (file_id, event, correlation_id, user_id, details)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(file_id)
    .bind(event.as_str())
    .bind(correlation_id)
    .bind(user)
    .bind(Json(details))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn parse_state(row: &PgRow) -> CatalogueResult<FileState> {
    let state: String = row.try_get("state")?;
    state.parse().map_err(CatalogueError::InvalidData)
}

fn to_size(value: Option<i64>) -> Option<u64> {
    value.and_then(|v| u64::try_from(v).ok())
}

fn file_record(row: &PgRow) -> CatalogueResult<FileRecord> {
    Ok(FileRecord {
        id: row.try_get("id")?,
        submission_user: row.try_get("submission_user")?,
        submission_file_path: row.try_get("submission_file_path")?,
        stable_id: row.try_get("stable_id")?,
        archive_file_path: row.try_get("archive_file_path")?,
        archive_file_size: to_size(row.try_get("archive_file_size")?),
        decrypted_file_size: to_size(row.try_get("decrypted_file_size")?),
        state: parse_state(row)?,
    })
}

#[async_trait]
impl Catalogue for PgCatalogue {
    #[instrument(skip(self))]
    async fn register_file(&self, path: &str, user: &str) -> CatalogueResult<Uuid> {
        self.retry("register_file", || self.register_once(path, user)).await
    }

    async fn file(&self, file_id: Uuid) -> CatalogueResult<FileRecord> {
        self.retry("file", || self.file_once(file_id)).await
    }

    #[instrument(skip(self, header), fields(header_len = header.len()))]
    async fn store_header(&self, file_id: Uuid, header: &[u8]) -> CatalogueResult<()> {
        let encoded = hex::encode(header);
        self.retry("store_header", || self.store_header_once(file_id, &encoded))
            .await
    }

    async fn get_header(&self, file_id: Uuid) -> CatalogueResult<Vec<u8>> {
        let key = file_id.to_string();
        // the id column is a uuid; compare as text so both lookups share one query
        self.retry("get_header", || self.header_once("id::text", &key))
            .await
    }

    async fn get_header_by_accession(&self, accession: &str) -> CatalogueResult<Vec<u8>> {
        self.retry("get_header_by_accession", || self.header_once("stable_id", accession))
            .await
    }

    #[instrument(skip(self, object), fields(archive_path = %object.path, size = object.size))]
    async fn set_archived(
        &self,
        file_id: Uuid,
        object: &ArchivedObject,
        correlation_id: &str,
    ) -> CatalogueResult<()> {
        self.retry("set_archived", || {
            self.set_archived_once(file_id, object, correlation_id)
        })
        .await
    }

    #[instrument(skip(self, object))]
    async fn set_verified(
        &self,
        file_id: Uuid,
        object: &VerifiedObject,
        correlation_id: &str,
    ) -> CatalogueResult<()> {
        self.retry("set_verified", || {
            self.set_verified_once(file_id, object, correlation_id)
        })
        .await
    }

    #[instrument(skip(self, decrypted_checksum))]
    async fn set_accession(
        &self,
        accession: &str,
        user: &str,
        path: &str,
        decrypted_checksum: &Checksum,
        correlation_id: &str,
    ) -> CatalogueResult<Uuid> {
        self.retry("set_accession", || {
            self.set_accession_once(accession, user, path, decrypted_checksum, correlation_id)
        })
        .await
    }

    #[instrument(skip(self, accessions), fields(files = accessions.len()))]
    async fn map_files_to_dataset(
        &self,
        dataset_id: &str,
        accessions: &[String],
    ) -> CatalogueResult<()> {
        self.retry("map_files_to_dataset", || self.map_once(dataset_id, accessions))
            .await
    }

    #[instrument(skip(self, message))]
    async fn update_dataset_event(
        &self,
        dataset_id: &str,
        event: DatasetEvent,
        message: &serde_json::Value,
    ) -> CatalogueResult<()> {
        self.retry("update_dataset_event", || {
            self.dataset_event_once(dataset_id, event, message)
        })
        .await
    }

    async fn dataset_accessions(&self, dataset_id: &str) -> CatalogueResult<Vec<String>> {
        self.retry("dataset_accessions", || async move {
            let exists: Option<i32> = sqlx::query_scalar("SELECT id FROM datasets WHERE stable_id = $1")
                .bind(dataset_id)
                .fetch_optional(&self.pool)
                .await?;
            let Some(dataset_pk) = exists else {
                return Err(CatalogueError::not_found("dataset", dataset_id));
            };
            let accessions: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT f.stable_id FROM files f
                JOIN file_dataset fd ON fd.file_id = f.id
                WHERE fd.dataset_id = $1 AND f.stable_id IS NOT NULL
                ORDER BY f.stable_id
                "#,
            )
            .bind(dataset_pk)
            .fetch_all(&self.pool)
            .await?;
            Ok(accessions)
        })
        .await
    }

    async fn get_inbox_path(&self, accession: &str) -> CatalogueResult<String> {
        self.retry("get_inbox_path", || async move {
            sqlx::query_scalar("SELECT submission_file_path FROM files WHERE stable_id = $1")
                .bind(accession)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| CatalogueError::not_found("accession", accession))
        })
        .await
    }

    async fn find_verified(
        &self,
        user: &str,
        path: &str,
        decrypted_checksum: &Checksum,
    ) -> CatalogueResult<ArchiveLocation> {
        self.retry("find_verified", || async move {
            let row = sqlx::query(
                r#"
                SELECT f.id, f.stable_id, f.submission_user, f.submission_file_path,
                       f.archive_file_path, f.archive_file_size
                FROM files f
                JOIN checksums c ON c.file_id = f.id
                WHERE f.submission_user = $1
                  AND f.submission_file_path = $2
                  AND c.source = 'unencrypted'
                  AND c.type = $3
                  AND c.checksum = $4
                  AND f.state >= 'verified'::file_state
                "#,
            )
            .bind(user)
            .bind(path)
            .bind(decrypted_checksum.algorithm.as_str())
            .bind(&decrypted_checksum.value)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CatalogueError::not_found("verified file", path))?;

            let file_id: Uuid = row.try_get("id")?;
            let archive_path: Option<String> = row.try_get("archive_file_path")?;
            let archive_size = to_size(row.try_get("archive_file_size")?);
            let (Some(archive_file_path), Some(archive_file_size)) = (archive_path, archive_size) else {
                return Err(CatalogueError::InvalidData(format!(
                    "verified file {file_id} has no archive location"
                )));
            };

            Ok(ArchiveLocation {
                file_id,
                stable_id: row.try_get("stable_id")?,
                submission_user: row.try_get("submission_user")?,
                submission_file_path: row.try_get("submission_file_path")?,
                archive_file_path,
                archive_file_size,
            })
        })
        .await
    }

    async fn checksums(&self, file_id: Uuid) -> CatalogueResult<Vec<(ChecksumSource, Checksum)>> {
        self.retry("checksums", || async move {
            let rows = sqlx::query(
                "SELECT source::text AS source, type, checksum FROM checksums WHERE file_id = $1 ORDER BY id",
            )
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;

            rows.iter()
                .map(|row| {
                    let source: String = row.try_get("source")?;
                    let algorithm: String = row.try_get("type")?;
                    let value: String = row.try_get("checksum")?;
                    Ok((
                        source.parse().map_err(CatalogueError::InvalidData)?,
                        Checksum::new(
                            algorithm
                                .parse()
                                .map_err(|e: sda_common::SdaError| CatalogueError::InvalidData(e.to_string()))?,
                            value,
                        ),
                    ))
                })
                .collect()
        })
        .await
    }

    async fn log_event(
        &self,
        file_id: Uuid,
        event: FileEvent,
        correlation_id: Option<&str>,
        user: Option<&str>,
        details: &serde_json::Value,
    ) -> CatalogueResult<()> {
        self.retry("log_event", || async move {
            let mut tx = self.pool.begin().await?;
            insert_event(&mut tx, file_id, event, correlation_id, user, details).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn file_events(&self, file_id: Uuid) -> CatalogueResult<Vec<FileEventRecord>> {
        self.retry("file_events", || async move {
            let rows = sqlx::query(
                r#"
                SELECT id, file_id, event, correlation_id, user_id, details, created_at
                FROM file_event_log WHERE file_id = $1 ORDER BY id
                "#,
            )
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;

            rows.iter()
                .map(|row| {
                    let event: String = row.try_get("event")?;
                    let details: Json<serde_json::Value> = row.try_get("details")?;
                    Ok(FileEventRecord {
                        id: row.try_get("id")?,
                        file_id: row.try_get("file_id")?,
                        event: event.parse().map_err(CatalogueError::InvalidData)?,
                        correlation_id: row.try_get("correlation_id")?,
                        user_id: row.try_get("user_id")?,
                        details: details.0,
                        created_at: row.try_get("created_at")?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn ping(&self) -> CatalogueResult<()> {
        match tokio::time::timeout(self.ping_timeout, sqlx::query("SELECT 1").execute(&self.pool))
            .await
        {
            Ok(result) => result.map(|_| ()).map_err(|e| CatalogueError::Transport(e.to_string())),
            Err(_) => Err(CatalogueError::Transport(format!(
                "ping exceeded {:?}",
                self.ping_timeout
            ))),
        }
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Catalogue connection pool closed");
    }
}
