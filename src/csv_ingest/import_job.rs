use chrono::Utc;
use rusqlite::params;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::csv_ingest::CsvValidator;
use crate::database::{get_repository, DbPool};
use crate::membership::{AddOutcome, MembershipStore};
use crate::models::{CsvImportRecord, ImportStatus, MemberSource, Result};

/// Entries kept in an import's error log before it is truncated.
const ERROR_LOG_CAP: usize = 200;

/// Runs CSV imports off the request path. The upload endpoint enqueues
/// and returns a tracking id immediately; a spawned task validates the
/// file and admits rows one at a time, so cancellation keeps whatever
/// was already admitted.
#[derive(Clone)]
pub struct ImportManager {
    pool: DbPool,
    store: MembershipStore,
    validator: Arc<CsvValidator>,
    progress_interval: usize,
    cancel_flags: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl ImportManager {
    pub fn new(pool: DbPool, validator: CsvValidator, progress_interval: usize) -> Self {
        let store = MembershipStore::new(pool.clone());
        Self {
            pool,
            store,
            validator: Arc::new(validator),
            progress_interval: progress_interval.max(1),
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create the tracking record and spawn the job. Returns the import
    /// id the caller can poll and cancel with.
    pub async fn enqueue(
        &self,
        repository_id: i64,
        filename: &str,
        uploaded_by: &str,
        bytes: Vec<u8>,
        declared_size: usize,
    ) -> Result<String> {
        let import_id = uuid::Uuid::new_v4().to_string();

        let conn = self.pool.get().await?;
        conn.execute(
            r#"
            INSERT INTO csv_imports (id, repository_id, filename, uploaded_by, status, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                import_id,
                repository_id,
                filename,
                uploaded_by,
                ImportStatus::Pending.as_str(),
                Utc::now(),
            ],
        )?;
        drop(conn);

        let flag = Arc::new(AtomicBool::new(false));
        self.cancel_flags
            .lock()
            .unwrap()
            .insert(import_id.clone(), flag.clone());

        let manager = self.clone();
        let id = import_id.clone();
        let uploader = uploaded_by.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager
                .execute(&id, repository_id, &uploader, &bytes, declared_size, flag)
                .await
            {
                warn!("import {} failed: {}", id, e);
                let _ = manager
                    .finalize(&id, ImportStatus::Failed, &[format!("internal error: {}", e)])
                    .await;
            }
            manager.cancel_flags.lock().unwrap().remove(&id);
        });

        info!(
            "import enqueued: id={} repo={} file={}",
            import_id, repository_id, filename
        );
        Ok(import_id)
    }

    /// The job body. Also callable directly in tests so the whole run
    /// can be awaited.
    pub async fn execute(
        &self,
        import_id: &str,
        repository_id: i64,
        uploaded_by: &str,
        bytes: &[u8],
        declared_size: usize,
        cancel: Arc<AtomicBool>,
    ) -> Result<()> {
        self.set_status(import_id, ImportStatus::Processing).await?;

        let validation = self.validator.validate(bytes, declared_size);
        let mut log: Vec<String> = validation.warnings.clone();

        self.record_counts(
            import_id,
            validation.metadata.total_rows,
            validation.metadata.valid_emails,
            validation.metadata.duplicate_emails,
            validation.metadata.invalid_emails,
        )
        .await?;

        if !validation.is_valid {
            for error in &validation.errors {
                log.insert(0, error.to_string());
            }
            self.finalize(import_id, ImportStatus::Failed, &log).await?;
            return Ok(());
        }

        let repo = get_repository(&self.pool, repository_id)
            .await?
            .ok_or_else(|| format!("unknown repository {}", repository_id))?;

        let mut processed = 0usize;
        let mut admitted = 0usize;
        let mut cancelled = false;

        for record in &validation.records {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                log.push(format!(
                    "cancelled after {} of {} rows; admitted rows are kept",
                    processed,
                    validation.records.len()
                ));
                break;
            }

            let outcome = self
                .store
                .add_member(
                    &repo,
                    &self.validator.classifier().classify(&record.email),
                    MemberSource::CsvImport,
                    Some(uploaded_by),
                    &record.tags,
                    record.subscribed,
                    false,
                )
                .await?;

            match outcome {
                AddOutcome::Added(_) => admitted += 1,
                AddOutcome::Duplicate { email, .. } => {
                    log.push(format!("row {}: '{}' already a member", record.row_number, email));
                }
                AddOutcome::Rejected { email, reason } => {
                    log.push(format!("row {}: '{}' rejected ({})", record.row_number, email, reason));
                }
            }

            processed += 1;
            if processed % self.progress_interval == 0 {
                self.record_progress(import_id, processed, admitted).await?;
            }
        }

        self.record_progress(import_id, processed, admitted).await?;
        let status = if cancelled {
            ImportStatus::Failed
        } else {
            ImportStatus::Completed
        };
        self.finalize(import_id, status, &log).await?;

        info!(
            "import {}: {} processed, {} admitted, status={}",
            import_id,
            processed,
            admitted,
            status.as_str()
        );
        Ok(())
    }

    /// Request cancellation of a running import. Returns false when the
    /// job already reached a final state.
    pub async fn cancel(&self, import_id: &str) -> Result<bool> {
        if let Some(record) = self.status(import_id).await? {
            if record.status.is_final() {
                return Ok(false);
            }
        } else {
            return Ok(false);
        }

        if let Some(flag) = self.cancel_flags.lock().unwrap().get(import_id) {
            flag.store(true, Ordering::Relaxed);
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn status(&self, import_id: &str) -> Result<Option<CsvImportRecord>> {
        let conn = self.pool.get().await?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, repository_id, filename, uploaded_by, status,
                   total_rows, valid_emails, duplicate_emails, invalid_emails,
                   processed_rows, admitted_rows, error_log, started_at, finished_at
            FROM csv_imports WHERE id = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![import_id])?;
        match rows.next()? {
            Some(row) => {
                let status: String = row.get(4)?;
                let error_log: String = row.get(11)?;
                Ok(Some(CsvImportRecord {
                    id: row.get(0)?,
                    repository_id: row.get(1)?,
                    filename: row.get(2)?,
                    uploaded_by: row.get(3)?,
                    status: ImportStatus::parse(&status).unwrap_or(ImportStatus::Failed),
                    total_rows: row.get::<_, i64>(5)? as usize,
                    valid_emails: row.get::<_, i64>(6)? as usize,
                    duplicate_emails: row.get::<_, i64>(7)? as usize,
                    invalid_emails: row.get::<_, i64>(8)? as usize,
                    processed_rows: row.get::<_, i64>(9)? as usize,
                    admitted_rows: row.get::<_, i64>(10)? as usize,
                    error_log: serde_json::from_str(&error_log).unwrap_or_default(),
                    started_at: row.get(12)?,
                    finished_at: row.get(13)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn set_status(&self, import_id: &str, status: ImportStatus) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            "UPDATE csv_imports SET status = ?1 WHERE id = ?2 AND status NOT IN ('completed', 'failed')",
            params![status.as_str(), import_id],
        )?;
        Ok(())
    }

    async fn record_counts(
        &self,
        import_id: &str,
        total: usize,
        valid: usize,
        duplicates: usize,
        invalid: usize,
    ) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            "UPDATE csv_imports SET total_rows = ?1, valid_emails = ?2, \
             duplicate_emails = ?3, invalid_emails = ?4 WHERE id = ?5",
            params![
                total as i64,
                valid as i64,
                duplicates as i64,
                invalid as i64,
                import_id
            ],
        )?;
        Ok(())
    }

    async fn record_progress(&self, import_id: &str, processed: usize, admitted: usize) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            "UPDATE csv_imports SET processed_rows = ?1, admitted_rows = ?2 WHERE id = ?3",
            params![processed as i64, admitted as i64, import_id],
        )?;
        Ok(())
    }

    /// Terminal update. Completed and failed records never change again.
    async fn finalize(&self, import_id: &str, status: ImportStatus, log: &[String]) -> Result<()> {
        let bounded: Vec<&String> = log.iter().take(ERROR_LOG_CAP).collect();
        let conn = self.pool.get().await?;
        conn.execute(
            "UPDATE csv_imports SET status = ?1, error_log = ?2, finished_at = ?3 \
             WHERE id = ?4 AND status NOT IN ('completed', 'failed')",
            params![
                status.as_str(),
                serde_json::to_string(&bounded)?,
                Utc::now(),
                import_id
            ],
        )?;
        Ok(())
    }
}
