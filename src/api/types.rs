//! Shared request context and wire DTOs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Semaphore, SemaphorePermit};
use uuid::Uuid;

use crate::auth::AuthRole;
use crate::config::AppConfig;
use crate::db::{DatabaseError, SubmissionRecord};
use crate::llm::ChatClient;
use crate::pipeline::types::SubmissionStatus;
use crate::pipeline::Pipeline;
use crate::storage::FileStore;

use super::error::ApiError;

/// Bounded wait for an upstream slot before shedding load with a 503.
const LLM_SLOT_WAIT: Duration = Duration::from_secs(30);

/// Shared state behind every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: Arc<AppConfig>,
    db: Mutex<Connection>,
    files: FileStore,
    pipeline: Pipeline,
    llm_gate: Semaphore,
    rerun_locks: Arc<Mutex<HashSet<Uuid>>>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        db: Connection,
        files: FileStore,
        chat: Arc<dyn ChatClient>,
    ) -> Self {
        let config = Arc::new(config);
        let pipeline = Pipeline::new(chat, config.clone());
        Self {
            inner: Arc::new(ContextInner {
                llm_gate: Semaphore::new(config.llm_concurrency),
                config,
                db: Mutex::new(db),
                files,
                pipeline,
                rerun_locks: Arc::new(Mutex::new(HashSet::new())),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn files(&self) -> &FileStore {
        &self.inner.files
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// Run a closure against the shared connection. The lock is held
    /// only for the duration of the repository call.
    pub fn with_db<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let conn = self
            .inner
            .db
            .lock()
            .map_err(|_| DatabaseError::ConstraintViolation("connection lock poisoned".into()))?;
        f(&conn)
    }

    /// Verify a bearer token against the master key and the key store.
    pub fn verify_token(&self, token: &str) -> Result<Option<AuthRole>, DatabaseError> {
        self.with_db(|conn| {
            crate::auth::verify_token(conn, self.inner.config.master_api_key.as_deref(), token)
        })
    }

    /// Acquire an upstream-model slot, waiting at most `LLM_SLOT_WAIT`.
    pub async fn acquire_llm_slot(&self) -> Result<SemaphorePermit<'_>, ApiError> {
        match tokio::time::timeout(LLM_SLOT_WAIT, self.inner.llm_gate.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(ApiError::UpstreamUnavailable {
                retry_after: LLM_SLOT_WAIT.as_secs(),
            }),
        }
    }

    /// Take the per-submission rerun lock, or report the holder.
    pub fn try_lock_rerun(&self, id: Uuid) -> Option<RerunGuard> {
        let mut locks = self.inner.rerun_locks.lock().ok()?;
        if !locks.insert(id) {
            return None;
        }
        Some(RerunGuard {
            id,
            locks: self.inner.rerun_locks.clone(),
        })
    }
}

/// Advisory lock for one submission's rerun; released on drop.
pub struct RerunGuard {
    id: Uuid,
    locks: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for RerunGuard {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(&self.id);
        }
    }
}

// ═══════════════════════════════════════════
// Wire DTOs
// ═══════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct ApiKeyResponse {
    pub key: String,
    pub name: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub submission_id: Uuid,
    pub patient_id: String,
    pub status: SubmissionStatus,
    pub db_persisted: bool,
    pub fhir_bundle: Value,
}

#[derive(Debug, Serialize)]
pub struct SubmissionDto {
    pub id: Uuid,
    pub patient_id: String,
    pub filename: String,
    pub image_url: Option<String>,
    pub status: SubmissionStatus,
    pub fhir_bundle: Value,
    pub raw_extraction: String,
    pub doctor_notes: String,
    pub ai_summary: String,
    pub created_at: DateTime<Utc>,
}

impl From<SubmissionRecord> for SubmissionDto {
    fn from(record: SubmissionRecord) -> Self {
        Self {
            id: record.id,
            patient_id: record.patient_id,
            filename: record.filename,
            image_url: record.image_url,
            status: record.status,
            fhir_bundle: record.fhir_bundle,
            raw_extraction: record.raw_extraction,
            doctor_notes: record.doctor_notes,
            ai_summary: record.ai_summary,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct NotesRequest {
    pub notes: String,
}

#[derive(Debug, Serialize)]
pub struct NotesResponse {
    pub status: &'static str,
    pub submission_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub submission_id: Uuid,
    pub summary: String,
}

#[derive(Debug, Serialize)]
pub struct RerunResponse {
    pub submission_id: Uuid,
    pub status: &'static str,
    pub fhir_bundle: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::test_context;
    use crate::llm::ScriptedChatClient;

    #[test]
    fn rerun_lock_is_exclusive_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            ScriptedChatClient::replying(&[]),
            AppConfig::for_tests(),
            dir.path(),
        );
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();

        let guard = ctx.try_lock_rerun(id).expect("first lock succeeds");
        assert!(ctx.try_lock_rerun(id).is_none(), "second caller is rejected");
        assert!(ctx.try_lock_rerun(other).is_some(), "other ids unaffected");

        drop(guard);
        assert!(ctx.try_lock_rerun(id).is_some(), "released on drop");
    }

    #[tokio::test]
    async fn llm_gate_bounds_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_tests();
        config.llm_concurrency = 2;
        let ctx = test_context(ScriptedChatClient::replying(&[]), config, dir.path());

        let a = ctx.acquire_llm_slot().await.unwrap();
        let _b = ctx.acquire_llm_slot().await.unwrap();
        // Third request would queue; release one slot and it proceeds.
        drop(a);
        let _c = ctx.acquire_llm_slot().await.unwrap();
    }
}
