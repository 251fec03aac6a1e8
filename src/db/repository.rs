//! Plain repository functions over a `rusqlite::Connection` for the two
//! persisted entities: submissions and API keys.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use super::DatabaseError;
use crate::pipeline::types::SubmissionStatus;

// ═══════════════════════════════════════════
// Submissions
// ═══════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub id: Uuid,
    pub patient_id: String,
    /// Comma-joined original filenames; the first is the primary file.
    pub filename: String,
    pub image_url: Option<String>,
    pub status: SubmissionStatus,
    pub fhir_bundle: Value,
    pub raw_extraction: String,
    pub doctor_notes: String,
    pub ai_summary: String,
    pub created_at: DateTime<Utc>,
}

const SUBMISSION_COLUMNS: &str = "id, patient_id, filename, image_url, status, fhir_bundle, \
     raw_extraction, doctor_notes, ai_summary, created_at";

/// Insert a new submission atomically.
pub fn insert_submission(
    conn: &Connection,
    record: &SubmissionRecord,
) -> Result<(), DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO submissions (id, patient_id, filename, image_url, status, fhir_bundle,
         raw_extraction, doctor_notes, ai_summary, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.id.to_string(),
            record.patient_id,
            record.filename,
            record.image_url,
            record.status.as_str(),
            record.fhir_bundle.to_string(),
            record.raw_extraction,
            record.doctor_notes,
            record.ai_summary,
            record.created_at.to_rfc3339(),
        ],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn get_submission(
    conn: &Connection,
    id: &Uuid,
) -> Result<Option<SubmissionRecord>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE id = ?1"
    ))?;
    let result = stmt
        .query_row(params![id.to_string()], submission_row)
        .optional()?;
    result.map(submission_from_row).transpose()
}

/// Replace the pipeline output after a rerun, refreshing `created_at`
/// so the record surfaces at the top of the clinician's timeline.
/// Returns false when the submission does not exist.
pub fn apply_rerun(
    conn: &Connection,
    id: &Uuid,
    bundle: &Value,
    raw_extraction: &str,
    status: SubmissionStatus,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE submissions
         SET fhir_bundle = ?2, raw_extraction = ?3, status = ?4, created_at = ?5
         WHERE id = ?1",
        params![
            id.to_string(),
            bundle.to_string(),
            raw_extraction,
            status.as_str(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(changed > 0)
}

pub fn update_doctor_notes(
    conn: &Connection,
    id: &Uuid,
    notes: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE submissions SET doctor_notes = ?2 WHERE id = ?1",
        params![id.to_string(), notes],
    )?;
    Ok(changed > 0)
}

pub fn update_ai_summary(
    conn: &Connection,
    id: &Uuid,
    summary: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE submissions SET ai_summary = ?2 WHERE id = ?1",
        params![id.to_string(), summary],
    )?;
    Ok(changed > 0)
}

pub fn list_recent(
    conn: &Connection,
    limit: usize,
) -> Result<Vec<SubmissionRecord>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBMISSION_COLUMNS} FROM submissions ORDER BY created_at DESC LIMIT ?1"
    ))?;
    let rows = stmt.query_map(params![limit as i64], submission_row)?;
    collect_submissions(rows)
}

pub fn patient_history(
    conn: &Connection,
    patient_id: &str,
) -> Result<Vec<SubmissionRecord>, DatabaseError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBMISSION_COLUMNS} FROM submissions WHERE patient_id = ?1
         ORDER BY created_at DESC"
    ))?;
    let rows = stmt.query_map(params![patient_id], submission_row)?;
    collect_submissions(rows)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PatientSummary {
    pub patient_id: String,
    pub file_count: i64,
    pub last_updated: String,
}

pub fn list_patients(conn: &Connection) -> Result<Vec<PatientSummary>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT patient_id, COUNT(*) AS file_count, MAX(created_at) AS last_updated
         FROM submissions GROUP BY patient_id ORDER BY last_updated DESC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(PatientSummary {
            patient_id: row.get(0)?,
            file_count: row.get(1)?,
            last_updated: row.get(2)?,
        })
    })?;
    let mut summaries = Vec::new();
    for row in rows {
        summaries.push(row?);
    }
    Ok(summaries)
}

/// All submission ids, for the orphan-file janitor.
pub fn all_submission_ids(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT id FROM submissions")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

// Internal row type before json/uuid/date decoding.
struct SubmissionRow {
    id: String,
    patient_id: String,
    filename: String,
    image_url: Option<String>,
    status: String,
    fhir_bundle: String,
    raw_extraction: String,
    doctor_notes: String,
    ai_summary: String,
    created_at: String,
}

fn submission_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubmissionRow> {
    Ok(SubmissionRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        filename: row.get(2)?,
        image_url: row.get(3)?,
        status: row.get(4)?,
        fhir_bundle: row.get(5)?,
        raw_extraction: row.get(6)?,
        doctor_notes: row.get(7)?,
        ai_summary: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn submission_from_row(row: SubmissionRow) -> Result<SubmissionRecord, DatabaseError> {
    Ok(SubmissionRecord {
        id: Uuid::parse_str(&row.id)
            .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?,
        patient_id: row.patient_id,
        filename: row.filename,
        image_url: row.image_url,
        status: SubmissionStatus::parse(&row.status).ok_or_else(|| {
            DatabaseError::ConstraintViolation(format!("unknown status {}", row.status))
        })?,
        fhir_bundle: serde_json::from_str(&row.fhir_bundle)
            .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?,
        raw_extraction: row.raw_extraction,
        doctor_notes: row.doctor_notes,
        ai_summary: row.ai_summary,
        created_at: DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?
            .with_timezone(&Utc),
    })
}

fn collect_submissions<F>(
    rows: rusqlite::MappedRows<'_, F>,
) -> Result<Vec<SubmissionRecord>, DatabaseError>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<SubmissionRow>,
{
    let mut records = Vec::new();
    for row in rows {
        records.push(submission_from_row(row?)?);
    }
    Ok(records)
}

// ═══════════════════════════════════════════
// API keys
// ═══════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub key: String,
    pub name: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

pub fn insert_api_key(conn: &Connection, record: &ApiKeyRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO api_keys (key, name, role, is_active, created_at, last_used_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.key,
            record.name,
            record.role,
            record.is_active as i32,
            record.created_at.to_rfc3339(),
            record.last_used_at.map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn get_api_key(conn: &Connection, key: &str) -> Result<Option<ApiKeyRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT key, name, role, is_active, created_at, last_used_at
         FROM api_keys WHERE key = ?1",
    )?;
    let row = stmt
        .query_row(params![key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })
        .optional()?;

    row.map(|(key, name, role, is_active, created_at, last_used_at)| {
        Ok(ApiKeyRecord {
            key,
            name,
            role,
            is_active: is_active != 0,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?
                .with_timezone(&Utc),
            last_used_at: last_used_at
                .map(|t| {
                    DateTime::parse_from_rfc3339(&t)
                        .map(|d| d.with_timezone(&Utc))
                        .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
                })
                .transpose()?,
        })
    })
    .transpose()
}

/// Record key usage. Best-effort bookkeeping: callers log and ignore
/// failures.
pub fn touch_api_key(conn: &Connection, key: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE api_keys SET last_used_at = ?2 WHERE key = ?1",
        params![key, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Flip the revocation flag. Returns false when the key does not exist.
pub fn set_api_key_active(
    conn: &Connection,
    key: &str,
    active: bool,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE api_keys SET is_active = ?2 WHERE key = ?1",
        params![key, active as i32],
    )?;
    Ok(changed > 0)
}
