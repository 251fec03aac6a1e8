//! API key issuance and verification.
//!
//! Keys are `sk-` followed by 32 random bytes in hex. Verification
//! compares in constant time: a candidate is checked against the
//! configured master key and then against the stored key row, with no
//! early exit on the first mismatching byte.

use chrono::Utc;
use rand::RngCore;
use rusqlite::Connection;
use subtle::ConstantTimeEq;

use crate::db::{self, ApiKeyRecord, DatabaseError};

pub const KEY_PREFIX: &str = "sk-";

/// Roles an API key can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRole {
    Admin,
    Frontend,
    Service,
    Internal,
}

impl AuthRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthRole::Admin => "admin",
            AuthRole::Frontend => "frontend",
            AuthRole::Service => "service",
            AuthRole::Internal => "internal",
        }
    }

    pub fn parse(value: &str) -> Option<AuthRole> {
        match value {
            "admin" => Some(AuthRole::Admin),
            "frontend" => Some(AuthRole::Frontend),
            "service" => Some(AuthRole::Service),
            "internal" => Some(AuthRole::Internal),
            _ => None,
        }
    }
}

/// Generate a fresh API key: `sk-` + 64 hex characters.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{KEY_PREFIX}{hex}")
}

/// Issue and persist a new frontend key.
pub fn register_key(conn: &Connection) -> Result<ApiKeyRecord, DatabaseError> {
    let now = Utc::now();
    let record = ApiKeyRecord {
        key: generate_api_key(),
        name: format!("Frontend Client {}", now.format("%Y-%m-%d %H:%M")),
        role: AuthRole::Frontend.as_str().to_string(),
        is_active: true,
        created_at: now,
        last_used_at: None,
    };
    db::insert_api_key(conn, &record)?;
    Ok(record)
}

/// Constant-time string equality. Length mismatch is decided after a
/// full-width comparison against the candidate itself, so timing does
/// not reveal a prefix match.
pub fn keys_match(expected: &str, candidate: &str) -> bool {
    let expected_bytes = expected.as_bytes();
    let candidate_bytes = candidate.as_bytes();
    if expected_bytes.len() != candidate_bytes.len() {
        // Burn comparable time, then fail.
        let _ = candidate_bytes.ct_eq(candidate_bytes);
        return false;
    }
    expected_bytes.ct_eq(candidate_bytes).into()
}

/// Verify a bearer token. Order: master key, then the key store. On a
/// store match the `last_used_at` column is updated best-effort.
pub fn verify_token(
    conn: &Connection,
    master_key: Option<&str>,
    token: &str,
) -> Result<Option<AuthRole>, DatabaseError> {
    if let Some(master) = master_key {
        if keys_match(master, token) {
            return Ok(Some(AuthRole::Admin));
        }
    }

    let Some(record) = db::get_api_key(conn, token)? else {
        return Ok(None);
    };
    if !record.is_active || !keys_match(&record.key, token) {
        return Ok(None);
    }

    if let Err(e) = db::touch_api_key(conn, token) {
        tracing::warn!(error = %e, "Failed to record key usage");
    }
    Ok(AuthRole::parse(&record.role).or(Some(AuthRole::Frontend)))
}
