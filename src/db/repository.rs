//! Database repository shared by the template, instance and deployment stores.
//!
//! Uses prepared statements and transactions for data integrity. Each store
//! lives in its own file as a separate `impl Repository` block.

use serde::de::DeserializeOwned;
use sqlx::SqlitePool;

use crate::errors::{is_unique_violation, AppError};

/// How many times a version-number allocation is retried after losing a race.
pub(crate) const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// How many suffixed slugs are tried before giving up.
pub(crate) const MAX_SLUG_ATTEMPTS: usize = 8;

/// Database repository for all data operations.
#[derive(Clone)]
pub struct Repository {
    pub(crate) pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Lower-case, dash-separated slug derived from a display name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "screen".to_string()
    } else {
        slug
    }
}

/// Candidate slug for the given attempt: the base first, then suffixed.
pub(crate) fn slug_candidate(base: &str, attempt: usize) -> String {
    if attempt == 0 {
        base.to_string()
    } else {
        let token = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", base, &token[..6])
    }
}

/// Errors worth retrying in an allocate-insert loop: a lost uniqueness race
/// or a busy/locked database.
pub(crate) fn is_retryable(err: &sqlx::Error) -> bool {
    if is_unique_violation(err) {
        return true;
    }
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("5") | Some("6") | Some("517")
        ),
        _ => false,
    }
}

/// Serialize a value that is known to be representable as JSON.
pub(crate) fn encode<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Decode a JSON column, surfacing corruption instead of defaulting.
pub(crate) fn decode_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, AppError> {
    serde_json::from_str(raw).map_err(|e| {
        tracing::error!(column, error = %e, "Stored JSON could not be decoded");
        AppError::Internal(format!("Corrupt {} column: {}", column, e))
    })
}

/// Decode an enum column via its `from_str` helper.
pub(crate) fn decode_enum<T>(
    column: &str,
    raw: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, AppError> {
    parse(raw).ok_or_else(|| AppError::Internal(format!("Unknown {} value '{}'", column, raw)))
}
