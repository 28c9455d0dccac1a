use crate::error::{IntegrityViolation, Result, ReviewError};
use crate::keys::{KeyHandle, SealedBox};
use crate::store::rows::get_ts;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reference from an owning row into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerRef(pub i64);

impl fmt::Display for LedgerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ledger#{}", self.0)
    }
}

/// What kind of owner a payload was written for. Bound into the AEAD as
/// associated data, so relabelling a row breaks decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    AssessmentResponse,
    ReviewerResponse,
    Override,
    DiscussionNote,
    FinalComment,
    CategoryComment,
}

impl RecordType {
    pub const ALL: [Self; 6] = [
        Self::AssessmentResponse,
        Self::ReviewerResponse,
        Self::Override,
        Self::DiscussionNote,
        Self::FinalComment,
        Self::CategoryComment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AssessmentResponse => "assessment_response",
            Self::ReviewerResponse => "reviewer_response",
            Self::Override => "override",
            Self::DiscussionNote => "discussion_note",
            Self::FinalComment => "final_comment",
            Self::CategoryComment => "category_comment",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = ReviewError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ReviewError::validation(format!("unknown record type '{s}'")))
    }
}

/// A ledger row exactly as stored.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: i64,
    pub record_type: RecordType,
    pub sealed: SealedBox,
    pub key: KeyHandle,
    pub signature: Vec<u8>,
    pub signer_public_key: Vec<u8>,
    pub signer_id: String,
    pub previous_chain_hash: String,
    pub chain_hash: String,
    pub created_at: DateTime<Utc>,
}

pub(crate) const RECORD_COLUMNS: &str = "id, record_type, ciphertext, nonce, tag, key_version, key_id,
     signature, signer_public_key, signer_id, previous_chain_hash, chain_hash, created_at";

/// One `ledger_records` row, decoded as far as its stored values allow.
#[derive(Debug, Clone)]
pub(crate) enum RecordRow {
    Intact(StoredRecord),
    /// The row exists but a column does not hold what the ledger wrote.
    Malformed { id: i64, detail: String },
}

impl RecordRow {
    /// Intact record, or `PayloadTampered` for a malformed row.
    pub(crate) fn into_record(self) -> std::result::Result<StoredRecord, IntegrityViolation> {
        match self {
            Self::Intact(record) => Ok(record),
            Self::Malformed { id, detail } => {
                tracing::error!(record_id = id, %detail, "Ledger row is malformed");
                Err(IntegrityViolation::PayloadTampered { record_id: id })
            }
        }
    }
}

/// Row mapper for [`RECORD_COLUMNS`]. Only a missing id is a storage error;
/// any other value that fails to decode marks the row as malformed.
pub(crate) fn map_record(row: &Row<'_>) -> rusqlite::Result<RecordRow> {
    let id: i64 = row.get(0)?;
    Ok(match decode(row, id) {
        Ok(record) => RecordRow::Intact(record),
        Err(e) => RecordRow::Malformed {
            id,
            detail: e.to_string(),
        },
    })
}

fn decode(row: &Row<'_>, id: i64) -> rusqlite::Result<StoredRecord> {
    let raw_type: String = row.get(1)?;
    let record_type = raw_type.parse().map_err(|e: ReviewError| {
        rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
    })?;
    Ok(StoredRecord {
        id,
        record_type,
        sealed: SealedBox {
            ciphertext: row.get(2)?,
            nonce: row.get(3)?,
            tag: row.get(4)?,
        },
        key: KeyHandle {
            version: row.get(5)?,
            key_id: row.get(6)?,
        },
        signature: row.get(7)?,
        signer_public_key: row.get(8)?,
        signer_id: row.get(9)?,
        previous_chain_hash: row.get(10)?,
        chain_hash: row.get(11)?,
        created_at: get_ts(row, 12)?,
    })
}

pub(crate) fn find_record(conn: &Connection, id: i64) -> Result<Option<RecordRow>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM ledger_records WHERE id = ?1");
    Ok(conn
        .query_row(&sql, rusqlite::params![id], map_record)
        .optional()?)
}
