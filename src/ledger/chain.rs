//! Hash chain over ledger records.
//!
//! `chain_hash = SHA-256(ciphertext ‖ previous_chain_hash)` where the previous
//! hash is fed as its raw 32 bytes. The first record links to
//! [`GENESIS_CHAIN_HASH`].

use super::record::{map_record, RecordRow, StoredRecord, RECORD_COLUMNS};
use crate::error::{IntegrityViolation, Result};
use crate::store::GENESIS_CHAIN_HASH;
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Compute the chain hash linking `ciphertext` to `previous_hex`.
///
/// Returns `None` if `previous_hex` is not a 32-byte hex digest.
pub fn chain_hash(ciphertext: &[u8], previous_hex: &str) -> Option<String> {
    let previous = hex::decode(previous_hex).ok()?;
    if previous.len() != 32 {
        return None;
    }
    let mut h = Sha256::new();
    h.update(ciphertext);
    h.update(&previous);
    Some(hex::encode(h.finalize()))
}

/// Outcome of a full chain walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub records_checked: u64,
    pub tail_hash: String,
    pub tail_record_id: Option<i64>,
}

/// Current tail as recorded in `ledger_tail`.
pub(crate) fn read_tail(conn: &Connection) -> Result<(String, Option<i64>)> {
    Ok(conn.query_row(
        "SELECT tail_hash, last_record_id FROM ledger_tail WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?)
}

/// Check one record's own link.
pub(crate) fn check_link(record: &StoredRecord) -> std::result::Result<(), IntegrityViolation> {
    match chain_hash(&record.sealed.ciphertext, &record.previous_chain_hash) {
        Some(expected) if expected == record.chain_hash => Ok(()),
        Some(_) => Err(IntegrityViolation::ChainBreak {
            record_id: record.id,
            detail: "stored chain hash does not match recomputed hash".into(),
        }),
        None => Err(IntegrityViolation::ChainBreak {
            record_id: record.id,
            detail: "previous chain hash is malformed".into(),
        }),
    }
}

/// A malformed row breaks the chain at that row.
pub(crate) fn intact(row: RecordRow) -> std::result::Result<StoredRecord, IntegrityViolation> {
    match row {
        RecordRow::Intact(record) => Ok(record),
        RecordRow::Malformed { id, detail } => Err(IntegrityViolation::ChainBreak {
            record_id: id,
            detail: format!("stored row does not decode: {detail}"),
        }),
    }
}

/// Walk from the tail back to genesis, re-hashing every link.
///
/// Fails at the first record (in walk order) whose link does not hold, and
/// also when rows exist that the walk never reached.
pub fn verify_chain(conn: &Connection) -> Result<ChainReport> {
    let (tail_hash, tail_record_id) = read_tail(conn)?;
    let sql = format!("SELECT {RECORD_COLUMNS} FROM ledger_records ORDER BY id DESC");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map([], map_record)?;

    let mut expected = tail_hash.clone();
    let mut checked: u64 = 0;
    let mut last_seen_id: Option<i64> = None;

    while expected != GENESIS_CHAIN_HASH {
        let record = match rows.next() {
            Some(row) => intact(row?)?,
            None => {
                return Err(IntegrityViolation::ChainBreak {
                    record_id: last_seen_id.unwrap_or(0),
                    detail: format!("chain hash {expected} has no record"),
                }
                .into())
            }
        };
        if checked == 0 && tail_record_id != Some(record.id) {
            return Err(IntegrityViolation::ChainBreak {
                record_id: record.id,
                detail: "newest record is not the recorded tail".into(),
            }
            .into());
        }
        if record.chain_hash != expected {
            return Err(IntegrityViolation::ChainBreak {
                record_id: record.id,
                detail: "record does not carry the hash its successor links to".into(),
            }
            .into());
        }
        check_link(&record)?;
        expected = record.previous_chain_hash.clone();
        last_seen_id = Some(record.id);
        checked += 1;
    }

    if let Some(extra) = rows.next() {
        let record_id = match extra? {
            RecordRow::Intact(record) => record.id,
            RecordRow::Malformed { id, .. } => id,
        };
        return Err(IntegrityViolation::ChainBreak {
            record_id,
            detail: "record is not reachable from the tail".into(),
        }
        .into());
    }

    Ok(ChainReport {
        records_checked: checked,
        tail_hash,
        tail_record_id,
    })
}
