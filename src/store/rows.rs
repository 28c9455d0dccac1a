//! Row mapping helpers shared by the ledger and the review service.

use crate::error::{Result, ReviewError};
use crate::review::lifecycle::{Assessment, AssessmentStatus, Timestamps};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// Canonical stored form of a timestamp (RFC 3339, millisecond precision, `Z`).
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn opt_ts(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn get_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<AssessmentStatus> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: ReviewError| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn get_opt_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<AssessmentStatus>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse().map_err(|e: ReviewError| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
    })
    .transpose()
}

const ASSESSMENT_COLUMNS: &str = "id, catalog_id, owner_id, status, previous_status, created_at,
     submitted_at, in_review_at, consolidation_at, reviewed_at, discussion_at,
     archived_at, closed_at, revert_deadline, updated_at";

fn map_assessment(row: &Row<'_>) -> rusqlite::Result<Assessment> {
    Ok(Assessment {
        id: row.get(0)?,
        catalog_id: row.get(1)?,
        owner_id: row.get(2)?,
        status: get_status(row, 3)?,
        previous_status: get_opt_status(row, 4)?,
        created_at: get_ts(row, 5)?,
        timestamps: Timestamps {
            submitted_at: get_opt_ts(row, 6)?,
            in_review_at: get_opt_ts(row, 7)?,
            consolidation_at: get_opt_ts(row, 8)?,
            reviewed_at: get_opt_ts(row, 9)?,
            discussion_at: get_opt_ts(row, 10)?,
            archived_at: get_opt_ts(row, 11)?,
            closed_at: get_opt_ts(row, 12)?,
        },
        revert_deadline: get_opt_ts(row, 13)?,
        updated_at: get_ts(row, 14)?,
    })
}

pub(crate) fn find_assessment(conn: &Connection, id: &str) -> Result<Option<Assessment>> {
    let sql = format!("SELECT {ASSESSMENT_COLUMNS} FROM assessments WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], map_assessment).optional()?)
}

pub(crate) fn load_assessment(conn: &Connection, id: &str) -> Result<Assessment> {
    find_assessment(conn, id)?
        .ok_or_else(|| ReviewError::not_found(format!("assessment {id}")))
}

pub(crate) fn list_assessments_for_owner(conn: &Connection, owner_id: &str) -> Result<Vec<Assessment>> {
    let sql = format!(
        "SELECT {ASSESSMENT_COLUMNS} FROM assessments WHERE owner_id = ?1 ORDER BY created_at DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![owner_id], map_assessment)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn insert_assessment(conn: &Connection, a: &Assessment) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO assessments (id, catalog_id, owner_id, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![a.id, a.catalog_id, a.owner_id, a.status.as_str(), ts(a.created_at), ts(a.updated_at)],
    );
    match result {
        Ok(_) => Ok(()),
        Err(e) if crate::error::is_constraint_violation(&e) => Err(ReviewError::guard(format!(
            "owner {} already has an active assessment for catalog {}",
            a.owner_id, a.catalog_id
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Persist `a` only if the stored status is still `expected`.
///
/// Zero matched rows means another writer moved the assessment first.
pub(crate) fn save_assessment_if(conn: &Connection, a: &Assessment, expected: AssessmentStatus) -> Result<()> {
    let t = &a.timestamps;
    let result = conn.execute(
        "UPDATE assessments SET
            status = ?1, previous_status = ?2,
            submitted_at = ?3, in_review_at = ?4, consolidation_at = ?5, reviewed_at = ?6,
            discussion_at = ?7, archived_at = ?8, closed_at = ?9, revert_deadline = ?10,
            updated_at = ?11
         WHERE id = ?12 AND status = ?13",
        params![
            a.status.as_str(),
            a.previous_status.map(|s| s.as_str()),
            opt_ts(t.submitted_at),
            opt_ts(t.in_review_at),
            opt_ts(t.consolidation_at),
            opt_ts(t.reviewed_at),
            opt_ts(t.discussion_at),
            opt_ts(t.archived_at),
            opt_ts(t.closed_at),
            opt_ts(a.revert_deadline),
            ts(a.updated_at),
            a.id,
            expected.as_str(),
        ],
    );
    match result {
        Ok(1) => Ok(()),
        Ok(_) => Err(ReviewError::conflict(format!(
            "assessment {} is no longer {}",
            a.id, expected
        ))),
        Err(e) if crate::error::is_constraint_violation(&e) => Err(ReviewError::guard(format!(
            "owner {} already has an active assessment for catalog {}",
            a.owner_id, a.catalog_id
        ))),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use chrono::{Duration, TimeZone};

    #[test]
    fn timestamps_survive_storage() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        let mut a = Assessment::new("a1".into(), "cat".into(), "owner".into(), now);
        db.write(|tx| insert_assessment(tx, &a)).unwrap();

        a.advance(AssessmentStatus::Submitted, now + Duration::minutes(5)).unwrap();
        db.write(|tx| save_assessment_if(tx, &a, AssessmentStatus::Draft)).unwrap();

        let loaded = db.read(|conn| load_assessment(conn, "a1")).unwrap();
        assert_eq!(loaded, a);
    }

    #[test]
    fn stale_expected_status_is_a_conflict() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let mut a = Assessment::new("a1".into(), "cat".into(), "owner".into(), now);
        db.write(|tx| insert_assessment(tx, &a)).unwrap();
        a.advance(AssessmentStatus::Submitted, now).unwrap();
        db.write(|tx| save_assessment_if(tx, &a, AssessmentStatus::Draft)).unwrap();

        // A second writer that still believes the assessment is a draft loses.
        let err = db
            .write(|tx| save_assessment_if(tx, &a, AssessmentStatus::Draft))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn second_active_assessment_for_same_catalog_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let first = Assessment::new("a1".into(), "cat".into(), "owner".into(), now);
        let second = Assessment::new("a2".into(), "cat".into(), "owner".into(), now);
        db.write(|tx| insert_assessment(tx, &first)).unwrap();
        let err = db.write(|tx| insert_assessment(tx, &second)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Guard);
    }

    #[test]
    fn missing_assessment_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db.read(|conn| load_assessment(conn, "nope")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
