//! Generic approval ledger.
//!
//! Averaged-value approvals, override approvals, final-consolidation
//! approvals and discussion confirmations share one table keyed by
//! `(subject_type, subject_id, approver_id)`. Rows are only ever inserted or
//! deleted; an SQLite trigger rejects updates. The business rules that differ
//! per subject (reset on override change, confirmation ordering) live in the
//! consolidation and discussion modules.

use crate::error::{Result, ReviewError};
use crate::identity::{Actor, Role};
use crate::store::rows::{get_ts, ts};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Average,
    Override,
    FinalConsolidation,
    DiscussionConfirmation,
}

impl SubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Override => "override",
            Self::FinalConsolidation => "final_consolidation",
            Self::DiscussionConfirmation => "discussion_confirmation",
        }
    }
}

/// What is being approved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    pub kind: SubjectKind,
    pub assessment_id: String,
    pub category_id: Option<String>,
}

impl Subject {
    pub fn average(assessment_id: &str, category_id: &str) -> Self {
        Self::per_category(SubjectKind::Average, assessment_id, category_id)
    }

    pub fn override_of(assessment_id: &str, category_id: &str) -> Self {
        Self::per_category(SubjectKind::Override, assessment_id, category_id)
    }

    pub fn final_consolidation(assessment_id: &str) -> Self {
        Self::whole(SubjectKind::FinalConsolidation, assessment_id)
    }

    pub fn discussion(assessment_id: &str) -> Self {
        Self::whole(SubjectKind::DiscussionConfirmation, assessment_id)
    }

    fn per_category(kind: SubjectKind, assessment_id: &str, category_id: &str) -> Self {
        Self {
            kind,
            assessment_id: assessment_id.to_string(),
            category_id: Some(category_id.to_string()),
        }
    }

    fn whole(kind: SubjectKind, assessment_id: &str) -> Self {
        Self {
            kind,
            assessment_id: assessment_id.to_string(),
            category_id: None,
        }
    }

    /// Stored key, unique across assessments.
    pub fn subject_id(&self) -> String {
        match &self.category_id {
            Some(category) => format!("{}/{}", self.assessment_id, category),
            None => self.assessment_id.clone(),
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.subject_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub approver_id: String,
    pub approver_role: Role,
    pub created_at: DateTime<Utc>,
}

/// Record `actor`'s approval. Re-approving is a no-op; returns whether a row
/// was inserted.
pub(crate) fn grant(conn: &Connection, subject: &Subject, actor: &Actor, now: DateTime<Utc>) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO approvals
            (subject_type, subject_id, approver_id, assessment_id, approver_role, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            subject.kind.as_str(),
            subject.subject_id(),
            actor.user_id,
            subject.assessment_id,
            actor.role.as_str(),
            ts(now),
        ],
    )?;
    Ok(inserted == 1)
}

/// Remove one approver's row. Returns whether anything was deleted.
pub(crate) fn revoke(conn: &Connection, subject: &Subject, approver_id: &str) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM approvals WHERE subject_type = ?1 AND subject_id = ?2 AND approver_id = ?3",
        params![subject.kind.as_str(), subject.subject_id(), approver_id],
    )?;
    Ok(deleted > 0)
}

/// Drop every approval on `subject`.
pub(crate) fn clear(conn: &Connection, subject: &Subject) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM approvals WHERE subject_type = ?1 AND subject_id = ?2",
        params![subject.kind.as_str(), subject.subject_id()],
    )?)
}

pub(crate) fn count(conn: &Connection, subject: &Subject) -> Result<u32> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM approvals WHERE subject_type = ?1 AND subject_id = ?2",
        params![subject.kind.as_str(), subject.subject_id()],
        |row| row.get(0),
    )?)
}

/// Approvals on `subject`, oldest first.
pub(crate) fn list(conn: &Connection, subject: &Subject) -> Result<Vec<Approval>> {
    let mut stmt = conn.prepare(
        "SELECT approver_id, approver_role, created_at FROM approvals
         WHERE subject_type = ?1 AND subject_id = ?2
         ORDER BY created_at ASC, approver_id ASC",
    )?;
    let rows = stmt
        .query_map(params![subject.kind.as_str(), subject.subject_id()], |row| {
            let raw_role: String = row.get(1)?;
            let approver_role = raw_role.parse().map_err(|e: ReviewError| {
                rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
            })?;
            Ok(Approval {
                approver_id: row.get(0)?,
                approver_role,
                created_at: get_ts(row, 2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
