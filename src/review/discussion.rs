//! Discussion and two-party confirmation.
//!
//! Entering discussion freezes the consolidated outcome into a
//! [`DiscussionResult`] snapshot. The row is immutable in SQLite. After that
//! a panel reviewer confirms the result was communicated, then the owner
//! confirms; the owner's confirmation archives the assessment.

use super::approvals::{self, Approval, Subject};
use super::assessment::{advance, load_responses, load_reviewer_responses};
use super::consolidation::{board_in, load_final, overall, ProposalSource};
use super::lifecycle::{Assessment, AssessmentStatus};
use super::{load_viewable, require_panel_or_admin, require_party, resource, ReviewService};
use crate::catalog::Catalog;
use crate::error::{Result, ReviewError};
use crate::identity::{Actor, Role};
use crate::ledger::{LedgerRef, RecordType};
use crate::store::rows::{get_ts, load_assessment, ts};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceSnapshot {
    pub path_id: String,
    pub level_id: String,
    pub level_number: u32,
}

/// Owner vs panel comparison for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryOutcome {
    pub category_id: String,
    pub name: String,
    pub weight: u32,
    pub owner: Option<ChoiceSnapshot>,
    /// Keyed by reviewer id.
    pub reviewers: BTreeMap<String, ChoiceSnapshot>,
    pub finalized: ChoiceSnapshot,
    pub source: ProposalSource,
    /// Finalized level minus the owner's own level.
    pub owner_delta: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionResult {
    pub assessment_id: String,
    pub overall_score: f64,
    pub overall_level_number: u32,
    pub categories: Vec<CategoryOutcome>,
    pub final_comment_ref: Option<LedgerRef>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscussionNote {
    pub id: i64,
    pub author_id: String,
    pub note_ref: Option<LedgerRef>,
    pub created_at: DateTime<Utc>,
}

/// The frozen result plus the live confirmation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscussionView {
    pub result: DiscussionResult,
    pub confirmations: Vec<Approval>,
    pub reviewer_confirmed: bool,
    pub owner_confirmed: bool,
    pub notes: Vec<DiscussionNote>,
}

impl ReviewService {
    /// reviewed → discussion. Generates the immutable result in the same unit.
    pub fn start_discussion(&self, actor: &Actor, assessment_id: &str) -> Result<DiscussionResult> {
        self.audited(actor, "assessment.start_discussion", resource(assessment_id), || {
            let now = self.now();
            self.db.write(|tx| {
                let mut a = load_assessment(tx, assessment_id)?;
                require_panel_or_admin(tx, actor, &a)?;
                a.require_status(&[AssessmentStatus::Reviewed])?;

                let catalog = self.catalog_for(&a)?;
                let result = build_result(tx, &catalog, &a, self.config.quorum, now)?;
                let snapshot = serde_json::to_string(&result)
                    .map_err(|e| ReviewError::validation(format!("cannot encode discussion result: {e}")))?;
                let inserted = tx.execute(
                    "INSERT INTO discussion_results
                        (assessment_id, overall_score, overall_level_number, final_comment_ref,
                         snapshot_json, generated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        assessment_id,
                        result.overall_score,
                        result.overall_level_number,
                        result.final_comment_ref.map(|r| r.0),
                        snapshot,
                        ts(now),
                    ],
                );
                match inserted {
                    Ok(_) => {}
                    Err(e) if crate::error::is_constraint_violation(&e) => {
                        return Err(ReviewError::guard(format!(
                            "discussion result for {assessment_id} already exists"
                        )))
                    }
                    Err(e) => return Err(e.into()),
                }

                advance(tx, &mut a, AssessmentStatus::Discussion, now)?;
                Ok(result)
            })
        })
    }

    pub fn discussion(&self, actor: &Actor, assessment_id: &str) -> Result<DiscussionView> {
        self.db.read(|conn| {
            load_viewable(conn, actor, assessment_id)?;
            let result = load_result(conn, assessment_id)?.ok_or_else(|| {
                ReviewError::not_found(format!("discussion result for assessment {assessment_id}"))
            })?;
            let confirmations = approvals::list(conn, &Subject::discussion(assessment_id))?;
            let reviewer_confirmed = confirmations.iter().any(|c| c.approver_role == Role::Reviewer);
            let owner_confirmed = confirmations.iter().any(|c| c.approver_role == Role::Owner);
            Ok(DiscussionView {
                result,
                confirmations,
                reviewer_confirmed,
                owner_confirmed,
                notes: load_notes(conn, assessment_id)?,
            })
        })
    }

    pub fn add_discussion_note(&self, actor: &Actor, assessment_id: &str, text: &str) -> Result<DiscussionNote> {
        self.audited(actor, "discussion.note", resource(assessment_id), || {
            let now = self.now();
            self.write_with_text(actor, RecordType::DiscussionNote, Some(text), |tx, note_ref| {
                let a = load_assessment(tx, assessment_id)?;
                require_party(tx, actor, &a)?;
                a.require_status(&[AssessmentStatus::Discussion])?;
                tx.execute(
                    "INSERT INTO discussion_notes (assessment_id, author_id, note_ref, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![assessment_id, actor.user_id, note_ref.map(|r| r.0), ts(now)],
                )?;
                Ok(DiscussionNote {
                    id: tx.last_insert_rowid(),
                    author_id: actor.user_id.clone(),
                    note_ref,
                    created_at: now,
                })
            })
        })
    }

    /// Record the actor's confirmation. A panel reviewer must confirm before
    /// the owner; the owner's confirmation archives the assessment.
    pub fn confirm_discussion(&self, actor: &Actor, assessment_id: &str) -> Result<Assessment> {
        self.audited(actor, "discussion.confirm", resource(assessment_id), || {
            let now = self.now();
            self.db.write(|tx| {
                let mut a = load_assessment(tx, assessment_id)?;
                require_party(tx, actor, &a)?;
                if actor.is_admin() {
                    return Err(ReviewError::forbidden("admins do not confirm discussions"));
                }
                a.require_status(&[AssessmentStatus::Discussion])?;

                let subject = Subject::discussion(assessment_id);
                let owner_side = actor.role == Role::Owner;
                if owner_side {
                    let reviewer_side = approvals::list(tx, &subject)?
                        .iter()
                        .any(|c| c.approver_role == Role::Reviewer);
                    if !reviewer_side {
                        return Err(ReviewError::guard(
                            "a reviewer must confirm the discussion before the owner",
                        ));
                    }
                }
                if !approvals::grant(tx, &subject, actor, now)? {
                    return Err(ReviewError::guard(format!(
                        "{actor} already confirmed the discussion"
                    )));
                }

                if owner_side {
                    advance(tx, &mut a, AssessmentStatus::Archived, now)?;
                }
                Ok(a)
            })
        })
    }
}

fn snapshot(catalog: &Catalog, path_id: &str, level_id: &str) -> ChoiceSnapshot {
    ChoiceSnapshot {
        path_id: path_id.to_string(),
        level_id: level_id.to_string(),
        level_number: catalog.level(level_id).map_or(0, |l| l.number),
    }
}

fn build_result(
    conn: &Connection,
    catalog: &Catalog,
    a: &Assessment,
    quorum: u32,
    now: DateTime<Utc>,
) -> Result<DiscussionResult> {
    let board = board_in(conn, catalog, &a.id, quorum)?;
    let score = overall(&board)
        .ok_or_else(|| ReviewError::guard("not every category has an approved proposal"))?;

    let owner: BTreeMap<String, ChoiceSnapshot> = load_responses(conn, &a.id)?
        .into_iter()
        .map(|r| (r.category_id, snapshot(catalog, &r.path_id, &r.level_id)))
        .collect();
    let mut reviewers: BTreeMap<String, BTreeMap<String, ChoiceSnapshot>> = BTreeMap::new();
    for r in load_reviewer_responses(conn, &a.id)? {
        reviewers
            .entry(r.category_id)
            .or_default()
            .insert(r.reviewer_id, snapshot(catalog, &r.path_id, &r.level_id));
    }

    let mut categories = Vec::with_capacity(board.len());
    for entry in board {
        let Some(finalized) = entry.finalized else {
            return Err(ReviewError::guard(format!(
                "category {} has no approved proposal",
                entry.category_id
            )));
        };
        let name = catalog
            .category(&entry.category_id)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        let owner_choice = owner.get(&entry.category_id).cloned();
        let owner_delta = owner_choice
            .as_ref()
            .map(|o| i64::from(finalized.level_number) - i64::from(o.level_number));
        categories.push(CategoryOutcome {
            name,
            weight: entry.weight,
            owner: owner_choice,
            reviewers: reviewers.remove(&entry.category_id).unwrap_or_default(),
            finalized: ChoiceSnapshot {
                path_id: finalized.path_id,
                level_id: finalized.level_id,
                level_number: finalized.level_number,
            },
            source: finalized.source,
            owner_delta,
            category_id: entry.category_id,
        });
    }

    let final_comment_ref = load_final(conn, &a.id)?.and_then(|f| f.comment_ref);
    tracing::info!(
        assessment_id = %a.id,
        overall = score.score,
        level = score.level_number,
        "Discussion result generated"
    );
    Ok(DiscussionResult {
        assessment_id: a.id.clone(),
        overall_score: score.score,
        overall_level_number: score.level_number,
        categories,
        final_comment_ref,
        generated_at: now,
    })
}

fn load_result(conn: &Connection, assessment_id: &str) -> Result<Option<DiscussionResult>> {
    Ok(conn
        .query_row(
            "SELECT snapshot_json FROM discussion_results WHERE assessment_id = ?1",
            params![assessment_id],
            |row| {
                let raw: String = row.get(0)?;
                serde_json::from_str(&raw)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
            },
        )
        .optional()?)
}

fn load_notes(conn: &Connection, assessment_id: &str) -> Result<Vec<DiscussionNote>> {
    let mut stmt = conn.prepare(
        "SELECT id, author_id, note_ref, created_at FROM discussion_notes
         WHERE assessment_id = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![assessment_id], |row| {
            Ok(DiscussionNote {
                id: row.get(0)?,
                author_id: row.get(1)?,
                note_ref: row.get::<_, Option<i64>>(2)?.map(LedgerRef),
                created_at: get_ts(row, 3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
