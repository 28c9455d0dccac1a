//! Owner drafting, reviewer judging, and the lifecycle transitions around them.

use super::aggregation::CompletionReport;
use super::lifecycle::{Assessment, AssessmentStatus};
use super::{
    category_resource, consolidation, enroll, is_enrolled, load_viewable, panel, require_owner,
    require_owner_or_admin, require_panel_or_admin, require_reviewer, resource, ReviewService,
};
use crate::catalog::Catalog;
use crate::error::{Result, ReviewError};
use crate::identity::{Actor, Role};
use crate::ledger::{LedgerRef, RecordType};
use crate::store::rows::{
    get_ts, insert_assessment, load_assessment, save_assessment_if, ts,
};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A (category, path, level) judgment with optional free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInput {
    pub category_id: String,
    pub path_id: String,
    pub level_id: String,
    pub justification: Option<String>,
}

impl ResponseInput {
    pub fn new(category_id: impl Into<String>, path_id: impl Into<String>, level_id: impl Into<String>) -> Self {
        Self {
            category_id: category_id.into(),
            path_id: path_id.into(),
            level_id: level_id.into(),
            justification: None,
        }
    }

    pub fn with_justification(mut self, text: impl Into<String>) -> Self {
        self.justification = Some(text.into());
        self
    }
}

/// The owner's self-judgment for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentResponse {
    pub category_id: String,
    pub path_id: String,
    pub level_id: String,
    pub justification_ref: Option<LedgerRef>,
    pub updated_at: DateTime<Utc>,
}

/// One reviewer's judgment for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerResponse {
    pub reviewer_id: String,
    pub category_id: String,
    pub path_id: String,
    pub level_id: String,
    pub justification_ref: Option<LedgerRef>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewService {
    // ── Owner side ─────────────────────────────────────────────────

    pub fn create_assessment(&self, actor: &Actor, catalog_id: &str) -> Result<Assessment> {
        self.audited(actor, "assessment.create", format!("catalog/{catalog_id}"), || {
            if actor.role != Role::Owner {
                return Err(ReviewError::forbidden(format!(
                    "{actor} cannot create assessments"
                )));
            }
            self.catalog(catalog_id)?;
            let now = self.now();
            let assessment = Assessment::new(
                uuid::Uuid::new_v4().to_string(),
                catalog_id.to_string(),
                actor.user_id.clone(),
                now,
            );
            self.db.write(|tx| insert_assessment(tx, &assessment))?;
            tracing::info!(
                assessment_id = %assessment.id,
                owner = %actor.user_id,
                catalog = catalog_id,
                "Assessment created"
            );
            Ok(assessment)
        })
    }

    /// Create or replace the owner's response for one category.
    pub fn save_response(
        &self,
        actor: &Actor,
        assessment_id: &str,
        input: ResponseInput,
    ) -> Result<AssessmentResponse> {
        let res = category_resource(assessment_id, &input.category_id);
        self.audited(actor, "response.save", res, || {
            let now = self.now();
            self.write_with_text(
                actor,
                RecordType::AssessmentResponse,
                input.justification.as_deref(),
                |tx, justification_ref| {
                    let a = load_assessment(tx, assessment_id)?;
                    require_owner(actor, &a)?;
                    a.require_status(&[AssessmentStatus::Draft])?;
                    self.catalog_for(&a)?
                        .resolve_choice(&input.category_id, &input.path_id, &input.level_id)?;

                    tx.execute(
                        "INSERT INTO assessment_responses
                            (assessment_id, category_id, path_id, level_id, justification_ref, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(assessment_id, category_id) DO UPDATE SET
                            path_id = excluded.path_id,
                            level_id = excluded.level_id,
                            justification_ref = excluded.justification_ref,
                            updated_at = excluded.updated_at",
                        params![
                            assessment_id,
                            input.category_id,
                            input.path_id,
                            input.level_id,
                            justification_ref.map(|r| r.0),
                            ts(now),
                        ],
                    )?;
                    Ok(AssessmentResponse {
                        category_id: input.category_id.clone(),
                        path_id: input.path_id.clone(),
                        level_id: input.level_id.clone(),
                        justification_ref,
                        updated_at: now,
                    })
                },
            )
        })
    }

    /// Drop the owner's response for one category. The justification stays in
    /// the ledger; only the reference goes away.
    pub fn delete_response(&self, actor: &Actor, assessment_id: &str, category_id: &str) -> Result<bool> {
        self.audited(actor, "response.delete", category_resource(assessment_id, category_id), || {
            self.db.write(|tx| {
                let a = load_assessment(tx, assessment_id)?;
                require_owner(actor, &a)?;
                a.require_status(&[AssessmentStatus::Draft])?;
                let deleted = tx.execute(
                    "DELETE FROM assessment_responses WHERE assessment_id = ?1 AND category_id = ?2",
                    params![assessment_id, category_id],
                )?;
                Ok(deleted > 0)
            })
        })
    }

    pub fn responses(&self, actor: &Actor, assessment_id: &str) -> Result<Vec<AssessmentResponse>> {
        self.db.read(|conn| {
            load_viewable(conn, actor, assessment_id)?;
            load_responses(conn, assessment_id)
        })
    }

    /// draft → submitted, once every required category is answered.
    pub fn submit(&self, actor: &Actor, assessment_id: &str) -> Result<Assessment> {
        self.audited(actor, "assessment.submit", resource(assessment_id), || {
            let now = self.now();
            self.db.write(|tx| {
                let mut a = load_assessment(tx, assessment_id)?;
                require_owner(actor, &a)?;
                a.require_status(&[AssessmentStatus::Draft])?;

                let catalog = self.catalog_for(&a)?;
                let answered: BTreeSet<String> = load_responses(tx, assessment_id)?
                    .into_iter()
                    .map(|r| r.category_id)
                    .collect();
                let missing: Vec<&str> = catalog
                    .required_categories()
                    .filter(|c| !answered.contains(&c.id))
                    .map(|c| c.id.as_str())
                    .collect();
                if !missing.is_empty() {
                    return Err(ReviewError::guard(format!(
                        "required categories without a response: {}",
                        missing.join(", ")
                    )));
                }

                advance(tx, &mut a, AssessmentStatus::Submitted, now)?;
                Ok(a)
            })
        })
    }

    // ── Panel side ─────────────────────────────────────────────────

    /// Put a reviewer on the panel ahead of time.
    pub fn assign_reviewer(&self, actor: &Actor, assessment_id: &str, reviewer_id: &str) -> Result<bool> {
        let res = format!("{}/reviewer/{reviewer_id}", resource(assessment_id));
        self.audited(actor, "panel.assign", res, || {
            if !actor.is_admin() {
                return Err(ReviewError::forbidden(format!("{actor} cannot assign reviewers")));
            }
            if reviewer_id.trim().is_empty() {
                return Err(ReviewError::validation("reviewer id cannot be empty"));
            }
            let now = self.now();
            self.db.write(|tx| {
                let a = load_assessment(tx, assessment_id)?;
                a.require_status(&[
                    AssessmentStatus::Draft,
                    AssessmentStatus::Submitted,
                    AssessmentStatus::InReview,
                ])?;
                if reviewer_id == a.owner_id {
                    return Err(ReviewError::validation(format!(
                        "owner {reviewer_id} cannot review their own assessment"
                    )));
                }
                enroll(tx, assessment_id, reviewer_id, now)
            })
        })
    }

    pub fn reviewers(&self, actor: &Actor, assessment_id: &str) -> Result<Vec<String>> {
        self.db.read(|conn| {
            load_viewable(conn, actor, assessment_id)?;
            panel(conn, assessment_id)
        })
    }

    /// submitted → in_review on first open. Later opens only join the panel.
    pub fn open_review(&self, actor: &Actor, assessment_id: &str) -> Result<Assessment> {
        self.audited(actor, "assessment.open_review", resource(assessment_id), || {
            let now = self.now();
            self.db.write(|tx| {
                let mut a = load_assessment(tx, assessment_id)?;
                require_reviewer(actor, &a)?;
                a.require_status(&[AssessmentStatus::Submitted, AssessmentStatus::InReview])?;
                open(tx, &mut a, actor, now)?;
                Ok(a)
            })
        })
    }

    /// Create or amend one reviewer's judgment for one category.
    ///
    /// Allowed while submitted (opens the review) and in_review. During
    /// review_consolidation only categories nobody has approved yet may be
    /// amended; the cached average goes stale until it is regenerated.
    pub fn save_reviewer_response(
        &self,
        actor: &Actor,
        assessment_id: &str,
        input: ResponseInput,
    ) -> Result<ReviewerResponse> {
        let res = category_resource(assessment_id, &input.category_id);
        self.audited(actor, "reviewer_response.save", res, || {
            let now = self.now();
            self.write_with_text(
                actor,
                RecordType::ReviewerResponse,
                input.justification.as_deref(),
                |tx, justification_ref| {
                    let mut a = load_assessment(tx, assessment_id)?;
                    require_reviewer(actor, &a)?;
                    a.require_status(&[
                        AssessmentStatus::Submitted,
                        AssessmentStatus::InReview,
                        AssessmentStatus::ReviewConsolidation,
                    ])?;
                    self.catalog_for(&a)?
                        .resolve_choice(&input.category_id, &input.path_id, &input.level_id)?;

                    if a.status == AssessmentStatus::ReviewConsolidation {
                        if !is_enrolled(tx, assessment_id, &actor.user_id)? {
                            return Err(ReviewError::forbidden(format!(
                                "{actor} joined after consolidation began"
                            )));
                        }
                        if consolidation::category_has_approvals(tx, assessment_id, &input.category_id)? {
                            return Err(ReviewError::guard(format!(
                                "category {} already has approvals",
                                input.category_id
                            )));
                        }
                    } else {
                        open(tx, &mut a, actor, now)?;
                    }

                    tx.execute(
                        "INSERT INTO reviewer_responses
                            (assessment_id, category_id, reviewer_id, path_id, level_id,
                             justification_ref, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT(assessment_id, category_id, reviewer_id) DO UPDATE SET
                            path_id = excluded.path_id,
                            level_id = excluded.level_id,
                            justification_ref = excluded.justification_ref,
                            updated_at = excluded.updated_at",
                        params![
                            assessment_id,
                            input.category_id,
                            actor.user_id,
                            input.path_id,
                            input.level_id,
                            justification_ref.map(|r| r.0),
                            ts(now),
                        ],
                    )?;
                    Ok(ReviewerResponse {
                        reviewer_id: actor.user_id.clone(),
                        category_id: input.category_id.clone(),
                        path_id: input.path_id.clone(),
                        level_id: input.level_id.clone(),
                        justification_ref,
                        updated_at: now,
                    })
                },
            )
        })
    }

    pub fn reviewer_responses(&self, actor: &Actor, assessment_id: &str) -> Result<Vec<ReviewerResponse>> {
        self.db.read(|conn| {
            load_viewable(conn, actor, assessment_id)?;
            load_reviewer_responses(conn, assessment_id)
        })
    }

    pub fn completion(&self, actor: &Actor, assessment_id: &str) -> Result<CompletionReport> {
        let a = self.get(actor, assessment_id)?;
        let catalog = self.catalog_for(&a)?;
        self.db
            .read(|conn| completion_in(conn, &catalog, assessment_id, self.config.quorum))
    }

    /// in_review → review_consolidation once a quorum of reviewers covers
    /// every category. Generates the averaged proposals in the same unit.
    pub fn begin_consolidation(&self, actor: &Actor, assessment_id: &str) -> Result<Assessment> {
        self.audited(actor, "assessment.begin_consolidation", resource(assessment_id), || {
            let now = self.now();
            self.db.write(|tx| {
                let mut a = load_assessment(tx, assessment_id)?;
                require_panel_or_admin(tx, actor, &a)?;
                a.require_status(&[AssessmentStatus::InReview])?;

                let catalog = self.catalog_for(&a)?;
                let report = completion_in(tx, &catalog, assessment_id, self.config.quorum)?;
                if !report.quorum_met {
                    return Err(ReviewError::guard(format!(
                        "{} of {} required reviewers have full coverage",
                        report.complete, report.quorum
                    )));
                }

                advance(tx, &mut a, AssessmentStatus::ReviewConsolidation, now)?;
                let ids: Vec<String> = catalog.categories.iter().map(|c| c.id.clone()).collect();
                consolidation::store_proposals(tx, &catalog, assessment_id, &ids, now)?;
                Ok(a)
            })
        })
    }

    // ── Close / revert ─────────────────────────────────────────────

    pub fn close(&self, actor: &Actor, assessment_id: &str) -> Result<Assessment> {
        self.audited(actor, "assessment.close", resource(assessment_id), || {
            let now = self.now();
            let hours = self.config.revert_window_hours;
            let window = Duration::try_hours(hours).ok_or_else(|| {
                ReviewError::validation(format!("revert window of {hours} hours is out of range"))
            })?;
            self.db.write(|tx| {
                let mut a = load_assessment(tx, assessment_id)?;
                require_owner_or_admin(actor, &a)?;
                let from = a.close(now, window)?;
                save_assessment_if(tx, &a, from)?;
                tracing::info!(assessment_id, from = %from, "Assessment closed");
                Ok(a)
            })
        })
    }

    /// Undo a close within the revert window.
    pub fn revert(&self, actor: &Actor, assessment_id: &str) -> Result<Assessment> {
        self.audited(actor, "assessment.revert", resource(assessment_id), || {
            let now = self.now();
            self.db.write(|tx| {
                let mut a = load_assessment(tx, assessment_id)?;
                require_owner_or_admin(actor, &a)?;
                let restored = a.revert(now)?;
                save_assessment_if(tx, &a, AssessmentStatus::Closed)?;
                tracing::info!(assessment_id, to = %restored, "Assessment reverted");
                Ok(a)
            })
        })
    }
}

/// Forward step with a compare-and-swap on the current status.
pub(super) fn advance(
    conn: &Connection,
    a: &mut Assessment,
    to: AssessmentStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let from = a.advance(to, now)?;
    save_assessment_if(conn, a, from)?;
    tracing::info!(assessment_id = %a.id, from = %from, to = %to, "Assessment advanced");
    Ok(())
}

/// Enroll the reviewer and, on the first open, move submitted → in_review.
fn open(conn: &Connection, a: &mut Assessment, actor: &Actor, now: DateTime<Utc>) -> Result<()> {
    if enroll(conn, &a.id, &actor.user_id, now)? {
        tracing::debug!(assessment_id = %a.id, reviewer = %actor.user_id, "Reviewer joined panel");
    }
    if a.status == AssessmentStatus::Submitted {
        advance(conn, a, AssessmentStatus::InReview, now)?;
    }
    Ok(())
}

pub(super) fn load_responses(conn: &Connection, assessment_id: &str) -> Result<Vec<AssessmentResponse>> {
    let mut stmt = conn.prepare(
        "SELECT category_id, path_id, level_id, justification_ref, updated_at
         FROM assessment_responses WHERE assessment_id = ?1 ORDER BY category_id",
    )?;
    let rows = stmt
        .query_map(params![assessment_id], |row| {
            Ok(AssessmentResponse {
                category_id: row.get(0)?,
                path_id: row.get(1)?,
                level_id: row.get(2)?,
                justification_ref: row.get::<_, Option<i64>>(3)?.map(LedgerRef),
                updated_at: get_ts(row, 4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(super) fn load_reviewer_responses(conn: &Connection, assessment_id: &str) -> Result<Vec<ReviewerResponse>> {
    let mut stmt = conn.prepare(
        "SELECT reviewer_id, category_id, path_id, level_id, justification_ref, updated_at
         FROM reviewer_responses WHERE assessment_id = ?1 ORDER BY category_id, reviewer_id",
    )?;
    let rows = stmt
        .query_map(params![assessment_id], |row| {
            Ok(ReviewerResponse {
                reviewer_id: row.get(0)?,
                category_id: row.get(1)?,
                path_id: row.get(2)?,
                level_id: row.get(3)?,
                justification_ref: row.get::<_, Option<i64>>(4)?.map(LedgerRef),
                updated_at: get_ts(row, 5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn completion_in(conn: &Connection, catalog: &Catalog, assessment_id: &str, quorum: u32) -> Result<CompletionReport> {
    let assigned = panel(conn, assessment_id)?;
    let mut covered: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for response in load_reviewer_responses(conn, assessment_id)? {
        covered
            .entry(response.reviewer_id)
            .or_default()
            .insert(response.category_id);
    }
    let complete: Vec<String> = assigned
        .iter()
        .filter(|reviewer| {
            covered.get(*reviewer).is_some_and(|cats| {
                catalog.categories.iter().all(|c| cats.contains(&c.id))
            })
        })
        .cloned()
        .collect();
    Ok(CompletionReport::new(assigned.len(), complete, quorum))
}
