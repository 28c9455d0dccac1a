//! Consolidation workflow.
//!
//! Each category carries up to two competing proposals: the cached average of
//! the reviewer judgments and an optional override. Each has its own approval
//! set. A category is finalized when one of them reaches quorum, with an
//! approved override taking precedence over an approved average. Changing or
//! removing an override wipes the approvals on both proposals for that
//! category, plus any approvals on the final consolidation.

use super::aggregation::{self, AverageProposal, ReviewerChoice, WeightedScore};
use super::approvals::{self, Approval, Subject};
use super::assessment::{advance, load_reviewer_responses, ResponseInput};
use super::lifecycle::{Assessment, AssessmentStatus};
use super::{
    category_resource, load_viewable, require_panel_member, require_panel_or_admin, resource,
    ReviewService,
};
use crate::catalog::Catalog;
use crate::error::{Result, ReviewError};
use crate::identity::Actor;
use crate::ledger::{LedgerRef, RecordType};
use crate::store::rows::{get_ts, load_assessment, ts};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalSource {
    Average,
    Override,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationOverride {
    pub category_id: String,
    pub path_id: String,
    pub level_id: String,
    pub justification_ref: Option<LedgerRef>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// The proposal that won for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedChoice {
    pub source: ProposalSource,
    pub path_id: String,
    pub level_id: String,
    pub level_number: u32,
    pub approvals: u32,
}

/// Everything the panel needs to see for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryBoard {
    pub category_id: String,
    pub weight: u32,
    pub average: Option<AverageProposal>,
    pub average_approvals: u32,
    pub override_proposal: Option<ConsolidationOverride>,
    pub override_approvals: u32,
    pub finalized: Option<FinalizedChoice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalConsolidation {
    pub assessment_id: String,
    pub comment_ref: Option<LedgerRef>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub approvals: Vec<Approval>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryComment {
    pub id: i64,
    pub category_id: String,
    pub author_id: String,
    pub comment_ref: Option<LedgerRef>,
    pub created_at: DateTime<Utc>,
}

impl ReviewService {
    // ── Reads ──────────────────────────────────────────────────────

    pub fn proposal_board(&self, actor: &Actor, assessment_id: &str) -> Result<Vec<CategoryBoard>> {
        let a = self.get(actor, assessment_id)?;
        let catalog = self.catalog_for(&a)?;
        self.db
            .read(|conn| board_in(conn, &catalog, assessment_id, self.config.quorum))
    }

    pub fn all_categories_approved(&self, actor: &Actor, assessment_id: &str) -> Result<bool> {
        Ok(self
            .proposal_board(actor, assessment_id)?
            .iter()
            .all(|b| b.finalized.is_some()))
    }

    /// Weighted overall score. `None` until every category is finalized.
    pub fn overall_score(&self, actor: &Actor, assessment_id: &str) -> Result<Option<WeightedScore>> {
        Ok(overall(&self.proposal_board(actor, assessment_id)?))
    }

    pub fn final_consolidation(&self, actor: &Actor, assessment_id: &str) -> Result<Option<FinalConsolidation>> {
        self.db.read(|conn| {
            load_viewable(conn, actor, assessment_id)?;
            load_final(conn, assessment_id)
        })
    }

    pub fn category_comments(&self, actor: &Actor, assessment_id: &str) -> Result<Vec<CategoryComment>> {
        self.db.read(|conn| {
            load_viewable(conn, actor, assessment_id)?;
            let mut stmt = conn.prepare(
                "SELECT id, category_id, author_id, comment_ref, created_at
                 FROM category_comments WHERE assessment_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![assessment_id], |row| {
                    Ok(CategoryComment {
                        id: row.get(0)?,
                        category_id: row.get(1)?,
                        author_id: row.get(2)?,
                        comment_ref: row.get::<_, Option<i64>>(3)?.map(LedgerRef),
                        created_at: get_ts(row, 4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    // ── Averaged proposals ─────────────────────────────────────────

    /// Recompute cached averages, e.g. after a late reviewer correction.
    ///
    /// `categories` empty means every category. Rejected as a whole if any
    /// targeted category already has an approval on either proposal.
    pub fn regenerate_proposals(
        &self,
        actor: &Actor,
        assessment_id: &str,
        categories: &[&str],
    ) -> Result<Vec<AverageProposal>> {
        self.audited(actor, "proposal.regenerate", resource(assessment_id), || {
            let now = self.now();
            self.db.write(|tx| {
                let a = load_assessment(tx, assessment_id)?;
                require_panel_or_admin(tx, actor, &a)?;
                a.require_status(&[AssessmentStatus::ReviewConsolidation])?;
                let catalog = self.catalog_for(&a)?;

                let targets: Vec<String> = if categories.is_empty() {
                    catalog.categories.iter().map(|c| c.id.clone()).collect()
                } else {
                    for id in categories {
                        if catalog.category(id).is_none() {
                            return Err(ReviewError::validation(format!("unknown category {id}")));
                        }
                    }
                    categories.iter().map(|c| c.to_string()).collect()
                };
                let mut blocked = Vec::new();
                for category_id in &targets {
                    if category_has_approvals(tx, assessment_id, category_id)? {
                        blocked.push(category_id.as_str());
                    }
                }
                if !blocked.is_empty() {
                    return Err(ReviewError::guard(format!(
                        "categories with approvals cannot be regenerated: {}",
                        blocked.join(", ")
                    )));
                }

                store_proposals(tx, &catalog, assessment_id, &targets, now)
            })
        })
    }

    pub fn approve_average(&self, actor: &Actor, assessment_id: &str, category_id: &str) -> Result<bool> {
        self.audited(actor, "approval.average.grant", category_resource(assessment_id, category_id), || {
            let now = self.now();
            self.db.write(|tx| {
                let a = consolidating(tx, actor, assessment_id)?;
                if load_proposal(tx, &a.id, category_id)?.is_none() {
                    return Err(ReviewError::not_found(format!(
                        "averaged proposal for category {category_id}"
                    )));
                }
                approvals::grant(tx, &Subject::average(assessment_id, category_id), actor, now)
            })
        })
    }

    pub fn revoke_average(&self, actor: &Actor, assessment_id: &str, category_id: &str) -> Result<bool> {
        self.audited(actor, "approval.average.revoke", category_resource(assessment_id, category_id), || {
            self.db.write(|tx| {
                consolidating(tx, actor, assessment_id)?;
                approvals::revoke(tx, &Subject::average(assessment_id, category_id), &actor.user_id)
            })
        })
    }

    // ── Overrides ──────────────────────────────────────────────────

    /// Create or replace the override for one category. Resets consensus on
    /// that category.
    pub fn set_override(
        &self,
        actor: &Actor,
        assessment_id: &str,
        input: ResponseInput,
    ) -> Result<ConsolidationOverride> {
        let res = category_resource(assessment_id, &input.category_id);
        self.audited(actor, "override.set", res, || {
            let now = self.now();
            self.write_with_text(
                actor,
                RecordType::Override,
                input.justification.as_deref(),
                |tx, justification_ref| {
                    let a = load_assessment(tx, assessment_id)?;
                    require_panel_or_admin(tx, actor, &a)?;
                    a.require_status(&[AssessmentStatus::ReviewConsolidation])?;
                    self.catalog_for(&a)?
                        .resolve_choice(&input.category_id, &input.path_id, &input.level_id)?;

                    tx.execute(
                        "INSERT INTO consolidation_overrides
                            (assessment_id, category_id, path_id, level_id, justification_ref,
                             created_by, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT(assessment_id, category_id) DO UPDATE SET
                            path_id = excluded.path_id,
                            level_id = excluded.level_id,
                            justification_ref = excluded.justification_ref,
                            created_by = excluded.created_by,
                            created_at = excluded.created_at",
                        params![
                            assessment_id,
                            input.category_id,
                            input.path_id,
                            input.level_id,
                            justification_ref.map(|r| r.0),
                            actor.user_id,
                            ts(now),
                        ],
                    )?;
                    reset_consensus(tx, assessment_id, &input.category_id)?;

                    Ok(ConsolidationOverride {
                        category_id: input.category_id.clone(),
                        path_id: input.path_id.clone(),
                        level_id: input.level_id.clone(),
                        justification_ref,
                        created_by: actor.user_id.clone(),
                        created_at: now,
                    })
                },
            )
        })
    }

    pub fn remove_override(&self, actor: &Actor, assessment_id: &str, category_id: &str) -> Result<bool> {
        self.audited(actor, "override.remove", category_resource(assessment_id, category_id), || {
            self.db.write(|tx| {
                let a = load_assessment(tx, assessment_id)?;
                require_panel_or_admin(tx, actor, &a)?;
                a.require_status(&[AssessmentStatus::ReviewConsolidation])?;
                let removed = tx.execute(
                    "DELETE FROM consolidation_overrides WHERE assessment_id = ?1 AND category_id = ?2",
                    params![assessment_id, category_id],
                )?;
                if removed == 0 {
                    return Ok(false);
                }
                reset_consensus(tx, assessment_id, category_id)?;
                Ok(true)
            })
        })
    }

    pub fn approve_override(&self, actor: &Actor, assessment_id: &str, category_id: &str) -> Result<bool> {
        self.audited(actor, "approval.override.grant", category_resource(assessment_id, category_id), || {
            let now = self.now();
            self.db.write(|tx| {
                let a = consolidating(tx, actor, assessment_id)?;
                if load_override(tx, &a.id, category_id)?.is_none() {
                    return Err(ReviewError::not_found(format!("override for category {category_id}")));
                }
                approvals::grant(tx, &Subject::override_of(assessment_id, category_id), actor, now)
            })
        })
    }

    pub fn revoke_override(&self, actor: &Actor, assessment_id: &str, category_id: &str) -> Result<bool> {
        self.audited(actor, "approval.override.revoke", category_resource(assessment_id, category_id), || {
            self.db.write(|tx| {
                consolidating(tx, actor, assessment_id)?;
                approvals::revoke(tx, &Subject::override_of(assessment_id, category_id), &actor.user_id)
            })
        })
    }

    // ── Category comments ──────────────────────────────────────────

    pub fn add_category_comment(
        &self,
        actor: &Actor,
        assessment_id: &str,
        category_id: &str,
        text: &str,
    ) -> Result<CategoryComment> {
        self.audited(actor, "comment.add", category_resource(assessment_id, category_id), || {
            let now = self.now();
            self.write_with_text(actor, RecordType::CategoryComment, Some(text), |tx, comment_ref| {
                let a = load_assessment(tx, assessment_id)?;
                require_panel_or_admin(tx, actor, &a)?;
                a.require_status(&[AssessmentStatus::ReviewConsolidation])?;
                if self.catalog_for(&a)?.category(category_id).is_none() {
                    return Err(ReviewError::validation(format!("unknown category {category_id}")));
                }
                tx.execute(
                    "INSERT INTO category_comments
                        (assessment_id, category_id, author_id, comment_ref, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![assessment_id, category_id, actor.user_id, comment_ref.map(|r| r.0), ts(now)],
                )?;
                Ok(CategoryComment {
                    id: tx.last_insert_rowid(),
                    category_id: category_id.to_string(),
                    author_id: actor.user_id.clone(),
                    comment_ref,
                    created_at: now,
                })
            })
        })
    }

    // ── Final consolidation ────────────────────────────────────────

    /// Draft (or redraft) the closing comment. Redrafting clears its approvals.
    pub fn draft_final_consolidation(
        &self,
        actor: &Actor,
        assessment_id: &str,
        comment: &str,
    ) -> Result<FinalConsolidation> {
        self.audited(actor, "final.draft", resource(assessment_id), || {
            let now = self.now();
            self.write_with_text(actor, RecordType::FinalComment, Some(comment), |tx, comment_ref| {
                let a = load_assessment(tx, assessment_id)?;
                require_panel_or_admin(tx, actor, &a)?;
                a.require_status(&[AssessmentStatus::ReviewConsolidation])?;
                self.require_all_finalized(tx, &a)?;

                tx.execute(
                    "INSERT INTO final_consolidations (assessment_id, comment_ref, created_by, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(assessment_id) DO UPDATE SET
                        comment_ref = excluded.comment_ref,
                        created_by = excluded.created_by,
                        created_at = excluded.created_at",
                    params![assessment_id, comment_ref.map(|r| r.0), actor.user_id, ts(now)],
                )?;
                approvals::clear(tx, &Subject::final_consolidation(assessment_id))?;

                Ok(FinalConsolidation {
                    assessment_id: assessment_id.to_string(),
                    comment_ref,
                    created_by: actor.user_id.clone(),
                    created_at: now,
                    approvals: Vec::new(),
                })
            })
        })
    }

    pub fn approve_final(&self, actor: &Actor, assessment_id: &str) -> Result<bool> {
        self.audited(actor, "approval.final.grant", resource(assessment_id), || {
            let now = self.now();
            self.db.write(|tx| {
                let a = consolidating(tx, actor, assessment_id)?;
                if load_final(tx, assessment_id)?.is_none() {
                    return Err(ReviewError::not_found(format!(
                        "final consolidation for assessment {assessment_id}"
                    )));
                }
                self.require_all_finalized(tx, &a)?;
                approvals::grant(tx, &Subject::final_consolidation(assessment_id), actor, now)
            })
        })
    }

    pub fn revoke_final(&self, actor: &Actor, assessment_id: &str) -> Result<bool> {
        self.audited(actor, "approval.final.revoke", resource(assessment_id), || {
            self.db.write(|tx| {
                consolidating(tx, actor, assessment_id)?;
                approvals::revoke(tx, &Subject::final_consolidation(assessment_id), &actor.user_id)
            })
        })
    }

    /// review_consolidation → reviewed.
    pub fn finish_consolidation(&self, actor: &Actor, assessment_id: &str) -> Result<Assessment> {
        self.audited(actor, "assessment.finish_consolidation", resource(assessment_id), || {
            let now = self.now();
            self.db.write(|tx| {
                let mut a = load_assessment(tx, assessment_id)?;
                require_panel_or_admin(tx, actor, &a)?;
                a.require_status(&[AssessmentStatus::ReviewConsolidation])?;
                self.require_all_finalized(tx, &a)?;

                let subject = Subject::final_consolidation(assessment_id);
                if load_final(tx, assessment_id)?.is_none() {
                    return Err(ReviewError::guard("final consolidation has not been drafted"));
                }
                let approved = approvals::count(tx, &subject)?;
                if approved < self.config.quorum {
                    return Err(ReviewError::guard(format!(
                        "final consolidation has {approved} of {} approvals",
                        self.config.quorum
                    )));
                }

                advance(tx, &mut a, AssessmentStatus::Reviewed, now)?;
                Ok(a)
            })
        })
    }

    fn require_all_finalized(&self, conn: &Connection, a: &Assessment) -> Result<()> {
        let catalog = self.catalog_for(a)?;
        let open: Vec<String> = board_in(conn, &catalog, &a.id, self.config.quorum)?
            .into_iter()
            .filter(|b| b.finalized.is_none())
            .map(|b| b.category_id)
            .collect();
        if open.is_empty() {
            return Ok(());
        }
        Err(ReviewError::guard(format!(
            "categories without an approved proposal: {}",
            open.join(", ")
        )))
    }
}

/// Load the assessment and check the actor may approve during consolidation.
fn consolidating(conn: &Connection, actor: &Actor, assessment_id: &str) -> Result<Assessment> {
    let a = load_assessment(conn, assessment_id)?;
    require_panel_member(conn, actor, &a)?;
    a.require_status(&[AssessmentStatus::ReviewConsolidation])?;
    Ok(a)
}

fn reset_consensus(conn: &Connection, assessment_id: &str, category_id: &str) -> Result<()> {
    let average = approvals::clear(conn, &Subject::average(assessment_id, category_id))?;
    let overridden = approvals::clear(conn, &Subject::override_of(assessment_id, category_id))?;
    let final_ = approvals::clear(conn, &Subject::final_consolidation(assessment_id))?;
    tracing::info!(
        assessment_id,
        category_id,
        cleared = average + overridden + final_,
        "Consensus reset after override change"
    );
    Ok(())
}

pub(super) fn category_has_approvals(conn: &Connection, assessment_id: &str, category_id: &str) -> Result<bool> {
    Ok(approvals::count(conn, &Subject::average(assessment_id, category_id))?
        + approvals::count(conn, &Subject::override_of(assessment_id, category_id))?
        > 0)
}

/// Recompute and cache the averaged proposals for `category_ids`.
pub(super) fn store_proposals(
    conn: &Connection,
    catalog: &Catalog,
    assessment_id: &str,
    category_ids: &[String],
    now: DateTime<Utc>,
) -> Result<Vec<AverageProposal>> {
    let mut choices: BTreeMap<String, Vec<ReviewerChoice>> = BTreeMap::new();
    for response in load_reviewer_responses(conn, assessment_id)? {
        let level = catalog.level(&response.level_id).ok_or_else(|| {
            ReviewError::validation(format!("level {} is not in catalog {}", response.level_id, catalog.id))
        })?;
        choices.entry(response.category_id).or_default().push(ReviewerChoice {
            reviewer_id: response.reviewer_id,
            path_id: response.path_id,
            level_number: level.number,
        });
    }

    let mut stored = Vec::new();
    for category_id in category_ids {
        let picks = choices.get(category_id).map(Vec::as_slice).unwrap_or_default();
        match aggregation::average_proposal(catalog, category_id, picks)? {
            Some(p) => {
                conn.execute(
                    "INSERT INTO category_proposals
                        (assessment_id, category_id, average_level_number, path_id, level_id,
                         level_number, reviewer_count, generated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(assessment_id, category_id) DO UPDATE SET
                        average_level_number = excluded.average_level_number,
                        path_id = excluded.path_id,
                        level_id = excluded.level_id,
                        level_number = excluded.level_number,
                        reviewer_count = excluded.reviewer_count,
                        generated_at = excluded.generated_at",
                    params![
                        assessment_id,
                        p.category_id,
                        p.average_level_number,
                        p.path_id,
                        p.level_id,
                        p.level_number,
                        p.reviewer_count,
                        ts(now),
                    ],
                )?;
                stored.push(p);
            }
            None => {
                conn.execute(
                    "DELETE FROM category_proposals WHERE assessment_id = ?1 AND category_id = ?2",
                    params![assessment_id, category_id],
                )?;
            }
        }
    }
    tracing::info!(assessment_id, proposals = stored.len(), "Averaged proposals generated");
    Ok(stored)
}

fn load_proposal(conn: &Connection, assessment_id: &str, category_id: &str) -> Result<Option<AverageProposal>> {
    Ok(conn
        .query_row(
            "SELECT category_id, average_level_number, path_id, level_id, level_number, reviewer_count
             FROM category_proposals WHERE assessment_id = ?1 AND category_id = ?2",
            params![assessment_id, category_id],
            |row| {
                Ok(AverageProposal {
                    category_id: row.get(0)?,
                    average_level_number: row.get(1)?,
                    path_id: row.get(2)?,
                    level_id: row.get(3)?,
                    level_number: row.get(4)?,
                    reviewer_count: row.get(5)?,
                })
            },
        )
        .optional()?)
}

fn load_override(conn: &Connection, assessment_id: &str, category_id: &str) -> Result<Option<ConsolidationOverride>> {
    Ok(conn
        .query_row(
            "SELECT category_id, path_id, level_id, justification_ref, created_by, created_at
             FROM consolidation_overrides WHERE assessment_id = ?1 AND category_id = ?2",
            params![assessment_id, category_id],
            |row| {
                Ok(ConsolidationOverride {
                    category_id: row.get(0)?,
                    path_id: row.get(1)?,
                    level_id: row.get(2)?,
                    justification_ref: row.get::<_, Option<i64>>(3)?.map(LedgerRef),
                    created_by: row.get(4)?,
                    created_at: get_ts(row, 5)?,
                })
            },
        )
        .optional()?)
}

pub(super) fn load_final(conn: &Connection, assessment_id: &str) -> Result<Option<FinalConsolidation>> {
    let row = conn
        .query_row(
            "SELECT comment_ref, created_by, created_at FROM final_consolidations WHERE assessment_id = ?1",
            params![assessment_id],
            |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?.map(LedgerRef),
                    row.get::<_, String>(1)?,
                    get_ts(row, 2)?,
                ))
            },
        )
        .optional()?;
    let Some((comment_ref, created_by, created_at)) = row else {
        return Ok(None);
    };
    Ok(Some(FinalConsolidation {
        assessment_id: assessment_id.to_string(),
        comment_ref,
        created_by,
        created_at,
        approvals: approvals::list(conn, &Subject::final_consolidation(assessment_id))?,
    }))
}

/// Per-category board in catalog order.
pub(super) fn board_in(
    conn: &Connection,
    catalog: &Catalog,
    assessment_id: &str,
    quorum: u32,
) -> Result<Vec<CategoryBoard>> {
    catalog
        .categories
        .iter()
        .map(|category| -> Result<CategoryBoard> {
            let average = load_proposal(conn, assessment_id, &category.id)?;
            let override_proposal = load_override(conn, assessment_id, &category.id)?;
            let average_approvals = approvals::count(conn, &Subject::average(assessment_id, &category.id))?;
            let override_approvals =
                approvals::count(conn, &Subject::override_of(assessment_id, &category.id))?;

            let finalized = match (&override_proposal, &average) {
                (Some(o), _) if override_approvals >= quorum => {
                    let level_number = catalog.level(&o.level_id).map_or(0, |l| l.number);
                    Some(FinalizedChoice {
                        source: ProposalSource::Override,
                        path_id: o.path_id.clone(),
                        level_id: o.level_id.clone(),
                        level_number,
                        approvals: override_approvals,
                    })
                }
                (_, Some(p)) if average_approvals >= quorum => Some(FinalizedChoice {
                    source: ProposalSource::Average,
                    path_id: p.path_id.clone(),
                    level_id: p.level_id.clone(),
                    level_number: p.level_number,
                    approvals: average_approvals,
                }),
                _ => None,
            };

            Ok(CategoryBoard {
                category_id: category.id.clone(),
                weight: category.weight,
                average,
                average_approvals,
                override_proposal,
                override_approvals,
                finalized,
            })
        })
        .collect()
}

/// Weighted score over a board, only when every category is finalized.
pub(super) fn overall(board: &[CategoryBoard]) -> Option<WeightedScore> {
    let entries = board
        .iter()
        .map(|b| b.finalized.as_ref().map(|f| (b.weight, f.level_number)))
        .collect::<Option<Vec<_>>>()?;
    aggregation::weighted_score(entries)
}
