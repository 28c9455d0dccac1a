//! Review service: the facade over lifecycle, aggregation, consolidation and
//! discussion.
//!
//! ## Design
//! - Every mutating call is one `BEGIN IMMEDIATE` unit: load the assessment,
//!   check role and guards, write, move the status with a compare-and-swap on
//!   the expected status. A failure anywhere rolls the whole unit back.
//! - Calls that carry free text seal it outside the transaction and append it
//!   to the ledger inside the same unit, so a rejected call leaves no record.
//!   A lost tail race reseals and retries.
//! - Every mutating call emits exactly one [`AuditEvent`] once the unit has
//!   finished, whatever the outcome.

pub mod aggregation;
pub mod approvals;
pub mod assessment;
pub mod consolidation;
pub mod discussion;
pub mod lifecycle;

pub use aggregation::{AverageProposal, CompletionReport, WeightedScore};
pub use approvals::{Approval, Subject, SubjectKind};
pub use assessment::{AssessmentResponse, ResponseInput, ReviewerResponse};
pub use consolidation::{
    CategoryBoard, CategoryComment, ConsolidationOverride, FinalConsolidation, FinalizedChoice,
    ProposalSource,
};
pub use discussion::{
    CategoryOutcome, ChoiceSnapshot, DiscussionNote, DiscussionResult, DiscussionView,
};
pub use lifecycle::{Assessment, AssessmentStatus, Timestamps};

use crate::catalog::{Catalog, CatalogProvider};
use crate::clock::{Clock, SystemClock};
use crate::config::ReviewConfig;
use crate::error::{Result, ReviewError};
use crate::events::{AuditEvent, EventSink, Outcome, TracingSink};
use crate::identity::{Actor, Role};
use crate::ledger::{Ledger, LedgerEntry, LedgerRef, RecordType};
use crate::store::rows::{load_assessment, ts};
use crate::store::Database;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::sync::Arc;

pub struct ReviewService {
    db: Arc<Database>,
    ledger: Arc<Ledger>,
    catalogs: Arc<dyn CatalogProvider>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: ReviewConfig,
}

impl ReviewService {
    pub fn new(
        db: Arc<Database>,
        ledger: Arc<Ledger>,
        catalogs: Arc<dyn CatalogProvider>,
        config: ReviewConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            catalogs,
            events: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ReviewConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Owner, an enrolled panel reviewer, or an admin may read an assessment.
    pub fn get(&self, actor: &Actor, assessment_id: &str) -> Result<Assessment> {
        self.db.read(|conn| load_viewable(conn, actor, assessment_id))
    }

    pub fn list_for_owner(&self, actor: &Actor, owner_id: &str) -> Result<Vec<Assessment>> {
        if !actor.is_admin() && !(actor.role == Role::Owner && actor.user_id == owner_id) {
            return Err(ReviewError::forbidden(format!(
                "{actor} cannot list assessments of {owner_id}"
            )));
        }
        self.db
            .read(|conn| crate::store::rows::list_assessments_for_owner(conn, owner_id))
    }

    /// Decrypt and verify one ledger payload.
    ///
    /// The reference must be held by some row of an assessment the actor may
    /// read. Unreferenced records are reported as missing.
    pub fn read_text(&self, actor: &Actor, reference: LedgerRef) -> Result<LedgerEntry> {
        self.audited(actor, "ledger.read", reference.to_string(), || {
            self.db.read(|conn| {
                let assessment_id = owning_assessment(conn, reference)?
                    .ok_or_else(|| ReviewError::not_found(reference.to_string()))?;
                load_viewable(conn, actor, &assessment_id).map(|_| ())
            })?;
            self.ledger.read(reference)
        })
    }

    // ── Shared plumbing ────────────────────────────────────────────

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn catalog_for(&self, assessment: &Assessment) -> Result<Arc<Catalog>> {
        self.catalog(&assessment.catalog_id)
    }

    fn catalog(&self, catalog_id: &str) -> Result<Arc<Catalog>> {
        self.catalogs
            .catalog(catalog_id)
            .ok_or_else(|| ReviewError::not_found(format!("catalog {catalog_id}")))
    }

    /// Run `f`, then emit one audit event describing how it went.
    fn audited<T>(
        &self,
        actor: &Actor,
        action: &str,
        resource: String,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let out = f();
        let outcome = match &out {
            Ok(_) => Outcome::Success,
            Err(e) => {
                if let ReviewError::Integrity(violation) = e {
                    tracing::error!(
                        action,
                        %resource,
                        record_id = violation.record_id(),
                        "Integrity violation"
                    );
                }
                Outcome::Failed(e.kind().into())
            }
        };
        self.events
            .emit(&AuditEvent::new(actor, action, resource, outcome, self.now()));
        out
    }

    /// One atomic unit that may also append a ledger record.
    ///
    /// `text` is sealed outside the transaction. Inside, the record is appended
    /// first and its reference handed to `f`; any error from `f` rolls the
    /// record back with everything else. Tail conflicts reseal and retry.
    fn write_with_text<T>(
        &self,
        author: &Actor,
        record_type: RecordType,
        text: Option<&str>,
        f: impl Fn(&Transaction<'_>, Option<LedgerRef>) -> Result<T>,
    ) -> Result<T> {
        let retries = self.ledger.config().append_retries;
        let mut attempt = 0;
        loop {
            let sealed = text
                .map(|t| self.ledger.seal(&author.user_id, record_type, t))
                .transpose()?;
            let out = self.db.write(|tx| {
                let reference = sealed
                    .map(|payload| self.ledger.insert_sealed(tx, payload))
                    .transpose()?;
                f(tx, reference)
            });
            match out {
                Err(ReviewError::Conflict(reason)) if text.is_some() && attempt < retries => {
                    attempt += 1;
                    tracing::debug!(attempt, %reason, "Retrying write after ledger conflict");
                }
                other => return other,
            }
        }
    }
}

// ── Role gates ─────────────────────────────────────────────────────

fn require_owner(actor: &Actor, assessment: &Assessment) -> Result<()> {
    if actor.role == Role::Owner && actor.user_id == assessment.owner_id {
        return Ok(());
    }
    Err(ReviewError::forbidden(format!(
        "{actor} is not the owner of assessment {}",
        assessment.id
    )))
}

fn require_owner_or_admin(actor: &Actor, assessment: &Assessment) -> Result<()> {
    if actor.is_admin() {
        return Ok(());
    }
    require_owner(actor, assessment)
}

/// Reviewers may act on assessments they do not own.
fn require_reviewer(actor: &Actor, assessment: &Assessment) -> Result<()> {
    if actor.role != Role::Reviewer {
        return Err(ReviewError::forbidden(format!("{actor} is not a reviewer")));
    }
    if actor.user_id == assessment.owner_id {
        return Err(ReviewError::forbidden(format!(
            "{actor} cannot review their own assessment"
        )));
    }
    Ok(())
}

/// A reviewer already sitting on this assessment's panel.
fn require_panel_member(conn: &Connection, actor: &Actor, assessment: &Assessment) -> Result<()> {
    require_reviewer(actor, assessment)?;
    if is_enrolled(conn, &assessment.id, &actor.user_id)? {
        return Ok(());
    }
    Err(ReviewError::forbidden(format!(
        "{actor} is not on the panel of assessment {}",
        assessment.id
    )))
}

fn require_panel_or_admin(conn: &Connection, actor: &Actor, assessment: &Assessment) -> Result<()> {
    if actor.is_admin() {
        return Ok(());
    }
    require_panel_member(conn, actor, assessment)
}

/// Owner, a panel reviewer, or an admin.
fn require_party(conn: &Connection, actor: &Actor, a: &Assessment) -> Result<()> {
    match actor.role {
        Role::Admin => Ok(()),
        Role::Owner if actor.user_id == a.owner_id => Ok(()),
        Role::Reviewer => require_panel_member(conn, actor, a),
        Role::Owner => Err(ReviewError::forbidden(format!(
            "{actor} is not the owner of assessment {}",
            a.id
        ))),
    }
}

fn load_viewable(conn: &Connection, actor: &Actor, assessment_id: &str) -> Result<Assessment> {
    let a = load_assessment(conn, assessment_id)?;
    require_party(conn, actor, &a)?;
    Ok(a)
}

/// The assessment whose rows hold `reference`, if any.
fn owning_assessment(conn: &Connection, reference: LedgerRef) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT assessment_id FROM assessment_responses WHERE justification_ref = ?1
             UNION ALL SELECT assessment_id FROM reviewer_responses WHERE justification_ref = ?1
             UNION ALL SELECT assessment_id FROM consolidation_overrides WHERE justification_ref = ?1
             UNION ALL SELECT assessment_id FROM final_consolidations WHERE comment_ref = ?1
             UNION ALL SELECT assessment_id FROM discussion_results WHERE final_comment_ref = ?1
             UNION ALL SELECT assessment_id FROM category_comments WHERE comment_ref = ?1
             UNION ALL SELECT assessment_id FROM discussion_notes WHERE note_ref = ?1
             LIMIT 1",
            params![reference.0],
            |row| row.get(0),
        )
        .optional()?)
}

fn is_enrolled(conn: &Connection, assessment_id: &str, reviewer_id: &str) -> Result<bool> {
    let found: i64 = conn.query_row(
        "SELECT COUNT(*) FROM assessment_reviewers WHERE assessment_id = ?1 AND reviewer_id = ?2",
        params![assessment_id, reviewer_id],
        |row| row.get(0),
    )?;
    Ok(found > 0)
}

fn enroll(conn: &Connection, assessment_id: &str, reviewer_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO assessment_reviewers (assessment_id, reviewer_id, assigned_at)
         VALUES (?1, ?2, ?3)",
        params![assessment_id, reviewer_id, ts(now)],
    )?;
    Ok(inserted == 1)
}

fn panel(conn: &Connection, assessment_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT reviewer_id FROM assessment_reviewers WHERE assessment_id = ?1
         ORDER BY assigned_at ASC, reviewer_id ASC",
    )?;
    let rows = stmt
        .query_map(params![assessment_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(rows)
}

fn resource(assessment_id: &str) -> String {
    format!("assessment/{assessment_id}")
}

fn category_resource(assessment_id: &str, category_id: &str) -> String {
    format!("assessment/{assessment_id}/category/{category_id}")
}
