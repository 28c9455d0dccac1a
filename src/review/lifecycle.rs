//! Assessment lifecycle state machine.
//!
//! ```text
//! draft ─▸ submitted ─▸ in_review ─▸ review_consolidation ─▸ reviewed ─▸ discussion ─▸ archived
//!   └──────────┴────────────┴──────────────┴──────────────────┴────────────┴──▸ closed
//! ```
//!
//! `closed` is soft-terminal: within the revert window the assessment returns
//! to the status it was closed from. `archived` is terminal.
//!
//! This module is pure. Guards that need stored data (coverage, quorum,
//! approvals) are evaluated by the service inside the same transaction that
//! applies the transition.

use crate::error::{Result, ReviewError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    Draft,
    Submitted,
    InReview,
    ReviewConsolidation,
    Reviewed,
    Discussion,
    Archived,
    Closed,
}

impl AssessmentStatus {
    pub const ALL: [Self; 8] = [
        Self::Draft,
        Self::Submitted,
        Self::InReview,
        Self::ReviewConsolidation,
        Self::Reviewed,
        Self::Discussion,
        Self::Archived,
        Self::Closed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::InReview => "in_review",
            Self::ReviewConsolidation => "review_consolidation",
            Self::Reviewed => "reviewed",
            Self::Discussion => "discussion",
            Self::Archived => "archived",
            Self::Closed => "closed",
        }
    }

    /// The single forward successor, if any.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Draft => Some(Self::Submitted),
            Self::Submitted => Some(Self::InReview),
            Self::InReview => Some(Self::ReviewConsolidation),
            Self::ReviewConsolidation => Some(Self::Reviewed),
            Self::Reviewed => Some(Self::Discussion),
            Self::Discussion => Some(Self::Archived),
            Self::Archived | Self::Closed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Archived
    }

    /// Whether `close` is allowed from here.
    pub fn can_close(self) -> bool {
        !matches!(self, Self::Archived | Self::Closed)
    }
}

impl fmt::Display for AssessmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssessmentStatus {
    type Err = ReviewError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ReviewError::validation(format!("unknown assessment status '{s}'")))
    }
}

/// Timestamp of each state entry. Each one is stamped exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub submitted_at: Option<DateTime<Utc>>,
    pub in_review_at: Option<DateTime<Utc>>,
    pub consolidation_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub discussion_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Timestamps {
    fn slot(&mut self, status: AssessmentStatus) -> Option<&mut Option<DateTime<Utc>>> {
        match status {
            AssessmentStatus::Draft => None,
            AssessmentStatus::Submitted => Some(&mut self.submitted_at),
            AssessmentStatus::InReview => Some(&mut self.in_review_at),
            AssessmentStatus::ReviewConsolidation => Some(&mut self.consolidation_at),
            AssessmentStatus::Reviewed => Some(&mut self.reviewed_at),
            AssessmentStatus::Discussion => Some(&mut self.discussion_at),
            AssessmentStatus::Archived => Some(&mut self.archived_at),
            AssessmentStatus::Closed => Some(&mut self.closed_at),
        }
    }

    /// Record entry into `status` unless it was already recorded.
    pub fn stamp(&mut self, status: AssessmentStatus, at: DateTime<Utc>) {
        if let Some(slot) = self.slot(status) {
            if slot.is_none() {
                *slot = Some(at);
            }
        }
    }

    pub fn get(&self, status: AssessmentStatus) -> Option<DateTime<Utc>> {
        match status {
            AssessmentStatus::Draft => None,
            AssessmentStatus::Submitted => self.submitted_at,
            AssessmentStatus::InReview => self.in_review_at,
            AssessmentStatus::ReviewConsolidation => self.consolidation_at,
            AssessmentStatus::Reviewed => self.reviewed_at,
            AssessmentStatus::Discussion => self.discussion_at,
            AssessmentStatus::Archived => self.archived_at,
            AssessmentStatus::Closed => self.closed_at,
        }
    }
}

/// One employee's run through one catalog version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub id: String,
    pub catalog_id: String,
    pub owner_id: String,
    pub status: AssessmentStatus,
    /// Status held before `closed`, restored by revert.
    pub previous_status: Option<AssessmentStatus>,
    pub created_at: DateTime<Utc>,
    pub timestamps: Timestamps,
    /// Last moment a revert of the current close is accepted.
    pub revert_deadline: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Assessment {
    pub fn new(id: String, catalog_id: String, owner_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            catalog_id,
            owner_id,
            status: AssessmentStatus::Draft,
            previous_status: None,
            created_at: now,
            timestamps: Timestamps::default(),
            revert_deadline: None,
            updated_at: now,
        }
    }

    /// Whether the aggregate still accepts any mutation.
    pub fn is_frozen(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            AssessmentStatus::Archived => true,
            AssessmentStatus::Closed => self.revert_deadline.is_none_or(|deadline| now > deadline),
            _ => false,
        }
    }

    pub fn require_status(&self, expected: &[AssessmentStatus]) -> Result<()> {
        if expected.contains(&self.status) {
            return Ok(());
        }
        let wanted: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
        Err(ReviewError::guard(format!(
            "assessment {} is {}, expected {}",
            self.id,
            self.status,
            wanted.join(" or ")
        )))
    }

    /// Apply a forward step. Only the direct successor is accepted.
    pub fn advance(&mut self, to: AssessmentStatus, now: DateTime<Utc>) -> Result<AssessmentStatus> {
        if self.status.successor() != Some(to) {
            return Err(ReviewError::guard(format!(
                "cannot move assessment {} from {} to {}",
                self.id, self.status, to
            )));
        }
        let from = self.status;
        self.status = to;
        self.timestamps.stamp(to, now);
        self.updated_at = now;
        Ok(from)
    }

    pub fn close(&mut self, now: DateTime<Utc>, window: Duration) -> Result<AssessmentStatus> {
        if !self.status.can_close() {
            return Err(ReviewError::guard(format!(
                "assessment {} is {} and cannot be closed",
                self.id, self.status
            )));
        }
        let deadline = now.checked_add_signed(window).ok_or_else(|| {
            ReviewError::validation(format!("revert window of {window} is out of range"))
        })?;
        let from = self.status;
        self.previous_status = Some(from);
        self.status = AssessmentStatus::Closed;
        self.timestamps.stamp(AssessmentStatus::Closed, now);
        self.revert_deadline = Some(deadline);
        self.updated_at = now;
        Ok(from)
    }

    pub fn revert(&mut self, now: DateTime<Utc>) -> Result<AssessmentStatus> {
        self.require_status(&[AssessmentStatus::Closed])?;
        if self.is_frozen(now) {
            return Err(ReviewError::guard(match self.revert_deadline {
                Some(deadline) => format!(
                    "revert window for assessment {} ended at {}",
                    self.id,
                    deadline.to_rfc3339()
                ),
                None => format!("assessment {} has no revert window", self.id),
            }));
        }
        let restored = self.previous_status.ok_or_else(|| {
            ReviewError::guard(format!("assessment {} has no previous status", self.id))
        })?;
        self.status = restored;
        self.previous_status = None;
        self.revert_deadline = None;
        self.updated_at = now;
        Ok(restored)
    }
}
