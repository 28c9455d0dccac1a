//! Reviewer aggregation math.
//!
//! Pure functions over catalog data and reviewer choices. All averaging is
//! done in integers so the result never depends on float rounding or on the
//! order categories and reviewers are processed in.

use crate::catalog::{Catalog, Level};
use crate::error::{Result, ReviewError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `num / den` rounded half up. `den` must be non-zero.
pub fn round_half_up(num: u64, den: u64) -> u64 {
    (2 * num + den) / (2 * den)
}

/// One reviewer's pick for one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewerChoice {
    pub reviewer_id: String,
    pub path_id: String,
    pub level_number: u32,
}

/// The averaged proposal for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageProposal {
    pub category_id: String,
    /// Exact mean of the reviewers' level numbers.
    pub average_level_number: f64,
    pub path_id: String,
    pub level_id: String,
    pub level_number: u32,
    pub reviewer_count: u32,
}

/// Average the reviewer choices for one category.
///
/// The mean is rounded half up, then snapped to the closest level that exists
/// on the majority path (ties between paths go to catalog order, ties between
/// levels go to the higher one). Returns `None` when nobody answered.
pub fn average_proposal(
    catalog: &Catalog,
    category_id: &str,
    choices: &[ReviewerChoice],
) -> Result<Option<AverageProposal>> {
    if choices.is_empty() {
        return Ok(None);
    }
    let count = choices.len() as u64;
    let sum: u64 = choices.iter().map(|c| u64::from(c.level_number)).sum();
    let rounded = round_half_up(sum, count);

    let path_id = majority_path(catalog, choices);
    let level = nearest_level(&catalog.levels_for_path(&path_id), rounded).ok_or_else(|| {
        ReviewError::validation(format!("path {path_id} has no levels in catalog {}", catalog.id))
    })?;

    Ok(Some(AverageProposal {
        category_id: category_id.to_string(),
        average_level_number: sum as f64 / count as f64,
        path_id,
        level_id: level.id.clone(),
        level_number: level.number,
        reviewer_count: choices.len() as u32,
    }))
}

fn majority_path(catalog: &Catalog, choices: &[ReviewerChoice]) -> String {
    let mut votes: HashMap<&str, usize> = HashMap::new();
    for choice in choices {
        *votes.entry(choice.path_id.as_str()).or_default() += 1;
    }
    let best = votes.values().copied().max().unwrap_or(0);
    catalog
        .paths
        .iter()
        .find(|p| votes.get(p.id.as_str()) == Some(&best))
        .map(|p| p.id.clone())
        // Paths outside the catalog cannot be stored, but fall back to the first vote.
        .unwrap_or_else(|| choices[0].path_id.clone())
}

/// Closest level to `target`; on a tie the higher ordinal wins.
pub fn nearest_level<'a>(levels: &[&'a Level], target: u64) -> Option<&'a Level> {
    levels
        .iter()
        .copied()
        .min_by_key(|l| {
            let n = u64::from(l.number);
            (n.abs_diff(target), std::cmp::Reverse(n))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedScore {
    pub score: f64,
    /// Score rounded half up to a level ordinal.
    pub level_number: u32,
}

/// Weighted overall score over `(weight, level_number)` pairs.
///
/// `None` when the total weight is zero.
pub fn weighted_score(entries: impl IntoIterator<Item = (u32, u32)>) -> Option<WeightedScore> {
    let (num, den) = entries
        .into_iter()
        .fold((0u64, 0u64), |(num, den), (weight, level)| {
            (num + u64::from(weight) * u64::from(level), den + u64::from(weight))
        });
    if den == 0 {
        return None;
    }
    Some(WeightedScore {
        score: num as f64 / den as f64,
        level_number: round_half_up(num, den) as u32,
    })
}

/// Reviewer coverage for the in_review → review_consolidation guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub assigned: usize,
    /// Reviewers with a response for every catalog category.
    pub complete: usize,
    pub quorum: u32,
    pub quorum_met: bool,
    pub complete_reviewers: Vec<String>,
}

impl CompletionReport {
    pub fn new(assigned: usize, complete_reviewers: Vec<String>, quorum: u32) -> Self {
        let complete = complete_reviewers.len();
        Self {
            assigned,
            complete,
            quorum,
            quorum_met: complete >= quorum as usize,
            complete_reviewers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Category, Path};

    fn catalog() -> Catalog {
        let level = |id: &str, path: &str, n: u32| Level {
            id: id.into(),
            path_id: path.into(),
            name: id.into(),
            number: n,
        };
        Catalog::new(
            "v1",
            vec![Category { id: "c".into(), name: "C".into(), weight: 1, required: true }],
            vec![
                Path { id: "ic".into(), name: "IC".into() },
                Path { id: "mgmt".into(), name: "Management".into() },
            ],
            vec![
                level("ic-1", "ic", 1),
                level("ic-2", "ic", 2),
                level("ic-4", "ic", 4),
                level("m-3", "mgmt", 3),
                level("m-5", "mgmt", 5),
            ],
        )
        .unwrap()
    }

    fn pick(reviewer: &str, path: &str, n: u32) -> ReviewerChoice {
        ReviewerChoice {
            reviewer_id: reviewer.into(),
            path_id: path.into(),
            level_number: n,
        }
    }

    #[test]
    fn half_rounds_up() {
        assert_eq!(round_half_up(5, 2), 3);
        assert_eq!(round_half_up(7, 3), 2);
        assert_eq!(round_half_up(8, 3), 3);
        assert_eq!(round_half_up(6, 3), 2);
    }

    #[test]
    fn mean_snaps_to_existing_level() {
        // (1 + 2 + 4) / 3 = 2.33 -> 2
        let p = average_proposal(
            &catalog(),
            "c",
            &[pick("a", "ic", 1), pick("b", "ic", 2), pick("c", "ic", 4)],
        )
        .unwrap()
        .unwrap();
        assert_eq!(p.level_id, "ic-2");
        assert_eq!(p.reviewer_count, 3);
        assert!((p.average_level_number - 7.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn missing_ordinal_clamps_to_higher_neighbour_on_tie() {
        // (2 + 4) / 2 = 3, no ic level 3; 2 and 4 are equally close.
        let p = average_proposal(&catalog(), "c", &[pick("a", "ic", 2), pick("b", "ic", 4)])
            .unwrap()
            .unwrap();
        assert_eq!(p.level_id, "ic-4");
    }

    #[test]
    fn majority_path_wins_and_ties_follow_catalog_order() {
        let p = average_proposal(
            &catalog(),
            "c",
            &[pick("a", "mgmt", 5), pick("b", "mgmt", 3), pick("c", "ic", 4)],
        )
        .unwrap()
        .unwrap();
        assert_eq!(p.path_id, "mgmt");
        assert_eq!(p.level_id, "m-5");

        let tie = average_proposal(&catalog(), "c", &[pick("a", "mgmt", 3), pick("b", "ic", 1)])
            .unwrap()
            .unwrap();
        assert_eq!(tie.path_id, "ic");
    }

    #[test]
    fn no_choices_no_proposal() {
        assert!(average_proposal(&catalog(), "c", &[]).unwrap().is_none());
    }

    #[test]
    fn weighted_score_ignores_order() {
        let entries = [(3, 4), (1, 2), (2, 5)];
        let forward = weighted_score(entries).unwrap();
        let backward = weighted_score(entries.iter().rev().copied()).unwrap();
        assert_eq!(forward, backward);
        // (12 + 2 + 10) / 6 = 4
        assert!((forward.score - 4.0).abs() < 1e-12);
        assert_eq!(forward.level_number, 4);
    }

    #[test]
    fn weighted_score_rounds_half_up() {
        // (1*2 + 1*3) / 2 = 2.5
        let s = weighted_score([(1, 2), (1, 3)]).unwrap();
        assert_eq!(s.level_number, 3);
        assert!(weighted_score(std::iter::empty()).is_none());
    }

    #[test]
    fn completion_report_quorum() {
        let two = CompletionReport::new(3, vec!["a".into(), "b".into()], 3);
        assert!(!two.quorum_met);
        let three = CompletionReport::new(3, vec!["a".into(), "b".into(), "c".into()], 3);
        assert!(three.quorum_met);
        assert_eq!(three.complete, 3);
    }
}
