//! Read-only skill catalog consumed from the catalog collaborator.
//!
//! A catalog version lists weighted categories, career paths, and the levels
//! of each path. Levels carry an ordinal (`number`) that the aggregation math
//! works on. Nothing in this crate mutates a catalog.

use crate::error::{Result, ReviewError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    /// Relative weight in the overall score. Always > 0.
    pub weight: u32,
    /// Whether the owner must answer it before submitting.
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub id: String,
    pub path_id: String,
    pub name: String,
    /// Ordinal within the path; higher is more senior.
    pub number: u32,
}

/// One immutable catalog version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub id: String,
    pub categories: Vec<Category>,
    pub paths: Vec<Path>,
    pub levels: Vec<Level>,
}

impl Catalog {
    /// Build a catalog and check it is internally consistent.
    pub fn new(
        id: impl Into<String>,
        categories: Vec<Category>,
        paths: Vec<Path>,
        levels: Vec<Level>,
    ) -> Result<Self> {
        let catalog = Self {
            id: id.into(),
            categories,
            paths,
            levels,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            return Err(ReviewError::validation(format!(
                "catalog {} has no categories",
                self.id
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for category in &self.categories {
            if category.weight == 0 {
                return Err(ReviewError::validation(format!(
                    "category {} has zero weight",
                    category.id
                )));
            }
            if !seen.insert(category.id.as_str()) {
                return Err(ReviewError::validation(format!(
                    "duplicate category {}",
                    category.id
                )));
            }
        }
        for level in &self.levels {
            if self.path(&level.path_id).is_none() {
                return Err(ReviewError::validation(format!(
                    "level {} references unknown path {}",
                    level.id, level.path_id
                )));
            }
        }
        Ok(())
    }

    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn path(&self, id: &str) -> Option<&Path> {
        self.paths.iter().find(|p| p.id == id)
    }

    pub fn level(&self, id: &str) -> Option<&Level> {
        self.levels.iter().find(|l| l.id == id)
    }

    /// Levels of one path, lowest ordinal first.
    pub fn levels_for_path(&self, path_id: &str) -> Vec<&Level> {
        let mut levels: Vec<&Level> = self.levels.iter().filter(|l| l.path_id == path_id).collect();
        levels.sort_by_key(|l| l.number);
        levels
    }

    pub fn required_categories(&self) -> impl Iterator<Item = &Category> {
        self.categories.iter().filter(|c| c.required)
    }

    /// Check a (category, path, level) choice and return the chosen level.
    pub fn resolve_choice(&self, category_id: &str, path_id: &str, level_id: &str) -> Result<&Level> {
        if self.category(category_id).is_none() {
            return Err(ReviewError::validation(format!(
                "unknown category {category_id} in catalog {}",
                self.id
            )));
        }
        if self.path(path_id).is_none() {
            return Err(ReviewError::validation(format!("unknown path {path_id}")));
        }
        let level = self
            .level(level_id)
            .ok_or_else(|| ReviewError::validation(format!("unknown level {level_id}")))?;
        if level.path_id != path_id {
            return Err(ReviewError::validation(format!(
                "level {level_id} does not belong to path {path_id}"
            )));
        }
        Ok(level)
    }
}

/// The catalog collaborator.
pub trait CatalogProvider: Send + Sync {
    fn catalog(&self, catalog_id: &str) -> Option<Arc<Catalog>>;
}

/// In-memory catalog registry.
#[derive(Debug, Default)]
pub struct StaticCatalogs {
    catalogs: RwLock<BTreeMap<String, Arc<Catalog>>>,
}

impl StaticCatalogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(catalog: Catalog) -> Self {
        let registry = Self::new();
        registry.insert(catalog);
        registry
    }

    pub fn insert(&self, catalog: Catalog) {
        self.catalogs
            .write()
            .insert(catalog.id.clone(), Arc::new(catalog));
    }
}

impl CatalogProvider for StaticCatalogs {
    fn catalog(&self, catalog_id: &str) -> Option<Arc<Catalog>> {
        self.catalogs.read().get(catalog_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Catalog {
        Catalog::new(
            "cat-v1",
            vec![
                Category { id: "rust".into(), name: "Rust".into(), weight: 2, required: true },
                Category { id: "ops".into(), name: "Operations".into(), weight: 1, required: false },
            ],
            vec![Path { id: "ic".into(), name: "Individual contributor".into() }],
            vec![
                Level { id: "ic-3".into(), path_id: "ic".into(), name: "Senior".into(), number: 3 },
                Level { id: "ic-1".into(), path_id: "ic".into(), name: "Junior".into(), number: 1 },
            ],
        )
        .unwrap()
    }

    #[test]
    fn levels_are_sorted_by_number() {
        let catalog = sample();
        let numbers: Vec<u32> = catalog.levels_for_path("ic").iter().map(|l| l.number).collect();
        assert_eq!(numbers, vec![1, 3]);
    }

    #[test]
    fn resolve_choice_rejects_foreign_level() {
        let mut catalog = sample();
        catalog.paths.push(Path { id: "mgmt".into(), name: "Management".into() });
        let err = catalog.resolve_choice("rust", "mgmt", "ic-3").unwrap_err();
        assert!(err.to_string().contains("does not belong"));
    }

    #[test]
    fn zero_weight_category_is_rejected() {
        let err = Catalog::new(
            "bad",
            vec![Category { id: "x".into(), name: "X".into(), weight: 0, required: true }],
            vec![],
            vec![],
        )
        .unwrap_err();
        assert!(err.to_string().contains("zero weight"));
    }

    #[test]
    fn provider_returns_registered_catalog() {
        let registry = StaticCatalogs::with(sample());
        assert!(registry.catalog("cat-v1").is_some());
        assert!(registry.catalog("cat-v2").is_none());
        assert_eq!(registry.catalog("cat-v1").unwrap().required_categories().count(), 1);
    }
}
