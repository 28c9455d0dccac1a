//! Panel review core for skill self-assessments.
//!
//! An owner drafts a self-assessment against a weighted skill catalog, a panel
//! of reviewers judges it independently, the panel consolidates one result per
//! category under an approval quorum, and both sides confirm the discussion.
//! Every free-text justification lives in an encrypted, signed, hash-chained
//! ledger.
//!
//! ```no_run
//! use skillpanel::{Config, Database, Ledger, LocalKeyring, ReviewService, StaticCatalogs, SystemClock};
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load_or_default(&Config::default_path())?;
//! let db = Arc::new(Database::open(&config.database_path)?);
//! let ledger = Arc::new(Ledger::new(
//!     db.clone(),
//!     Arc::new(LocalKeyring::generate()),
//!     Arc::new(SystemClock),
//!     config.ledger.clone(),
//! ));
//! let service = ReviewService::new(db, ledger, Arc::new(StaticCatalogs::new()), config.review);
//! # let _ = service;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod keys;
pub mod ledger;
pub mod review;
pub mod store;

pub use catalog::{Catalog, CatalogProvider, Category, Level, Path, StaticCatalogs};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, LedgerConfig, ReviewConfig};
pub use error::{ErrorKind, IntegrityViolation, Result, ReviewError};
pub use events::{AuditEvent, EventSink, MemorySink, Outcome, TracingSink};
pub use identity::{Actor, Role};
pub use keys::{KeyManagement, LocalKeyring};
pub use ledger::{Ledger, LedgerEntry, LedgerRef, RecordType};
pub use review::{Assessment, AssessmentStatus, ResponseInput, ReviewService};
pub use store::Database;
