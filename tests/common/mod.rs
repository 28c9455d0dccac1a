#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use skillpanel::{
    Actor, Catalog, Category, Database, Ledger, LedgerConfig, Level, LocalKeyring, ManualClock,
    MemorySink, Path, ResponseInput, ReviewConfig, ReviewService, StaticCatalogs,
};
use std::sync::Arc;

pub const CATALOG: &str = "eng-v1";
pub const CATEGORIES: [&str; 5] = ["c1", "c2", "c3", "c4", "c5"];

pub struct Fixture {
    pub db: Arc<Database>,
    pub keys: Arc<LocalKeyring>,
    pub ledger: Arc<Ledger>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<MemorySink>,
    pub service: ReviewService,
}

/// Five categories weighted 1..=5, all required. Two paths.
pub fn catalog() -> Catalog {
    let categories = CATEGORIES
        .iter()
        .enumerate()
        .map(|(i, id)| Category {
            id: (*id).into(),
            name: format!("Category {}", i + 1),
            weight: i as u32 + 1,
            required: true,
        })
        .collect();
    let mut levels: Vec<Level> = (1..=5)
        .map(|n| Level {
            id: format!("ic-{n}"),
            path_id: "ic".into(),
            name: format!("IC {n}"),
            number: n,
        })
        .collect();
    levels.push(Level { id: "m-3".into(), path_id: "mgmt".into(), name: "Manager".into(), number: 3 });
    levels.push(Level { id: "m-4".into(), path_id: "mgmt".into(), name: "Director".into(), number: 4 });
    Catalog::new(
        CATALOG,
        categories,
        vec![
            Path { id: "ic".into(), name: "Individual contributor".into() },
            Path { id: "mgmt".into(), name: "Management".into() },
        ],
        levels,
    )
    .unwrap()
}

pub fn fixture(quorum: u32) -> Fixture {
    fixture_with_db(Arc::new(Database::open_in_memory().unwrap()), quorum)
}

pub fn fixture_with_db(db: Arc<Database>, quorum: u32) -> Fixture {
    let keys = Arc::new(LocalKeyring::generate());
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()));
    let events = Arc::new(MemorySink::new());
    let ledger = Arc::new(Ledger::new(
        db.clone(),
        keys.clone(),
        clock.clone(),
        LedgerConfig::default(),
    ));
    let service = ReviewService::new(
        db.clone(),
        ledger.clone(),
        Arc::new(StaticCatalogs::with(catalog())),
        ReviewConfig {
            quorum,
            revert_window_hours: 24,
        },
    )
    .with_events(events.clone())
    .with_clock(clock.clone());
    Fixture {
        db,
        keys,
        ledger,
        clock,
        events,
        service,
    }
}

pub fn owner() -> Actor {
    Actor::owner("alice")
}

pub fn reviewer(n: usize) -> Actor {
    Actor::reviewer(format!("rev-{n}"))
}

pub fn admin() -> Actor {
    Actor::admin("root")
}

/// Draft every category at `ic-3` and submit.
pub fn submitted(f: &Fixture) -> String {
    let a = f.service.create_assessment(&owner(), CATALOG).unwrap();
    for category in CATEGORIES {
        f.service
            .save_response(
                &owner(),
                &a.id,
                ResponseInput::new(category, "ic", "ic-3")
                    .with_justification(format!("I own {category} end to end.")),
            )
            .unwrap();
    }
    f.service.submit(&owner(), &a.id).unwrap();
    a.id
}

/// `reviewer` answers every category with the level `pick` returns.
pub fn review_all(f: &Fixture, assessment_id: &str, reviewer: &Actor, pick: impl Fn(&str) -> u32) {
    for category in CATEGORIES {
        f.service
            .save_reviewer_response(
                reviewer,
                assessment_id,
                ResponseInput::new(category, "ic", format!("ic-{}", pick(category)))
                    .with_justification(format!("{} on {category}", reviewer.user_id)),
            )
            .unwrap();
    }
}

/// Submitted, reviewed by three reviewers at `ic-3`, consolidation begun.
pub fn consolidating(f: &Fixture) -> String {
    let id = submitted(f);
    for n in 1..=3 {
        review_all(f, &id, &reviewer(n), |_| 3);
    }
    f.service.begin_consolidation(&reviewer(1), &id).unwrap();
    id
}
