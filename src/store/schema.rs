//! Relational schema.
//!
//! The ledger tables enforce append-only semantics in SQLite itself: the
//! triggers fire for every connection, so no caller can rewrite history
//! through this crate or around it.

use rusqlite::Connection;

/// Chain hash that the first ledger record links to (32 zero bytes, hex).
pub const GENESIS_CHAIN_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

pub(crate) fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS ledger_records (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            record_type         TEXT NOT NULL,
            ciphertext          BLOB NOT NULL,
            nonce               BLOB NOT NULL,
            tag                 BLOB NOT NULL,
            key_version         INTEGER NOT NULL,
            key_id              TEXT NOT NULL,
            signature           BLOB NOT NULL,
            signer_public_key   BLOB NOT NULL,
            signer_id           TEXT NOT NULL,
            previous_chain_hash TEXT NOT NULL,
            chain_hash          TEXT NOT NULL UNIQUE,
            created_at          TEXT NOT NULL
        );

        CREATE TRIGGER IF NOT EXISTS ledger_records_no_update
        BEFORE UPDATE ON ledger_records
        BEGIN
            SELECT RAISE(ABORT, 'ledger_records is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS ledger_records_no_delete
        BEFORE DELETE ON ledger_records
        BEGIN
            SELECT RAISE(ABORT, 'ledger_records is append-only');
        END;

        CREATE TABLE IF NOT EXISTS ledger_tail (
            id             INTEGER PRIMARY KEY CHECK (id = 1),
            tail_hash      TEXT NOT NULL,
            last_record_id INTEGER
        );
        INSERT OR IGNORE INTO ledger_tail (id, tail_hash, last_record_id)
        VALUES (1, '0000000000000000000000000000000000000000000000000000000000000000', NULL);

        CREATE TABLE IF NOT EXISTS assessments (
            id                TEXT PRIMARY KEY,
            catalog_id        TEXT NOT NULL,
            owner_id          TEXT NOT NULL,
            status            TEXT NOT NULL,
            previous_status   TEXT,
            created_at        TEXT NOT NULL,
            submitted_at      TEXT,
            in_review_at      TEXT,
            consolidation_at  TEXT,
            reviewed_at       TEXT,
            discussion_at     TEXT,
            archived_at       TEXT,
            closed_at         TEXT,
            revert_deadline   TEXT,
            updated_at        TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_assessments_active_owner
            ON assessments(catalog_id, owner_id)
            WHERE status NOT IN ('archived', 'closed');
        CREATE INDEX IF NOT EXISTS idx_assessments_owner ON assessments(owner_id);

        CREATE TABLE IF NOT EXISTS assessment_reviewers (
            assessment_id TEXT NOT NULL REFERENCES assessments(id),
            reviewer_id   TEXT NOT NULL,
            assigned_at   TEXT NOT NULL,
            PRIMARY KEY (assessment_id, reviewer_id)
        );

        CREATE TABLE IF NOT EXISTS assessment_responses (
            assessment_id     TEXT NOT NULL REFERENCES assessments(id),
            category_id       TEXT NOT NULL,
            path_id           TEXT NOT NULL,
            level_id          TEXT NOT NULL,
            justification_ref INTEGER REFERENCES ledger_records(id),
            updated_at        TEXT NOT NULL,
            PRIMARY KEY (assessment_id, category_id)
        );

        CREATE TABLE IF NOT EXISTS reviewer_responses (
            assessment_id     TEXT NOT NULL REFERENCES assessments(id),
            category_id       TEXT NOT NULL,
            reviewer_id       TEXT NOT NULL,
            path_id           TEXT NOT NULL,
            level_id          TEXT NOT NULL,
            justification_ref INTEGER REFERENCES ledger_records(id),
            updated_at        TEXT NOT NULL,
            PRIMARY KEY (assessment_id, category_id, reviewer_id)
        );

        CREATE TABLE IF NOT EXISTS category_proposals (
            assessment_id        TEXT NOT NULL REFERENCES assessments(id),
            category_id          TEXT NOT NULL,
            average_level_number REAL NOT NULL,
            path_id              TEXT NOT NULL,
            level_id             TEXT NOT NULL,
            level_number         INTEGER NOT NULL,
            reviewer_count       INTEGER NOT NULL,
            generated_at         TEXT NOT NULL,
            PRIMARY KEY (assessment_id, category_id)
        );

        CREATE TABLE IF NOT EXISTS consolidation_overrides (
            assessment_id     TEXT NOT NULL REFERENCES assessments(id),
            category_id       TEXT NOT NULL,
            path_id           TEXT NOT NULL,
            level_id          TEXT NOT NULL,
            justification_ref INTEGER REFERENCES ledger_records(id),
            created_by        TEXT NOT NULL,
            created_at        TEXT NOT NULL,
            PRIMARY KEY (assessment_id, category_id)
        );

        CREATE TABLE IF NOT EXISTS approvals (
            subject_type  TEXT NOT NULL,
            subject_id    TEXT NOT NULL,
            approver_id   TEXT NOT NULL,
            assessment_id TEXT NOT NULL REFERENCES assessments(id),
            approver_role TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            PRIMARY KEY (subject_type, subject_id, approver_id)
        );
        CREATE INDEX IF NOT EXISTS idx_approvals_assessment ON approvals(assessment_id);

        CREATE TRIGGER IF NOT EXISTS approvals_no_update
        BEFORE UPDATE ON approvals
        BEGIN
            SELECT RAISE(ABORT, 'approvals are insert/delete only');
        END;

        CREATE TABLE IF NOT EXISTS final_consolidations (
            assessment_id TEXT PRIMARY KEY REFERENCES assessments(id),
            comment_ref   INTEGER REFERENCES ledger_records(id),
            created_by    TEXT NOT NULL,
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS category_comments (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            assessment_id TEXT NOT NULL REFERENCES assessments(id),
            category_id   TEXT NOT NULL,
            author_id     TEXT NOT NULL,
            comment_ref   INTEGER REFERENCES ledger_records(id),
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_category_comments_assessment
            ON category_comments(assessment_id, category_id);

        CREATE TABLE IF NOT EXISTS discussion_notes (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            assessment_id TEXT NOT NULL REFERENCES assessments(id),
            author_id     TEXT NOT NULL,
            note_ref      INTEGER REFERENCES ledger_records(id),
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS discussion_results (
            assessment_id        TEXT PRIMARY KEY REFERENCES assessments(id),
            overall_score        REAL NOT NULL,
            overall_level_number INTEGER NOT NULL,
            final_comment_ref    INTEGER REFERENCES ledger_records(id),
            snapshot_json        TEXT NOT NULL,
            generated_at         TEXT NOT NULL
        );

        CREATE TRIGGER IF NOT EXISTS discussion_results_no_update
        BEFORE UPDATE ON discussion_results
        BEGIN
            SELECT RAISE(ABORT, 'discussion results are immutable');
        END;

        CREATE TRIGGER IF NOT EXISTS discussion_results_no_delete
        BEFORE DELETE ON discussion_results
        BEGIN
            SELECT RAISE(ABORT, 'discussion results are immutable');
        END;",
    )
}
