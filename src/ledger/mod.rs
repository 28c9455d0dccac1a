//! Encrypted ledger for free-text justifications and comments.
//!
//! Write path:
//! 1. read the current tail hash
//! 2. encrypt under the active data key (AES-256-GCM, record type as AAD)
//! 3. sign the ciphertext with the author's key
//! 4. `chain_hash = SHA-256(ciphertext ‖ previous)`
//! 5. inside the caller's transaction, insert the row and move the tail with a
//!    compare-and-swap on the previous hash
//!
//! Steps 1-4 ([`Ledger::seal`]) hold no database lock, so slow key-service
//! calls never block other writers. If another append lands in between, step 5
//! ([`Ledger::insert_sealed`]) fails with a `Conflict` and the caller reseals
//! against the fresh tail.
//!
//! Read path verifies the signature before touching the key service, then
//! decrypts. The three failure classes stay apart: `KeyUnavailable` (cannot
//! read right now), `Integrity(SignatureMismatch | PayloadTampered)` (payload
//! compromised), `Integrity(ChainBreak)` (history altered).

pub mod chain;
pub mod record;

pub use chain::{chain_hash, ChainReport};
pub use record::{LedgerRef, RecordType, StoredRecord};

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::error::{IntegrityViolation, Result, ReviewError};
use crate::keys::{KeyError, KeyHandle, KeyManagement, SealedBox};
use crate::store::rows::ts;
use crate::store::Database;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;

/// A payload ready to be appended, bound to the tail it was sealed against.
#[derive(Debug, Clone)]
pub struct SealedPayload {
    pub record_type: RecordType,
    pub sealed: SealedBox,
    pub key: KeyHandle,
    pub signature: Vec<u8>,
    pub signer_public_key: Vec<u8>,
    pub signer_id: String,
    pub previous_chain_hash: String,
    pub chain_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A decrypted, verified ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub reference: LedgerRef,
    pub record_type: RecordType,
    pub text: String,
    pub signer_id: String,
    pub created_at: DateTime<Utc>,
}

pub struct Ledger {
    db: Arc<Database>,
    keys: Arc<dyn KeyManagement>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(
        db: Arc<Database>,
        keys: Arc<dyn KeyManagement>,
        clock: Arc<dyn Clock>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            db,
            keys,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Encrypt, sign, and chain `text` against the current tail.
    pub fn seal(&self, author_id: &str, record_type: RecordType, text: &str) -> Result<SealedPayload> {
        if text.len() > self.config.max_plaintext_bytes {
            return Err(ReviewError::validation(format!(
                "{record_type} text is {} bytes, limit is {}",
                text.len(),
                self.config.max_plaintext_bytes
            )));
        }
        if author_id.trim().is_empty() {
            return Err(ReviewError::validation("ledger author id cannot be empty"));
        }

        let (previous_chain_hash, _) = self.db.read(chain::read_tail)?;
        let aad = record_type.as_str().as_bytes();

        let key = self.with_key_retry("active_key", || self.keys.active_key())?;
        let sealed = self.with_key_retry("encrypt", || self.keys.encrypt(&key, text.as_bytes(), aad))?;
        let signed = self.with_key_retry("sign", || self.keys.sign(author_id, &sealed.ciphertext))?;

        let chain_hash = chain_hash(&sealed.ciphertext, &previous_chain_hash).ok_or_else(|| {
            IntegrityViolation::ChainBreak {
                record_id: 0,
                detail: "ledger tail hash is malformed".into(),
            }
        })?;

        Ok(SealedPayload {
            record_type,
            sealed,
            key,
            signature: signed.signature,
            signer_public_key: signed.public_key,
            signer_id: author_id.to_string(),
            previous_chain_hash,
            chain_hash,
            created_at: self.clock.now(),
        })
    }

    /// Append a sealed payload inside an open transaction.
    ///
    /// Fails with `Conflict` when the tail moved since [`Ledger::seal`].
    pub fn insert_sealed(&self, conn: &Connection, payload: SealedPayload) -> Result<LedgerRef> {
        let (current_tail, _) = chain::read_tail(conn)?;
        if current_tail != payload.previous_chain_hash {
            return Err(ReviewError::conflict(format!(
                "ledger tail moved from {} to {}",
                short(&payload.previous_chain_hash),
                short(&current_tail)
            )));
        }

        conn.execute(
            "INSERT INTO ledger_records
                (record_type, ciphertext, nonce, tag, key_version, key_id, signature,
                 signer_public_key, signer_id, previous_chain_hash, chain_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                payload.record_type.as_str(),
                payload.sealed.ciphertext,
                payload.sealed.nonce,
                payload.sealed.tag,
                payload.key.version,
                payload.key.key_id,
                payload.signature,
                payload.signer_public_key,
                payload.signer_id,
                payload.previous_chain_hash,
                payload.chain_hash,
                ts(payload.created_at),
            ],
        )?;
        let id = conn.last_insert_rowid();

        let moved = conn.execute(
            "UPDATE ledger_tail SET tail_hash = ?1, last_record_id = ?2
             WHERE id = 1 AND tail_hash = ?3",
            params![payload.chain_hash, id, payload.previous_chain_hash],
        )?;
        if moved != 1 {
            return Err(ReviewError::conflict("ledger tail moved during append"));
        }

        tracing::debug!(
            record_id = id,
            record_type = %payload.record_type,
            signer = %payload.signer_id,
            key_version = payload.key.version,
            "Ledger record appended"
        );
        Ok(LedgerRef(id))
    }

    /// Seal and append in one go, resealing on tail conflicts.
    pub fn append(&self, author_id: &str, record_type: RecordType, text: &str) -> Result<LedgerRef> {
        let mut attempt = 0;
        loop {
            let payload = self.seal(author_id, record_type, text)?;
            match self.db.write(|tx| self.insert_sealed(tx, payload)) {
                Err(ReviewError::Conflict(reason)) if attempt < self.config.append_retries => {
                    attempt += 1;
                    tracing::debug!(attempt, %reason, "Ledger tail conflict, resealing");
                }
                other => return other,
            }
        }
    }

    pub fn record(&self, reference: LedgerRef) -> Result<StoredRecord> {
        let row = self
            .db
            .read(|conn| record::find_record(conn, reference.0))?
            .ok_or_else(|| ReviewError::not_found(reference.to_string()))?;
        Ok(row.into_record()?)
    }

    /// Decrypt and verify one entry.
    pub fn read(&self, reference: LedgerRef) -> Result<LedgerEntry> {
        let stored = self.record(reference)?;
        self.open(&stored)
    }

    /// Read one entry and also re-walk the whole chain.
    pub fn read_verified(&self, reference: LedgerRef) -> Result<LedgerEntry> {
        self.verify_chain()?;
        self.read(reference)
    }

    fn open(&self, stored: &StoredRecord) -> Result<LedgerEntry> {
        if !self.keys.verify(
            &stored.signer_public_key,
            &stored.sealed.ciphertext,
            &stored.signature,
        ) {
            tracing::error!(record_id = stored.id, "Ledger signature verification failed");
            return Err(IntegrityViolation::SignatureMismatch {
                record_id: stored.id,
            }
            .into());
        }

        let aad = stored.record_type.as_str().as_bytes();
        let plain = match self.with_key_retry("decrypt", || {
            self.keys.decrypt(&stored.key, &stored.sealed, aad)
        }) {
            Ok(plain) => plain,
            Err(ReviewError::Integrity(_)) => {
                tracing::error!(record_id = stored.id, "Ledger payload failed authentication");
                return Err(IntegrityViolation::PayloadTampered {
                    record_id: stored.id,
                }
                .into());
            }
            Err(e) => return Err(e),
        };

        let text = String::from_utf8(plain).map_err(|_| IntegrityViolation::PayloadTampered {
            record_id: stored.id,
        })?;
        Ok(LedgerEntry {
            reference: LedgerRef(stored.id),
            record_type: stored.record_type,
            text,
            signer_id: stored.signer_id.clone(),
            created_at: stored.created_at,
        })
    }

    /// Re-hash the chain from the tail back to genesis and check every
    /// signature on the way.
    pub fn verify_chain(&self) -> Result<ChainReport> {
        let report = self.db.read(chain::verify_chain)?;
        self.db.read(|conn| {
            let sql = format!("SELECT {} FROM ledger_records ORDER BY id DESC", record::RECORD_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            for row in stmt.query_map([], record::map_record)? {
                let stored = chain::intact(row?)?;
                if !self.keys.verify(
                    &stored.signer_public_key,
                    &stored.sealed.ciphertext,
                    &stored.signature,
                ) {
                    return Err(IntegrityViolation::SignatureMismatch {
                        record_id: stored.id,
                    }
                    .into());
                }
            }
            Ok(())
        })?;
        tracing::info!(records = report.records_checked, "Ledger chain verified");
        Ok(report)
    }

    fn with_key_retry<T>(
        &self,
        op: &'static str,
        mut call: impl FnMut() -> std::result::Result<T, KeyError>,
    ) -> Result<T> {
        let attempts = self.config.key_retry_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.key_retry_backoff_ms);
        for attempt in 1..=attempts {
            match call() {
                Ok(value) => return Ok(value),
                Err(KeyError::Unavailable(reason)) if attempt < attempts => {
                    tracing::warn!(op, attempt, %reason, "Key service unavailable, backing off");
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(KeyError::Authentication) => {
                    return Err(IntegrityViolation::PayloadTampered { record_id: 0 }.into())
                }
                Err(e) => return Err(ReviewError::KeyUnavailable(format!("{op}: {e}"))),
            }
        }
        Err(ReviewError::KeyUnavailable(format!("{op}: retries exhausted")))
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
