// 📦 Commit Engine - atomic promotion of approved applications
//
// One SQLite transaction per run: every committable application, its
// Person rows, its Issuance rows and exactly one Batch row land together
// or not at all. The UNIQUE constraints on normalized phone/national ID
// are the last line of defense; a violation aborts the whole batch.

use std::collections::BTreeSet;
use std::fmt;

use chrono::Utc;

use crate::model::{Application, ApplicationStatus, Batch, Issuance, SystemFlag};
use crate::stage::apply_transition;
use crate::store::{self, Registry};

/// The resource this registry issues.
pub const BOOK_NAME: &str = "Shepherd Staff";

/// Languages the book is printed in; anything else falls back to the
/// default at issuance time.
pub const KNOWN_LANGUAGES: &[&str] = &["KISWAHILI", "ENGLISH", "FRENCH"];
pub const DEFAULT_LANGUAGE: &str = "ENGLISH";

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug)]
pub enum CommitError {
    /// No application is in a committable state
    NothingToCommit,

    /// A registry uniqueness constraint fired mid-commit; the whole batch
    /// rolled back
    Integrity(String),

    /// Underlying store failure; the whole batch rolled back
    Store(String),
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitError::NothingToCommit => write!(f, "No applications ready to commit"),
            CommitError::Integrity(msg) => {
                write!(f, "Integrity violation, batch rolled back: {}", msg)
            }
            CommitError::Store(msg) => write!(f, "Store error, batch rolled back: {}", msg),
        }
    }
}

impl std::error::Error for CommitError {}

impl From<rusqlite::Error> for CommitError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                CommitError::Integrity(e.to_string())
            }
            _ => CommitError::Store(e.to_string()),
        }
    }
}

impl From<anyhow::Error> for CommitError {
    fn from(e: anyhow::Error) -> Self {
        CommitError::Store(e.to_string())
    }
}

// ============================================================================
// COMMIT RECEIPT
// ============================================================================

#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub batch_id: String,
    pub committed: usize,
    pub persons_created: usize,
    pub persons_matched: usize,
}

// ============================================================================
// COMMIT ENGINE
// ============================================================================

pub struct CommitEngine {
    pub book_name: String,
    pub default_language: String,
    pub known_languages: Vec<String>,
}

impl CommitEngine {
    pub fn new() -> Self {
        CommitEngine {
            book_name: BOOK_NAME.to_string(),
            default_language: DEFAULT_LANGUAGE.to_string(),
            known_languages: KNOWN_LANGUAGES.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn language_for(&self, requested: &str) -> String {
        if self.known_languages.iter().any(|l| l == requested) {
            requested.to_string()
        } else {
            self.default_language.clone()
        }
    }

    /// Commit every APPROVED_READY / APPROVED / APPROVED_EXCEPTION
    /// application that has never been committed, in one transaction.
    ///
    /// Person resolution: an application carrying a matched_person_id
    /// attaches its issuance to that Person; otherwise a new Person is
    /// created. A new Person whose normalized phone or national ID
    /// collides with the registry trips the UNIQUE constraint, the
    /// transaction aborts, and nothing from the batch persists.
    pub fn commit_batch(
        &self,
        registry: &mut Registry,
        source_label: &str,
        issued_by: &str,
    ) -> Result<CommitReceipt, CommitError> {
        let tx = registry.conn_mut().transaction()?;

        let apps = store::fetch_committable(&tx)?;
        if apps.is_empty() {
            return Err(CommitError::NothingToCommit);
        }

        let source_files: BTreeSet<&str> =
            apps.iter().map(|a| a.source_file.as_str()).collect();
        let source_files = source_files.into_iter().collect::<Vec<_>>().join(";");
        let batch = Batch::new(
            source_label,
            &source_files,
            &format!("{} applications", apps.len()),
        );
        let issued_at = Utc::now().format("%Y-%m-%d").to_string();

        let mut persons_created = 0;
        let mut persons_matched = 0;
        let committed = apps.len();

        for mut app in apps {
            let person_id = match app.matched_person_id {
                Some(pid) => {
                    persons_matched += 1;
                    pid
                }
                None => {
                    persons_created += 1;
                    store::insert_person_from_application(&tx, &app)?
                }
            };

            self.record_issuance(&tx, &mut app, person_id, &issued_at, issued_by, &batch)?;

            if app.status == ApplicationStatus::ApprovedReady {
                apply_transition(&mut app, ApplicationStatus::Approved)
                    .map_err(|e| CommitError::Store(e.to_string()))?;
            }
            app.matched_person_id = Some(person_id);
            app.batch_id = Some(batch.batch_id.clone());
            store::update_application(&tx, &app)?;
        }

        store::insert_batch(&tx, &batch)?;
        tx.commit()?;

        Ok(CommitReceipt {
            batch_id: batch.batch_id,
            committed,
            persons_created,
            persons_matched,
        })
    }

    fn record_issuance(
        &self,
        conn: &rusqlite::Connection,
        app: &mut Application,
        person_id: i64,
        issued_at: &str,
        issued_by: &str,
        batch: &Batch,
    ) -> Result<(), CommitError> {
        let is_exception = app.status == ApplicationStatus::ApprovedException;
        if is_exception {
            app.add_flag(SystemFlag::AdminOverride);
        }
        let issuance = Issuance {
            issuance_id: 0,
            person_id,
            issued_at: issued_at.to_string(),
            book_name: self.book_name.clone(),
            language: self.language_for(&app.requested_language),
            issued_by: issued_by.to_string(),
            notes: app.admin_notes.clone(),
            is_exception,
            exception_type: if is_exception {
                "ADMIN_OVERRIDE".to_string()
            } else {
                String::new()
            },
            exception_reason: if is_exception {
                app.override_reason.clone()
            } else {
                String::new()
            },
            batch_id: batch.batch_id.clone(),
        };
        store::insert_issuance(conn, &issuance)?;
        Ok(())
    }
}

impl Default for CommitEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
