// 🗄️ Registry store - SQLite repository for the person registry
//
// One connection, one writer. Components never hold an ambient connection;
// they receive the `Registry` (or run inside a transaction it opens). Row
// mapping helpers take `&Connection` so the same code serves both direct
// reads and transactional scopes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use crate::model::{
    flags_from_string, flags_to_string, Application, ApplicationStatus, Batch, Issuance, Person,
};

// ============================================================================
// REGISTRY
// ============================================================================

pub struct Registry {
    conn: Connection,
}

impl Registry {
    /// Open (or create) the registry database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open registry at {:?}", path.as_ref()))?;
        let registry = Registry { conn };
        registry.setup()?;
        Ok(registry)
    }

    /// In-memory registry for tests.
    pub fn open_in_memory() -> Result<Self> {
        let registry = Registry {
            conn: Connection::open_in_memory()?,
        };
        registry.setup()?;
        Ok(registry)
    }

    fn setup(&self) -> Result<()> {
        setup_schema(&self.conn)
    }

    /// Raw connection access. Used by the commit engine to open its
    /// transaction and by tests to stage scenarios.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    // ------------------------------------------------------------------
    // Applications
    // ------------------------------------------------------------------

    /// Insert applications, skipping rows whose idempotency hash already
    /// exists. Returns (inserted, skipped_duplicates).
    pub fn insert_applications(&self, apps: &[Application]) -> Result<(usize, usize)> {
        let mut inserted = 0;
        let mut duplicates = 0;
        for app in apps {
            match insert_application(&self.conn, app) {
                Ok(_) => inserted += 1,
                Err(InsertError::Duplicate) => duplicates += 1,
                Err(InsertError::Other(e)) => return Err(e),
            }
        }
        Ok((inserted, duplicates))
    }

    pub fn application(&self, application_id: i64) -> Result<Option<Application>> {
        fetch_application(&self.conn, application_id)
    }

    pub fn applications(&self) -> Result<Vec<Application>> {
        fetch_applications(&self.conn, None)
    }

    pub fn applications_with_status(&self, status: ApplicationStatus) -> Result<Vec<Application>> {
        fetch_applications(&self.conn, Some(status))
    }

    /// Persist the mutable pipeline fields of an application.
    pub fn update_application(&self, app: &Application) -> Result<()> {
        update_application(&self.conn, app)
    }

    /// Applications that hold identity keys but are not yet committed:
    /// HELD or approved with no batch_id. The duplicate scan treats these
    /// like registry rows so cross-pass collisions surface before commit.
    pub fn uncommitted_applications(&self) -> Result<Vec<Application>> {
        fetch_uncommitted(&self.conn)
    }

    // ------------------------------------------------------------------
    // Persons & issuances
    // ------------------------------------------------------------------

    pub fn persons(&self) -> Result<Vec<Person>> {
        fetch_persons(&self.conn)
    }

    pub fn issuances_for_person(&self, person_id: i64) -> Result<Vec<Issuance>> {
        fetch_issuances_for_person(&self.conn, person_id)
    }

    /// Consistent read view for a Stage 2 pass: every person plus each
    /// person's latest issuance date.
    pub fn snapshot(&self) -> Result<RegistrySnapshot> {
        let persons = fetch_persons(&self.conn)?;
        let latest_issuance = fetch_latest_issuance_dates(&self.conn)?;
        Ok(RegistrySnapshot {
            persons,
            latest_issuance,
        })
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    pub fn batches(&self) -> Result<Vec<Batch>> {
        fetch_batches(&self.conn)
    }
}

// ============================================================================
// REGISTRY SNAPSHOT
// ============================================================================

/// Point-in-time view the duplicate detector scans: the full historical
/// registry, never just the current batch.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub persons: Vec<Person>,
    /// person_id → latest issued_at
    pub latest_issuance: HashMap<i64, String>,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_schema(conn: &Connection) -> Result<()> {
    // WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS persons (
            person_id INTEGER PRIMARY KEY AUTOINCREMENT,
            first_name TEXT NOT NULL,
            middle_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            full_name_original TEXT NOT NULL,
            full_name_normalized TEXT NOT NULL,
            name_key TEXT NOT NULL,
            phone_original TEXT NOT NULL DEFAULT '',
            phone_normalized TEXT UNIQUE,
            national_id_original TEXT NOT NULL DEFAULT '',
            national_id_normalized TEXT UNIQUE,
            country TEXT NOT NULL DEFAULT '',
            church_name TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS applications (
            application_id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            submitted_at TEXT NOT NULL,
            source_file TEXT NOT NULL,
            full_name_original TEXT NOT NULL,
            phone_original TEXT NOT NULL DEFAULT '',
            national_id_original TEXT NOT NULL DEFAULT '',
            country TEXT NOT NULL DEFAULT '',
            church_name TEXT NOT NULL DEFAULT '',
            title TEXT NOT NULL DEFAULT '',
            congregation_size TEXT NOT NULL DEFAULT '',
            requested_language TEXT NOT NULL DEFAULT '',
            received_before TEXT NOT NULL DEFAULT '',
            received_before_reason TEXT NOT NULL DEFAULT '',
            first_name TEXT NOT NULL DEFAULT '',
            middle_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            full_name_normalized TEXT NOT NULL DEFAULT '',
            name_key TEXT NOT NULL DEFAULT '',
            phone_normalized TEXT,
            national_id_normalized TEXT,
            is_disqualified INTEGER NOT NULL DEFAULT 0,
            disqualify_reason TEXT NOT NULL DEFAULT '',
            needs_review INTEGER NOT NULL DEFAULT 0,
            system_flags TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'PENDING',
            matched_person_id INTEGER REFERENCES persons(person_id),
            candidates TEXT NOT NULL DEFAULT '[]',
            admin_notes TEXT NOT NULL DEFAULT '',
            override_reason TEXT NOT NULL DEFAULT '',
            batch_id TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS issuances (
            issuance_id INTEGER PRIMARY KEY AUTOINCREMENT,
            person_id INTEGER NOT NULL REFERENCES persons(person_id),
            issued_at TEXT NOT NULL,
            book_name TEXT NOT NULL,
            language TEXT NOT NULL,
            issued_by TEXT NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            is_exception INTEGER NOT NULL DEFAULT 0,
            exception_type TEXT NOT NULL DEFAULT '',
            exception_reason TEXT NOT NULL DEFAULT '',
            batch_id TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batches (
            batch_id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            source_label TEXT NOT NULL DEFAULT '',
            source_files TEXT NOT NULL DEFAULT '',
            notes TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_persons_name_key ON persons(name_key)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_applications_status ON applications(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_applications_batch ON applications(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_issuances_person ON issuances(person_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// APPLICATION ROWS
// ============================================================================

pub enum InsertError {
    /// Idempotency hash already present - same row ingested before
    Duplicate,
    Other(anyhow::Error),
}

pub fn insert_application(conn: &Connection, app: &Application) -> Result<i64, InsertError> {
    let hash = app.compute_idempotency_hash();
    let candidates_json = candidates_to_json(&app.candidates).map_err(InsertError::Other)?;
    let result = conn.execute(
        "INSERT INTO applications (
            idempotency_hash, submitted_at, source_file,
            full_name_original, phone_original, national_id_original,
            country, church_name, title, congregation_size,
            requested_language, received_before, received_before_reason,
            first_name, middle_name, last_name,
            full_name_normalized, name_key, phone_normalized, national_id_normalized,
            is_disqualified, disqualify_reason, needs_review, system_flags,
            status, matched_person_id, candidates, admin_notes, override_reason, batch_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                  ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
                  ?27, ?28, ?29, ?30)",
        params![
            hash,
            app.submitted_at.to_rfc3339(),
            app.source_file,
            app.full_name_original,
            app.phone_original,
            app.national_id_original,
            app.country,
            app.church_name,
            app.title,
            app.congregation_size_raw,
            app.requested_language,
            app.received_before,
            app.received_before_reason,
            app.first_name,
            app.middle_name,
            app.last_name,
            app.full_name_normalized,
            app.name_key,
            app.phone_normalized,
            app.national_id_normalized,
            app.is_disqualified as i64,
            app.disqualify_reason,
            app.needs_review as i64,
            flags_to_string(&app.system_flags),
            app.status.as_str(),
            app.matched_person_id,
            candidates_json,
            app.admin_notes,
            app.override_reason,
            app.batch_id,
        ],
    );

    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(InsertError::Duplicate)
        }
        Err(e) => Err(InsertError::Other(e.into())),
    }
}

const APPLICATION_COLUMNS: &str = "application_id, submitted_at, source_file,
    full_name_original, phone_original, national_id_original,
    country, church_name, title, congregation_size,
    requested_language, received_before, received_before_reason,
    first_name, middle_name, last_name,
    full_name_normalized, name_key, phone_normalized, national_id_normalized,
    is_disqualified, disqualify_reason, needs_review, system_flags,
    status, matched_person_id, candidates, admin_notes, override_reason, batch_id";

/// Candidates persist as a JSON array on the application row.
fn candidates_to_json(candidates: &[crate::model::Candidate]) -> Result<String> {
    serde_json::to_string(candidates).context("Failed to serialize candidates")
}

fn candidates_from_json(s: &str) -> Vec<crate::model::Candidate> {
    serde_json::from_str(s).unwrap_or_default()
}

fn map_application(row: &rusqlite::Row<'_>) -> rusqlite::Result<Application> {
    let submitted_at: String = row.get(1)?;
    let flags: String = row.get(23)?;
    let status: String = row.get(24)?;
    let candidates: String = row.get(26)?;
    Ok(Application {
        application_id: row.get(0)?,
        submitted_at: parse_timestamp(&submitted_at)?,
        source_file: row.get(2)?,
        full_name_original: row.get(3)?,
        phone_original: row.get(4)?,
        national_id_original: row.get(5)?,
        country: row.get(6)?,
        church_name: row.get(7)?,
        title: row.get(8)?,
        congregation_size_raw: row.get(9)?,
        requested_language: row.get(10)?,
        received_before: row.get(11)?,
        received_before_reason: row.get(12)?,
        first_name: row.get(13)?,
        middle_name: row.get(14)?,
        last_name: row.get(15)?,
        full_name_normalized: row.get(16)?,
        name_key: row.get(17)?,
        phone_normalized: row.get(18)?,
        national_id_normalized: row.get(19)?,
        is_disqualified: row.get::<_, i64>(20)? != 0,
        disqualify_reason: row.get(21)?,
        needs_review: row.get::<_, i64>(22)? != 0,
        system_flags: flags_from_string(&flags),
        status: ApplicationStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                24,
                rusqlite::types::Type::Text,
                format!("Unrecognized application status '{}'", status).into(),
            )
        })?,
        matched_person_id: row.get(25)?,
        candidates: candidates_from_json(&candidates),
        admin_notes: row.get(27)?,
        override_reason: row.get(28)?,
        batch_id: row.get(29)?,
    })
}

fn parse_timestamp(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub fn fetch_application(conn: &Connection, application_id: i64) -> Result<Option<Application>> {
    let sql = format!(
        "SELECT {} FROM applications WHERE application_id = ?1",
        APPLICATION_COLUMNS
    );
    let app = conn
        .query_row(&sql, params![application_id], map_application)
        .optional()?;
    Ok(app)
}

pub fn fetch_applications(
    conn: &Connection,
    status: Option<ApplicationStatus>,
) -> Result<Vec<Application>> {
    let (sql, filter) = match status {
        Some(s) => (
            format!(
                "SELECT {} FROM applications WHERE status = ?1 ORDER BY application_id ASC",
                APPLICATION_COLUMNS
            ),
            Some(s.as_str()),
        ),
        None => (
            format!(
                "SELECT {} FROM applications ORDER BY application_id ASC",
                APPLICATION_COLUMNS
            ),
            None,
        ),
    };
    let mut stmt = conn.prepare(&sql)?;
    let apps = match filter {
        Some(s) => stmt
            .query_map(params![s], map_application)?
            .collect::<Result<Vec<_>, _>>()?,
        None => stmt
            .query_map([], map_application)?
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok(apps)
}

/// Applications eligible for commit: committable status, never committed.
pub fn fetch_committable(conn: &Connection) -> Result<Vec<Application>> {
    let sql = format!(
        "SELECT {} FROM applications
         WHERE status IN ('APPROVED_READY', 'APPROVED', 'APPROVED_EXCEPTION')
           AND batch_id IS NULL
         ORDER BY application_id ASC",
        APPLICATION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let apps = stmt
        .query_map([], map_application)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(apps)
}

/// Applications whose identity keys are live but not yet in `persons`.
pub fn fetch_uncommitted(conn: &Connection) -> Result<Vec<Application>> {
    let sql = format!(
        "SELECT {} FROM applications
         WHERE status IN ('HELD', 'APPROVED_READY', 'APPROVED', 'APPROVED_EXCEPTION')
           AND batch_id IS NULL
         ORDER BY application_id ASC",
        APPLICATION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let apps = stmt
        .query_map([], map_application)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(apps)
}

pub fn update_application(conn: &Connection, app: &Application) -> Result<()> {
    let updated = conn.execute(
        "UPDATE applications SET
            is_disqualified = ?1,
            disqualify_reason = ?2,
            needs_review = ?3,
            system_flags = ?4,
            status = ?5,
            matched_person_id = ?6,
            candidates = ?7,
            admin_notes = ?8,
            override_reason = ?9,
            batch_id = ?10
         WHERE application_id = ?11",
        params![
            app.is_disqualified as i64,
            app.disqualify_reason,
            app.needs_review as i64,
            flags_to_string(&app.system_flags),
            app.status.as_str(),
            app.matched_person_id,
            candidates_to_json(&app.candidates)?,
            app.admin_notes,
            app.override_reason,
            app.batch_id,
            app.application_id,
        ],
    )?;
    anyhow::ensure!(
        updated == 1,
        "Application {} not found for update",
        app.application_id
    );
    Ok(())
}

// ============================================================================
// PERSON ROWS
// ============================================================================

/// Create a Person from a committed application's identity fields.
/// Returns the new person_id. A uniqueness violation on normalized
/// phone/national ID surfaces as a rusqlite constraint error so the
/// caller's transaction can abort.
pub fn insert_person_from_application(
    conn: &Connection,
    app: &Application,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO persons (
            first_name, middle_name, last_name,
            full_name_original, full_name_normalized, name_key,
            phone_original, phone_normalized,
            national_id_original, national_id_normalized,
            country, church_name, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            app.first_name,
            app.middle_name,
            app.last_name,
            app.full_name_original,
            app.full_name_normalized,
            app.name_key,
            app.phone_original,
            app.phone_normalized,
            app.national_id_original,
            app.national_id_normalized,
            app.country,
            app.church_name,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_person(row: &rusqlite::Row<'_>) -> rusqlite::Result<Person> {
    let created_at: String = row.get(13)?;
    Ok(Person {
        person_id: row.get(0)?,
        first_name: row.get(1)?,
        middle_name: row.get(2)?,
        last_name: row.get(3)?,
        full_name_original: row.get(4)?,
        full_name_normalized: row.get(5)?,
        name_key: row.get(6)?,
        phone_original: row.get(7)?,
        phone_normalized: row.get(8)?,
        national_id_original: row.get(9)?,
        national_id_normalized: row.get(10)?,
        country: row.get(11)?,
        church_name: row.get(12)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

const PERSON_COLUMNS: &str = "person_id, first_name, middle_name, last_name,
    full_name_original, full_name_normalized, name_key,
    phone_original, phone_normalized, national_id_original, national_id_normalized,
    country, church_name, created_at";

pub fn fetch_persons(conn: &Connection) -> Result<Vec<Person>> {
    let sql = format!("SELECT {} FROM persons ORDER BY person_id ASC", PERSON_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let persons = stmt
        .query_map([], map_person)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(persons)
}

// ============================================================================
// ISSUANCE ROWS
// ============================================================================

pub fn insert_issuance(conn: &Connection, issuance: &Issuance) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO issuances (
            person_id, issued_at, book_name, language, issued_by, notes,
            is_exception, exception_type, exception_reason, batch_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            issuance.person_id,
            issuance.issued_at,
            issuance.book_name,
            issuance.language,
            issuance.issued_by,
            issuance.notes,
            issuance.is_exception as i64,
            issuance.exception_type,
            issuance.exception_reason,
            issuance.batch_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_issuance(row: &rusqlite::Row<'_>) -> rusqlite::Result<Issuance> {
    Ok(Issuance {
        issuance_id: row.get(0)?,
        person_id: row.get(1)?,
        issued_at: row.get(2)?,
        book_name: row.get(3)?,
        language: row.get(4)?,
        issued_by: row.get(5)?,
        notes: row.get(6)?,
        is_exception: row.get::<_, i64>(7)? != 0,
        exception_type: row.get(8)?,
        exception_reason: row.get(9)?,
        batch_id: row.get(10)?,
    })
}

const ISSUANCE_COLUMNS: &str = "issuance_id, person_id, issued_at, book_name,
    language, issued_by, notes, is_exception, exception_type, exception_reason, batch_id";

pub fn fetch_issuances_for_person(conn: &Connection, person_id: i64) -> Result<Vec<Issuance>> {
    let sql = format!(
        "SELECT {} FROM issuances WHERE person_id = ?1 ORDER BY issued_at DESC",
        ISSUANCE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let issuances = stmt
        .query_map(params![person_id], map_issuance)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(issuances)
}

/// person_id → latest issued_at, for the prior-issuance check.
pub fn fetch_latest_issuance_dates(conn: &Connection) -> Result<HashMap<i64, String>> {
    let mut stmt = conn.prepare(
        "SELECT person_id, MAX(issued_at) FROM issuances GROUP BY person_id",
    )?;
    let mut map = HashMap::new();
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (pid, issued_at) = row?;
        map.insert(pid, issued_at);
    }
    Ok(map)
}

// ============================================================================
// BATCH ROWS
// ============================================================================

pub fn insert_batch(conn: &Connection, batch: &Batch) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO batches (batch_id, created_at, source_label, source_files, notes)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            batch.batch_id,
            batch.created_at.to_rfc3339(),
            batch.source_label,
            batch.source_files,
            batch.notes,
        ],
    )?;
    Ok(())
}

pub fn fetch_batches(conn: &Connection) -> Result<Vec<Batch>> {
    let mut stmt = conn.prepare(
        "SELECT batch_id, created_at, source_label, source_files, notes
         FROM batches ORDER BY created_at DESC",
    )?;
    let batches = stmt
        .query_map([], |row| {
            let created_at: String = row.get(1)?;
            Ok(Batch {
                batch_id: row.get(0)?,
                created_at: parse_timestamp(&created_at)?,
                source_label: row.get(2)?,
                source_files: row.get(3)?,
                notes: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(batches)
}

// ============================================================================
// TESTS
// ============================================================================
