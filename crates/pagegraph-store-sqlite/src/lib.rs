//! `SQLite` persistence for the page graph: schema migrations, the serialized
//! id allocator, content writes and a batched [`pagegraph_core::GraphSource`].

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use pagegraph_core::{next_id, Id};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod source;
mod writes;

pub use writes::{NewMark, NewPage, PageEdit};

const LATEST_SCHEMA_VERSION: i64 = 2;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS page_infos (
  page_id TEXT PRIMARY KEY,
  page_type TEXT NOT NULL CHECK (page_type IN ('wiki', 'comment', 'question', 'group')),
  alias TEXT NOT NULL,
  current_edit INTEGER NOT NULL DEFAULT 0 CHECK (current_edit >= 0),
  max_edit INTEGER NOT NULL DEFAULT 0 CHECK (max_edit >= current_edit),
  creator_id TEXT NOT NULL REFERENCES users(id),
  created_at TEXT NOT NULL,
  is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
  see_group_id TEXT,
  edit_group_id TEXT,
  lock_owner_id TEXT,
  locked_until TEXT
);

CREATE TABLE IF NOT EXISTS pages (
  page_id TEXT NOT NULL REFERENCES page_infos(page_id) ON DELETE CASCADE,
  edit_num INTEGER NOT NULL CHECK (edit_num > 0),
  creator_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  title TEXT NOT NULL,
  clickbait TEXT NOT NULL DEFAULT '',
  text TEXT NOT NULL DEFAULT '',
  edit_summary TEXT NOT NULL DEFAULT '',
  is_live_edit INTEGER NOT NULL DEFAULT 0 CHECK (is_live_edit IN (0, 1)),
  is_autosave INTEGER NOT NULL DEFAULT 0 CHECK (is_autosave IN (0, 1)),
  is_snapshot INTEGER NOT NULL DEFAULT 0 CHECK (is_snapshot IN (0, 1)),
  PRIMARY KEY (page_id, edit_num)
);

CREATE VIEW IF NOT EXISTS page_flags AS
SELECT
  page_id,
  page_type,
  is_deleted,
  current_edit > 0 AS is_published,
  see_group_id,
  creator_id
FROM page_infos;

CREATE TABLE IF NOT EXISTS page_pairs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  parent_id TEXT NOT NULL REFERENCES page_infos(page_id),
  child_id TEXT NOT NULL REFERENCES page_infos(page_id),
  pair_type TEXT NOT NULL CHECK (pair_type IN ('parent', 'tag', 'prerequisite', 'subject')),
  creator_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (parent_id, child_id, pair_type)
);

CREATE TABLE IF NOT EXISTS lenses (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  page_id TEXT NOT NULL REFERENCES page_infos(page_id),
  lens_id TEXT NOT NULL REFERENCES page_infos(page_id),
  lens_index INTEGER NOT NULL CHECK (lens_index >= 0),
  UNIQUE (page_id, lens_id)
);

CREATE TABLE IF NOT EXISTS answers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  question_id TEXT NOT NULL REFERENCES page_infos(page_id),
  answer_page_id TEXT NOT NULL REFERENCES page_infos(page_id),
  UNIQUE (question_id, answer_page_id)
);

CREATE TABLE IF NOT EXISTS links (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  from_id TEXT NOT NULL REFERENCES page_infos(page_id),
  to_id TEXT NOT NULL REFERENCES page_infos(page_id),
  UNIQUE (from_id, to_id)
);

CREATE TABLE IF NOT EXISTS page_summaries (
  page_id TEXT NOT NULL REFERENCES page_infos(page_id) ON DELETE CASCADE,
  name TEXT NOT NULL,
  text TEXT NOT NULL,
  PRIMARY KEY (page_id, name)
);

CREATE TABLE IF NOT EXISTS marks (
  id TEXT PRIMARY KEY,
  page_id TEXT NOT NULL REFERENCES page_infos(page_id),
  creator_id TEXT NOT NULL REFERENCES users(id),
  mark_type TEXT NOT NULL CHECK (mark_type IN ('query', 'typo', 'confusion')),
  anchor_context TEXT NOT NULL DEFAULT '',
  text TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL,
  resolved_page_id TEXT REFERENCES page_infos(page_id),
  is_submitted INTEGER NOT NULL DEFAULT 0 CHECK (is_submitted IN (0, 1))
);

CREATE TABLE IF NOT EXISTS visits (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  page_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS likes (
  page_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  value INTEGER NOT NULL CHECK (value BETWEEN -1 AND 1),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (page_id, user_id)
);

CREATE TABLE IF NOT EXISTS votes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  page_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  value INTEGER NOT NULL CHECK (value BETWEEN 0 AND 100),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
  user_id TEXT NOT NULL,
  to_id TEXT NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (user_id, to_id)
);

CREATE TABLE IF NOT EXISTS change_logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  page_id TEXT NOT NULL REFERENCES page_infos(page_id) ON DELETE CASCADE,
  edit_num INTEGER NOT NULL,
  user_id TEXT NOT NULL,
  change_type TEXT NOT NULL,
  aux_id TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS domains (
  id TEXT PRIMARY KEY,
  page_id TEXT NOT NULL REFERENCES page_infos(page_id),
  alias TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS page_domain_pairs (
  page_id TEXT NOT NULL REFERENCES page_infos(page_id),
  domain_id TEXT NOT NULL REFERENCES domains(id),
  PRIMARY KEY (page_id, domain_id)
);

CREATE TABLE IF NOT EXISTS domain_members (
  domain_id TEXT NOT NULL REFERENCES domains(id),
  user_id TEXT NOT NULL REFERENCES users(id),
  role TEXT NOT NULL CHECK (role IN ('banned', 'default', 'trusted', 'reviewer', 'arbiter')),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (domain_id, user_id)
);

CREATE TABLE IF NOT EXISTS group_members (
  group_id TEXT NOT NULL,
  user_id TEXT NOT NULL REFERENCES users(id),
  created_at TEXT NOT NULL,
  PRIMARY KEY (group_id, user_id)
);

CREATE TABLE IF NOT EXISTS user_masteries (
  user_id TEXT NOT NULL,
  page_id TEXT NOT NULL,
  has INTEGER NOT NULL DEFAULT 0 CHECK (has IN (0, 1)),
  wants INTEGER NOT NULL DEFAULT 0 CHECK (wants IN (0, 1)),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, page_id)
);

CREATE TABLE IF NOT EXISTS id_reservations (
  id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_page_pairs_parent ON page_pairs(parent_id, pair_type);
CREATE INDEX IF NOT EXISTS idx_page_pairs_child ON page_pairs(child_id, pair_type);
CREATE INDEX IF NOT EXISTS idx_lenses_page ON lenses(page_id, lens_index);
CREATE INDEX IF NOT EXISTS idx_answers_question ON answers(question_id);
CREATE INDEX IF NOT EXISTS idx_links_from ON links(from_id);
CREATE INDEX IF NOT EXISTS idx_marks_page ON marks(page_id);
CREATE INDEX IF NOT EXISTS idx_marks_resolved ON marks(resolved_page_id);
CREATE INDEX IF NOT EXISTS idx_visits_page_user ON visits(page_id, user_id);
CREATE INDEX IF NOT EXISTS idx_votes_page ON votes(page_id, created_at);
CREATE INDEX IF NOT EXISTS idx_subscriptions_to ON subscriptions(to_id);
CREATE INDEX IF NOT EXISTS idx_change_logs_page ON change_logs(page_id, id);
CREATE INDEX IF NOT EXISTS idx_domain_members_user ON domain_members(user_id);
CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);
CREATE INDEX IF NOT EXISTS idx_user_masteries_page ON user_masteries(page_id, user_id);
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SQL)];

/// Every table that hands out ids from the shared allocator. Ids compare by
/// length first, then symbol by symbol, which matches `SQLite`'s binary
/// collation for equal lengths.
const MAX_ID_SQL: &str = r"
SELECT id FROM (
  SELECT id FROM users
  UNION ALL SELECT page_id FROM page_infos
  UNION ALL SELECT id FROM marks
  UNION ALL SELECT id FROM domains
  UNION ALL SELECT id FROM id_reservations
)
ORDER BY LENGTH(id) DESC, id DESC
LIMIT 1
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Published pages whose `current_edit` has no row in `pages`.
    pub missing_live_edits: Vec<Id>,
    /// Pages with no edit at all.
    pub pages_without_edits: Vec<Id>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.missing_live_edits.is_empty()
            && self.pages_without_edits.is_empty()
    }
}

impl SqliteStore {
    /// Open a SQLite-backed page store with the default busy timeout.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open a SQLite-backed page store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(busy_timeout).context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails,
    /// or when the database was written by a newer schema.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        for (version, sql) in MIGRATIONS {
            self.with_transaction(|tx| {
                // Another connection may have applied it while this one waited.
                if current_schema_version(tx)? >= version {
                    return Ok(());
                }
                tx.execute_batch(sql)
                    .with_context(|| format!("failed to apply migration {version}"))?;
                record_schema_version(tx, version)?;
                tracing::debug!(version, "applied schema migration");
                Ok(())
            })?;
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run `work` inside an IMMEDIATE transaction. The write lock is taken
    /// up front, so reads inside `work` see a state no other writer can change
    /// before commit. Any error rolls the transaction back.
    ///
    /// # Errors
    /// Returns an error when the transaction cannot be started or committed, or
    /// whatever `work` returns.
    pub fn with_transaction<T>(
        &mut self,
        work: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start write transaction")?;
        let value = work(&tx)?;
        tx.commit().context("failed to commit write transaction")?;
        Ok(value)
    }

    /// The id the allocator would hand out next. Read-only; two callers may
    /// observe the same value.
    ///
    /// # Errors
    /// Returns an error when the current maximum cannot be read or is malformed.
    pub fn peek_next_id(&self) -> Result<Id> {
        let current = current_max_id(&self.conn)?;
        Ok(next_id(current.as_ref())?)
    }

    /// Allocate an id and persist the reservation, so no later allocation can
    /// return it again.
    ///
    /// # Errors
    /// Returns an error when the allocation transaction fails.
    pub fn reserve_id(&mut self) -> Result<Id> {
        self.with_transaction(|tx| {
            let id = allocate_id(tx)?;
            tx.execute(
                "INSERT INTO id_reservations(id, created_at) VALUES (?1, ?2)",
                params![id.as_str(), now_rfc3339()?],
            )
            .context("failed to record id reservation")?;
            Ok(id)
        })
    }

    /// Write a consistent copy of the database to `out_file` and confirm the
    /// copy carries the same schema version.
    ///
    /// # Errors
    /// Returns an error when the copy cannot be written or reads back at a
    /// different schema version.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(dir) = out_file.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create backup directory {}", dir.display()))?;
        }
        let source_version = self.schema_status()?.current_version;
        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to back up page store to {}", out_file.display()))?;

        let copy = Connection::open(out_file)
            .with_context(|| format!("failed to reopen backup {}", out_file.display()))?;
        let copy_version = current_schema_version(&copy)?;
        if copy_version != source_version {
            return Err(anyhow!(
                "backup {} is at schema version {copy_version}, expected {source_version}",
                out_file.display()
            ));
        }
        tracing::debug!(path = %out_file.display(), schema_version = copy_version, "backup written");
        Ok(())
    }

    /// `SQLite` health plus the page-graph invariants the loader relies on:
    /// a published page has a row for its live edit, and every page has at
    /// least one edit to materialize from.
    ///
    /// # Errors
    /// Returns an error when any of the check queries fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let foreign_key_violations = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read foreign key violations")?;

        let schema_status = self.schema_status()?;
        let (missing_live_edits, pages_without_edits) = if schema_status.current_version >= 1 {
            (
                page_ids_matching(&self.conn, MISSING_LIVE_EDIT_SQL)?,
                page_ids_matching(&self.conn, PAGES_WITHOUT_EDITS_SQL)?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            missing_live_edits,
            pages_without_edits,
            schema_status,
        })
    }
}

const MISSING_LIVE_EDIT_SQL: &str = "
SELECT pi.page_id FROM page_infos pi
WHERE pi.current_edit > 0
  AND NOT EXISTS (
    SELECT 1 FROM pages p WHERE p.page_id = pi.page_id AND p.edit_num = pi.current_edit
  )
ORDER BY pi.page_id";

const PAGES_WITHOUT_EDITS_SQL: &str = "
SELECT pi.page_id FROM page_infos pi
WHERE NOT EXISTS (SELECT 1 FROM pages p WHERE p.page_id = pi.page_id)
ORDER BY pi.page_id";

fn page_ids_matching(conn: &Connection, sql: &str) -> Result<Vec<Id>> {
    let mut stmt = conn.prepare(sql).context("failed to prepare page integrity query")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .map(|row| row.map(Id::new))
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to run page integrity query")?;
    Ok(ids)
}

fn current_max_id(conn: &Connection) -> Result<Option<Id>> {
    let current = conn
        .query_row(MAX_ID_SQL, [], |row| row.get::<_, String>(0))
        .optional()
        .context("failed to read current maximum id")?;
    Ok(current.map(Id::new))
}

/// Next free id. Must run inside a write transaction for the result to stay
/// free until the caller inserts it.
fn allocate_id(conn: &Connection) -> Result<Id> {
    let current = current_max_id(conn)?;
    let id = next_id(current.as_ref())?;
    tracing::debug!(id = %id, "allocated id");
    Ok(id)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
