// 🗄️ Storage - SQLite schema + WAL
// Action log (append-only), current-state projection, requests and notes.
//
// Timestamps are stored as fixed-width RFC 3339 text in UTC with microsecond
// precision, so ORDER BY on the text column is chronological.

use crate::error::{LedgerError, LedgerResult};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

// ============================================================================
// TIMESTAMP CODEC
// ============================================================================

/// Truncate to the precision the database keeps, so values compare equal
/// after a round trip.
pub fn at_storage_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

/// Current time at storage precision.
pub fn now() -> DateTime<Utc> {
    at_storage_precision(Utc::now())
}

pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_ts(raw: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::InvalidStoredValue(format!("timestamp {raw:?}: {e}")))
}

pub fn decode_opt_ts(raw: Option<String>) -> LedgerResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(decode_ts).transpose()
}

/// Row-mapping variant for use inside `query_map` closures.
pub(crate) fn column_ts(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn column_opt_ts(
    raw: Option<String>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(|s| column_ts(s, idx)).transpose()
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> LedgerResult<()> {
    // Enable WAL mode for crash recovery (no-op for in-memory databases)
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS membership_type_categories (
            name TEXT PRIMARY KEY,
            is_individual INTEGER NOT NULL DEFAULT 0,
            is_organization INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS membership_types (
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            category TEXT NOT NULL REFERENCES membership_type_categories(name),
            group_cn TEXT NOT NULL DEFAULT '',
            enabled INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS organizations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            representative TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS membership_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            requested_username TEXT NOT NULL DEFAULT '',
            requested_organization_id INTEGER REFERENCES organizations(id) ON DELETE SET NULL,
            requested_organization_code TEXT NOT NULL DEFAULT '',
            requested_organization_name TEXT NOT NULL DEFAULT '',
            membership_type TEXT NOT NULL REFERENCES membership_types(code),
            requested_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            on_hold_at TEXT,
            decided_at TEXT,
            decided_by_username TEXT NOT NULL DEFAULT '',
            responses TEXT NOT NULL DEFAULT '[]'
        );

        CREATE UNIQUE INDEX IF NOT EXISTS uniq_request_open_user_type
            ON membership_requests(requested_username, membership_type)
            WHERE status IN ('pending', 'on_hold') AND requested_username != '';

        CREATE UNIQUE INDEX IF NOT EXISTS uniq_request_open_org_type
            ON membership_requests(requested_organization_code, membership_type)
            WHERE status IN ('pending', 'on_hold') AND requested_organization_code != '';

        CREATE TABLE IF NOT EXISTS notes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            membership_request_id INTEGER NOT NULL
                REFERENCES membership_requests(id) ON DELETE CASCADE,
            username TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            content TEXT,
            action TEXT,
            CHECK (content IS NOT NULL OR action IS NOT NULL)
        );

        CREATE INDEX IF NOT EXISTS idx_notes_request ON notes(membership_request_id, timestamp);

        CREATE TABLE IF NOT EXISTS membership_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor_username TEXT NOT NULL,
            target_username TEXT NOT NULL DEFAULT '',
            target_organization_id INTEGER REFERENCES organizations(id) ON DELETE SET NULL,
            target_organization_code TEXT NOT NULL DEFAULT '',
            target_organization_name TEXT NOT NULL DEFAULT '',
            membership_type TEXT NOT NULL REFERENCES membership_types(code),
            membership_request_id INTEGER
                REFERENCES membership_requests(id) ON DELETE SET NULL,
            requested_group_cn TEXT NOT NULL DEFAULT '',
            action TEXT NOT NULL,
            created_at TEXT NOT NULL,
            rejection_reason TEXT NOT NULL DEFAULT '',
            expires_at TEXT,
            import_batch_id TEXT,
            CHECK (
                (target_username = '' AND target_organization_code != '')
                OR (target_username != '' AND target_organization_id IS NULL
                    AND target_organization_code = '')
            )
        );

        CREATE INDEX IF NOT EXISTS idx_logs_user
            ON membership_logs(target_username, membership_type, action, created_at);
        CREATE INDEX IF NOT EXISTS idx_logs_org_code
            ON membership_logs(target_organization_code, membership_type, action, created_at);
        CREATE INDEX IF NOT EXISTS idx_logs_request ON membership_logs(membership_request_id);
        CREATE INDEX IF NOT EXISTS idx_logs_batch ON membership_logs(import_batch_id);

        CREATE TRIGGER IF NOT EXISTS membership_logs_no_delete
            BEFORE DELETE ON membership_logs
        BEGIN
            SELECT RAISE(ABORT, 'membership_logs is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS membership_logs_no_update
            BEFORE UPDATE OF actor_username, target_username, target_organization_code,
                target_organization_name, membership_type, requested_group_cn, action,
                created_at, rejection_reason, expires_at, import_batch_id
            ON membership_logs
        BEGIN
            SELECT RAISE(ABORT, 'membership_logs is append-only');
        END;

        CREATE TABLE IF NOT EXISTS memberships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            target_username TEXT NOT NULL DEFAULT '',
            target_organization_id INTEGER REFERENCES organizations(id) ON DELETE CASCADE,
            target_organization_code TEXT NOT NULL DEFAULT '',
            target_organization_name TEXT NOT NULL DEFAULT '',
            membership_type TEXT NOT NULL REFERENCES membership_types(code),
            category TEXT NOT NULL REFERENCES membership_type_categories(name),
            created_at TEXT NOT NULL,
            expires_at TEXT,
            updated_at TEXT NOT NULL,
            CHECK (
                (target_username != '' AND target_organization_id IS NULL
                    AND target_organization_code = '')
                OR (target_username = '' AND target_organization_id IS NOT NULL)
            )
        );

        CREATE UNIQUE INDEX IF NOT EXISTS uniq_membership_user_type
            ON memberships(target_username, membership_type) WHERE target_username != '';
        CREATE UNIQUE INDEX IF NOT EXISTS uniq_membership_org_type
            ON memberships(target_organization_id, membership_type)
            WHERE target_organization_id IS NOT NULL;
        -- One membership per category is DB-enforced for organizations only.
        CREATE UNIQUE INDEX IF NOT EXISTS uniq_membership_org_category
            ON memberships(target_organization_id, category)
            WHERE target_organization_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_memberships_expires ON memberships(expires_at);
        ",
    )?;

    Ok(())
}

// ============================================================================
// UNITS OF WORK
// ============================================================================

/// Run `f` inside a `BEGIN IMMEDIATE` transaction, taking the write lock up
/// front. When the caller already holds a transaction, `f` joins it.
pub fn with_immediate<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> LedgerResult<T>,
) -> LedgerResult<T> {
    if !conn.is_autocommit() {
        return f(conn);
    }
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
}

// ============================================================================
// REFERENCE DATA
// ============================================================================

pub fn insert_category(
    conn: &Connection,
    name: &str,
    is_individual: bool,
    is_organization: bool,
    sort_order: i64,
) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO membership_type_categories (name, is_individual, is_organization, sort_order)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET
            is_individual = excluded.is_individual,
            is_organization = excluded.is_organization,
            sort_order = excluded.sort_order",
        params![name, is_individual, is_organization, sort_order],
    )?;
    Ok(())
}

/// Create a category unless one with this name exists. An existing
/// category keeps its flags and sort order. Returns whether it was created.
pub fn ensure_category(
    conn: &Connection,
    name: &str,
    is_individual: bool,
    is_organization: bool,
    sort_order: i64,
) -> LedgerResult<bool> {
    let created = conn.execute(
        "INSERT INTO membership_type_categories (name, is_individual, is_organization, sort_order)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO NOTHING",
        params![name, is_individual, is_organization, sort_order],
    )?;
    Ok(created > 0)
}

/// Insert or update a membership type. The category must already exist.
pub fn insert_membership_type(
    conn: &Connection,
    code: &str,
    name: &str,
    category: &str,
    group_cn: &str,
    sort_order: i64,
) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO membership_types (code, name, category, group_cn, sort_order)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(code) DO UPDATE SET
            name = excluded.name,
            category = excluded.category,
            group_cn = excluded.group_cn,
            sort_order = excluded.sort_order",
        params![code, name, category, group_cn, sort_order],
    )?;
    Ok(())
}

pub fn set_membership_type_enabled(conn: &Connection, code: &str, enabled: bool) -> LedgerResult<()> {
    let changed = conn.execute(
        "UPDATE membership_types SET enabled = ?1 WHERE code = ?2",
        params![enabled, code],
    )?;
    if changed == 0 {
        return Err(LedgerError::UnknownMembershipType(code.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationRecord {
    pub id: i64,
    pub name: String,
    pub representative: String,
}

pub fn insert_organization(conn: &Connection, name: &str, representative: &str) -> LedgerResult<i64> {
    conn.execute(
        "INSERT INTO organizations (name, representative) VALUES (?1, ?2)",
        params![name, representative.trim()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_organization(conn: &Connection, id: i64) -> LedgerResult<Option<OrganizationRecord>> {
    let org = conn
        .query_row(
            "SELECT id, name, representative FROM organizations WHERE id = ?1",
            [id],
            |row| {
                Ok(OrganizationRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    representative: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(org)
}

pub fn list_organizations(conn: &Connection) -> LedgerResult<Vec<OrganizationRecord>> {
    let mut stmt = conn.prepare("SELECT id, name, representative FROM organizations ORDER BY id")?;
    let orgs = stmt
        .query_map([], |row| {
            Ok(OrganizationRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                representative: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(orgs)
}

/// Delete an organization. Log rows keep its fallback code and name; its
/// current-state rows cascade away.
pub fn delete_organization(conn: &Connection, id: i64) -> LedgerResult<bool> {
    let deleted = conn.execute("DELETE FROM organizations WHERE id = ?1", [id])?;
    Ok(deleted > 0)
}
