// 🔁 Current-State Projector
//
// `apply(entry)` is the single place where log entries turn into rows of the
// `memberships` table. Dispatch is explicit on the action kind:
//
//   approved / expiry_changed → replace within category, then upsert
//   terminated               → delete the (target, type) row
//   anything else            → no effect
//
// The projection is a cache of the log: `rebuild_current_state` throws it
// away and replays every entry.
//
// Exclusivity: one row per (target, category). Organizations also have a
// unique index on (organization, category); individuals rely on the
// delete-then-upsert below running inside the append's IMMEDIATE
// transaction, which serializes all writers on the database.

use crate::action_log::{self, ActionKind, ActionLogEntry};
use crate::db::{self, encode_ts};
use crate::entities::membership::{
    get_membership, map_membership, target_predicate, CurrentMembership, SELECT_MEMBERSHIP,
};
use crate::entities::membership_type::{require_membership_type, MembershipType};
use crate::entities::target::Target;
use crate::error::LedgerResult;
use crate::temporal::resolve_term_start;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

// ============================================================================
// EFFECTS
// ============================================================================

/// What one log entry did to the projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Effects {
    /// Row created or updated for the entry's (target, type)
    pub upserted: Option<CurrentMembership>,
    /// Same-category rows of other types that were removed
    pub replaced: Vec<CurrentMembership>,
    /// Rows deleted by a termination
    pub removed: usize,
    /// Rows deleted by the stale organization sweep
    pub swept: usize,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_none() && self.replaced.is_empty() && self.removed == 0 && self.swept == 0
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Project one freshly appended entry. Runs inside the append transaction.
pub fn apply(
    conn: &Connection,
    entry: &ActionLogEntry,
    mtype: &MembershipType,
) -> LedgerResult<Effects> {
    if !entry.action.changes_state() {
        return Ok(Effects::default());
    }

    // Organization known only by its fallback code: the record is gone, so
    // repair any rows still pointing at it and stop there.
    if let Target::Organization { id: None, code, .. } = &entry.target {
        let swept = sweep_stale_organization(conn, code)?;
        return Ok(Effects {
            swept,
            ..Effects::default()
        });
    }

    match entry.action {
        ActionKind::Approved | ActionKind::ExpiryChanged => {
            let (row, replaced) = replace_within_category(conn, entry, mtype)?;
            Ok(Effects {
                upserted: Some(row),
                replaced,
                ..Effects::default()
            })
        }
        ActionKind::Terminated => {
            let removed = terminate(conn, &entry.target, &entry.membership_type)?;
            Ok(Effects {
                removed,
                ..Effects::default()
            })
        }
        _ => Ok(Effects::default()),
    }
}

// ============================================================================
// CATEGORY EXCLUSIVITY
// ============================================================================

/// Delete other-type rows in the entry's category, then create or update the
/// entry's own row. Returns (new row, replaced rows).
pub fn replace_within_category(
    conn: &Connection,
    entry: &ActionLogEntry,
    mtype: &MembershipType,
) -> LedgerResult<(CurrentMembership, Vec<CurrentMembership>)> {
    let target = &entry.target;
    let (predicate, value) = target_predicate(target);

    let mut stmt = conn.prepare(&format!(
        "{SELECT_MEMBERSHIP} WHERE {predicate} AND m.category = ? AND m.membership_type != ?"
    ))?;
    let replaced = stmt
        .query_map(params![value, mtype.category.name, mtype.code], map_membership)?
        .collect::<Result<Vec<_>, _>>()?;
    for old in &replaced {
        conn.execute("DELETE FROM memberships WHERE id = ?1", [old.id])?;
        info!(
            holder = %target,
            category = %mtype.category.name,
            old_type = %old.membership_type,
            new_type = %mtype.code,
            "Membership type changed within category"
        );
    }

    let existing = get_membership(conn, target, &mtype.code)?;
    let history = action_log::history(conn, target, &mtype.code)?;
    let start = resolve_term_start(existing.as_ref(), &history, entry);
    let now = db::now();

    let row_id = match &existing {
        Some(row) => {
            conn.execute(
                "UPDATE memberships SET created_at = ?1, expires_at = ?2, category = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    encode_ts(start),
                    entry.expires_at.map(encode_ts),
                    mtype.category.name,
                    encode_ts(now),
                    row.id
                ],
            )?;
            row.id
        }
        None => {
            let (username, org_id, org_code, org_name) = target.columns();
            conn.execute(
                "INSERT INTO memberships (
                    target_username, target_organization_id, target_organization_code,
                    target_organization_name, membership_type, category,
                    created_at, expires_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    username,
                    org_id,
                    org_code,
                    org_name,
                    mtype.code,
                    mtype.category.name,
                    encode_ts(start),
                    entry.expires_at.map(encode_ts),
                    encode_ts(now)
                ],
            )?;
            conn.last_insert_rowid()
        }
    };

    let row = conn.query_row(
        &format!("{SELECT_MEMBERSHIP} WHERE m.id = ?1"),
        [row_id],
        map_membership,
    )?;
    debug!(
        holder = %target,
        membership_type = %mtype.code,
        created_at = %row.created_at,
        expires_at = ?row.expires_at,
        "Projected membership"
    );
    Ok((row, replaced))
}

/// Remove the (target, type) row. No continuity work is needed.
pub fn terminate(conn: &Connection, target: &Target, membership_type: &str) -> LedgerResult<usize> {
    let (predicate, value) = target_predicate(target);
    let removed = conn.execute(
        &format!(
            "DELETE FROM memberships WHERE id IN (
                SELECT m.id FROM memberships m WHERE {predicate} AND m.membership_type = ?)"
        ),
        params![value, membership_type],
    )?;
    Ok(removed)
}

/// Overwrite the term start of the (target, type) row. A direct projection
/// edit: replaying the log does not reproduce it.
pub fn backfill_term_start(
    conn: &Connection,
    target: &Target,
    membership_type: &str,
    start: DateTime<Utc>,
) -> LedgerResult<usize> {
    let (predicate, value) = target_predicate(target);
    let updated = conn.execute(
        &format!(
            "UPDATE memberships SET created_at = ?, updated_at = ? WHERE id IN (
                SELECT m.id FROM memberships m WHERE {predicate} AND m.membership_type = ?)"
        ),
        params![
            encode_ts(db::at_storage_precision(start)),
            encode_ts(db::now()),
            value,
            membership_type
        ],
    )?;
    Ok(updated)
}

/// Delete rows still referencing a deleted organization by its fallback code.
pub fn sweep_stale_organization(conn: &Connection, code: &str) -> LedgerResult<usize> {
    let swept = conn.execute(
        "DELETE FROM memberships
         WHERE target_username = ''
           AND (target_organization_code = ?1 OR CAST(target_organization_id AS TEXT) = ?1)",
        [code],
    )?;
    if swept > 0 {
        info!(organization_code = %code, swept, "Swept memberships of deleted organization");
    }
    Ok(swept)
}

// ============================================================================
// REPLAY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RebuildSummary {
    pub entries_replayed: usize,
    pub memberships: usize,
}

/// Discard the projection and replay the whole log in order.
pub fn rebuild_current_state(conn: &Connection) -> LedgerResult<RebuildSummary> {
    db::with_immediate(conn, |tx| {
        tx.execute("DELETE FROM memberships", [])?;

        let mut types: HashMap<String, MembershipType> = HashMap::new();
        let mut replayed = 0;
        for entry in action_log::all_entries(tx)? {
            if !entry.action.changes_state() {
                continue;
            }
            if !types.contains_key(&entry.membership_type) {
                let mtype = require_membership_type(tx, &entry.membership_type)?;
                types.insert(mtype.code.clone(), mtype);
            }
            if let Some(mtype) = types.get(&entry.membership_type) {
                apply(tx, &entry, mtype)?;
                replayed += 1;
            }
        }

        let memberships: i64 = tx.query_row("SELECT COUNT(*) FROM memberships", [], |r| r.get(0))?;
        info!(entries_replayed = replayed, memberships, "Rebuilt current state");
        Ok(RebuildSummary {
            entries_replayed: replayed,
            memberships: memberships as usize,
        })
    })
}
