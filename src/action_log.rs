// 📜 Action Log - append-only membership history
//
// Every lifecycle transition is one immutable row. Entries are totally
// ordered by (created_at, id); all backward scans use that order.
//
// `append` inserts the entry and runs the projector in the same IMMEDIATE
// transaction, so the current-state table never lags the log.

use crate::db::{self, column_opt_ts, column_ts, encode_ts};
use crate::entities::membership_type::require_membership_type;
use crate::entities::target::Target;
use crate::error::{LedgerError, LedgerResult};
use crate::projector::{self, Effects};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// ACTION KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Requested,
    OnHold,
    Resubmitted,
    Approved,
    Rejected,
    Ignored,
    Rescinded,
    RepresentativeChanged,
    ExpiryChanged,
    Terminated,
}

impl ActionKind {
    pub const ALL: [ActionKind; 10] = [
        ActionKind::Requested,
        ActionKind::OnHold,
        ActionKind::Resubmitted,
        ActionKind::Approved,
        ActionKind::Rejected,
        ActionKind::Ignored,
        ActionKind::Rescinded,
        ActionKind::RepresentativeChanged,
        ActionKind::ExpiryChanged,
        ActionKind::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Requested => "requested",
            ActionKind::OnHold => "on_hold",
            ActionKind::Resubmitted => "resubmitted",
            ActionKind::Approved => "approved",
            ActionKind::Rejected => "rejected",
            ActionKind::Ignored => "ignored",
            ActionKind::Rescinded => "rescinded",
            ActionKind::RepresentativeChanged => "representative_changed",
            ActionKind::ExpiryChanged => "expiry_changed",
            ActionKind::Terminated => "terminated",
        }
    }

    /// Kinds the projector reacts to.
    pub fn changes_state(&self) -> bool {
        matches!(
            self,
            ActionKind::Approved | ActionKind::ExpiryChanged | ActionKind::Terminated
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown action: {s}"))
    }
}

// ============================================================================
// LOG ENTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: i64,
    pub actor: String,
    pub target: Target,
    pub membership_type: String,
    pub membership_request_id: Option<i64>,
    /// Group identifier of the type when the action was taken
    pub requested_group_cn: String,
    pub action: ActionKind,
    pub created_at: DateTime<Utc>,
    pub rejection_reason: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub import_batch_id: Option<Uuid>,
}

impl ActionLogEntry {
    /// Strictly earlier in log order.
    pub fn precedes(&self, other: &ActionLogEntry) -> bool {
        (self.created_at, self.id) < (other.created_at, other.id)
    }
}

const SELECT_ENTRY: &str = "
    SELECT id, actor_username, target_username, target_organization_id,
           target_organization_code, target_organization_name, membership_type,
           membership_request_id, requested_group_cn, action, created_at,
           rejection_reason, expires_at, import_batch_id
    FROM membership_logs";

fn map_entry(row: &Row<'_>) -> rusqlite::Result<ActionLogEntry> {
    let username: String = row.get(2)?;
    let org_id: Option<i64> = row.get(3)?;
    let org_code: String = row.get(4)?;
    let org_name: String = row.get(5)?;
    let action: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    let batch: Option<String> = row.get(13)?;

    let action = action.parse::<ActionKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, e.into())
    })?;
    let import_batch_id = batch
        .as_deref()
        .map(Uuid::parse_str)
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(13, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(ActionLogEntry {
        id: row.get(0)?,
        actor: row.get(1)?,
        target: Target::from_columns(&username, org_id, &org_code, &org_name),
        membership_type: row.get(6)?,
        membership_request_id: row.get(7)?,
        requested_group_cn: row.get(8)?,
        action,
        created_at: column_ts(&created_at, 10)?,
        rejection_reason: row.get(11)?,
        expires_at: column_opt_ts(row.get(12)?, 12)?,
        import_batch_id,
    })
}

// ============================================================================
// NEW ACTIONS
// ============================================================================

/// An action not yet appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub actor: String,
    pub target: Target,
    pub membership_type: String,
    pub action: ActionKind,
    /// None = stamped with the current time on append
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub rejection_reason: String,
    pub membership_request_id: Option<i64>,
}

impl NewAction {
    pub fn new(actor: &str, target: &Target, membership_type: &str, action: ActionKind) -> Self {
        NewAction {
            actor: actor.to_string(),
            target: target.clone(),
            membership_type: membership_type.to_string(),
            action,
            created_at: None,
            expires_at: None,
            rejection_reason: String::new(),
            membership_request_id: None,
        }
    }

    pub fn requested(actor: &str, target: &Target, membership_type: &str) -> Self {
        Self::new(actor, target, membership_type, ActionKind::Requested)
    }

    pub fn on_hold(actor: &str, target: &Target, membership_type: &str) -> Self {
        Self::new(actor, target, membership_type, ActionKind::OnHold)
    }

    pub fn resubmitted(actor: &str, target: &Target, membership_type: &str) -> Self {
        Self::new(actor, target, membership_type, ActionKind::Resubmitted)
    }

    /// Approval at `approved_at` granting membership through `expires_at`.
    pub fn approved_at(
        actor: &str,
        target: &Target,
        membership_type: &str,
        approved_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut action = Self::new(actor, target, membership_type, ActionKind::Approved);
        action.created_at = Some(approved_at);
        action.expires_at = expires_at;
        action
    }

    pub fn rejected(actor: &str, target: &Target, membership_type: &str, reason: &str) -> Self {
        let mut action = Self::new(actor, target, membership_type, ActionKind::Rejected);
        action.rejection_reason = reason.to_string();
        action
    }

    pub fn ignored(actor: &str, target: &Target, membership_type: &str) -> Self {
        Self::new(actor, target, membership_type, ActionKind::Ignored)
    }

    pub fn rescinded(actor: &str, target: &Target, membership_type: &str) -> Self {
        Self::new(actor, target, membership_type, ActionKind::Rescinded)
    }

    pub fn representative_changed(actor: &str, target: &Target, membership_type: &str) -> Self {
        Self::new(actor, target, membership_type, ActionKind::RepresentativeChanged)
    }

    pub fn expiry_changed(
        actor: &str,
        target: &Target,
        membership_type: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut action = Self::new(actor, target, membership_type, ActionKind::ExpiryChanged);
        action.expires_at = expires_at;
        action
    }

    /// Termination takes effect immediately: the entry records expiry = now.
    pub fn terminated(actor: &str, target: &Target, membership_type: &str) -> Self {
        let now = db::now();
        let mut action = Self::new(actor, target, membership_type, ActionKind::Terminated);
        action.created_at = Some(now);
        action.expires_at = Some(now);
        action
    }

    pub fn with_request(mut self, request_id: i64) -> Self {
        self.membership_request_id = Some(request_id);
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Run-scoped context attached to every appended entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionContext {
    /// Correlation id of the import run creating these entries
    pub batch_id: Option<Uuid>,
}

impl ActionContext {
    pub fn import_batch(batch_id: Uuid) -> Self {
        ActionContext {
            batch_id: Some(batch_id),
        }
    }
}

// ============================================================================
// APPEND
// ============================================================================

/// Append an action and project it, in one unit of work.
pub fn append(
    conn: &Connection,
    ctx: &ActionContext,
    action: NewAction,
) -> LedgerResult<(ActionLogEntry, Effects)> {
    if action.membership_type.trim().is_empty() {
        return Err(LedgerError::MissingMembershipType);
    }

    db::with_immediate(conn, |tx| {
        let mtype = require_membership_type(tx, &action.membership_type)?;
        if action.action == ActionKind::Approved {
            mtype.ensure_admits(&action.target)?;
        }

        let created_at = db::at_storage_precision(action.created_at.unwrap_or_else(db::now));
        let expires_at = action.expires_at.map(db::at_storage_precision);
        let (username, org_id, org_code, org_name) = action.target.columns();

        tx.execute(
            "INSERT INTO membership_logs (
                actor_username, target_username, target_organization_id,
                target_organization_code, target_organization_name, membership_type,
                membership_request_id, requested_group_cn, action, created_at,
                rejection_reason, expires_at, import_batch_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                action.actor,
                username,
                org_id,
                org_code,
                org_name,
                mtype.code,
                action.membership_request_id,
                mtype.group_cn,
                action.action.as_str(),
                encode_ts(created_at),
                action.rejection_reason,
                expires_at.map(encode_ts),
                ctx.batch_id.map(|id| id.to_string()),
            ],
        )?;

        let entry = ActionLogEntry {
            id: tx.last_insert_rowid(),
            actor: action.actor.clone(),
            target: action.target.clone(),
            membership_type: mtype.code.clone(),
            membership_request_id: action.membership_request_id,
            requested_group_cn: mtype.group_cn.clone(),
            action: action.action,
            created_at,
            rejection_reason: action.rejection_reason.clone(),
            expires_at,
            import_batch_id: ctx.batch_id,
        };

        debug!(
            entry_id = entry.id,
            action = %entry.action,
            holder = %entry.target,
            membership_type = %entry.membership_type,
            "Appended log entry"
        );

        let effects = projector::apply(tx, &entry, &mtype)?;
        Ok((entry, effects))
    })
}

// ============================================================================
// QUERIES
// ============================================================================

pub fn get_entry(conn: &Connection, id: i64) -> LedgerResult<ActionLogEntry> {
    let entry = conn.query_row(&format!("{SELECT_ENTRY} WHERE id = ?1"), [id], map_entry)?;
    Ok(entry)
}

/// History of one (target, type) in log order.
pub fn history(
    conn: &Connection,
    target: &Target,
    membership_type: &str,
) -> LedgerResult<Vec<ActionLogEntry>> {
    let (predicate, value) = target.log_filter("target");
    let mut stmt = conn.prepare(&format!(
        "{SELECT_ENTRY} WHERE {predicate} AND membership_type = ?
         ORDER BY created_at, id"
    ))?;
    let entries = stmt
        .query_map(params![value, membership_type], map_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Every entry for a target, all types, in log order.
pub fn entries_for_target(conn: &Connection, target: &Target) -> LedgerResult<Vec<ActionLogEntry>> {
    let (predicate, value) = target.log_filter("target");
    let mut stmt = conn.prepare(&format!(
        "{SELECT_ENTRY} WHERE {predicate} ORDER BY created_at, id"
    ))?;
    let entries = stmt
        .query_map([value], map_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Entries created by one import run.
pub fn entries_in_batch(conn: &Connection, batch_id: Uuid) -> LedgerResult<Vec<ActionLogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_ENTRY} WHERE import_batch_id = ?1 ORDER BY created_at, id"
    ))?;
    let entries = stmt
        .query_map([batch_id.to_string()], map_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// The whole log in order, for projection replay.
pub fn all_entries(conn: &Connection) -> LedgerResult<Vec<ActionLogEntry>> {
    let mut stmt = conn.prepare(&format!("{SELECT_ENTRY} ORDER BY created_at, id"))?;
    let entries = stmt
        .query_map([], map_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Whether an entry of `kind` exists for this target+type, optionally tied
/// to a specific request.
pub fn has_entry(
    conn: &Connection,
    target: &Target,
    membership_type: &str,
    kind: ActionKind,
    request_id: Option<i64>,
) -> LedgerResult<bool> {
    let (predicate, value) = target.log_filter("target");
    let exists: i64 = conn.query_row(
        &format!(
            "SELECT EXISTS(SELECT 1 FROM membership_logs
             WHERE {predicate} AND membership_type = ? AND action = ?
               AND (? IS NULL OR membership_request_id = ?))"
        ),
        params![value, membership_type, kind.as_str(), request_id, request_id],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}
