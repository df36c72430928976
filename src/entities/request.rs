// 📝 Membership Requests + Notes
//
// Workflow documents the importer reuses or creates. Request responses are
// stored as a JSON array of {question, answer} pairs.

use crate::db::{column_opt_ts, column_ts, encode_ts};
use crate::entities::target::Target;
use crate::error::LedgerResult;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// REQUEST STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    OnHold,
    Approved,
    Rejected,
    Ignored,
    Rescinded,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::OnHold => "on_hold",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Ignored => "ignored",
            RequestStatus::Rescinded => "rescinded",
        }
    }

    /// Still awaiting a decision.
    pub fn is_open(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::OnHold)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "on_hold" => Ok(RequestStatus::OnHold),
            "approved" => Ok(RequestStatus::Approved),
            "rejected" => Ok(RequestStatus::Rejected),
            "ignored" => Ok(RequestStatus::Ignored),
            "rescinded" => Ok(RequestStatus::Rescinded),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

// ============================================================================
// RESPONSES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Response {
    pub question: String,
    pub answer: String,
}

impl Response {
    pub fn new(question: &str, answer: &str) -> Self {
        Response {
            question: question.to_string(),
            answer: answer.to_string(),
        }
    }
}

/// Append responses not already present (exact question+answer match).
/// Returns how many were added.
pub fn merge_responses(existing: &mut Vec<Response>, incoming: &[Response]) -> usize {
    let mut added = 0;
    for response in incoming {
        if !existing.contains(response) {
            existing.push(response.clone());
            added += 1;
        }
    }
    added
}

// ============================================================================
// MEMBERSHIP REQUEST
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipRequest {
    pub id: i64,
    pub target: Target,
    pub membership_type: String,
    pub requested_at: DateTime<Utc>,
    pub status: RequestStatus,
    pub on_hold_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: String,
    pub responses: Vec<Response>,
}

pub(crate) const SELECT_REQUEST: &str = "
    SELECT id, requested_username, requested_organization_id, requested_organization_code,
           requested_organization_name, membership_type, requested_at, status,
           on_hold_at, decided_at, decided_by_username, responses
    FROM membership_requests";

pub(crate) fn map_request(row: &Row<'_>) -> rusqlite::Result<MembershipRequest> {
    let username: String = row.get(1)?;
    let org_id: Option<i64> = row.get(2)?;
    let org_code: String = row.get(3)?;
    let org_name: String = row.get(4)?;
    let requested_at: String = row.get(6)?;
    let status: String = row.get(7)?;
    let responses: String = row.get(11)?;

    let status = status.parse::<RequestStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, e.into())
    })?;
    let responses: Vec<Response> = serde_json::from_str(&responses).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(MembershipRequest {
        id: row.get(0)?,
        target: Target::from_columns(&username, org_id, &org_code, &org_name),
        membership_type: row.get(5)?,
        requested_at: column_ts(&requested_at, 6)?,
        status,
        on_hold_at: column_opt_ts(row.get(8)?, 8)?,
        decided_at: column_opt_ts(row.get(9)?, 9)?,
        decided_by: row.get(10)?,
        responses,
    })
}

pub fn get_request(conn: &Connection, id: i64) -> LedgerResult<Option<MembershipRequest>> {
    let found = conn
        .query_row(&format!("{SELECT_REQUEST} WHERE id = ?1"), [id], map_request)
        .optional()?;
    Ok(found)
}

/// The open (pending or on hold) request for a target and type, if any.
pub fn find_open_request(
    conn: &Connection,
    target: &Target,
    membership_type: &str,
) -> LedgerResult<Option<MembershipRequest>> {
    let (predicate, value) = target.log_filter("requested");
    let found = conn
        .query_row(
            &format!(
                "{SELECT_REQUEST} WHERE {predicate} AND membership_type = ?
                 AND status IN ('pending', 'on_hold')
                 ORDER BY requested_at DESC, id DESC LIMIT 1"
            ),
            params![value, membership_type],
            map_request,
        )
        .optional()?;
    Ok(found)
}

/// Most recent request of any status for a target and type.
pub fn latest_request(
    conn: &Connection,
    target: &Target,
    membership_type: &str,
) -> LedgerResult<Option<MembershipRequest>> {
    let (predicate, value) = target.log_filter("requested");
    let found = conn
        .query_row(
            &format!(
                "{SELECT_REQUEST} WHERE {predicate} AND membership_type = ?
                 ORDER BY requested_at DESC, id DESC LIMIT 1"
            ),
            params![value, membership_type],
            map_request,
        )
        .optional()?;
    Ok(found)
}

pub fn count_requests(conn: &Connection, target: &Target, membership_type: &str) -> LedgerResult<i64> {
    let (predicate, value) = target.log_filter("requested");
    let count = conn.query_row(
        &format!("SELECT COUNT(*) FROM membership_requests WHERE {predicate} AND membership_type = ?"),
        params![value, membership_type],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ============================================================================
// NOTES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub request_id: i64,
    pub username: String,
    pub timestamp: DateTime<Utc>,
    pub content: Option<String>,
    /// Machine-readable action marker, e.g. "request_approved"
    pub action: Option<String>,
}

pub fn list_notes(conn: &Connection, request_id: i64) -> LedgerResult<Vec<Note>> {
    let mut stmt = conn.prepare(
        "SELECT id, membership_request_id, username, timestamp, content, action
         FROM notes WHERE membership_request_id = ?1 ORDER BY timestamp, id",
    )?;
    let notes = stmt
        .query_map([request_id], |row| {
            let timestamp: String = row.get(3)?;
            Ok(Note {
                id: row.get(0)?,
                request_id: row.get(1)?,
                username: row.get(2)?,
                timestamp: column_ts(&timestamp, 3)?,
                content: row.get(4)?,
                action: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(notes)
}

/// Whether any request of this target+type carries a note with exactly
/// this content.
pub fn note_exists(
    conn: &Connection,
    target: &Target,
    membership_type: &str,
    content: &str,
) -> LedgerResult<bool> {
    let (predicate, value) = target.log_filter("r.requested");
    let exists: i64 = conn.query_row(
        &format!(
            "SELECT EXISTS(
                SELECT 1 FROM notes n
                JOIN membership_requests r ON r.id = n.membership_request_id
                WHERE {predicate} AND r.membership_type = ? AND n.content = ?)"
        ),
        params![value, membership_type, content],
        |row| row.get(0),
    )?;
    Ok(exists != 0)
}

pub(crate) fn insert_note(
    conn: &Connection,
    request_id: i64,
    username: &str,
    timestamp: DateTime<Utc>,
    content: Option<&str>,
    action: Option<&str>,
) -> LedgerResult<i64> {
    conn.execute(
        "INSERT INTO notes (membership_request_id, username, timestamp, content, action)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![request_id, username, encode_ts(timestamp), content, action],
    )?;
    Ok(conn.last_insert_rowid())
}
