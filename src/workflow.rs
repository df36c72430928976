// 🗂️ Request Workflow - requests, notes and committee decisions
//
// Decisions (approve / reject / hold / terminate / change expiry) append to
// the action log and keep the request document in step. Directory effects
// follow two rules:
// - approval grants the group BEFORE anything is recorded; a failed grant
//   leaves no trace in the ledger
// - revocations and notifications are best effort and only logged on failure

use crate::action_log::{self, ActionContext, ActionKind, ActionLogEntry, NewAction};
use crate::db::{self, encode_ts, get_organization};
use crate::directory::{Collaborators, Notification};
use crate::entities::membership::{get_membership, list_memberships};
use crate::entities::membership_type::{require_membership_type, MembershipType};
use crate::entities::request::{
    get_request, insert_note, map_request, MembershipRequest, RequestStatus, Response,
    SELECT_REQUEST,
};
use crate::entities::target::Target;
use crate::error::{LedgerError, LedgerResult};
use crate::projector::Effects;
use crate::temporal::expiry_for_approval_at;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{info, warn};

/// Note action marker written on approval.
pub const NOTE_REQUEST_APPROVED: &str = "request_approved";

/// Result of a successful approval.
#[derive(Debug, Clone)]
pub struct Approval {
    pub request: MembershipRequest,
    pub entry: ActionLogEntry,
    pub effects: Effects,
}

pub struct Workflow<'a> {
    conn: &'a Connection,
    collab: Collaborators<'a>,
    validity_days: i64,
}

impl<'a> Workflow<'a> {
    pub fn new(conn: &'a Connection, collab: Collaborators<'a>, validity_days: i64) -> Self {
        Workflow {
            conn,
            collab,
            validity_days,
        }
    }

    pub fn conn(&self) -> &'a Connection {
        self.conn
    }

    pub fn validity_days(&self) -> i64 {
        self.validity_days
    }

    // ========================================================================
    // REQUESTS + NOTES
    // ========================================================================

    /// Create a pending request.
    pub fn create_request(
        &self,
        target: &Target,
        membership_type: &str,
        requested_at: DateTime<Utc>,
        responses: &[Response],
    ) -> LedgerResult<MembershipRequest> {
        let mtype = require_membership_type(self.conn, membership_type)?;
        mtype.ensure_admits(target)?;

        let (username, org_id, org_code, org_name) = target.columns();
        self.conn.execute(
            "INSERT INTO membership_requests (
                requested_username, requested_organization_id, requested_organization_code,
                requested_organization_name, membership_type, requested_at, status, responses
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
            params![
                username,
                org_id,
                org_code,
                org_name,
                mtype.code,
                encode_ts(db::at_storage_precision(requested_at)),
                serde_json::to_string(responses)?,
            ],
        )?;
        self.require_request(self.conn.last_insert_rowid())
    }

    pub fn require_request(&self, request_id: i64) -> LedgerResult<MembershipRequest> {
        get_request(self.conn, request_id)?.ok_or(LedgerError::RequestNotFound(request_id))
    }

    /// Append the `requested` entry for a request and optionally tell the
    /// target about it.
    pub fn record_creation(
        &self,
        ctx: &ActionContext,
        request: &MembershipRequest,
        actor: &str,
        notify: bool,
    ) -> LedgerResult<ActionLogEntry> {
        let (entry, _) = action_log::append(
            self.conn,
            ctx,
            NewAction::requested(actor, &request.target, &request.membership_type)
                .with_request(request.id)
                .at(request.requested_at),
        )?;
        if notify {
            self.notify(Notification::RequestCreated {
                request_id: request.id,
                target: request.target.clone(),
            });
        }
        Ok(entry)
    }

    pub fn set_responses(&self, request_id: i64, responses: &[Response]) -> LedgerResult<()> {
        self.conn.execute(
            "UPDATE membership_requests SET responses = ?1 WHERE id = ?2",
            params![serde_json::to_string(responses)?, request_id],
        )?;
        Ok(())
    }

    /// Overwrite the creation time of a request (roster back-fill).
    pub fn set_requested_at(&self, request_id: i64, requested_at: DateTime<Utc>) -> LedgerResult<()> {
        self.conn.execute(
            "UPDATE membership_requests SET requested_at = ?1 WHERE id = ?2",
            params![encode_ts(db::at_storage_precision(requested_at)), request_id],
        )?;
        Ok(())
    }

    pub fn add_note(&self, request_id: i64, username: &str, content: &str) -> LedgerResult<i64> {
        insert_note(self.conn, request_id, username, db::now(), Some(content), None)
    }

    // ========================================================================
    // DECISIONS
    // ========================================================================

    /// Approve a pending request, effective at `decided_at`.
    pub fn approve(
        &self,
        ctx: &ActionContext,
        request_id: i64,
        actor: &str,
        decided_at: DateTime<Utc>,
        notify: bool,
    ) -> LedgerResult<Approval> {
        let request = self.require_request(request_id)?;
        expect_status(&request, &[RequestStatus::Pending])?;
        let mtype = require_membership_type(self.conn, &request.membership_type)?;
        mtype.ensure_admits(&request.target)?;

        let grantee = self.grantee(&request.target)?;
        if let Some(username) = &grantee {
            self.grant(username, &mtype)?;
        }

        let decided_at = db::at_storage_precision(decided_at);
        let previous = self.previous_expires_at_for_extension(
            &request.target,
            &mtype.code,
            decided_at,
        )?;
        let expires_at = expiry_for_approval_at(decided_at, previous, self.validity_days);

        let (entry, effects) = db::with_immediate(self.conn, |tx| {
            tx.execute(
                "UPDATE membership_requests
                 SET status = 'approved', decided_at = ?1, decided_by_username = ?2
                 WHERE id = ?3",
                params![encode_ts(decided_at), actor, request.id],
            )?;
            let appended = action_log::append(
                tx,
                ctx,
                NewAction::approved_at(
                    actor,
                    &request.target,
                    &mtype.code,
                    decided_at,
                    Some(expires_at),
                )
                .with_request(request.id),
            )?;
            insert_note(
                tx,
                request.id,
                actor,
                db::now(),
                None,
                Some(NOTE_REQUEST_APPROVED),
            )?;
            Ok(appended)
        })?;

        // Type changed within the category: the grantee leaves the old
        // type's group.
        if let Some(username) = &grantee {
            for old in &effects.replaced {
                if let Ok(old_type) = require_membership_type(self.conn, &old.membership_type) {
                    if old_type.has_group() && old_type.group_cn != mtype.group_cn {
                        self.revoke(username, &old_type.group_cn);
                    }
                }
            }
        }

        info!(
            request_id = request.id,
            holder = %request.target,
            membership_type = %mtype.code,
            expires_at = %expires_at,
            "Approved membership request"
        );

        if notify {
            self.notify(Notification::RequestApproved {
                request_id: request.id,
                target: request.target.clone(),
            });
        }

        Ok(Approval {
            request: self.require_request(request.id)?,
            entry,
            effects,
        })
    }

    /// Reject an open request. The reason is appended to the responses.
    pub fn reject(
        &self,
        ctx: &ActionContext,
        request_id: i64,
        actor: &str,
        reason: &str,
    ) -> LedgerResult<ActionLogEntry> {
        let mut request = self.require_request(request_id)?;
        expect_status(&request, &[RequestStatus::Pending, RequestStatus::OnHold])?;

        if !reason.trim().is_empty() {
            request
                .responses
                .push(Response::new("Rejection reason", reason.trim()));
        }

        db::with_immediate(self.conn, |tx| {
            tx.execute(
                "UPDATE membership_requests
                 SET status = 'rejected', decided_at = ?1, decided_by_username = ?2, responses = ?3
                 WHERE id = ?4",
                params![
                    encode_ts(db::now()),
                    actor,
                    serde_json::to_string(&request.responses)?,
                    request.id
                ],
            )?;
            let (entry, _) = action_log::append(
                tx,
                ctx,
                NewAction::rejected(actor, &request.target, &request.membership_type, reason.trim())
                    .with_request(request.id),
            )?;
            Ok(entry)
        })
    }

    pub fn put_on_hold(
        &self,
        ctx: &ActionContext,
        request_id: i64,
        actor: &str,
    ) -> LedgerResult<ActionLogEntry> {
        let request = self.require_request(request_id)?;
        expect_status(&request, &[RequestStatus::Pending])?;

        db::with_immediate(self.conn, |tx| {
            tx.execute(
                "UPDATE membership_requests SET status = 'on_hold', on_hold_at = ?1 WHERE id = ?2",
                params![encode_ts(db::now()), request.id],
            )?;
            let (entry, _) = action_log::append(
                tx,
                ctx,
                NewAction::on_hold(actor, &request.target, &request.membership_type)
                    .with_request(request.id),
            )?;
            Ok(entry)
        })
    }

    /// End a membership now. Group removal is best effort.
    pub fn terminate_membership(
        &self,
        ctx: &ActionContext,
        target: &Target,
        membership_type: &str,
        actor: &str,
    ) -> LedgerResult<(ActionLogEntry, Effects)> {
        let mtype = require_membership_type(self.conn, membership_type)?;
        let appended = action_log::append(
            self.conn,
            ctx,
            NewAction::terminated(actor, target, &mtype.code),
        )?;

        if mtype.has_group() {
            if let Some(username) = self.grantee(target)? {
                self.revoke(&username, &mtype.group_cn);
            }
        }
        info!(holder = %target, membership_type = %mtype.code, "Terminated membership");
        Ok(appended)
    }

    /// Record a new expiry for a membership (None = perpetual).
    pub fn change_expiry(
        &self,
        ctx: &ActionContext,
        target: &Target,
        membership_type: &str,
        actor: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> LedgerResult<(ActionLogEntry, Effects)> {
        action_log::append(
            self.conn,
            ctx,
            NewAction::expiry_changed(actor, target, membership_type, expires_at),
        )
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Expiry of the current term, when it is still running at `at`.
    pub fn previous_expires_at_for_extension(
        &self,
        target: &Target,
        membership_type: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<Option<DateTime<Utc>>> {
        Ok(get_membership(self.conn, target, membership_type)?
            .and_then(|row| row.expires_at)
            .filter(|expires| *expires > at))
    }

    /// Latest running expiry among the target's rows in the category of
    /// `membership_type`, whatever their type.
    pub fn previous_expires_at_in_category(
        &self,
        target: &Target,
        membership_type: &str,
        at: DateTime<Utc>,
    ) -> LedgerResult<Option<DateTime<Utc>>> {
        let mtype = require_membership_type(self.conn, membership_type)?;
        Ok(list_memberships(self.conn, target)?
            .into_iter()
            .filter(|row| row.category == mtype.category.name)
            .filter_map(|row| row.expires_at)
            .filter(|expires| *expires > at)
            .max())
    }

    /// Whether the log already holds an entry of `kind` for this request.
    pub fn has_logged(&self, request: &MembershipRequest, kind: ActionKind) -> LedgerResult<bool> {
        action_log::has_entry(
            self.conn,
            &request.target,
            &request.membership_type,
            kind,
            Some(request.id),
        )
    }

    /// Directory user that receives the group for this target: the user
    /// itself, or the organization's representative (if any).
    fn grantee(&self, target: &Target) -> LedgerResult<Option<String>> {
        match target {
            Target::User { username } => Ok(Some(username.clone())),
            Target::Organization { id: Some(id), .. } => {
                let org = get_organization(self.conn, *id)?
                    .ok_or(LedgerError::OrganizationNotFound(*id))?;
                Ok(Some(org.representative).filter(|r| !r.is_empty()))
            }
            Target::Organization { id: None, .. } => Ok(None),
        }
    }

    fn grant(&self, username: &str, mtype: &MembershipType) -> LedgerResult<()> {
        if !mtype.has_group() {
            // Individuals must land in a group; organizations may not have one.
            if mtype.category.is_individual && !mtype.category.is_organization {
                return Err(LedgerError::MissingGroup(mtype.code.clone()));
            }
            return Ok(());
        }

        let missing = self.collab.prerequisites.missing_for(username, &mtype.group_cn)?;
        if !missing.is_empty() {
            return Err(LedgerError::MissingPrerequisites {
                group: mtype.group_cn.clone(),
                missing: missing.join(", "),
            });
        }

        self.collab
            .groups
            .add_to_group(username, &mtype.group_cn)
            .map_err(|message| LedgerError::GroupGrant {
                username: username.to_string(),
                group: mtype.group_cn.clone(),
                message,
            })
    }

    fn revoke(&self, username: &str, group: &str) {
        if let Err(message) = self.collab.groups.remove_from_group(username, group) {
            warn!(username = %username, group = %group, error = %message, "Group removal failed");
        }
    }

    fn notify(&self, notification: Notification) {
        if let Err(message) = self.collab.notifier.notify(&notification) {
            warn!(error = %message, "Notification failed");
        }
    }
}

fn expect_status(request: &MembershipRequest, allowed: &[RequestStatus]) -> LedgerResult<()> {
    if allowed.contains(&request.status) {
        return Ok(());
    }
    Err(LedgerError::InvalidRequestState {
        request_id: request.id,
        status: request.status.to_string(),
        expected: allowed
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" or "),
    })
}

/// All requests of a target, newest first.
pub fn requests_for_target(conn: &Connection, target: &Target) -> LedgerResult<Vec<MembershipRequest>> {
    let (predicate, value) = target.log_filter("requested");
    let mut stmt = conn.prepare(&format!(
        "{SELECT_REQUEST} WHERE {predicate} ORDER BY requested_at DESC, id DESC"
    ))?;
    let requests = stmt
        .query_map([value], map_request)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_category, insert_membership_type, insert_organization, setup_database};
    use crate::directory::InMemoryDirectory;
    use crate::entities::membership::list_memberships;
    use crate::entities::request::list_notes;
    use crate::temporal::end_of_day_utc;
    use chrono::{Duration, TimeZone};

    fn fixture() -> (Connection, InMemoryDirectory) {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        insert_category(&conn, "individual", true, false, 0).unwrap();
        insert_category(&conn, "sponsorship", false, true, 1).unwrap();
        insert_membership_type(&conn, "individual", "Individual", "individual", "members", 0)
            .unwrap();
        insert_membership_type(&conn, "nogroup", "No group", "individual", "", 1).unwrap();
        insert_membership_type(&conn, "gold", "Gold", "sponsorship", "gold-sponsors", 0).unwrap();
        insert_membership_type(&conn, "silver", "Silver", "sponsorship", "silver-sponsors", 1)
            .unwrap();
        (conn, InMemoryDirectory::default())
    }

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_approve_pending_request() {
        let (conn, dir) = fixture();
        let wf = Workflow::new(&conn, Collaborators::from_one(&dir), 365);
        let alice = Target::user("alice");
        let ctx = ActionContext::default();

        let request = wf.create_request(&alice, "individual", ts(2024, 1, 1), &[]).unwrap();
        wf.record_creation(&ctx, &request, "alice", true).unwrap();
        assert!(wf.has_logged(&request, ActionKind::Requested).unwrap());

        let approval = wf.approve(&ctx, request.id, "admin", ts(2024, 1, 2), true).unwrap();
        assert_eq!(approval.request.status, RequestStatus::Approved);
        assert_eq!(approval.request.decided_by, "admin");
        assert_eq!(
            approval.entry.expires_at,
            Some(end_of_day_utc(ts(2024, 1, 2)) + Duration::days(365))
        );
        assert!(dir.is_member("alice", "members"));
        assert_eq!(dir.notifications().len(), 2);

        let notes = list_notes(&conn, request.id).unwrap();
        assert_eq!(notes[0].action.as_deref(), Some(NOTE_REQUEST_APPROVED));

        let err = wf.approve(&ctx, request.id, "admin", ts(2024, 1, 3), false).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequestState { .. }));
    }

    #[test]
    fn test_failed_grant_records_nothing() {
        let (conn, dir) = fixture();
        dir.fail_grants_for("alice");
        let wf = Workflow::new(&conn, Collaborators::from_one(&dir), 365);
        let alice = Target::user("alice");

        let request = wf.create_request(&alice, "individual", ts(2024, 1, 1), &[]).unwrap();
        let err = wf
            .approve(&ActionContext::default(), request.id, "admin", ts(2024, 1, 2), false)
            .unwrap_err();
        assert!(matches!(err, LedgerError::GroupGrant { .. }));
        assert_eq!(wf.require_request(request.id).unwrap().status, RequestStatus::Pending);
        assert!(list_memberships(&conn, &alice).unwrap().is_empty());
        assert!(action_log::all_entries(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_prerequisites_and_missing_group() {
        let (conn, dir) = fixture();
        dir.require_agreements("members", &["FPCA"]);
        let wf = Workflow::new(&conn, Collaborators::from_one(&dir), 365);
        let ctx = ActionContext::default();

        let request = wf
            .create_request(&Target::user("bob"), "individual", ts(2024, 1, 1), &[])
            .unwrap();
        let err = wf.approve(&ctx, request.id, "admin", ts(2024, 1, 2), false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing required agreements for 'members': FPCA"
        );

        let request = wf
            .create_request(&Target::user("bob"), "nogroup", ts(2024, 1, 1), &[])
            .unwrap();
        let err = wf.approve(&ctx, request.id, "admin", ts(2024, 1, 2), false).unwrap_err();
        assert!(matches!(err, LedgerError::MissingGroup(_)));
    }

    #[test]
    fn test_extension_uses_running_expiry() {
        let (conn, dir) = fixture();
        let wf = Workflow::new(&conn, Collaborators::from_one(&dir), 365);
        let ctx = ActionContext::default();
        let alice = Target::user("alice");

        let first = wf.create_request(&alice, "individual", ts(2024, 1, 1), &[]).unwrap();
        let e1 = wf
            .approve(&ctx, first.id, "admin", ts(2024, 1, 1), false)
            .unwrap()
            .entry
            .expires_at
            .unwrap();

        let second = wf.create_request(&alice, "individual", ts(2024, 12, 1), &[]).unwrap();
        let approval = wf.approve(&ctx, second.id, "admin", ts(2024, 12, 1), false).unwrap();
        assert_eq!(approval.entry.expires_at, Some(e1 + Duration::days(365)));
        let row = approval.effects.upserted.unwrap();
        assert_eq!(row.created_at, ts(2024, 1, 1));
    }

    #[test]
    fn test_running_expiry_in_category() {
        let (conn, dir) = fixture();
        let wf = Workflow::new(&conn, Collaborators::from_one(&dir), 365);
        let ctx = ActionContext::default();
        let org_id = insert_organization(&conn, "Acme", "").unwrap();
        let acme = Target::organization(org_id, "Acme");

        let gold = wf.create_request(&acme, "gold", ts(2024, 1, 1), &[]).unwrap();
        let expires = wf
            .approve(&ctx, gold.id, "admin", ts(2024, 1, 1), false)
            .unwrap()
            .entry
            .expires_at;

        assert_eq!(
            wf.previous_expires_at_in_category(&acme, "silver", ts(2024, 6, 1)).unwrap(),
            expires
        );
        assert_eq!(
            wf.previous_expires_at_for_extension(&acme, "silver", ts(2024, 6, 1)).unwrap(),
            None
        );
        assert_eq!(
            wf.previous_expires_at_in_category(&acme, "silver", ts(2026, 1, 1)).unwrap(),
            None
        );
    }

    #[test]
    fn test_organization_type_change_moves_representative() {
        let (conn, dir) = fixture();
        let wf = Workflow::new(&conn, Collaborators::from_one(&dir), 365);
        let ctx = ActionContext::default();
        let org_id = insert_organization(&conn, "Acme", "rep").unwrap();
        let acme = Target::organization(org_id, "Acme");

        let gold = wf.create_request(&acme, "gold", ts(2024, 1, 1), &[]).unwrap();
        wf.approve(&ctx, gold.id, "admin", ts(2024, 1, 1), false).unwrap();
        assert!(dir.is_member("rep", "gold-sponsors"));

        let silver = wf.create_request(&acme, "silver", ts(2024, 2, 1), &[]).unwrap();
        let approval = wf.approve(&ctx, silver.id, "admin", ts(2024, 2, 1), false).unwrap();
        assert_eq!(approval.effects.replaced[0].membership_type, "gold");
        assert!(dir.is_member("rep", "silver-sponsors"));
        assert!(!dir.is_member("rep", "gold-sponsors"));
        assert_eq!(list_memberships(&conn, &acme).unwrap().len(), 1);

        assert!(matches!(
            wf.create_request(&Target::user("alice"), "gold", ts(2024, 1, 1), &[]),
            Err(LedgerError::TargetNotAllowed { .. })
        ));
    }

    #[test]
    fn test_hold_reject_terminate_and_change_expiry() {
        let (conn, dir) = fixture();
        let wf = Workflow::new(&conn, Collaborators::from_one(&dir), 365);
        let ctx = ActionContext::default();
        let bob = Target::user("bob");

        let request = wf.create_request(&bob, "individual", ts(2024, 1, 1), &[]).unwrap();
        wf.put_on_hold(&ctx, request.id, "admin").unwrap();
        let held = wf.require_request(request.id).unwrap();
        assert_eq!(held.status, RequestStatus::OnHold);
        assert!(held.on_hold_at.is_some());

        let entry = wf.reject(&ctx, request.id, "admin", "Not eligible").unwrap();
        assert_eq!(entry.rejection_reason, "Not eligible");
        let rejected = wf.require_request(request.id).unwrap();
        assert_eq!(rejected.status, RequestStatus::Rejected);
        assert_eq!(
            rejected.responses.last(),
            Some(&Response::new("Rejection reason", "Not eligible"))
        );

        let start = db::now() - Duration::days(10);
        let request = wf.create_request(&bob, "individual", start, &[]).unwrap();
        wf.approve(&ctx, request.id, "admin", start, false).unwrap();

        let (_, effects) = wf
            .change_expiry(&ctx, &bob, "individual", "admin", None)
            .unwrap();
        let row = effects.upserted.unwrap();
        assert_eq!(row.created_at, start);
        assert!(row.expires_at.is_none());

        let (_, effects) = wf.terminate_membership(&ctx, &bob, "individual", "admin").unwrap();
        assert_eq!(effects.removed, 1);
        assert!(!dir.is_member("bob", "members"));
        assert_eq!(requests_for_target(&conn, &bob).unwrap().len(), 2);
    }
}
