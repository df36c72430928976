// ✅ Apply one IMPORT row (confirm mode)
//
// Steps, in order:
// 1. reuse the open request (merging responses) or create a pending one
// 2. on-hold requests only receive responses and the note
// 3. make sure a `requested` entry exists for the request
// 4. approve at max(start, now), never earlier
// 5. back-fill request time and term start to the roster start date
// 6. record an `expiry_changed` entry for a roster end date, or to keep
//    a running expiry from being extended (for organizations, the running
//    expiry of whatever type they held in the category)
// 7. add the import note, only once everything above succeeded
//
// Directory effects cannot be rolled back, so each row stands alone.

use crate::action_log::{ActionContext, ActionKind};
use crate::entities::request::{find_open_request, merge_responses, note_exists, RequestStatus};
use crate::entities::target::{Target, TargetKind};
use crate::error::{ApplyError, LedgerError, LedgerResult};
use crate::projector;
use crate::reconciliation::decision::RowPlan;
use crate::workflow::Workflow;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Applied {
    pub row: usize,
    /// Username, or `org:<id>`
    pub holder: String,
    pub request_id: i64,
    pub created_request: bool,
    pub approved: bool,
    pub responses_added: usize,
    pub note_added: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct RowApplier<'w, 'a> {
    pub workflow: &'w Workflow<'a>,
    pub ctx: &'w ActionContext,
    pub actor: &'w str,
    pub membership_type: &'w str,
    pub note_prefix: &'w str,
}

impl<'w, 'a> RowApplier<'w, 'a> {
    pub fn apply(&self, plan: &RowPlan, now: DateTime<Utc>) -> Result<Applied, ApplyError> {
        self.apply_inner(plan, now)
            .map_err(|source| ApplyError::new(plan.row, source))
    }

    fn apply_inner(&self, plan: &RowPlan, now: DateTime<Utc>) -> LedgerResult<Applied> {
        let wf = self.workflow;
        let conn = wf.conn();
        let code = self.membership_type;
        let target = plan
            .target
            .clone()
            .ok_or_else(|| LedgerError::Directory("row has no matched target".to_string()))?;
        let effective_start = plan.start_at.unwrap_or(now);

        let (request, created_request, responses_added) =
            match find_open_request(conn, &target, code)? {
                Some(mut open) => {
                    let added = merge_responses(&mut open.responses, &plan.responses);
                    if added > 0 {
                        wf.set_responses(open.id, &open.responses)?;
                    }
                    (open, false, added)
                }
                None => {
                    let created =
                        wf.create_request(&target, code, effective_start, &plan.responses)?;
                    (created, true, plan.responses.len())
                }
            };

        let mut applied = Applied {
            row: plan.row,
            holder: target.to_string(),
            request_id: request.id,
            created_request,
            approved: false,
            responses_added,
            note_added: false,
            expires_at: None,
        };

        if request.status == RequestStatus::OnHold {
            applied.note_added = self.add_import_note(&target, request.id, &plan.note)?;
            return Ok(applied);
        }

        if !wf.has_logged(&request, ActionKind::Requested)? {
            wf.record_creation(self.ctx, &request, self.actor, false)?;
        }

        let previous = match target.kind() {
            TargetKind::User => wf.previous_expires_at_for_extension(&target, code, now)?,
            TargetKind::Organization => wf.previous_expires_at_in_category(&target, code, now)?,
        };
        let decided_at = effective_start.max(now);
        let approval = wf.approve(self.ctx, request.id, self.actor, decided_at, !created_request)?;
        applied.approved = true;
        applied.expires_at = approval.entry.expires_at;

        if let Some(start) = plan.start_at {
            wf.set_requested_at(request.id, start)?;
            projector::backfill_term_start(conn, &target, code, start)?;
        }

        let expiry_override = match plan.end_at {
            Some(end) if end > effective_start => Some(end),
            _ => previous.filter(|prev| Some(*prev) != applied.expires_at),
        };
        if let Some(expires_at) = expiry_override {
            let (entry, _) = wf.change_expiry(self.ctx, &target, code, self.actor, Some(expires_at))?;
            applied.expires_at = entry.expires_at;
        }

        applied.note_added = self.add_import_note(&target, request.id, &plan.note)?;
        Ok(applied)
    }

    fn add_import_note(&self, target: &Target, request_id: i64, note: &str) -> LedgerResult<bool> {
        if note.is_empty() {
            return Ok(false);
        }
        let content = format!("{} {}", self.note_prefix, note);
        let conn = self.workflow.conn();
        if note_exists(conn, target, self.membership_type, &content)? {
            return Ok(false);
        }
        self.workflow.add_note(request_id, self.actor, &content)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_log::entries_in_batch;
    use crate::db::{self, insert_category, insert_membership_type, setup_database};
    use crate::directory::{Collaborators, InMemoryDirectory};
    use crate::entities::membership::get_membership;
    use crate::entities::request::{list_notes, Response};
    use crate::reconciliation::decision::Decision;
    use crate::temporal::end_of_day_utc;
    use chrono::{Duration, TimeZone};
    use rusqlite::Connection;
    use uuid::Uuid;

    fn fixture() -> (Connection, InMemoryDirectory) {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        insert_category(&conn, "individual", true, false, 0).unwrap();
        insert_membership_type(&conn, "individual", "Individual", "individual", "members", 0)
            .unwrap();
        (conn, InMemoryDirectory::default())
    }

    fn plan(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>, note: &str) -> RowPlan {
        RowPlan {
            row: 4,
            email: "alice@example.org".to_string(),
            name: String::new(),
            target: Some(Target::user("alice")),
            matched_by: None,
            unmatched: false,
            decision: Decision::import("New request will be created"),
            start_at: start,
            end_at: end,
            note: note.to_string(),
            responses: vec![Response::new("Team", "infra")],
        }
    }

    #[test]
    fn test_new_row_creates_and_approves() {
        let (conn, dir) = fixture();
        let wf = Workflow::new(&conn, Collaborators::from_one(&dir), 365);
        let batch = Uuid::new_v4();
        let ctx = ActionContext::import_batch(batch);
        let applier = RowApplier {
            workflow: &wf,
            ctx: &ctx,
            actor: "importer",
            membership_type: "individual",
            note_prefix: "[Import]",
        };
        let now = db::now();
        let start = Utc.with_ymd_and_hms(2020, 5, 1, 0, 0, 0).unwrap();

        let applied = applier.apply(&plan(Some(start), None, "Founding member"), now).unwrap();
        assert!(applied.created_request && applied.approved && applied.note_added);
        assert_eq!(applied.expires_at, Some(end_of_day_utc(now) + Duration::days(365)));

        let request = wf.require_request(applied.request_id).unwrap();
        assert_eq!(request.requested_at, start);
        assert_eq!(request.decided_at, Some(now));
        let row = get_membership(&conn, &Target::user("alice"), "individual").unwrap().unwrap();
        assert_eq!(row.created_at, start);

        let notes = list_notes(&conn, request.id).unwrap();
        assert!(notes.iter().any(|n| n.content.as_deref() == Some("[Import] Founding member")));

        // requested + approved, both tagged with the run.
        let kinds: Vec<ActionKind> = entries_in_batch(&conn, batch)
            .unwrap()
            .iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(kinds, vec![ActionKind::Requested, ActionKind::Approved]);
        // Newly created requests are not announced twice.
        assert!(dir.notifications().is_empty());
    }

    #[test]
    fn test_end_date_and_running_expiry_are_logged() {
        let (conn, dir) = fixture();
        let wf = Workflow::new(&conn, Collaborators::from_one(&dir), 365);
        let ctx = ActionContext::import_batch(Uuid::new_v4());
        let applier = RowApplier {
            workflow: &wf,
            ctx: &ctx,
            actor: "importer",
            membership_type: "individual",
            note_prefix: "[Import]",
        };
        let now = db::now();
        let end = end_of_day_utc(now) + Duration::days(30);

        let applied = applier.apply(&plan(None, Some(end), ""), now).unwrap();
        assert_eq!(applied.expires_at, Some(end));

        // Re-applying without an end date keeps the running expiry instead
        // of extending it by another term.
        let mut again = plan(None, None, "");
        again.responses.push(Response::new("Team", "docs"));
        let applied = applier.apply(&again, now).unwrap();
        assert_eq!(applied.expires_at, Some(end));
        let row = get_membership(&conn, &Target::user("alice"), "individual").unwrap().unwrap();
        assert_eq!(row.expires_at, Some(end));
        assert_eq!(crate::action_log::all_entries(&conn).unwrap().len(), 6);
    }

    #[test]
    fn test_failed_grant_leaves_no_note() {
        let (conn, dir) = fixture();
        dir.fail_grants_for("alice");
        let wf = Workflow::new(&conn, Collaborators::from_one(&dir), 365);
        let ctx = ActionContext::default();
        let applier = RowApplier {
            workflow: &wf,
            ctx: &ctx,
            actor: "importer",
            membership_type: "individual",
            note_prefix: "[Import]",
        };

        let err = applier
            .apply(&plan(None, None, "Should not appear"), db::now())
            .unwrap_err();
        assert_eq!(err.row, 4);
        assert!(matches!(err.source, LedgerError::GroupGrant { .. }));
        assert!(!note_exists(
            &conn,
            &Target::user("alice"),
            "individual",
            "[Import] Should not appear"
        )
        .unwrap());
    }

    #[test]
    fn test_on_hold_request_gets_updates_only() {
        let (conn, dir) = fixture();
        let wf = Workflow::new(&conn, Collaborators::from_one(&dir), 365);
        let ctx = ActionContext::default();
        let alice = Target::user("alice");
        let request = wf.create_request(&alice, "individual", db::now(), &[]).unwrap();
        wf.put_on_hold(&ctx, request.id, "admin").unwrap();

        let applier = RowApplier {
            workflow: &wf,
            ctx: &ctx,
            actor: "importer",
            membership_type: "individual",
            note_prefix: "[Import]",
        };
        let applied = applier.apply(&plan(None, None, "Waiting on FPCA"), db::now()).unwrap();
        assert!(!applied.approved);
        assert!(applied.note_added);
        assert_eq!(applied.responses_added, 1);
        assert_eq!(applied.request_id, request.id);
        assert!(get_membership(&conn, &alice, "individual").unwrap().is_none());
        assert_eq!(
            wf.require_request(request.id).unwrap().responses,
            vec![Response::new("Team", "infra")]
        );
    }
}
