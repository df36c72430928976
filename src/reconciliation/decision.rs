// ⚖️ Row decisions - IMPORT or SKIP, always with a reason
//
// Fixed priority, first hit wins:
//   missing email → no identity → inactive → type mismatch → prerequisites
//   → bad end date → end not after start → request/membership state
//
// Organization rosters swap the first two steps for "missing organization
// identifier → no organization"; prerequisites apply to users only.
//
// Deciding never writes. It is run once per row in preview and again,
// against the then-current ledger, right before each row is applied.

use crate::directory::Prerequisites;
use crate::entities::membership::get_membership;
use crate::entities::membership_type::MembershipType;
use crate::entities::request::{
    find_open_request, latest_request, note_exists, RequestStatus, Response,
};
use crate::entities::target::Target;
use crate::error::LedgerResult;
use crate::matcher::{
    IdentityMatcher, MatchMethod, MatchOutcome, OrganizationMatcher, OrganizationOutcome,
};
use crate::reconciliation::columns::{ColumnMap, RosterField};
use crate::reconciliation::roster::{normalize_header, parse_bool, parse_date, RosterRow};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

pub const REASON_MISSING_EMAIL: &str = "Missing Email";
pub const REASON_MISSING_ORGANIZATION: &str = "Missing organization identifier";
pub const REASON_INACTIVE: &str = "Not an Active Member";
pub const REASON_INVALID_END: &str = "Invalid membership end date";
pub const REASON_END_BEFORE_START: &str = "Membership end date must be after start date";
pub const REASON_ON_HOLD: &str = "Request on hold, will ignore";
pub const REASON_PENDING: &str = "Active request, will be accepted";
pub const REASON_UPDATE_START: &str = "Active membership, updating start date";
pub const REASON_UPDATES: &str = "Active membership, importing updates";
pub const REASON_UP_TO_DATE: &str = "Already up-to-date";
pub const REASON_NEW: &str = "New request will be created";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionKind {
    Import,
    Skip,
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionKind::Import => f.write_str("IMPORT"),
            DecisionKind::Skip => f.write_str("SKIP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub reason: String,
}

impl Decision {
    pub fn import(reason: &str) -> Self {
        Decision {
            kind: DecisionKind::Import,
            reason: reason.to_string(),
        }
    }

    pub fn skip(reason: &str) -> Self {
        Decision {
            kind: DecisionKind::Skip,
            reason: reason.to_string(),
        }
    }

    pub fn is_import(&self) -> bool {
        self.kind == DecisionKind::Import
    }
}

/// Resolves roster rows to targets: directory users or organizations.
pub enum RowMatcher<'a> {
    Users(IdentityMatcher<'a>),
    Organizations(OrganizationMatcher),
}

/// Everything known about one roster row after deciding it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowPlan {
    pub row: usize,
    /// Normalized email ("" when missing or for organization rows)
    pub email: String,
    pub name: String,
    pub target: Option<Target>,
    pub matched_by: Option<MatchMethod>,
    /// An identifier was given but matched nothing, or more than one target
    pub unmatched: bool,
    pub decision: Decision,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub note: String,
    pub responses: Vec<Response>,
}

impl RowPlan {
    /// Display form of the matched target (username or `org:<id>`).
    pub fn holder(&self) -> Option<String> {
        self.target.as_ref().map(Target::to_string)
    }
}

/// Fixed inputs shared by every row of a run.
pub struct DecisionContext<'a> {
    pub conn: &'a Connection,
    pub membership_type: &'a MembershipType,
    pub columns: &'a ColumnMap,
    pub prerequisites: &'a dyn Prerequisites,
    pub note_prefix: &'a str,
    pub now: DateTime<Utc>,
}

impl<'a> DecisionContext<'a> {
    pub fn import_note(&self, note: &str) -> String {
        format!("{} {}", self.note_prefix, note)
    }

    pub fn decide(&self, matcher: &mut RowMatcher<'_>, row: &RosterRow) -> LedgerResult<RowPlan> {
        let columns = self.columns;
        let email = columns
            .value(row, RosterField::Email)
            .unwrap_or("")
            .to_lowercase();
        let name = match matcher {
            RowMatcher::Users(_) => columns.value(row, RosterField::Name),
            RowMatcher::Organizations(_) => columns.value(row, RosterField::OrganizationName),
        }
        .unwrap_or("")
        .to_string();
        let note = columns.value(row, RosterField::Notes).unwrap_or("").to_string();
        let start_at = match columns.value(row, RosterField::StartDate).map(parse_date) {
            Some(Ok(start)) => start,
            Some(Err(e)) => {
                debug!(row = row.number, error = %e, "Ignoring unparsable start date");
                None
            }
            None => None,
        };

        let mut plan = RowPlan {
            row: row.number,
            email: email.clone(),
            name: name.clone(),
            target: None,
            matched_by: None,
            unmatched: false,
            decision: Decision::skip(REASON_MISSING_EMAIL),
            start_at,
            end_at: None,
            note,
            responses: columns.responses(row),
        };

        let (target, method) = match matcher {
            RowMatcher::Users(users) => {
                if email.is_empty() {
                    return Ok(plan);
                }
                match users.lookup(&email, &name) {
                    MatchOutcome::Matched { identity, method } => {
                        (Target::user(&identity.username), method)
                    }
                    outcome => {
                        plan.unmatched = true;
                        plan.decision = Decision::skip(&outcome.reason().unwrap_or_default());
                        return Ok(plan);
                    }
                }
            }
            RowMatcher::Organizations(organizations) => {
                let raw_id = columns.value(row, RosterField::OrganizationId).unwrap_or("");
                if raw_id.is_empty() && name.is_empty() {
                    plan.decision = Decision::skip(REASON_MISSING_ORGANIZATION);
                    return Ok(plan);
                }
                match organizations.lookup(raw_id, &name) {
                    OrganizationOutcome::Matched {
                        organization,
                        method,
                    } => (Target::organization(organization.id, &organization.name), method),
                    OrganizationOutcome::Unmatched { reason } => {
                        plan.unmatched = true;
                        plan.decision = Decision::skip(&reason);
                        return Ok(plan);
                    }
                }
            }
        };
        plan.matched_by = Some(method);

        let decision = self.decide_matched(row, &target, &mut plan)?;
        plan.target = Some(target);
        plan.decision = decision;
        Ok(plan)
    }

    fn decide_matched(&self, row: &RosterRow, target: &Target, plan: &mut RowPlan) -> LedgerResult<Decision> {
        let columns = self.columns;
        let mtype = self.membership_type;

        if let Some(status) = columns.value(row, RosterField::ActiveMember) {
            if !parse_bool(status) {
                return Ok(Decision::skip(REASON_INACTIVE));
            }
        }

        if let Some(declared) = columns.value(row, RosterField::MembershipType) {
            if !declared.is_empty() && !self.type_matches(declared) {
                return Ok(Decision::skip(&format!(
                    "Roster type '{}' does not match selected '{}'",
                    declared, mtype.code
                )));
            }
        }

        if let Some(username) = target.username().filter(|_| mtype.has_group()) {
            match self.prerequisites.missing_for(username, &mtype.group_cn) {
                Ok(missing) if !missing.is_empty() => {
                    return Ok(Decision::skip(&format!(
                        "Missing required agreements for '{}': {}",
                        mtype.group_cn,
                        missing.join(", ")
                    )));
                }
                Ok(_) => {}
                Err(e) => warn!(row = row.number, error = %e, "Prerequisite check failed"),
            }
        }

        if let Some(raw_end) = columns.value(row, RosterField::EndDate) {
            match parse_date(raw_end) {
                Ok(end) => plan.end_at = end,
                Err(_) => return Ok(Decision::skip(REASON_INVALID_END)),
            }
        }
        if let Some(end) = plan.end_at {
            let effective_start = plan.start_at.unwrap_or(self.now);
            if end <= effective_start {
                return Ok(Decision::skip(REASON_END_BEFORE_START));
            }
        }

        let has_updates = self.has_updates(target, plan)?;

        if let Some(open) = find_open_request(self.conn, target, &mtype.code)? {
            return Ok(match open.status {
                RequestStatus::OnHold if has_updates => Decision::import(REASON_ON_HOLD),
                RequestStatus::OnHold => Decision::skip(REASON_ON_HOLD),
                _ => Decision::import(REASON_PENDING),
            });
        }

        if let Some(existing) = get_membership(self.conn, target, &mtype.code)? {
            if existing.is_active_at(self.now) {
                let start_differs = plan
                    .start_at
                    .is_some_and(|start| start != existing.created_at);
                return Ok(if start_differs {
                    Decision::import(REASON_UPDATE_START)
                } else if has_updates {
                    Decision::import(REASON_UPDATES)
                } else {
                    Decision::skip(REASON_UP_TO_DATE)
                });
            }
        }

        Ok(Decision::import(REASON_NEW))
    }

    /// A note not yet recorded, or a response missing from the latest request.
    fn has_updates(&self, target: &Target, plan: &RowPlan) -> LedgerResult<bool> {
        let code = &self.membership_type.code;
        if !plan.note.is_empty()
            && !note_exists(self.conn, target, code, &self.import_note(&plan.note))?
        {
            return Ok(true);
        }
        if plan.responses.is_empty() {
            return Ok(false);
        }
        let known = latest_request(self.conn, target, code)?
            .map(|request| request.responses)
            .unwrap_or_default();
        Ok(plan.responses.iter().any(|response| !known.contains(response)))
    }

    fn type_matches(&self, declared: &str) -> bool {
        let declared = normalize_header(declared);
        declared == normalize_header(&self.membership_type.code)
            || declared == normalize_header(&self.membership_type.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_log::ActionContext;
    use crate::config::ImportConfig;
    use crate::db::{insert_category, insert_membership_type, setup_database};
    use crate::directory::{Collaborators, Identity, InMemoryDirectory};
    use crate::entities::membership_type::require_membership_type;
    use crate::entities::target::TargetKind;
    use crate::workflow::Workflow;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    const HEADERS: [&str; 7] = ["Email", "Name", "Active", "Type", "Start Date", "End Date", "Notes"];

    struct Fixture {
        conn: Connection,
        dir: InMemoryDirectory,
        columns: ColumnMap,
        mtype: MembershipType,
        now: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        insert_category(&conn, "individual", true, false, 0).unwrap();
        insert_membership_type(&conn, "individual", "Individual Member", "individual", "members", 0)
            .unwrap();
        let mtype = require_membership_type(&conn, "individual").unwrap();

        let dir = InMemoryDirectory::new(vec![
            Identity {
                username: "alice".to_string(),
                email: "alice@example.org".to_string(),
                full_name: "Alice".to_string(),
            },
            Identity {
                username: "twin1".to_string(),
                email: "twins@example.org".to_string(),
                full_name: String::new(),
            },
            Identity {
                username: "twin2".to_string(),
                email: "twins@example.org".to_string(),
                full_name: String::new(),
            },
        ]);

        let headers: Vec<String> = HEADERS.iter().map(|h| h.to_string()).collect();
        let columns = ColumnMap::resolve(
            TargetKind::User,
            &headers,
            &BTreeMap::new(),
            &ImportConfig::default(),
            &[],
        )
        .unwrap();

        Fixture {
            conn,
            dir,
            columns,
            mtype,
            now: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    fn row(values: [&str; 7]) -> RosterRow {
        RosterRow {
            number: 1,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn decide(f: &Fixture, values: [&str; 7]) -> RowPlan {
        let ctx = DecisionContext {
            conn: &f.conn,
            membership_type: &f.mtype,
            columns: &f.columns,
            prerequisites: &f.dir,
            note_prefix: "[Import]",
            now: f.now,
        };
        let mut matcher = RowMatcher::Users(IdentityMatcher::build(&f.dir, false));
        ctx.decide(&mut matcher, &row(values)).unwrap()
    }

    fn reason(f: &Fixture, values: [&str; 7]) -> (DecisionKind, String) {
        let plan = decide(f, values);
        (plan.decision.kind, plan.decision.reason)
    }

    #[test]
    fn test_priority_order() {
        let f = fixture();
        f.dir.require_agreements("members", &["FPCA", "CoC"]);

        // Missing email beats everything, and is not an unmatched row.
        let plan = decide(&f, ["", "Alice", "no", "other", "", "garbage", ""]);
        assert_eq!(plan.decision, Decision::skip(REASON_MISSING_EMAIL));
        assert!(!plan.unmatched);

        // No match beats inactive.
        assert_eq!(
            reason(&f, ["nobody@example.org", "", "no", "", "", "", ""]).1,
            "No directory user with this email"
        );
        // Inactive beats type mismatch.
        assert_eq!(
            reason(&f, ["alice@example.org", "", "no", "other", "", "", ""]).1,
            REASON_INACTIVE
        );
        // Type mismatch names both values and beats prerequisites.
        assert_eq!(
            reason(&f, ["alice@example.org", "", "yes", "Emeritus", "", "", ""]).1,
            "Roster type 'Emeritus' does not match selected 'individual'"
        );
        // Prerequisites beat a bad end date.
        assert_eq!(
            reason(&f, ["alice@example.org", "", "yes", "", "", "garbage", ""]).1,
            "Missing required agreements for 'members': FPCA, CoC"
        );

        f.dir.sign_agreement("alice", "FPCA");
        f.dir.sign_agreement("alice", "CoC");
        assert_eq!(
            reason(&f, ["alice@example.org", "", "yes", "", "", "garbage", ""]).1,
            REASON_INVALID_END
        );
        assert_eq!(
            reason(&f, ["alice@example.org", "", "yes", "", "2024-03-01", "2024-03-01", ""]).1,
            REASON_END_BEFORE_START
        );
        // Without a start date the end must be after "now".
        assert_eq!(
            reason(&f, ["alice@example.org", "", "yes", "", "", "2024-05-01", ""]).1,
            REASON_END_BEFORE_START
        );

        let plan = decide(&f, ["ALICE@example.org", "", "Active", "Individual Member", "", "", ""]);
        assert_eq!(plan.decision, Decision::import(REASON_NEW));
        assert_eq!(plan.target, Some(Target::user("alice")));
        assert!(!plan.unmatched);
        assert_eq!(plan.email, "alice@example.org");
    }

    #[test]
    fn test_ambiguous_email() {
        let f = fixture();
        let plan = decide(&f, ["twins@example.org", "", "yes", "", "", "", ""]);
        assert_eq!(plan.decision.kind, DecisionKind::Skip);
        assert!(plan.decision.reason.contains("Ambiguous email"));
        assert!(plan.decision.reason.contains('2'));
        assert!(plan.unmatched);
    }

    #[test]
    fn test_missing_status_column_means_active() {
        let mut f = fixture();
        let headers: Vec<String> = ["Email", "Name", "Col3", "Col4", "Col5", "Col6", "Col7"]
            .iter()
            .map(|h| h.to_string())
            .collect();
        f.columns = ColumnMap::resolve(
            TargetKind::User,
            &headers,
            &BTreeMap::new(),
            &ImportConfig::default(),
            &[],
        )
        .unwrap();
        let plan = decide(&f, ["alice@example.org", "", "", "", "", "", ""]);
        assert_eq!(plan.decision, Decision::import(REASON_NEW));
    }

    #[test]
    fn test_request_and_membership_states() {
        let f = fixture();
        let dir = InMemoryDirectory::default();
        let wf = Workflow::new(&f.conn, Collaborators::from_one(&dir), 365);
        let ctx = ActionContext::default();
        let alice = Target::user("alice");
        let values = ["alice@example.org", "", "yes", "", "", "", ""];

        // Pending request.
        let request = wf.create_request(&alice, "individual", f.now, &[]).unwrap();
        assert_eq!(reason(&f, values), (DecisionKind::Import, REASON_PENDING.to_string()));

        // On hold: skip unless there is something new.
        wf.put_on_hold(&ctx, request.id, "admin").unwrap();
        assert_eq!(reason(&f, values), (DecisionKind::Skip, REASON_ON_HOLD.to_string()));
        let with_note = ["alice@example.org", "", "yes", "", "", "", "Board member"];
        assert_eq!(reason(&f, with_note), (DecisionKind::Import, REASON_ON_HOLD.to_string()));
        wf.add_note(request.id, "admin", "[Import] Board member").unwrap();
        assert_eq!(reason(&f, with_note), (DecisionKind::Skip, REASON_ON_HOLD.to_string()));

        // Active membership.
        wf.reject(&ctx, request.id, "admin", "").unwrap();
        let request = wf.create_request(&alice, "individual", f.now, &[]).unwrap();
        wf.approve(&ctx, request.id, "admin", f.now - Duration::days(1), false)
            .unwrap();
        assert_eq!(reason(&f, values), (DecisionKind::Skip, REASON_UP_TO_DATE.to_string()));
        assert_eq!(
            reason(&f, ["alice@example.org", "", "yes", "", "2020-01-01", "", ""]),
            (DecisionKind::Import, REASON_UPDATE_START.to_string())
        );
        assert_eq!(
            reason(&f, ["alice@example.org", "", "yes", "", "", "", "New note"]),
            (DecisionKind::Import, REASON_UPDATES.to_string())
        );
    }
}
