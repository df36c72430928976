// 🔁 Roster Reconciliation - bulk CSV import
//
// Two modes over the same decision logic:
// - preview: decide every row, write nothing, collect unmatched rows
// - confirm: decide each row again against the current ledger and, for
//   IMPORT rows, apply it. Rows run strictly in order; a later row sees the
//   log entries written by earlier rows of the same run.
//
// Each confirm run gets one batch id, attached to every log entry it writes.
// A failing row (while deciding or applying) is logged and counted; the run
// moves on.
//
// A roster lists either directory users (matched by email, then optionally
// by name) or organizations (matched by id, then by name).

pub mod apply;
pub mod columns;
pub mod decision;
pub mod export;
pub mod roster;

pub use apply::{Applied, RowApplier};
pub use columns::{ColumnMap, RosterField};
pub use decision::{Decision, DecisionContext, DecisionKind, RowMatcher, RowPlan};
pub use export::write_unmatched;
pub use roster::Roster;

use crate::action_log::ActionContext;
use crate::config::LedgerConfig;
use crate::db;
use crate::directory::Collaborators;
use crate::entities::membership_type::{get_membership_type, MembershipType};
use crate::entities::target::TargetKind;
use crate::error::{ImportError, LedgerError};
use crate::matcher::{normalize_email, IdentityMatcher, MatchMethod, OrganizationMatcher};
use crate::reconciliation::roster::RosterRow;
use crate::workflow::Workflow;
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, error, info};
use uuid::Uuid;

const TOP_SKIP_REASONS: usize = 8;

// ============================================================================
// OPTIONS + REPORT
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub membership_type: String,
    /// What the roster lists: users or organizations
    pub target_kind: TargetKind,
    /// Fall back to exact full-name matching when the email does not match
    pub match_names: bool,
    /// Logical field (or question name) → roster header
    pub column_overrides: BTreeMap<String, String>,
    pub actor: String,
    /// Restrict confirm to these 1-based data row numbers
    pub only_rows: Option<BTreeSet<usize>>,
}

impl ImportOptions {
    pub fn new(membership_type: &str, actor: &str) -> Self {
        ImportOptions {
            membership_type: membership_type.to_string(),
            actor: actor.to_string(),
            ..ImportOptions::default()
        }
    }

    pub fn organizations(membership_type: &str, actor: &str) -> Self {
        ImportOptions {
            target_kind: TargetKind::Organization,
            ..ImportOptions::new(membership_type, actor)
        }
    }

    fn selects(&self, row: usize) -> bool {
        self.only_rows
            .as_ref()
            .map_or(true, |rows| rows.contains(&row))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RowFailure {
    pub row: usize,
    /// Matched target, when the row got that far
    pub holder: Option<String>,
    pub reason: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    /// Set for confirm runs only
    pub batch_id: Option<Uuid>,
    pub rows_total: usize,
    pub imports: usize,
    pub skips: usize,
    /// (reason, count), most frequent first
    pub skip_reasons: Vec<(String, usize)>,
    pub matched_by_email: usize,
    pub matched_by_id: usize,
    pub matched_by_name: usize,
    pub match_percent: f64,
    pub plans: Vec<RowPlan>,
    pub applied: Vec<Applied>,
    /// Rows whose decision could not be computed
    pub undecided: usize,
    /// Undecided rows plus rows that failed to apply
    pub failed: usize,
    /// Capped at `import.max_reported_failures`
    pub failures: Vec<RowFailure>,
}

impl ImportReport {
    pub fn unmatched(&self) -> Vec<&RowPlan> {
        export::unmatched_plans(&self.plans)
    }

    fn tally(&mut self) {
        let mut reasons: HashMap<&str, usize> = HashMap::new();
        self.rows_total = self.plans.len() + self.undecided;
        self.imports = 0;
        self.skips = 0;
        self.matched_by_email = 0;
        self.matched_by_id = 0;
        self.matched_by_name = 0;

        for plan in &self.plans {
            if plan.decision.is_import() {
                self.imports += 1;
            } else {
                self.skips += 1;
                *reasons.entry(plan.decision.reason.as_str()).or_default() += 1;
            }
            match plan.matched_by {
                Some(MatchMethod::Email) => self.matched_by_email += 1,
                Some(MatchMethod::Id) => self.matched_by_id += 1,
                Some(MatchMethod::Name) => self.matched_by_name += 1,
                None => {}
            }
        }

        let mut reasons: Vec<(String, usize)> = reasons
            .into_iter()
            .map(|(reason, count)| (reason.to_string(), count))
            .collect();
        reasons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        self.skip_reasons = reasons;

        self.match_percent = if self.rows_total == 0 {
            0.0
        } else {
            let matched = self.matched_by_email + self.matched_by_id + self.matched_by_name;
            matched as f64 * 100.0 / self.rows_total as f64
        };
    }

    fn log_summary(&self) {
        info!(
            rows_total = self.rows_total,
            imports = self.imports,
            skips = self.skips,
            matched_by_email = self.matched_by_email,
            matched_by_id = self.matched_by_id,
            matched_by_name = self.matched_by_name,
            undecided = self.undecided,
            match_percent = self.match_percent,
            "Roster decisions"
        );
        for (reason, count) in self.skip_reasons.iter().take(TOP_SKIP_REASONS) {
            info!(reason = %reason, count = *count, "Skip reason");
        }
    }
}

/// Stable, non-reversible stand-in for an email address in logs.
pub fn email_fingerprint(email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_email(email).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

// ============================================================================
// IMPORTER
// ============================================================================

pub struct RosterImporter<'a> {
    conn: &'a Connection,
    collab: Collaborators<'a>,
    config: &'a LedgerConfig,
}

impl<'a> RosterImporter<'a> {
    pub fn new(conn: &'a Connection, collab: Collaborators<'a>, config: &'a LedgerConfig) -> Self {
        RosterImporter {
            conn,
            collab,
            config,
        }
    }

    /// Decide every row without writing anything.
    pub fn preview(&self, roster: &Roster, options: &ImportOptions) -> Result<ImportReport, ImportError> {
        let (mtype, columns) = self.prepare(roster, options)?;
        let mut matcher = self.row_matcher(options)?;
        let ctx = self.decision_context(&mtype, &columns, db::now());

        let mut report = ImportReport::default();
        for row in &roster.rows {
            match ctx.decide(&mut matcher, row) {
                Ok(plan) => {
                    self.breadcrumb(&plan);
                    report.plans.push(plan);
                }
                Err(e) => self.undecided(&mut report, None, row, &e),
            }
        }
        report.tally();
        report.log_summary();
        Ok(report)
    }

    /// Decide and apply row by row under a fresh batch id.
    pub fn confirm(&self, roster: &Roster, options: &ImportOptions) -> Result<ImportReport, ImportError> {
        let (mtype, columns) = self.prepare(roster, options)?;
        let mut matcher = self.row_matcher(options)?;

        let batch_id = Uuid::new_v4();
        let action_ctx = ActionContext::import_batch(batch_id);
        let workflow = Workflow::new(self.conn, self.collab, self.config.validity_days);
        let applier = RowApplier {
            workflow: &workflow,
            ctx: &action_ctx,
            actor: &options.actor,
            membership_type: &mtype.code,
            note_prefix: &self.config.import.note_prefix,
        };
        info!(batch_id = %batch_id, membership_type = %mtype.code, "Starting roster import");

        let mut report = ImportReport {
            batch_id: Some(batch_id),
            ..ImportReport::default()
        };

        for row in roster.rows.iter().filter(|row| options.selects(row.number)) {
            let now = db::now();
            let ctx = self.decision_context(&mtype, &columns, now);
            let plan = match ctx.decide(&mut matcher, row) {
                Ok(plan) => plan,
                Err(e) => {
                    self.undecided(&mut report, Some(batch_id), row, &e);
                    continue;
                }
            };
            self.breadcrumb(&plan);

            if plan.decision.is_import() {
                match applier.apply(&plan, now) {
                    Ok(applied) => report.applied.push(applied),
                    Err(e) => {
                        let holder = plan.holder();
                        error!(
                            batch_id = %batch_id,
                            row = plan.row,
                            holder = holder.as_deref().unwrap_or(""),
                            membership_type = %mtype.code,
                            email_fingerprint = %email_fingerprint(&plan.email),
                            decision = %plan.decision.kind,
                            reason = %plan.decision.reason,
                            error = %e.source,
                            "Failed to apply roster row"
                        );
                        self.record_failure(
                            &mut report,
                            RowFailure {
                                row: plan.row,
                                holder,
                                reason: plan.decision.reason.clone(),
                                error: e.source.to_string(),
                            },
                        );
                    }
                }
            }
            report.plans.push(plan);
        }

        report.tally();
        report.log_summary();
        info!(
            outcome = if report.failed == 0 { "success" } else { "partial" },
            batch_id = %batch_id,
            rows_total = report.rows_total,
            rows_applied = report.applied.len(),
            rows_failed = report.failed,
            "Roster import finished"
        );
        Ok(report)
    }

    fn prepare(
        &self,
        roster: &Roster,
        options: &ImportOptions,
    ) -> Result<(MembershipType, ColumnMap), ImportError> {
        let code = options.membership_type.trim();
        if code.is_empty() {
            return Err(ImportError::MissingMembershipType);
        }
        let mtype = get_membership_type(self.conn, code)?
            .filter(|mtype| mtype.enabled)
            .ok_or_else(|| ImportError::UnknownMembershipType(code.to_string()))?;
        if !mtype.category.admits(options.target_kind) {
            return Err(LedgerError::TargetNotAllowed {
                membership_type: mtype.code.clone(),
                target_kind: options.target_kind.as_str().to_string(),
            }
            .into());
        }

        let questions = self.config.questions_for(&mtype.code);
        let columns = ColumnMap::resolve(
            options.target_kind,
            &roster.headers,
            &options.column_overrides,
            &self.config.import,
            &questions,
        )?;
        Ok((mtype, columns))
    }

    fn row_matcher(&self, options: &ImportOptions) -> Result<RowMatcher<'a>, ImportError> {
        Ok(match options.target_kind {
            TargetKind::User => RowMatcher::Users(IdentityMatcher::build(
                self.collab.directory,
                options.match_names,
            )),
            TargetKind::Organization => {
                RowMatcher::Organizations(OrganizationMatcher::build(self.conn)?)
            }
        })
    }

    fn record_failure(&self, report: &mut ImportReport, failure: RowFailure) {
        report.failed += 1;
        if report.failures.len() < self.config.import.max_reported_failures {
            report.failures.push(failure);
        }
    }

    /// A row whose decision hit an error. It is counted and the run goes on.
    fn undecided(
        &self,
        report: &mut ImportReport,
        batch_id: Option<Uuid>,
        row: &RosterRow,
        error: &LedgerError,
    ) {
        error!(
            batch_id = batch_id.map(|id| id.to_string()).unwrap_or_default(),
            row = row.number,
            error = %error,
            "Failed to decide roster row"
        );
        report.undecided += 1;
        self.record_failure(
            report,
            RowFailure {
                row: row.number,
                holder: None,
                reason: String::new(),
                error: error.to_string(),
            },
        );
    }

    fn decision_context<'c>(
        &'c self,
        mtype: &'c MembershipType,
        columns: &'c ColumnMap,
        now: chrono::DateTime<chrono::Utc>,
    ) -> DecisionContext<'c> {
        DecisionContext {
            conn: self.conn,
            membership_type: mtype,
            columns,
            prerequisites: self.collab.prerequisites,
            note_prefix: &self.config.import.note_prefix,
            now,
        }
    }

    fn breadcrumb(&self, plan: &RowPlan) {
        if plan.row <= self.config.import.max_logged_rows {
            debug!(
                row = plan.row,
                email = %plan.email,
                holder = plan.holder().unwrap_or_default(),
                decision = %plan.decision.kind,
                reason = %plan.decision.reason,
                "Decided roster row"
            );
        }
    }
}
