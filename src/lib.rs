// Membership Ledger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod config;
pub mod db;
pub mod entities;
pub mod action_log;     // Append-only action log
pub mod temporal;       // Expiry Calculator + Term Continuity Resolver
pub mod projector;      // Current-state projection + category exclusivity
pub mod directory;      // External directory collaborators
pub mod matcher;        // Roster row → directory identity
pub mod workflow;       // Requests, notes, committee decisions
pub mod reconciliation; // Bulk CSV roster import

// Re-export commonly used types
pub use error::{ApplyError, ImportError, LedgerError, LedgerResult};
pub use config::{ImportConfig, LedgerConfig, QuestionSpec};
pub use db::{
    setup_database, with_immediate,
    insert_category, ensure_category, insert_membership_type, set_membership_type_enabled,
    insert_organization, get_organization, list_organizations, delete_organization,
    OrganizationRecord,
};
pub use entities::{
    Target, TargetKind,
    Category, MembershipType, get_membership_type, list_membership_types, require_membership_type,
    CurrentMembership, get_membership, list_memberships, active_memberships, expiring_memberships,
    MembershipRequest, RequestStatus, Response, Note,
};
pub use action_log::{
    ActionContext, ActionKind, ActionLogEntry, NewAction,
    append, history, entries_for_target, entries_in_batch, all_entries,
};
pub use temporal::{end_of_day_utc, expiry_for_approval_at, resolve_term_start};
pub use projector::{Effects, RebuildSummary, rebuild_current_state};
pub use directory::{
    Collaborators, Directory, DirectorySnapshot, GroupGrant, Identity, InMemoryDirectory,
    Notification, Notifier, Prerequisites,
};
pub use matcher::{IdentityMatcher, MatchMethod, MatchOutcome, OrganizationMatcher};
pub use workflow::{Approval, Workflow, requests_for_target};
pub use reconciliation::{
    Applied, Decision, DecisionKind, ImportOptions, ImportReport, Roster, RosterImporter, RowMatcher,
    RowPlan, write_unmatched,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
