// Entity Models
// Targets, membership reference data, the current-state projection and the
// request documents the importer works against.

pub mod membership;
pub mod membership_type;
pub mod request;
pub mod target;

pub use membership::{active_memberships, expiring_memberships, get_membership, list_memberships, CurrentMembership};
pub use membership_type::{
    get_membership_type, list_membership_types, require_membership_type, Category, MembershipType,
};
pub use request::{
    find_open_request, get_request, latest_request, list_notes, merge_responses, note_exists,
    MembershipRequest, Note, RequestStatus, Response,
};
pub use target::{Target, TargetKind};
