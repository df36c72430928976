// 🔎 Identity Matcher - roster row → directory identity
//
// Indexes one directory listing by normalized email and, optionally, by
// normalized full name. A lookup that misses the snapshot (or runs against an
// empty snapshot) falls back to one direct `find_by_email` call, cached per
// email for the rest of the run.
//
// Name matching is exact after trim + lowercase. Nothing fuzzier.
//
// Organization rosters resolve against the organizations table instead:
// by numeric id first, then by exact (normalized) name.

use crate::db::{list_organizations, OrganizationRecord};
use crate::directory::{Directory, Identity};
use crate::error::LedgerResult;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Email,
    Id,
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched {
        identity: Identity,
        method: MatchMethod,
    },
    Ambiguous {
        method: MatchMethod,
        count: usize,
    },
    NoMatch {
        names_tried: bool,
    },
}

impl MatchOutcome {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            MatchOutcome::Matched { identity, .. } => Some(identity),
            _ => None,
        }
    }

    /// Skip reason for rows that did not resolve to exactly one identity.
    pub fn reason(&self) -> Option<String> {
        match self {
            MatchOutcome::Matched { .. } => None,
            MatchOutcome::Ambiguous { method, count } => {
                let field = match method {
                    MatchMethod::Email => "email",
                    MatchMethod::Id => "id",
                    MatchMethod::Name => "name",
                };
                Some(format!("Ambiguous {field} (matches {count} users)"))
            }
            MatchOutcome::NoMatch { names_tried: false } => {
                Some("No directory user with this email".to_string())
            }
            MatchOutcome::NoMatch { names_tried: true } => {
                Some("No directory user with this email or name".to_string())
            }
        }
    }
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub fn normalize_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}

pub struct IdentityMatcher<'a> {
    directory: &'a dyn Directory,
    by_email: HashMap<String, Vec<Identity>>,
    by_name: HashMap<String, Vec<Identity>>,
    match_names: bool,
    snapshot_size: usize,
    fallback_cache: HashMap<String, Option<Identity>>,
}

impl<'a> IdentityMatcher<'a> {
    /// Build indexes from one listing. A failed listing leaves the indexes
    /// empty and every lookup goes through the per-email fallback.
    pub fn build(directory: &'a dyn Directory, match_names: bool) -> Self {
        let identities = match directory.list_all_identities() {
            Ok(identities) => identities,
            Err(e) => {
                warn!(error = %e, "Directory listing unavailable, using per-email lookups");
                Vec::new()
            }
        };

        let mut by_email: HashMap<String, Vec<Identity>> = HashMap::new();
        let mut by_name: HashMap<String, Vec<Identity>> = HashMap::new();
        for identity in &identities {
            let email = normalize_email(&identity.email);
            if !email.is_empty() {
                push_unique(by_email.entry(email).or_default(), identity);
            }
            if match_names {
                let name = normalize_name(&identity.full_name);
                if !name.is_empty() {
                    push_unique(by_name.entry(name).or_default(), identity);
                }
            }
        }

        debug!(
            identities = identities.len(),
            emails = by_email.len(),
            names = by_name.len(),
            "Built identity indexes"
        );

        IdentityMatcher {
            directory,
            by_email,
            by_name,
            match_names,
            snapshot_size: identities.len(),
            fallback_cache: HashMap::new(),
        }
    }

    pub fn snapshot_size(&self) -> usize {
        self.snapshot_size
    }

    pub fn lookup(&mut self, email: &str, name: &str) -> MatchOutcome {
        let email = normalize_email(email);
        if !email.is_empty() {
            let indexed = self.by_email.get(&email).cloned().unwrap_or_default();
            match indexed.len() {
                1 => {
                    return MatchOutcome::Matched {
                        identity: indexed[0].clone(),
                        method: MatchMethod::Email,
                    }
                }
                0 => {
                    if let Some(identity) = self.fallback(&email) {
                        return MatchOutcome::Matched {
                            identity,
                            method: MatchMethod::Email,
                        };
                    }
                }
                count => {
                    return MatchOutcome::Ambiguous {
                        method: MatchMethod::Email,
                        count,
                    }
                }
            }
        }

        let name = normalize_name(name);
        if !self.match_names || name.is_empty() {
            return MatchOutcome::NoMatch { names_tried: false };
        }

        let candidates = self.by_name.get(&name).map(Vec::as_slice).unwrap_or(&[]);
        match candidates.len() {
            0 => MatchOutcome::NoMatch { names_tried: true },
            1 => MatchOutcome::Matched {
                identity: candidates[0].clone(),
                method: MatchMethod::Name,
            },
            count => MatchOutcome::Ambiguous {
                method: MatchMethod::Name,
                count,
            },
        }
    }

    fn fallback(&mut self, email: &str) -> Option<Identity> {
        if let Some(cached) = self.fallback_cache.get(email) {
            return cached.clone();
        }
        let found = match self.directory.find_by_email(email) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Direct email lookup failed");
                None
            }
        };
        self.fallback_cache.insert(email.to_string(), found.clone());
        found
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrganizationOutcome {
    Matched {
        organization: OrganizationRecord,
        method: MatchMethod,
    },
    Unmatched {
        reason: String,
    },
}

impl OrganizationOutcome {
    fn unmatched(reason: &str) -> Self {
        OrganizationOutcome::Unmatched {
            reason: reason.to_string(),
        }
    }
}

pub struct OrganizationMatcher {
    by_id: HashMap<i64, OrganizationRecord>,
    by_name: HashMap<String, Vec<OrganizationRecord>>,
}

impl OrganizationMatcher {
    pub fn build(conn: &Connection) -> LedgerResult<Self> {
        let mut by_id = HashMap::new();
        let mut by_name: HashMap<String, Vec<OrganizationRecord>> = HashMap::new();
        for org in list_organizations(conn)? {
            let name = normalize_name(&org.name);
            if !name.is_empty() {
                by_name.entry(name).or_default().push(org.clone());
            }
            by_id.insert(org.id, org);
        }
        debug!(organizations = by_id.len(), "Built organization indexes");
        Ok(OrganizationMatcher { by_id, by_name })
    }

    /// An unparsable id is only fatal when there is no name to fall back on.
    pub fn lookup(&self, raw_id: &str, raw_name: &str) -> OrganizationOutcome {
        let raw_id = raw_id.trim();
        let name = normalize_name(raw_name);

        if !raw_id.is_empty() {
            match raw_id.parse::<i64>() {
                Ok(id) => {
                    if let Some(org) = self.by_id.get(&id) {
                        return OrganizationOutcome::Matched {
                            organization: org.clone(),
                            method: MatchMethod::Id,
                        };
                    }
                    if name.is_empty() {
                        return OrganizationOutcome::unmatched("Organization not found");
                    }
                }
                Err(_) if name.is_empty() => {
                    return OrganizationOutcome::unmatched("Invalid organization ID");
                }
                Err(_) => {}
            }
        }

        let candidates = self.by_name.get(&name).map(Vec::as_slice).unwrap_or(&[]);
        match candidates.len() {
            1 => OrganizationOutcome::Matched {
                organization: candidates[0].clone(),
                method: MatchMethod::Name,
            },
            0 => OrganizationOutcome::unmatched("Organization not found"),
            count => OrganizationOutcome::Unmatched {
                reason: format!("Ambiguous organization name ({count} matches)"),
            },
        }
    }
}

fn push_unique(bucket: &mut Vec<Identity>, identity: &Identity) {
    if !bucket.iter().any(|known| known.username == identity.username) {
        bucket.push(identity.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::error::LedgerResult;
    use std::cell::Cell;

    fn identity(username: &str, email: &str, name: &str) -> Identity {
        Identity {
            username: username.to_string(),
            email: email.to_string(),
            full_name: name.to_string(),
        }
    }

    fn directory() -> InMemoryDirectory {
        InMemoryDirectory::new(vec![
            identity("alice", "alice@example.org", "Alice Liddell"),
            identity("bob", "shared@example.org", "Bob Builder"),
            identity("bobby", "shared@example.org", "Bob Builder"),
            identity("carol", "carol@example.org", "Carol Danvers"),
        ])
    }

    #[test]
    fn test_email_match_is_normalized() {
        let dir = directory();
        let mut matcher = IdentityMatcher::build(&dir, false);
        let outcome = matcher.lookup("  ALICE@example.org ", "");
        assert_eq!(outcome.identity().unwrap().username, "alice");
        assert!(outcome.reason().is_none());
    }

    #[test]
    fn test_ambiguous_email_names_the_count() {
        let dir = directory();
        let mut matcher = IdentityMatcher::build(&dir, true);
        let outcome = matcher.lookup("shared@example.org", "Bob Builder");
        assert_eq!(
            outcome.reason().unwrap(),
            "Ambiguous email (matches 2 users)"
        );
    }

    #[test]
    fn test_name_match_only_when_enabled_and_exact() {
        let dir = directory();

        let mut email_only = IdentityMatcher::build(&dir, false);
        let outcome = email_only.lookup("old@example.org", "Carol Danvers");
        assert_eq!(outcome.reason().unwrap(), "No directory user with this email");

        let mut with_names = IdentityMatcher::build(&dir, true);
        let outcome = with_names.lookup("old@example.org", " carol danvers ");
        assert_eq!(
            outcome,
            MatchOutcome::Matched {
                identity: identity("carol", "carol@example.org", "Carol Danvers"),
                method: MatchMethod::Name,
            }
        );

        let outcome = with_names.lookup("old@example.org", "Carol-Danvers");
        assert_eq!(
            outcome.reason().unwrap(),
            "No directory user with this email or name"
        );

        let outcome = with_names.lookup("", "bob builder");
        assert_eq!(outcome.reason().unwrap(), "Ambiguous name (matches 2 users)");
    }

    #[test]
    fn test_blank_name_reports_email_only() {
        let dir = directory();
        let mut with_names = IdentityMatcher::build(&dir, true);
        let outcome = with_names.lookup("old@example.org", "   ");
        assert_eq!(outcome, MatchOutcome::NoMatch { names_tried: false });
        assert_eq!(outcome.reason().unwrap(), "No directory user with this email");
    }

    #[test]
    fn test_organization_lookup_by_id_then_name() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::setup_database(&conn).unwrap();
        let acme = crate::db::insert_organization(&conn, "Acme", "").unwrap();
        crate::db::insert_organization(&conn, "Twin Corp", "").unwrap();
        crate::db::insert_organization(&conn, "twin corp", "").unwrap();
        let matcher = OrganizationMatcher::build(&conn).unwrap();

        let matched = |outcome: OrganizationOutcome| match outcome {
            OrganizationOutcome::Matched { organization, method } => (organization.id, method),
            OrganizationOutcome::Unmatched { reason } => panic!("unmatched: {reason}"),
        };
        let reason = |outcome: OrganizationOutcome| match outcome {
            OrganizationOutcome::Unmatched { reason } => reason,
            OrganizationOutcome::Matched { .. } => panic!("unexpected match"),
        };

        assert_eq!(matched(matcher.lookup(&acme.to_string(), "")), (acme, MatchMethod::Id));
        assert_eq!(matched(matcher.lookup("", " ACME ")), (acme, MatchMethod::Name));
        // A stale id falls back to the name.
        assert_eq!(matched(matcher.lookup("999", "Acme")), (acme, MatchMethod::Name));
        assert_eq!(matched(matcher.lookup("n/a", "Acme")), (acme, MatchMethod::Name));

        assert_eq!(reason(matcher.lookup("999", "")), "Organization not found");
        assert_eq!(reason(matcher.lookup("n/a", "")), "Invalid organization ID");
        assert_eq!(reason(matcher.lookup("", "Initech")), "Organization not found");
        assert_eq!(
            reason(matcher.lookup("", "Twin Corp")),
            "Ambiguous organization name (2 matches)"
        );
    }

    struct CountingDirectory {
        inner: InMemoryDirectory,
        point_lookups: Cell<usize>,
    }

    impl Directory for CountingDirectory {
        fn list_all_identities(&self) -> LedgerResult<Vec<Identity>> {
            self.inner.list_all_identities()
        }

        fn find_by_email(&self, email: &str) -> LedgerResult<Option<Identity>> {
            self.point_lookups.set(self.point_lookups.get() + 1);
            self.inner.find_by_email(email)
        }
    }

    #[test]
    fn test_fallback_when_listing_unavailable() {
        let dir = CountingDirectory {
            inner: directory(),
            point_lookups: Cell::new(0),
        };
        dir.inner.set_listing_allowed(false);

        let mut matcher = IdentityMatcher::build(&dir, false);
        assert_eq!(matcher.snapshot_size(), 0);
        assert_eq!(
            matcher.lookup("carol@example.org", "").identity().unwrap().username,
            "carol"
        );
        matcher.lookup("carol@example.org", "");
        matcher.lookup("nobody@example.org", "");
        matcher.lookup("nobody@example.org", "");
        assert_eq!(dir.point_lookups.get(), 2);
    }

    #[test]
    fn test_fallback_on_snapshot_miss() {
        let dir = directory();
        let mut matcher = IdentityMatcher::build(&dir, false);
        // Added after the snapshot was taken.
        dir.add_identity("dave", "dave@example.org", "Dave");
        assert_eq!(
            matcher.lookup("dave@example.org", "").identity().unwrap().username,
            "dave"
        );
    }
}
