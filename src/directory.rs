// 📇 External collaborators - directory, groups, agreements, notifications
//
// The ledger never owns identities. It reads them from a directory, asks it
// to grant or revoke group membership, checks agreement prerequisites and
// sends best-effort notifications. Each concern is a trait; the in-memory
// implementation below backs the CLI (loaded from a JSON snapshot) and the
// tests.

use crate::entities::target::Target;
use crate::error::{LedgerError, LedgerResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::RwLock;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    RequestCreated { request_id: i64, target: Target },
    RequestApproved { request_id: i64, target: Target },
}

// ============================================================================
// TRAITS
// ============================================================================

/// Read-only identity lookups. Both calls must be safe to repeat.
pub trait Directory {
    fn list_all_identities(&self) -> LedgerResult<Vec<Identity>>;
    fn find_by_email(&self, email: &str) -> LedgerResult<Option<Identity>>;
}

/// Group membership in the external directory. Errors are plain messages;
/// callers decide whether a failure is fatal.
pub trait GroupGrant {
    fn add_to_group(&self, username: &str, group: &str) -> Result<(), String>;
    fn remove_from_group(&self, username: &str, group: &str) -> Result<(), String>;
}

/// Agreements a user must have signed before joining a group.
pub trait Prerequisites {
    fn missing_for(&self, username: &str, group: &str) -> LedgerResult<Vec<String>>;
}

pub trait Notifier {
    fn notify(&self, notification: &Notification) -> Result<(), String>;
}

/// Everything the workflow and importer call out to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub directory: &'a dyn Directory,
    pub groups: &'a dyn GroupGrant,
    pub prerequisites: &'a dyn Prerequisites,
    pub notifier: &'a dyn Notifier,
}

impl<'a> Collaborators<'a> {
    /// Use one object for every role.
    pub fn from_one<T>(all: &'a T) -> Self
    where
        T: Directory + GroupGrant + Prerequisites + Notifier,
    {
        Collaborators {
            directory: all,
            groups: all,
            prerequisites: all,
            notifier: all,
        }
    }
}

// ============================================================================
// IN-MEMORY DIRECTORY
// ============================================================================

/// Serialized form of a directory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySnapshot {
    pub identities: Vec<Identity>,
    /// group → member usernames
    pub groups: BTreeMap<String, BTreeSet<String>>,
    /// group → agreements required to join
    pub required_agreements: BTreeMap<String, Vec<String>>,
    /// username → agreements signed
    pub signed_agreements: BTreeMap<String, BTreeSet<String>>,
    /// false = bulk listing is not permitted (point lookups still work)
    pub listing_allowed: bool,
}

impl Default for DirectorySnapshot {
    fn default() -> Self {
        DirectorySnapshot {
            identities: Vec::new(),
            groups: BTreeMap::new(),
            required_agreements: BTreeMap::new(),
            signed_agreements: BTreeMap::new(),
            listing_allowed: true,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    snapshot: DirectorySnapshot,
    failing_grants: BTreeSet<String>,
    notifications: Vec<Notification>,
}

/// Directory backed by an in-process snapshot.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: RwLock<State>,
}

impl InMemoryDirectory {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self::from_snapshot(DirectorySnapshot {
            identities,
            ..DirectorySnapshot::default()
        })
    }

    pub fn from_snapshot(snapshot: DirectorySnapshot) -> Self {
        InMemoryDirectory {
            state: RwLock::new(State {
                snapshot,
                ..State::default()
            }),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read directory snapshot {:?}", path))?;
        let snapshot: DirectorySnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid directory snapshot {:?}", path))?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Write the snapshot back, including group changes made since loading.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write directory snapshot {:?}", path))?;
        Ok(())
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        self.read(|state| state.snapshot.clone())
    }

    pub fn add_identity(&self, username: &str, email: &str, full_name: &str) {
        self.write(|state| {
            state.snapshot.identities.push(Identity {
                username: username.to_string(),
                email: email.to_string(),
                full_name: full_name.to_string(),
            })
        });
    }

    pub fn set_listing_allowed(&self, allowed: bool) {
        self.write(|state| state.snapshot.listing_allowed = allowed);
    }

    pub fn require_agreements(&self, group: &str, agreements: &[&str]) {
        self.write(|state| {
            state.snapshot.required_agreements.insert(
                group.to_string(),
                agreements.iter().map(|a| a.to_string()).collect(),
            );
        });
    }

    pub fn sign_agreement(&self, username: &str, agreement: &str) {
        self.write(|state| {
            state
                .snapshot
                .signed_agreements
                .entry(username.to_string())
                .or_default()
                .insert(agreement.to_string());
        });
    }

    /// Make every group grant for `username` fail.
    pub fn fail_grants_for(&self, username: &str) {
        self.write(|state| {
            state.failing_grants.insert(username.to_string());
        });
    }

    pub fn is_member(&self, username: &str, group: &str) -> bool {
        self.read(|state| {
            state
                .snapshot
                .groups
                .get(group)
                .is_some_and(|members| members.contains(username))
        })
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.read(|state| state.notifications.clone())
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        match self.state.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        match self.state.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl Directory for InMemoryDirectory {
    fn list_all_identities(&self) -> LedgerResult<Vec<Identity>> {
        self.read(|state| {
            if state.snapshot.listing_allowed {
                Ok(state.snapshot.identities.clone())
            } else {
                Err(LedgerError::Directory(
                    "listing identities is not permitted".to_string(),
                ))
            }
        })
    }

    fn find_by_email(&self, email: &str) -> LedgerResult<Option<Identity>> {
        let wanted = email.trim().to_lowercase();
        Ok(self.read(|state| {
            state
                .snapshot
                .identities
                .iter()
                .find(|identity| identity.email.trim().to_lowercase() == wanted)
                .cloned()
        }))
    }
}

impl GroupGrant for InMemoryDirectory {
    fn add_to_group(&self, username: &str, group: &str) -> Result<(), String> {
        self.write(|state| {
            if state.failing_grants.contains(username) {
                return Err(format!("directory refused to add {username} to {group}"));
            }
            state
                .snapshot
                .groups
                .entry(group.to_string())
                .or_default()
                .insert(username.to_string());
            Ok(())
        })
    }

    fn remove_from_group(&self, username: &str, group: &str) -> Result<(), String> {
        self.write(|state| {
            if let Some(members) = state.snapshot.groups.get_mut(group) {
                members.remove(username);
            }
            Ok(())
        })
    }
}

impl Prerequisites for InMemoryDirectory {
    fn missing_for(&self, username: &str, group: &str) -> LedgerResult<Vec<String>> {
        Ok(self.read(|state| {
            let signed = state.snapshot.signed_agreements.get(username);
            state
                .snapshot
                .required_agreements
                .get(group)
                .map(|required| {
                    required
                        .iter()
                        .filter(|agreement| !signed.is_some_and(|s| s.contains(*agreement)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        }))
    }
}

impl Notifier for InMemoryDirectory {
    fn notify(&self, notification: &Notification) -> Result<(), String> {
        self.write(|state| state.notifications.push(notification.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_lookups() {
        let dir = InMemoryDirectory::new(vec![Identity {
            username: "alice".to_string(),
            email: "Alice@Example.org".to_string(),
            full_name: "Alice Liddell".to_string(),
        }]);
        assert_eq!(dir.list_all_identities().unwrap().len(), 1);
        assert_eq!(
            dir.find_by_email(" alice@example.org ").unwrap().unwrap().username,
            "alice"
        );
        assert!(dir.find_by_email("bob@example.org").unwrap().is_none());

        dir.set_listing_allowed(false);
        assert!(dir.list_all_identities().is_err());
        assert!(dir.find_by_email("alice@example.org").unwrap().is_some());
    }

    #[test]
    fn test_groups_and_failures() {
        let dir = InMemoryDirectory::default();
        dir.add_to_group("alice", "members").unwrap();
        assert!(dir.is_member("alice", "members"));
        dir.remove_from_group("alice", "members").unwrap();
        assert!(!dir.is_member("alice", "members"));

        dir.fail_grants_for("bob");
        assert!(dir.add_to_group("bob", "members").is_err());
        assert!(!dir.is_member("bob", "members"));
    }

    #[test]
    fn test_missing_agreements() {
        let dir = InMemoryDirectory::default();
        dir.require_agreements("members", &["FPCA", "CoC"]);
        dir.sign_agreement("alice", "CoC");
        assert_eq!(dir.missing_for("alice", "members").unwrap(), vec!["FPCA"]);
        assert!(dir.missing_for("alice", "other").unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_file_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"identities": [{{"username": "bob", "email": "bob@example.org"}}]}}"#
        )
        .unwrap();

        let dir = InMemoryDirectory::load(file.path()).unwrap();
        dir.add_to_group("bob", "members").unwrap();
        dir.save(file.path()).unwrap();

        let reloaded = InMemoryDirectory::load(file.path()).unwrap();
        assert!(reloaded.is_member("bob", "members"));
        assert!(reloaded.list_all_identities().is_ok());
        assert_eq!(reloaded.snapshot().identities[0].full_name, "");
    }
}
