// 🎯 Target - who a membership belongs to
//
// Exactly one of: an individual (directory username) or an organization.
// Organizations carry a fallback code and display name so log entries stay
// identifiable after the organization record itself is deleted.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[default]
    User,
    Organization,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::User => "user",
            TargetKind::Organization => "organization",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    User {
        username: String,
    },
    Organization {
        /// None once the organization record is gone
        id: Option<i64>,
        /// Fallback identifier (the id at the time of the action)
        code: String,
        /// Fallback display name
        name: String,
    },
}

impl Target {
    pub fn user(username: &str) -> Self {
        Target::User {
            username: username.trim().to_string(),
        }
    }

    pub fn organization(id: i64, name: &str) -> Self {
        Target::Organization {
            id: Some(id),
            code: id.to_string(),
            name: name.to_string(),
        }
    }

    /// An organization known only by its fallback code.
    pub fn orphaned_organization(code: &str, name: &str) -> Self {
        Target::Organization {
            id: None,
            code: code.to_string(),
            name: name.to_string(),
        }
    }

    /// Rebuild a target from stored columns. A non-empty username wins.
    pub fn from_columns(
        username: &str,
        organization_id: Option<i64>,
        organization_code: &str,
        organization_name: &str,
    ) -> Self {
        if !username.is_empty() {
            return Target::user(username);
        }
        let code = if !organization_code.is_empty() {
            organization_code.to_string()
        } else {
            organization_id.map(|id| id.to_string()).unwrap_or_default()
        };
        Target::Organization {
            id: organization_id,
            code,
            name: organization_name.to_string(),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Target::User { .. } => TargetKind::User,
            Target::Organization { .. } => TargetKind::Organization,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Target::User { username } => Some(username),
            Target::Organization { .. } => None,
        }
    }

    pub fn organization_id(&self) -> Option<i64> {
        match self {
            Target::Organization { id, .. } => *id,
            Target::User { .. } => None,
        }
    }

    /// Stable identifier used in log filters: username, or the organization code.
    pub fn identifier(&self) -> &str {
        match self {
            Target::User { username } => username,
            Target::Organization { code, .. } => code,
        }
    }

    /// Column values in storage order: (username, org id, org code, org name).
    pub(crate) fn columns(&self) -> (&str, Option<i64>, &str, &str) {
        match self {
            Target::User { username } => (username.as_str(), None, "", ""),
            Target::Organization { id, code, name } => ("", *id, code.as_str(), name.as_str()),
        }
    }

    /// SQL predicate + parameter selecting this target's rows in log or
    /// request tables. Organizations are matched by fallback code so history
    /// survives deletion of the organization record.
    pub(crate) fn log_filter(&self, prefix: &str) -> (String, String) {
        match self {
            Target::User { username } => (format!("{prefix}_username = ?"), username.clone()),
            Target::Organization { code, .. } => {
                (format!("{prefix}_organization_code = ?"), code.clone())
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::User { username } => write!(f, "{}", username),
            Target::Organization { code, .. } => write!(f, "org:{}", code),
        }
    }
}
