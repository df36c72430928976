// ⚙️ Configuration
// Process-wide settings loaded once and threaded explicitly into the engine.
//
// Column synonym lists live here, not in code: operators can teach the
// importer a new roster dialect by editing the TOML file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ============================================================================
// LEDGER CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Length of one membership term in days
    pub validity_days: i64,

    /// Window used by `expiring_memberships` when no explicit window is given
    pub expiring_soon_days: i64,

    pub import: ImportConfig,

    /// Membership questions whose answers may appear as roster columns
    pub questions: Vec<QuestionSpec>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            database_path: PathBuf::from("membership.db"),
            validity_days: 365,
            expiring_soon_days: 30,
            import: ImportConfig::default(),
            questions: Vec::new(),
        }
    }
}

impl LedgerConfig {
    /// Load configuration from a TOML file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml_str(&raw).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: LedgerConfig = toml::from_str(raw)?;
        if config.validity_days <= 0 {
            anyhow::bail!("validity_days must be positive, got {}", config.validity_days);
        }
        Ok(config)
    }

    /// Questions that apply to the given membership type code.
    pub fn questions_for(&self, membership_type: &str) -> Vec<&QuestionSpec> {
        self.questions
            .iter()
            .filter(|q| q.applies_to(membership_type))
            .collect()
    }
}

// ============================================================================
// IMPORT CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Ordered synonyms per logical roster field (normalized header form)
    pub synonyms: BTreeMap<String, Vec<String>>,

    /// Prefix that marks notes written by the importer
    pub note_prefix: String,

    /// Cap on detailed row failures returned from a confirm run
    pub max_reported_failures: usize,

    /// Rows beyond this number get no per-row DEBUG breadcrumb
    pub max_logged_rows: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        let synonyms = [
            ("email", &["email", "emailaddress", "mail"][..]),
            ("name", &["name", "fullname"][..]),
            ("active_member", &["activemember", "active", "status"][..]),
            ("start_date", &["membershipstartdate", "startdate"][..]),
            (
                "end_date",
                &[
                    "membershipenddate",
                    "enddate",
                    "membershipexpirydate",
                    "membershipexpirationdate",
                    "expirydate",
                    "expirationdate",
                ][..],
            ),
            (
                "notes",
                &["committeenotes", "committeenote", "fasstatusnote", "note", "notes"][..],
            ),
            ("membership_type", &["membershiptype", "type"][..]),
            ("organization_id", &["organizationid", "orgid", "id"][..]),
            ("organization_name", &["organizationname", "orgname", "name"][..]),
        ]
        .into_iter()
        .map(|(field, names)| {
            (
                field.to_string(),
                names.iter().map(|n| n.to_string()).collect(),
            )
        })
        .collect();

        ImportConfig {
            synonyms,
            note_prefix: "[Import]".to_string(),
            max_reported_failures: 25,
            max_logged_rows: 50,
        }
    }
}

impl ImportConfig {
    pub fn synonyms_for(&self, field: &str) -> &[String] {
        self.synonyms.get(field).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ============================================================================
// QUESTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionSpec {
    /// Display name, also the key stored in request responses
    pub name: String,

    /// Form field name, e.g. "q_contributions"
    pub field_name: String,

    #[serde(default)]
    pub required: bool,

    /// Membership type codes this question belongs to (empty = all)
    #[serde(default)]
    pub membership_types: Vec<String>,
}

impl QuestionSpec {
    pub fn applies_to(&self, membership_type: &str) -> bool {
        self.membership_types.is_empty()
            || self
                .membership_types
                .iter()
                .any(|code| code.eq_ignore_ascii_case(membership_type))
    }

    /// Header spellings that identify this question's answer column.
    pub fn header_synonyms(&self) -> Vec<String> {
        let mut names = vec![self.name.clone(), self.field_name.clone()];
        if let Some(stripped) = self.field_name.strip_prefix("q_") {
            names.push(stripped.to_string());
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_cover_every_roster_field() {
        let config = LedgerConfig::default();
        assert_eq!(config.validity_days, 365);
        for field in [
            "email",
            "name",
            "active_member",
            "start_date",
            "end_date",
            "notes",
            "membership_type",
            "organization_id",
            "organization_name",
        ] {
            assert!(!config.import.synonyms_for(field).is_empty(), "{field}");
        }
        assert_eq!(config.import.synonyms_for("email")[0], "email");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LedgerConfig::from_toml_str(
            r#"
validity_days = 30

[[questions]]
name = "Contributions"
field_name = "q_contributions"
membership_types = ["individual"]
"#,
        )
        .unwrap();

        assert_eq!(config.validity_days, 30);
        assert_eq!(config.import.note_prefix, "[Import]");
        assert_eq!(config.questions_for("INDIVIDUAL").len(), 1);
        assert!(config.questions_for("mirror").is_empty());
        assert_eq!(
            config.questions[0].header_synonyms(),
            vec!["Contributions", "q_contributions", "contributions"]
        );
    }

    #[test]
    fn test_rejects_non_positive_validity() {
        assert!(LedgerConfig::from_toml_str("validity_days = 0").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database_path = \"ledger.db\"").unwrap();
        writeln!(file, "[import.synonyms]").unwrap();
        writeln!(file, "email = [\"contactemail\"]").unwrap();

        let config = LedgerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database_path, PathBuf::from("ledger.db"));
        assert_eq!(config.import.synonyms_for("email"), ["contactemail"]);
        // Table replaced as a whole; fields not listed lose their synonyms.
        assert!(config.import.synonyms_for("name").is_empty());
    }
}
