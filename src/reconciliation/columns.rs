// 🧭 Header resolution - roster columns → logical fields
//
// Per field: explicit override, else the first synonym (in configured order)
// that equals a normalized header, else unresolved. A column is claimed by
// at most one field. Columns no field or question claims become free-form
// responses.
//
// User rosters identify rows by email (and name); organization rosters by
// organization id and/or name.

use crate::config::{ImportConfig, QuestionSpec};
use crate::entities::request::Response;
use crate::entities::target::TargetKind;
use crate::error::ImportError;
use crate::reconciliation::roster::{normalize_header, RosterRow};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RosterField {
    Email,
    Name,
    ActiveMember,
    StartDate,
    EndDate,
    Notes,
    MembershipType,
    OrganizationId,
    OrganizationName,
}

impl RosterField {
    pub const ALL: [RosterField; 9] = [
        RosterField::Email,
        RosterField::Name,
        RosterField::ActiveMember,
        RosterField::StartDate,
        RosterField::EndDate,
        RosterField::Notes,
        RosterField::MembershipType,
        RosterField::OrganizationId,
        RosterField::OrganizationName,
    ];

    const USER: [RosterField; 7] = [
        RosterField::Email,
        RosterField::Name,
        RosterField::ActiveMember,
        RosterField::StartDate,
        RosterField::EndDate,
        RosterField::Notes,
        RosterField::MembershipType,
    ];

    const ORGANIZATION: [RosterField; 7] = [
        RosterField::OrganizationId,
        RosterField::OrganizationName,
        RosterField::ActiveMember,
        RosterField::StartDate,
        RosterField::EndDate,
        RosterField::Notes,
        RosterField::MembershipType,
    ];

    /// Fields resolved for a roster of this kind, in claiming order.
    pub fn for_kind(kind: TargetKind) -> &'static [RosterField] {
        match kind {
            TargetKind::User => &Self::USER,
            TargetKind::Organization => &Self::ORGANIZATION,
        }
    }

    /// Key used in configuration and overrides.
    pub fn key(&self) -> &'static str {
        match self {
            RosterField::Email => "email",
            RosterField::Name => "name",
            RosterField::ActiveMember => "active_member",
            RosterField::StartDate => "start_date",
            RosterField::EndDate => "end_date",
            RosterField::Notes => "notes",
            RosterField::MembershipType => "membership_type",
            RosterField::OrganizationId => "organization_id",
            RosterField::OrganizationName => "organization_name",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        RosterField::ALL.into_iter().find(|f| f.key() == key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuestionColumn {
    pub name: String,
    pub required: bool,
    pub index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMap {
    pub headers: Vec<String>,
    fields: BTreeMap<RosterField, usize>,
    pub questions: Vec<QuestionColumn>,
    /// Unclaimed columns, in header order
    pub free_form: Vec<usize>,
}

impl ColumnMap {
    pub fn resolve(
        kind: TargetKind,
        headers: &[String],
        overrides: &BTreeMap<String, String>,
        config: &ImportConfig,
        questions: &[&QuestionSpec],
    ) -> Result<Self, ImportError> {
        let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
        let mut claimed: BTreeSet<usize> = BTreeSet::new();
        let mut fields = BTreeMap::new();
        let mut question_overrides: BTreeMap<String, usize> = BTreeMap::new();

        // 1. Explicit overrides must name a real header.
        for (key, header) in overrides {
            let wanted = normalize_header(header);
            let idx = headers
                .iter()
                .position(|h| h == header)
                .or_else(|| normalized.iter().position(|n| *n == wanted))
                .ok_or_else(|| ImportError::UnknownColumnOverride {
                    field: key.clone(),
                    header: header.clone(),
                })?;
            match RosterField::from_key(key) {
                Some(field) => {
                    fields.insert(field, idx);
                }
                None => {
                    question_overrides.insert(normalize_header(key), idx);
                }
            }
            claimed.insert(idx);
        }

        // 2. Synonyms, in configured order.
        for &field in RosterField::for_kind(kind) {
            if fields.contains_key(&field) {
                continue;
            }
            let found = config.synonyms_for(field.key()).iter().find_map(|synonym| {
                let synonym = normalize_header(synonym);
                normalized
                    .iter()
                    .enumerate()
                    .find(|(idx, n)| **n == synonym && !claimed.contains(idx))
                    .map(|(idx, _)| idx)
            });
            if let Some(idx) = found {
                fields.insert(field, idx);
                claimed.insert(idx);
            }
        }

        match kind {
            TargetKind::User if !fields.contains_key(&RosterField::Email) => {
                return Err(ImportError::MissingEmailColumn);
            }
            TargetKind::Organization
                if !fields.contains_key(&RosterField::OrganizationId)
                    && !fields.contains_key(&RosterField::OrganizationName) =>
            {
                return Err(ImportError::MissingOrganizationColumn);
            }
            _ => {}
        }

        // 3. Question columns.
        let mut question_columns = Vec::new();
        for question in questions {
            let synonyms: Vec<String> = question
                .header_synonyms()
                .iter()
                .map(|s| normalize_header(s))
                .collect();
            let index = synonyms
                .iter()
                .find_map(|s| question_overrides.get(s).copied())
                .or_else(|| {
                    synonyms.iter().find_map(|synonym| {
                        normalized
                            .iter()
                            .enumerate()
                            .find(|(idx, n)| *n == synonym && !claimed.contains(idx))
                            .map(|(idx, _)| idx)
                    })
                });
            if let Some(idx) = index {
                claimed.insert(idx);
            }
            question_columns.push(QuestionColumn {
                name: question.name.clone(),
                required: question.required,
                index,
            });
        }

        let free_form = (0..headers.len())
            .filter(|idx| !claimed.contains(idx) && !headers[*idx].is_empty())
            .collect();

        Ok(ColumnMap {
            headers: headers.to_vec(),
            fields,
            questions: question_columns,
            free_form,
        })
    }

    pub fn index_of(&self, field: RosterField) -> Option<usize> {
        self.fields.get(&field).copied()
    }

    pub fn has(&self, field: RosterField) -> bool {
        self.fields.contains_key(&field)
    }

    /// Trimmed cell for a field; None when the field is unresolved.
    pub fn value<'r>(&self, row: &'r RosterRow, field: RosterField) -> Option<&'r str> {
        self.index_of(field).map(|idx| row.get(idx).trim())
    }

    /// Question answers (present, or required) then non-empty free-form cells.
    pub fn responses(&self, row: &RosterRow) -> Vec<Response> {
        let mut responses = Vec::new();
        for question in &self.questions {
            let answer = question.index.map(|idx| row.get(idx).trim()).unwrap_or("");
            if !answer.is_empty() || question.required {
                responses.push(Response::new(&question.name, answer));
            }
        }
        for &idx in &self.free_form {
            let answer = row.get(idx).trim();
            if !answer.is_empty() {
                responses.push(Response::new(&self.headers[idx], answer));
            }
        }
        responses
    }
}
