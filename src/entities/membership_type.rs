// 🏷️ Membership Types - reference data
//
// A type belongs to exactly one category. The category decides which target
// kinds may hold the type and is the unit of mutual exclusivity.

use crate::entities::target::{Target, TargetKind};
use crate::error::{LedgerError, LedgerResult};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

// ============================================================================
// CATEGORY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub is_individual: bool,
    pub is_organization: bool,
    pub sort_order: i64,
}

impl Category {
    pub fn admits(&self, kind: TargetKind) -> bool {
        match kind {
            TargetKind::User => self.is_individual,
            TargetKind::Organization => self.is_organization,
        }
    }
}

// ============================================================================
// MEMBERSHIP TYPE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipType {
    pub code: String,
    pub name: String,
    pub description: String,
    pub category: Category,
    /// External directory group granted on approval ("" = none)
    pub group_cn: String,
    pub enabled: bool,
    pub sort_order: i64,
}

impl MembershipType {
    pub fn has_group(&self) -> bool {
        !self.group_cn.trim().is_empty()
    }

    /// Reject targets the category does not admit.
    pub fn ensure_admits(&self, target: &Target) -> LedgerResult<()> {
        if self.category.admits(target.kind()) {
            Ok(())
        } else {
            Err(LedgerError::TargetNotAllowed {
                membership_type: self.code.clone(),
                target_kind: target.kind().as_str().to_string(),
            })
        }
    }
}

const SELECT_TYPE: &str = "
    SELECT t.code, t.name, t.description, t.group_cn, t.enabled, t.sort_order,
           c.name, c.is_individual, c.is_organization, c.sort_order
    FROM membership_types t
    JOIN membership_type_categories c ON c.name = t.category";

fn map_type(row: &Row<'_>) -> rusqlite::Result<MembershipType> {
    Ok(MembershipType {
        code: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        group_cn: row.get(3)?,
        enabled: row.get(4)?,
        sort_order: row.get(5)?,
        category: Category {
            name: row.get(6)?,
            is_individual: row.get(7)?,
            is_organization: row.get(8)?,
            sort_order: row.get(9)?,
        },
    })
}

pub fn get_membership_type(conn: &Connection, code: &str) -> LedgerResult<Option<MembershipType>> {
    let found = conn
        .query_row(&format!("{SELECT_TYPE} WHERE t.code = ?1"), [code], map_type)
        .optional()?;
    Ok(found)
}

/// Look up a type that must exist.
pub fn require_membership_type(conn: &Connection, code: &str) -> LedgerResult<MembershipType> {
    if code.trim().is_empty() {
        return Err(LedgerError::MissingMembershipType);
    }
    get_membership_type(conn, code)?
        .ok_or_else(|| LedgerError::UnknownMembershipType(code.to_string()))
}

/// All types in display order: category order, category name, type order, code.
pub fn list_membership_types(
    conn: &Connection,
    include_disabled: bool,
) -> LedgerResult<Vec<MembershipType>> {
    let filter = if include_disabled { "" } else { "WHERE t.enabled = 1" };
    let mut stmt = conn.prepare(&format!(
        "{SELECT_TYPE} {filter} ORDER BY c.sort_order, c.name, t.sort_order, t.code"
    ))?;
    let types = stmt
        .query_map([], map_type)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(types)
}
