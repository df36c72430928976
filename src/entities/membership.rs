// 📇 Current Membership - denormalized projection row
//
// One row per (target, membership type). `created_at` is the start of the
// current uninterrupted term; `expires_at = None` means perpetual.
// Rows are written only by the projector.

use crate::db::{column_opt_ts, column_ts, encode_ts};
use crate::entities::target::Target;
use crate::error::LedgerResult;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentMembership {
    pub id: i64,
    pub target: Target,
    pub membership_type: String,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CurrentMembership {
    /// Active at `at`: perpetual, or not yet past its expiry.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires >= at)
    }
}

pub(crate) const SELECT_MEMBERSHIP: &str = "
    SELECT m.id, m.target_username, m.target_organization_id, m.target_organization_code,
           m.target_organization_name, m.membership_type, m.category,
           m.created_at, m.expires_at, m.updated_at
    FROM memberships m";

pub(crate) fn map_membership(row: &Row<'_>) -> rusqlite::Result<CurrentMembership> {
    let username: String = row.get(1)?;
    let org_id: Option<i64> = row.get(2)?;
    let org_code: String = row.get(3)?;
    let org_name: String = row.get(4)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(9)?;
    Ok(CurrentMembership {
        id: row.get(0)?,
        target: Target::from_columns(&username, org_id, &org_code, &org_name),
        membership_type: row.get(5)?,
        category: row.get(6)?,
        created_at: column_ts(&created_at, 7)?,
        expires_at: column_opt_ts(row.get(8)?, 8)?,
        updated_at: column_ts(&updated_at, 9)?,
    })
}

/// Predicate selecting a target's rows in `memberships` (alias `m`).
pub(crate) fn target_predicate(target: &Target) -> (&'static str, Value) {
    match target {
        Target::User { username } => ("m.target_username = ?", Value::Text(username.clone())),
        Target::Organization { id: Some(id), .. } => {
            ("m.target_organization_id = ?", Value::Integer(*id))
        }
        Target::Organization { id: None, code, .. } => {
            ("m.target_organization_code = ?", Value::Text(code.clone()))
        }
    }
}

pub fn get_membership(
    conn: &Connection,
    target: &Target,
    membership_type: &str,
) -> LedgerResult<Option<CurrentMembership>> {
    let (predicate, value) = target_predicate(target);
    let found = conn
        .query_row(
            &format!("{SELECT_MEMBERSHIP} WHERE {predicate} AND m.membership_type = ?"),
            params![value, membership_type],
            map_membership,
        )
        .optional()?;
    Ok(found)
}

/// Every projection row for a target, expired ones included.
pub fn list_memberships(conn: &Connection, target: &Target) -> LedgerResult<Vec<CurrentMembership>> {
    let (predicate, value) = target_predicate(target);
    let mut stmt = conn.prepare(&format!(
        "{SELECT_MEMBERSHIP} WHERE {predicate} ORDER BY m.category, m.membership_type"
    ))?;
    let rows = stmt
        .query_map([value], map_membership)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Memberships active at `at`, in display order (category order, category
/// name, type order, type code).
pub fn active_memberships(
    conn: &Connection,
    target: &Target,
    at: DateTime<Utc>,
) -> LedgerResult<Vec<CurrentMembership>> {
    let (predicate, value) = target_predicate(target);
    let mut stmt = conn.prepare(&format!(
        "{SELECT_MEMBERSHIP}
         JOIN membership_types t ON t.code = m.membership_type
         JOIN membership_type_categories c ON c.name = t.category
         WHERE {predicate} AND (m.expires_at IS NULL OR m.expires_at >= ?)
         ORDER BY c.sort_order, c.name, t.sort_order, t.code"
    ))?;
    let rows = stmt
        .query_map(params![value, encode_ts(at)], map_membership)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Memberships of any target expiring in `[now, now + within_days]`,
/// soonest first.
pub fn expiring_memberships(
    conn: &Connection,
    now: DateTime<Utc>,
    within_days: i64,
) -> LedgerResult<Vec<CurrentMembership>> {
    let until = now + Duration::days(within_days);
    let mut stmt = conn.prepare(&format!(
        "{SELECT_MEMBERSHIP}
         WHERE m.expires_at IS NOT NULL AND m.expires_at >= ?1 AND m.expires_at <= ?2
         ORDER BY m.expires_at, m.id"
    ))?;
    let rows = stmt
        .query_map(params![encode_ts(now), encode_ts(until)], map_membership)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_category, insert_membership_type, insert_organization, setup_database};
    use chrono::TimeZone;

    fn fixture() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        insert_category(&conn, "individual", true, false, 0).unwrap();
        insert_category(&conn, "extras", true, false, 1).unwrap();
        insert_membership_type(&conn, "individual", "Individual", "individual", "members", 0)
            .unwrap();
        insert_membership_type(&conn, "mirror", "Mirror", "extras", "", 0).unwrap();
        conn
    }

    fn put(conn: &Connection, user: &str, mtype: &str, category: &str, expires: Option<DateTime<Utc>>) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        conn.execute(
            "INSERT INTO memberships (target_username, membership_type, category, created_at, expires_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?4)",
            params![user, mtype, category, encode_ts(start), expires.map(encode_ts)],
        )
        .unwrap();
    }

    #[test]
    fn test_active_filters_expired_and_orders_by_category() {
        let conn = fixture();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        put(&conn, "alice", "mirror", "extras", None);
        put(&conn, "alice", "individual", "individual", Some(now + Duration::days(10)));
        put(&conn, "bob", "individual", "individual", Some(now - Duration::days(1)));

        let alice = active_memberships(&conn, &Target::user("alice"), now).unwrap();
        let codes: Vec<&str> = alice.iter().map(|m| m.membership_type.as_str()).collect();
        assert_eq!(codes, vec!["individual", "mirror"]);
        assert!(alice[1].expires_at.is_none());

        assert!(active_memberships(&conn, &Target::user("bob"), now).unwrap().is_empty());
        assert_eq!(list_memberships(&conn, &Target::user("bob")).unwrap().len(), 1);
    }

    #[test]
    fn test_expiring_window() {
        let conn = fixture();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        put(&conn, "alice", "individual", "individual", Some(now + Duration::days(5)));
        put(&conn, "bob", "individual", "individual", Some(now + Duration::days(50)));
        put(&conn, "carol", "individual", "individual", None);

        let soon = expiring_memberships(&conn, now, 30).unwrap();
        assert_eq!(soon.len(), 1);
        assert_eq!(soon[0].target, Target::user("alice"));
    }

    #[test]
    fn test_get_membership_for_organization() {
        let conn = fixture();
        insert_category(&conn, "sponsorship", false, true, 2).unwrap();
        insert_membership_type(&conn, "gold", "Gold", "sponsorship", "", 0).unwrap();
        let org_id = insert_organization(&conn, "Acme", "").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        conn.execute(
            "INSERT INTO memberships (target_organization_id, target_organization_code, target_organization_name,
                                      membership_type, category, created_at, updated_at)
             VALUES (?1, ?2, 'Acme', 'gold', 'sponsorship', ?3, ?3)",
            params![org_id, org_id.to_string(), encode_ts(start)],
        )
        .unwrap();

        let target = Target::organization(org_id, "Acme");
        let row = get_membership(&conn, &target, "gold").unwrap().unwrap();
        assert_eq!(row.target, target);
        assert!(row.is_active_at(start));
        assert!(get_membership(&conn, &target, "silver").unwrap().is_none());
    }
}
