// ⏰ Temporal Model - term arithmetic
//
// Two pure functions, no I/O:
// 1. Expiry Calculator: when does a membership approved at T expire?
// 2. Term Continuity Resolver: when did the uninterrupted term that an
//    approval at T extends actually start?
//
// The resolver reads history, not the projection row alone, so it gives the
// same answer when the current-state row was deleted or never written.

use crate::action_log::{ActionKind, ActionLogEntry};
use crate::entities::membership::CurrentMembership;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

// ============================================================================
// EXPIRY CALCULATOR
// ============================================================================

/// 23:59:59 UTC on the UTC calendar date of `at`.
pub fn end_of_day_utc(at: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = Utc.from_utc_datetime(&at.date_naive().and_time(NaiveTime::default()));
    midnight + Duration::seconds(86_399)
}

/// Expiry for an approval at `approved_at`.
///
/// A still-running previous term is extended from its own expiry; otherwise
/// the grant runs through the end of the approval day. Either way
/// `validity_days` is added on top.
pub fn expiry_for_approval_at(
    approved_at: DateTime<Utc>,
    previous_expires_at: Option<DateTime<Utc>>,
    validity_days: i64,
) -> DateTime<Utc> {
    let base = match previous_expires_at {
        Some(previous) if previous > approved_at => previous,
        _ => end_of_day_utc(approved_at),
    };
    base + Duration::days(validity_days)
}

// ============================================================================
// TERM CONTINUITY RESOLVER
// ============================================================================

/// Start of the term that `entry` (an approval or expiry change at T)
/// belongs to.
///
/// `existing` is the current-state row for the same (target, type), if any.
/// `history` is that pair's log in (created_at, id) order; entries at or
/// after `entry` are ignored.
pub fn resolve_term_start(
    existing: Option<&CurrentMembership>,
    history: &[ActionLogEntry],
    entry: &ActionLogEntry,
) -> DateTime<Utc> {
    let at = entry.created_at;

    // 1. Live row: the term is being extended. Perpetual rows count as live.
    if let Some(row) = existing {
        if row.expires_at.map_or(true, |expires| expires > at) {
            return row.created_at;
        }
    }

    let prior: Vec<&ActionLogEntry> = history
        .iter()
        .filter(|candidate| candidate.id != entry.id && candidate.precedes(entry))
        .collect();

    // 2. Did some earlier approval still cover T?
    let still_covered = prior.iter().rev().any(|candidate| {
        candidate.action == ActionKind::Approved
            && candidate.expires_at.map_or(true, |expires| expires > at)
    });
    if !still_covered {
        return at;
    }

    // 3. Earliest approval since the last termination starts the chain.
    let last_termination = prior
        .iter()
        .rposition(|candidate| candidate.action == ActionKind::Terminated);
    let chain = match last_termination {
        Some(idx) => &prior[idx + 1..],
        None => &prior[..],
    };
    chain
        .iter()
        .find(|candidate| candidate.action == ActionKind::Approved)
        .map(|first| first.created_at)
        .unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::target::Target;

    const VALIDITY: i64 = 365;

    fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn entry(id: i64, action: ActionKind, at: DateTime<Utc>, expires: Option<DateTime<Utc>>) -> ActionLogEntry {
        ActionLogEntry {
            id,
            actor: "admin".to_string(),
            target: Target::user("alice"),
            membership_type: "individual".to_string(),
            membership_request_id: None,
            requested_group_cn: String::new(),
            action,
            created_at: at,
            rejection_reason: String::new(),
            expires_at: expires,
            import_batch_id: None,
        }
    }

    fn row(created: DateTime<Utc>, expires: Option<DateTime<Utc>>) -> CurrentMembership {
        CurrentMembership {
            id: 1,
            target: Target::user("alice"),
            membership_type: "individual".to_string(),
            category: "individual".to_string(),
            created_at: created,
            expires_at: expires,
            updated_at: created,
        }
    }

    #[test]
    fn test_end_of_day() {
        let eod = end_of_day_utc(ts(2024, 2, 29, 0));
        assert_eq!(eod, Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap());
        assert_eq!(end_of_day_utc(eod), eod);
    }

    #[test]
    fn test_fresh_approval_expiry() {
        let t1 = ts(2024, 1, 10, 15);
        let expires = expiry_for_approval_at(t1, None, VALIDITY);
        assert_eq!(expires, end_of_day_utc(t1) + Duration::days(VALIDITY));
    }

    #[test]
    fn test_extension_builds_on_previous_expiry() {
        let t2 = ts(2024, 11, 1, 9);
        let e1 = ts(2025, 1, 10, 23);
        assert_eq!(
            expiry_for_approval_at(t2, Some(e1), VALIDITY),
            e1 + Duration::days(VALIDITY)
        );

        // An already-lapsed previous expiry is ignored.
        let lapsed = ts(2024, 10, 1, 0);
        assert_eq!(
            expiry_for_approval_at(t2, Some(lapsed), VALIDITY),
            end_of_day_utc(t2) + Duration::days(VALIDITY)
        );
    }

    #[test]
    fn test_validity_is_a_parameter() {
        let t = ts(2024, 1, 1, 0);
        assert_eq!(
            expiry_for_approval_at(t, None, 30),
            end_of_day_utc(t) + Duration::days(30)
        );
    }

    #[test]
    fn test_fresh_term_starts_at_approval() {
        let t1 = ts(2024, 1, 10, 15);
        let approval = entry(1, ActionKind::Approved, t1, Some(t1 + Duration::days(365)));
        assert_eq!(resolve_term_start(None, &[approval.clone()], &approval), t1);
    }

    #[test]
    fn test_live_row_keeps_its_start() {
        let t1 = ts(2024, 1, 10, 15);
        let t2 = ts(2024, 11, 1, 9);
        let e1 = expiry_for_approval_at(t1, None, VALIDITY);
        let second = entry(2, ActionKind::Approved, t2, Some(e1 + Duration::days(VALIDITY)));

        assert_eq!(resolve_term_start(Some(&row(t1, Some(e1))), &[], &second), t1);
        assert_eq!(resolve_term_start(Some(&row(t1, None)), &[], &second), t1);
    }

    #[test]
    fn test_extension_survives_deleted_row() {
        let t1 = ts(2024, 1, 10, 15);
        let t2 = ts(2024, 11, 1, 9);
        let e1 = expiry_for_approval_at(t1, None, VALIDITY);
        let history = vec![
            entry(1, ActionKind::Approved, t1, Some(e1)),
            entry(2, ActionKind::Approved, t2, Some(e1 + Duration::days(VALIDITY))),
        ];
        assert_eq!(resolve_term_start(None, &history, &history[1]), t1);
    }

    #[test]
    fn test_gap_resets_term() {
        let t1 = ts(2022, 1, 10, 15);
        let e1 = expiry_for_approval_at(t1, None, VALIDITY);
        let t3 = e1 + Duration::days(3);
        let history = vec![
            entry(1, ActionKind::Approved, t1, Some(e1)),
            entry(2, ActionKind::Approved, t3, Some(t3 + Duration::days(VALIDITY))),
        ];
        // Stale expired row present: still a new term.
        assert_eq!(resolve_term_start(Some(&row(t1, Some(e1))), &history, &history[1]), t3);
        assert_eq!(resolve_term_start(None, &history, &history[1]), t3);
    }

    #[test]
    fn test_chain_starts_after_last_termination() {
        let t0 = ts(2020, 1, 1, 0);
        let t1 = ts(2021, 1, 1, 0);
        let t2 = ts(2021, 6, 1, 0);
        let t3 = ts(2021, 9, 1, 0);
        let far = ts(2030, 1, 1, 0);
        let history = vec![
            entry(1, ActionKind::Approved, t0, Some(far)),
            entry(2, ActionKind::Terminated, t1 - Duration::days(1), Some(t1 - Duration::days(1))),
            entry(3, ActionKind::Approved, t1, Some(far)),
            entry(4, ActionKind::Rejected, t2, None),
            entry(5, ActionKind::Approved, t2, Some(far)),
            entry(6, ActionKind::Approved, t3, Some(far)),
        ];
        assert_eq!(resolve_term_start(None, &history, &history[5]), t1);
    }

    #[test]
    fn test_same_timestamp_uses_insertion_order() {
        let t = ts(2024, 5, 1, 12);
        let far = ts(2030, 1, 1, 0);
        let history = vec![
            entry(7, ActionKind::Approved, t, Some(far)),
            entry(8, ActionKind::Approved, t, Some(far)),
        ];
        assert_eq!(resolve_term_start(None, &history, &history[1]), t);
        // The later entry is not "prior" to the earlier one.
        assert_eq!(resolve_term_start(None, &history, &history[0]), t);
    }
}
