// 📤 Unmatched rows export
//
// Rows whose identifier resolved to no target, or to several, are written back out
// with every original cell plus a reason column, so they can be fixed in a
// spreadsheet and re-imported. Cells that a spreadsheet would evaluate as a
// formula get a leading apostrophe.

use crate::error::ImportError;
use crate::reconciliation::decision::RowPlan;
use crate::reconciliation::roster::{normalize_header, Roster};
use csv::WriterBuilder;
use std::collections::HashMap;
use std::io::Write;

const FORMULA_TRIGGERS: [char; 6] = ['=', '+', '-', '@', '\t', '\r'];

pub fn sanitize_cell(value: &str) -> String {
    if value.starts_with(&FORMULA_TRIGGERS[..]) {
        format!("'{value}")
    } else {
        value.to_string()
    }
}

/// Name of the appended reason column, avoiding an existing "reason" header.
pub fn reason_header(headers: &[String]) -> &'static str {
    if headers.iter().any(|h| normalize_header(h) == "reason") {
        "unmatched_reason"
    } else {
        "reason"
    }
}

/// Plans for rows whose identifier matched no single target, in roster order.
/// Rows with no identifier at all are left out.
pub fn unmatched_plans(plans: &[RowPlan]) -> Vec<&RowPlan> {
    plans.iter().filter(|plan| plan.unmatched).collect()
}

/// Write the unmatched rows of `roster` as CSV. Returns the number of rows
/// written.
pub fn write_unmatched<W: Write>(
    writer: W,
    roster: &Roster,
    plans: &[RowPlan],
) -> Result<usize, ImportError> {
    let by_number: HashMap<usize, &[String]> = roster
        .rows
        .iter()
        .map(|row| (row.number, row.values.as_slice()))
        .collect();

    let mut csv = WriterBuilder::new().flexible(false).from_writer(writer);

    let mut header: Vec<String> = roster.headers.iter().map(|h| sanitize_cell(h)).collect();
    header.push(reason_header(&roster.headers).to_string());
    csv.write_record(&header)?;

    let mut written = 0;
    for plan in unmatched_plans(plans) {
        let values = by_number.get(&plan.row).copied().unwrap_or(&[]);
        let mut record: Vec<String> = (0..roster.headers.len())
            .map(|idx| sanitize_cell(values.get(idx).map(String::as_str).unwrap_or("")))
            .collect();
        record.push(sanitize_cell(&plan.decision.reason));
        csv.write_record(&record)?;
        written += 1;
    }
    csv.flush()?;
    Ok(written)
}
