// 📄 Roster file - CSV loading and cell parsing
//
// Rosters come from spreadsheets: a UTF-8 BOM and a non-comma delimiter are
// both common. The header row is required; every data row keeps all of its
// original cells so unmatched rows can be exported unchanged.

use crate::error::ImportError;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use csv::ReaderBuilder;
use std::path::Path;

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

const YEAR_FIRST_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];

const TRUE_VALUES: [&str; 8] = [
    "1",
    "y",
    "yes",
    "true",
    "t",
    "active",
    "activemember",
    "active member",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RosterRow {
    /// 1-based position among data rows
    pub number: usize,
    pub values: Vec<String>,
}

impl RosterRow {
    pub fn get(&self, idx: usize) -> &str {
        self.values.get(idx).map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Roster {
    pub headers: Vec<String>,
    pub rows: Vec<RosterRow>,
    pub delimiter: u8,
}

impl Roster {
    pub fn from_path(path: &Path) -> Result<Self, ImportError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImportError> {
        let text = String::from_utf8_lossy(bytes);
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
        let delimiter = sniff_delimiter(text);

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(delimiter)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(ImportError::NoHeaders);
        }

        let mut rows = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record?;
            let values: Vec<String> = record.iter().map(|v| v.to_string()).collect();
            if values.iter().all(|v| v.trim().is_empty()) {
                continue;
            }
            rows.push(RosterRow {
                number: idx + 1,
                values,
            });
        }

        Ok(Roster {
            headers,
            rows,
            delimiter,
        })
    }
}

/// Pick the candidate delimiter that occurs most often in the header line.
pub fn sniff_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or("");
    CANDIDATE_DELIMITERS
        .iter()
        .map(|&d| (d, header.bytes().filter(|&b| b == d).count()))
        .filter(|&(_, count)| count > 0)
        .max_by_key(|&(_, count)| count)
        .map(|(d, _)| d)
        .unwrap_or(b',')
}

/// Lowercase, alphanumerics only: "Membership Start-Date" → "membershipstartdate".
pub fn normalize_header(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Parse a roster date as midnight UTC. Empty → Ok(None); garbage → Err.
///
/// chrono's `%Y` accepts short years, so the format is chosen from the
/// shape of the value instead of trying every format in turn.
pub fn parse_date(raw: &str) -> Result<Option<DateTime<Utc>>, String> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let year_first = value.bytes().take_while(u8::is_ascii_digit).count() == 4;
    let parsed = if year_first {
        YEAR_FIRST_FORMATS
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
    } else {
        let short_year = value.rsplit('/').next().is_some_and(|year| year.len() == 2);
        let format = if short_year { "%m/%d/%y" } else { "%m/%d/%Y" };
        NaiveDate::parse_from_str(value, format).ok()
    };

    parsed
        .map(|date| Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))))
        .ok_or_else(|| format!("unrecognized date: {value}"))
}

pub fn parse_bool(raw: &str) -> bool {
    let value = raw.trim().to_lowercase();
    TRUE_VALUES.contains(&value.as_str())
}
