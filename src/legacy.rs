use anyhow::Context;
use serde_json::json;
use std::path::Path;

use crate::grading::normalize_reg_no;

/// One row of a legacy metrics ledger export.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyMetricsRow {
    pub line_no: usize,
    pub reg_no: String,
    pub session: String,
    pub semester: i64,
    pub tcc: i64,
    pub tce: i64,
    pub tpe: f64,
    pub gpa: f64,
    pub ccc: i64,
    pub cce: i64,
    pub cpe: f64,
    pub cgpa: f64,
}

#[derive(Debug, Clone)]
pub struct LegacyMetricsFile {
    pub rows: Vec<LegacyMetricsRow>,
    pub warnings: Vec<serde_json::Value>,
    pub total_rows: usize,
}

const EXPECTED_HEADER: [&str; 11] = [
    "regNo", "session", "semester", "tcc", "tce", "tpe", "gpa", "ccc", "cce", "cpe", "cgpa",
];

/// Parses the legacy metrics ledger (CSV export of the old records office
/// spreadsheet). Bad rows are reported, not fatal.
pub fn parse_legacy_metrics_csv(path: &Path) -> anyhow::Result<LegacyMetricsFile> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open legacy ledger {}", path.to_string_lossy()))?;

    {
        let headers = reader.headers().context("failed to read ledger header")?;
        let got: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        let want: Vec<String> = EXPECTED_HEADER.iter().map(|h| h.to_string()).collect();
        if got.len() != want.len()
            || !got
                .iter()
                .zip(want.iter())
                .all(|(g, w)| g.eq_ignore_ascii_case(w))
        {
            anyhow::bail!(
                "unexpected ledger header: expected {}, got {}",
                want.join(","),
                got.join(",")
            );
        }
    }

    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    let mut total_rows = 0usize;

    for (idx, record) in reader.records().enumerate() {
        // Header is line 1.
        let line_no = idx + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warnings.push(json!({
                    "line": line_no,
                    "code": "bad_record",
                    "message": e.to_string(),
                }));
                continue;
            }
        };
        total_rows += 1;

        let reg_no = normalize_reg_no(record.get(0).unwrap_or(""));
        if reg_no.is_empty() {
            warnings.push(json!({
                "line": line_no,
                "code": "missing_reg_no",
                "message": "regNo must not be empty",
            }));
            continue;
        }
        let session = record.get(1).unwrap_or("").to_string();
        if session.is_empty() {
            warnings.push(json!({
                "line": line_no,
                "code": "missing_session",
                "message": "session must not be empty",
            }));
            continue;
        }

        let semester = match record.get(2).unwrap_or("").parse::<i64>() {
            Ok(v) if v == 1 || v == 2 => v,
            _ => {
                warnings.push(json!({
                    "line": line_no,
                    "code": "bad_semester",
                    "message": "semester must be 1 or 2",
                }));
                continue;
            }
        };

        let mut ints = [0_i64; 4]; // tcc, tce, ccc, cce
        let mut floats = [0.0_f64; 4]; // tpe, gpa, cpe, cgpa
        let int_cols = [(3, 0), (4, 1), (7, 2), (8, 3)];
        let float_cols = [(5, 0), (6, 1), (9, 2), (10, 3)];
        let mut bad = false;
        for (col, slot) in int_cols {
            match record.get(col).unwrap_or("").parse::<i64>() {
                Ok(v) if v >= 0 => ints[slot] = v,
                _ => {
                    bad = true;
                    break;
                }
            }
        }
        if !bad {
            for (col, slot) in float_cols {
                match record.get(col).unwrap_or("").parse::<f64>() {
                    Ok(v) if v >= 0.0 => floats[slot] = v,
                    _ => {
                        bad = true;
                        break;
                    }
                }
            }
        }
        if bad {
            warnings.push(json!({
                "line": line_no,
                "code": "bad_number",
                "message": "metric columns must be non-negative numbers",
            }));
            continue;
        }

        rows.push(LegacyMetricsRow {
            line_no,
            reg_no,
            session,
            semester,
            tcc: ints[0],
            tce: ints[1],
            tpe: floats[0],
            gpa: floats[1],
            ccc: ints[2],
            cce: ints[3],
            cpe: floats[2],
            cgpa: floats[3],
        });
    }

    Ok(LegacyMetricsFile {
        rows,
        warnings,
        total_rows,
    })
}
