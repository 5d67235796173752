use crate::export::{grade_summary_grid, result_sheet_grid, write_csv, write_xlsx};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_i64, required_semester, required_str};
use crate::ipc::types::{AppState, Request};
use crate::report::{grade_summary_model, result_sheet_model, ReportContext};
use serde_json::json;
use std::path::PathBuf;

enum Sheet {
    ResultSheet,
    GradeSummary,
}

enum Format {
    Csv,
    Xlsx,
}

fn handle_export(
    state: &mut AppState,
    req: &Request,
    sheet: Sheet,
    format: Format,
) -> serde_json::Value {
    let programme_id = match required_str(req, "programmeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = match required_i64(req, "level") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match required_semester(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ctx = ReportContext {
        conn,
        programme_id: &programme_id,
        session_id: &session_id,
        level,
        semester,
    };

    let (grid, sheet_name) = match sheet {
        Sheet::ResultSheet => match result_sheet_model(&ctx) {
            Ok(m) => (result_sheet_grid(&m), "Result Sheet"),
            Err(e) => return err(&req.id, &e.code, e.message, None),
        },
        Sheet::GradeSummary => match grade_summary_model(&ctx) {
            Ok(m) => (grade_summary_grid(&m), "Grade Summary"),
            Err(e) => return err(&req.id, &e.code, e.message, None),
        },
    };

    let written = match format {
        Format::Csv => write_csv(&grid, &out_path),
        Format::Xlsx => write_xlsx(sheet_name, &grid, &out_path),
    };
    match written {
        Ok(summary) => ok(
            &req.id,
            json!({
                "outPath": out_path.to_string_lossy(),
                "rowCount": summary.row_count
            }),
        ),
        Err(e) => err(&req.id, "io_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exports.resultSheetCsv" => {
            Some(handle_export(state, req, Sheet::ResultSheet, Format::Csv))
        }
        "exports.gradeSummaryCsv" => {
            Some(handle_export(state, req, Sheet::GradeSummary, Format::Csv))
        }
        "exports.resultSheetXlsx" => {
            Some(handle_export(state, req, Sheet::ResultSheet, Format::Xlsx))
        }
        "exports.gradeSummaryXlsx" => {
            Some(handle_export(state, req, Sheet::GradeSummary, Format::Xlsx))
        }
        _ => None,
    }
}
