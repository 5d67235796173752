use crate::grading::normalize_reg_no;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_i64, required_semester, required_str};
use crate::ipc::types::{AppState, Request};
use crate::report::{
    grade_summary_model, graduating_list_model, pass_fail_model, result_sheet_model,
    statement_model, ReportContext, ReportError,
};
use serde::Serialize;

fn model_response<T: Serialize>(req: &Request, model: Result<T, ReportError>) -> serde_json::Value {
    match model {
        Ok(m) => match serde_json::to_value(&m) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "bad_json", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

/// Result sheet, grade summary and pass/fail lists all take the same
/// programme/session/level/semester scope.
fn cohort_model(
    state: &mut AppState,
    req: &Request,
    build: fn(&ReportContext<'_>) -> Result<serde_json::Value, ReportError>,
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
    match build(&ctx) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

fn to_value<T: Serialize>(model: T) -> Result<serde_json::Value, ReportError> {
    serde_json::to_value(&model).map_err(|e| ReportError::new("bad_json", e.to_string()))
}

fn handle_graduating_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let programme_id = match required_str(req, "programmeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    model_response(req, graduating_list_model(conn, &programme_id, &session_id))
}

fn handle_statement(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let reg_no = match required_str(req, "regNo") {
        Ok(v) => normalize_reg_no(&v),
        Err(e) => return e,
    };
    model_response(req, statement_model(conn, &reg_no))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.resultSheetModel" => Some(cohort_model(state, req, |ctx| {
            result_sheet_model(ctx).and_then(to_value)
        })),
        "reports.gradeSummaryModel" => Some(cohort_model(state, req, |ctx| {
            grade_summary_model(ctx).and_then(to_value)
        })),
        "reports.passFailModel" => Some(cohort_model(state, req, |ctx| {
            pass_fail_model(ctx).and_then(to_value)
        })),
        "reports.graduatingListModel" => Some(handle_graduating_list(state, req)),
        "reports.statementModel" => Some(handle_statement(state, req)),
        _ => None,
    }
}
