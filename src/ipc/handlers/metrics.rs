use crate::grading::normalize_reg_no;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_bool, optional_i64, optional_str, required_i64, required_semester,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::legacy;
use crate::report::{compute_cohort, ReportContext};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::Path;
use uuid::Uuid;

struct MetricsRow {
    reg_no: String,
    session_id: String,
    semester: i64,
    tcc: i64,
    tce: i64,
    tpe: f64,
    gpa: f64,
    ccc: i64,
    cce: i64,
    cpe: f64,
    cgpa: f64,
    remark: String,
}

fn upsert_metrics(conn: &Connection, row: &MetricsRow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO metrics(id, reg_no, session_id, semester,
            tcc, tce, tpe, gpa, ccc, cce, cpe, cgpa, remark, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(reg_no, session_id, semester) DO UPDATE SET
            tcc=excluded.tcc, tce=excluded.tce, tpe=excluded.tpe, gpa=excluded.gpa,
            ccc=excluded.ccc, cce=excluded.cce, cpe=excluded.cpe, cgpa=excluded.cgpa,
            remark=excluded.remark, updated_at=excluded.updated_at",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            row.reg_no,
            row.session_id,
            row.semester,
            row.tcc,
            row.tce,
            row.tpe,
            row.gpa,
            row.ccc,
            row.cce,
            row.cpe,
            row.cgpa,
            row.remark,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn handle_search(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let reg_no = optional_str(req, "regNo").map(|v| normalize_reg_no(&v));
    let session_id = optional_str(req, "sessionId");
    let semester = optional_i64(req, "semester");

    let mut stmt = match conn.prepare(
        "SELECT m.id, m.reg_no, s.name, m.semester,
                m.tcc, m.tce, m.tpe, m.gpa, m.ccc, m.cce, m.cpe, m.cgpa,
                m.remark, m.updated_at
         FROM metrics m
         JOIN sessions s ON s.id = m.session_id
         WHERE (?1 IS NULL OR m.reg_no = ?1)
           AND (?2 IS NULL OR m.session_id = ?2)
           AND (?3 IS NULL OR m.semester = ?3)
         ORDER BY m.reg_no, s.name, m.semester",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&reg_no, &session_id, &semester), |row| {
            Ok(json!({
                "metricId": row.get::<_, String>(0)?,
                "regNo": row.get::<_, String>(1)?,
                "session": row.get::<_, String>(2)?,
                "semester": row.get::<_, i64>(3)?,
                "tcc": row.get::<_, i64>(4)?,
                "tce": row.get::<_, i64>(5)?,
                "tpe": row.get::<_, f64>(6)?,
                "gpa": row.get::<_, f64>(7)?,
                "ccc": row.get::<_, i64>(8)?,
                "cce": row.get::<_, i64>(9)?,
                "cpe": row.get::<_, f64>(10)?,
                "cgpa": row.get::<_, f64>(11)?,
                "remark": row.get::<_, String>(12)?,
                "updatedAt": row.get::<_, String>(13)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(metrics) => ok(&req.id, json!({ "metrics": metrics })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Recomputes term and cumulative metrics for every student of a
/// programme/session/level/semester scope and upserts the stored rows.
/// Non-registered students get no row; their absence is the record.
fn handle_recompute(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let level = match required_i64(req, "level") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester = match required_semester(req) {
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
    let cohort = match compute_cohort(&ctx) {
        Ok(c) => c,
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };

    let mut written = 0usize;
    let mut skipped = 0usize;
    for row in &cohort.rows {
        if row.registered_count == 0 {
            skipped += 1;
            continue;
        }
        let stored = MetricsRow {
            reg_no: row.reg_no.clone(),
            session_id: session_id.clone(),
            semester,
            tcc: row.current.tcc,
            tce: row.current.tce,
            tpe: row.current.tpe,
            gpa: row.current.gpa,
            ccc: row.cumulative.ccc,
            cce: row.cumulative.cce,
            cpe: row.cumulative.cpe,
            cgpa: row.cumulative.cgpa,
            remark: row.remark.clone(),
        };
        if let Err(e) = upsert_metrics(conn, &stored) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "regNo": row.reg_no })),
            );
        }
        written += 1;
    }

    ok(
        &req.id,
        json!({
            "programmeId": programme_id,
            "sessionId": session_id,
            "level": level,
            "semester": semester,
            "written": written,
            "skippedNonRegistered": skipped
        }),
    )
}

const OFFICERS: [&str; 3] = ["examOfficer", "headOfDepartment", "dean"];

fn handle_approve(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let metric_id = match required_str(req, "metricId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let officer = match required_str(req, "officer") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    if !OFFICERS.contains(&officer.as_str()) {
        return err(
            &req.id,
            "bad_params",
            "officer must be one of: examOfficer, headOfDepartment, dean",
            Some(json!({ "officer": officer })),
        );
    }
    let approved = optional_bool(req, "approved").unwrap_or(true);
    let flagged = optional_bool(req, "flagged").unwrap_or(false);
    let note = optional_str(req, "note");
    let response = optional_str(req, "response");

    let found: Option<i64> = match conn
        .query_row("SELECT 1 FROM metrics WHERE id = ?", [&metric_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if found.is_none() {
        return err(&req.id, "not_found", "metric row not found", None);
    }

    if let Err(e) = conn.execute(
        "INSERT INTO metric_approvals(metric_id, officer, name, approved, flagged, note, response)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(metric_id, officer) DO UPDATE SET
            name=excluded.name, approved=excluded.approved, flagged=excluded.flagged,
            note=excluded.note, response=excluded.response",
        rusqlite::params![
            metric_id,
            officer,
            name,
            approved as i64,
            flagged as i64,
            note,
            response,
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "metricId": metric_id,
            "officer": officer,
            "approved": approved,
            "flagged": flagged
        }),
    )
}

/// Imports a metrics ledger exported by the predecessor system. Rows carry
/// already-computed figures; they are stored as-is so historic terms keep
/// their published values.
fn handle_import_legacy(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let parsed = match legacy::parse_legacy_metrics_csv(Path::new(&path)) {
        Ok(p) => p,
        Err(e) => return err(&req.id, "io_failed", format!("{e:?}"), None),
    };

    // The ledger lands whole or not at all.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut imported = 0usize;
    let mut warnings = parsed.warnings;
    for row in &parsed.rows {
        let session_id: Option<String> = match tx
            .query_row(
                "SELECT id FROM sessions WHERE name = ?",
                [&row.session],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        let Some(session_id) = session_id else {
            warnings.push(json!({
                "line": row.line_no,
                "code": "unknown_session",
                "message": format!("session {} does not exist in this workspace", row.session),
            }));
            continue;
        };

        let stored = MetricsRow {
            reg_no: row.reg_no.clone(),
            session_id,
            semester: row.semester,
            tcc: row.tcc,
            tce: row.tce,
            tpe: row.tpe,
            gpa: row.gpa,
            ccc: row.ccc,
            cce: row.cce,
            cpe: row.cpe,
            cgpa: row.cgpa,
            remark: String::new(),
        };
        if let Err(e) = upsert_metrics(&tx, &stored) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "regNo": row.reg_no })),
            );
        }
        imported += 1;
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "totalRows": parsed.total_rows,
            "imported": imported,
            "warnings": warnings
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "metrics.search" => Some(handle_search(state, req)),
        "metrics.recompute" => Some(handle_recompute(state, req)),
        "metrics.approve" => Some(handle_approve(state, req)),
        "metrics.importLegacy" => Some(handle_import_legacy(state, req)),
        _ => None,
    }
}
