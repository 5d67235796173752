use crate::grading::{normalize_reg_no, Grade};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_bool, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

const UPLOAD_HEADER: [&str; 12] = [
    "regno", "q1", "q2", "q3", "q4", "q5", "q6", "q7", "q8", "ca", "totalexam", "grandtotal",
];

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT reg_no, q1, q2, q3, q4, q5, q6, q7, q8, ca, totalexam, grandtotal, grade, moderated
         FROM results
         WHERE course_id = ?
         ORDER BY reg_no",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&course_id], |row| {
            let qs: Vec<Option<f64>> = (1..=8)
                .map(|i| row.get::<_, Option<f64>>(i))
                .collect::<Result<_, _>>()?;
            Ok(json!({
                "regNo": row.get::<_, String>(0)?,
                "questions": qs,
                "ca": row.get::<_, Option<f64>>(9)?,
                "totalExam": row.get::<_, Option<f64>>(10)?,
                "grandTotal": row.get::<_, Option<f64>>(11)?,
                "grade": row.get::<_, Option<String>>(12)?,
                "moderated": row.get::<_, i64>(13)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(results) => ok(&req.id, json!({ "courseId": course_id, "results": results })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn registered(conn: &Connection, course_id: &str, reg_no: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM registrations WHERE course_id = ? AND reg_no = ?",
            (course_id, reg_no),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn upsert_result(
    conn: &Connection,
    course_id: &str,
    reg_no: &str,
    questions: &[Option<f64>; 8],
    ca: Option<f64>,
    totalexam: Option<f64>,
    grandtotal: Option<f64>,
    moderated: bool,
) -> rusqlite::Result<String> {
    let grade = grandtotal.map(|t| Grade::from_score(t).letter().to_string());
    let updated_at = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO results(id, course_id, reg_no,
            q1, q2, q3, q4, q5, q6, q7, q8,
            ca, totalexam, grandtotal, grade, moderated, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
         ON CONFLICT(course_id, reg_no) DO UPDATE SET
            q1=excluded.q1, q2=excluded.q2, q3=excluded.q3, q4=excluded.q4,
            q5=excluded.q5, q6=excluded.q6, q7=excluded.q7, q8=excluded.q8,
            ca=excluded.ca, totalexam=excluded.totalexam,
            grandtotal=excluded.grandtotal, grade=excluded.grade,
            moderated=excluded.moderated, updated_at=excluded.updated_at",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            course_id,
            reg_no,
            questions[0],
            questions[1],
            questions[2],
            questions[3],
            questions[4],
            questions[5],
            questions[6],
            questions[7],
            ca,
            totalexam,
            grandtotal,
            grade,
            moderated as i64,
            updated_at,
        ],
    )?;
    Ok(grade.unwrap_or_default())
}

fn score_field(req: &Request, key: &str) -> Option<f64> {
    req.params.get(key).and_then(|v| v.as_f64())
}

fn handle_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let reg_no = match required_str(req, "regNo") {
        Ok(v) => normalize_reg_no(&v),
        Err(e) => return e,
    };

    match registered(conn, &course_id, &reg_no) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "not_found",
                "student is not registered for this course",
                Some(json!({ "courseId": course_id, "regNo": reg_no })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut questions: [Option<f64>; 8] = [None; 8];
    for (i, slot) in questions.iter_mut().enumerate() {
        *slot = score_field(req, &format!("q{}", i + 1));
    }
    let ca = score_field(req, "ca");
    let totalexam = score_field(req, "totalExam");
    let grandtotal = score_field(req, "grandTotal");
    if let Some(t) = grandtotal {
        if !(0.0..=100.0).contains(&t) {
            return err(
                &req.id,
                "bad_params",
                "grandTotal must be between 0 and 100",
                Some(json!({ "grandTotal": t })),
            );
        }
    }
    let moderated = optional_bool(req, "moderated").unwrap_or(false);

    match upsert_result(
        conn, &course_id, &reg_no, &questions, ca, totalexam, grandtotal, moderated,
    ) {
        Ok(grade) => ok(
            &req.id,
            json!({ "courseId": course_id, "regNo": reg_no, "grade": grade }),
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let reg_no = match required_str(req, "regNo") {
        Ok(v) => normalize_reg_no(&v),
        Err(e) => return e,
    };
    let affected = match conn.execute(
        "DELETE FROM results WHERE course_id = ? AND reg_no = ?",
        (&course_id, &reg_no),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if affected == 0 {
        return err(&req.id, "not_found", "result not found", None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_bulk_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM results WHERE course_id = ?", [&course_id]) {
        Ok(n) => ok(&req.id, json!({ "courseId": course_id, "deleted": n })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

fn parse_score(field: &str) -> Result<Option<f64>, ()> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(None);
    }
    field.parse::<f64>().map(Some).map_err(|_| ())
}

/// Imports a marks CSV for one course. The file must carry the fixed header
/// regNo,q1..q8,ca,totalexam,grandTotal. Bad rows are reported, good rows are
/// upserted in one transaction, and a fingerprint of any file that landed
/// rows is recorded so the same file cannot be imported twice.
fn handle_bulk_upload(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let found: Option<i64> = match conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if found.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                format!("read {}: {}", path, e),
                None,
            )
        }
    };
    let fingerprint = format!("{:x}", Sha256::digest(&bytes));

    let seen: Option<String> = match conn
        .query_row(
            "SELECT filename FROM upload_batches WHERE fingerprint = ?",
            [&fingerprint],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(filename) = seen {
        return err(
            &req.id,
            "conflict",
            "this file was already imported",
            Some(json!({ "previousFilename": filename })),
        );
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes.as_slice());
    let headers = match reader.headers() {
        Ok(h) => h.clone(),
        Err(e) => return err(&req.id, "bad_params", format!("bad csv header: {}", e), None),
    };
    let got: Vec<String> = headers
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();
    if got != UPLOAD_HEADER {
        return err(
            &req.id,
            "bad_params",
            "header must be regNo,q1..q8,ca,totalexam,grandTotal",
            Some(json!({ "header": got })),
        );
    }

    // All row upserts and the batch record land together or not at all.
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut imported = 0usize;
    let mut failures = Vec::new();
    let mut seen_reg_nos: HashSet<String> = HashSet::new();
    for (idx, record) in reader.records().enumerate() {
        // Line numbers count from 1 and skip the header.
        let line = idx + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                failures.push(json!({ "line": line, "reason": "bad_record", "detail": e.to_string() }));
                continue;
            }
        };
        if record.len() != UPLOAD_HEADER.len() {
            failures.push(json!({ "line": line, "reason": "wrong_field_count" }));
            continue;
        }
        let reg_no = normalize_reg_no(&record[0]);
        if reg_no.is_empty() {
            failures.push(json!({ "line": line, "reason": "missing_reg_no" }));
            continue;
        }
        if !seen_reg_nos.insert(reg_no.clone()) {
            failures.push(json!({ "line": line, "regNo": reg_no, "reason": "duplicate_in_file" }));
            continue;
        }
        match registered(&tx, &course_id, &reg_no) {
            Ok(true) => {}
            Ok(false) => {
                failures.push(json!({ "line": line, "regNo": reg_no, "reason": "not_registered" }));
                continue;
            }
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        }

        let mut fields: [Option<f64>; 11] = [None; 11];
        let mut bad_field = None;
        for (i, slot) in fields.iter_mut().enumerate() {
            match parse_score(&record[i + 1]) {
                Ok(v) => *slot = v,
                Err(()) => {
                    bad_field = Some(UPLOAD_HEADER[i + 1]);
                    break;
                }
            }
        }
        if let Some(field) = bad_field {
            failures.push(json!({ "line": line, "regNo": reg_no, "reason": "bad_number", "field": field }));
            continue;
        }
        let questions: [Option<f64>; 8] = [
            fields[0], fields[1], fields[2], fields[3], fields[4], fields[5], fields[6], fields[7],
        ];
        let (ca, totalexam, grandtotal) = (fields[8], fields[9], fields[10]);
        if let Some(t) = grandtotal {
            if !(0.0..=100.0).contains(&t) {
                failures.push(json!({ "line": line, "regNo": reg_no, "reason": "score_out_of_range" }));
                continue;
            }
        }

        if let Err(e) = upsert_result(
            &tx, &course_id, &reg_no, &questions, ca, totalexam, grandtotal, false,
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        imported += 1;
    }

    // Only a batch that landed rows is fingerprinted; a file whose every row
    // failed stays importable after the data problems are fixed.
    if imported > 0 {
        let filename = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.clone());
        if let Err(e) = tx.execute(
            "INSERT INTO upload_batches(id, fingerprint, filename, course_id, row_count, imported_at)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &fingerprint,
                &filename,
                &course_id,
                imported as i64,
                Utc::now().to_rfc3339(),
            ),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "courseId": course_id,
            "imported": imported,
            "failures": failures,
            "fingerprint": fingerprint
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.list" => Some(handle_list(state, req)),
        "results.upsert" => Some(handle_upsert(state, req)),
        "results.delete" => Some(handle_delete(state, req)),
        "results.bulkUpload" => Some(handle_bulk_upload(state, req)),
        "results.bulkDelete" => Some(handle_bulk_delete(state, req)),
        _ => None,
    }
}
