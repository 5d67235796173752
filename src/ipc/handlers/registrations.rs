use crate::grading::normalize_reg_no;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_i64, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

/// Registers a batch of students for one course. Rows that cannot be
/// registered are reported individually; the rest go through.
fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(reg_nos) = req.params.get("regNos").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing regNos array", None);
    };

    let course: Option<(String, i64)> = match conn
        .query_row(
            "SELECT session_id, semester FROM courses WHERE id = ?",
            [&course_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((session_id, semester)) = course else {
        return err(&req.id, "not_found", "course not found", None);
    };

    let mut registered = 0usize;
    let mut rejects = Vec::new();
    for (idx, raw) in reg_nos.iter().enumerate() {
        let Some(raw) = raw.as_str() else {
            rejects.push(json!({ "index": idx, "reason": "not_a_string" }));
            continue;
        };
        let reg_no = normalize_reg_no(raw);
        if reg_no.is_empty() {
            rejects.push(json!({ "index": idx, "reason": "empty_reg_no" }));
            continue;
        }

        let known: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM students WHERE reg_no = ?",
                [&reg_no],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if known.is_none() {
            rejects.push(json!({
                "index": idx,
                "regNo": reg_no,
                "reason": "unknown_student"
            }));
            continue;
        }

        let already: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM registrations WHERE course_id = ? AND reg_no = ?",
                (&course_id, &reg_no),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if already.is_some() {
            rejects.push(json!({
                "index": idx,
                "regNo": reg_no,
                "reason": "already_registered"
            }));
            continue;
        }

        if let Err(e) = conn.execute(
            "INSERT INTO registrations(id, course_id, reg_no, session_id, semester)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &course_id,
                &reg_no,
                &session_id,
                semester,
            ),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "regNo": reg_no })),
            );
        }
        registered += 1;
    }

    ok(
        &req.id,
        json!({
            "courseId": course_id,
            "registered": registered,
            "rejects": rejects
        }),
    )
}

fn handle_search(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = optional_i64(req, "limit").unwrap_or(100).clamp(1, 1000);
    let offset = optional_i64(req, "offset").unwrap_or(0).max(0);

    let total: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM registrations WHERE course_id = ?",
        [&course_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT r.reg_no, COALESCE(s.full_name, '')
         FROM registrations r
         LEFT JOIN students s ON s.reg_no = r.reg_no
         WHERE r.course_id = ?
         ORDER BY r.reg_no
         LIMIT ? OFFSET ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&course_id, limit, offset), |row| {
            Ok(json!({
                "regNo": row.get::<_, String>(0)?,
                "fullName": row.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(registrations) => ok(
            &req.id,
            json!({
                "total": total,
                "limit": limit,
                "offset": offset,
                "registrations": registrations
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
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

    // An entered result implies the registration happened; keep both.
    let has_result: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM results WHERE course_id = ? AND reg_no = ?",
            (&course_id, &reg_no),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if has_result.is_some() {
        return err(
            &req.id,
            "conflict",
            "a result exists for this registration",
            Some(json!({ "courseId": course_id, "regNo": reg_no })),
        );
    }

    let affected = match conn.execute(
        "DELETE FROM registrations WHERE course_id = ? AND reg_no = ?",
        (&course_id, &reg_no),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if affected == 0 {
        return err(&req.id, "not_found", "registration not found", None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "registrations.register" => Some(handle_register(state, req)),
        "registrations.search" => Some(handle_search(state, req)),
        "registrations.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
