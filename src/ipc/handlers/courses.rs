use crate::grading::normalize_code;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_bool, optional_i64, optional_str, required_i64, required_semester,
    required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };
    let session_id = optional_str(req, "sessionId");
    let semester = optional_i64(req, "semester");
    let level = optional_i64(req, "level");

    let mut stmt = match conn.prepare(
        "SELECT id, code, title, unit, elective, level, semester, session_id
         FROM courses
         WHERE (?1 IS NULL OR session_id = ?1)
           AND (?2 IS NULL OR semester = ?2)
           AND (?3 IS NULL OR level = ?3)
         ORDER BY unit, code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&session_id, &semester, &level), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "code": row.get::<_, String>(1)?,
                "title": row.get::<_, String>(2)?,
                "unit": row.get::<_, i64>(3)?,
                "elective": row.get::<_, i64>(4)? != 0,
                "level": row.get::<_, i64>(5)?,
                "semester": row.get::<_, i64>(6)?,
                "sessionId": row.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => normalize_code(&v),
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    let unit = match required_i64(req, "unit") {
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
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let elective = optional_bool(req, "elective").unwrap_or(false);

    if code.is_empty() || title.is_empty() {
        return err(&req.id, "bad_params", "code and title must not be empty", None);
    }
    if !(1..=12).contains(&unit) {
        return err(
            &req.id,
            "bad_params",
            "unit must be between 1 and 12",
            Some(json!({ "unit": unit })),
        );
    }
    if level < 100 || level % 100 != 0 {
        return err(
            &req.id,
            "bad_params",
            "level must be a multiple of 100",
            Some(json!({ "level": level })),
        );
    }

    let session_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?", [&session_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if session_exists.is_none() {
        return err(&req.id, "not_found", "session not found", None);
    }

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, code, title, unit, elective, level, semester, session_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &course_id,
            &code,
            &title,
            unit,
            elective as i64,
            level,
            semester,
            &session_id,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses", "code": code })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id, "code": code }))
}

fn handle_courses_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
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

    if let Some(title) = patch.get("title").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE courses SET title = ? WHERE id = ?",
            (title.trim(), &course_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(unit) = patch.get("unit").and_then(|v| v.as_i64()) {
        if !(1..=12).contains(&unit) {
            return err(
                &req.id,
                "bad_params",
                "unit must be between 1 and 12",
                Some(json!({ "unit": unit })),
            );
        }
        if let Err(e) = conn.execute(
            "UPDATE courses SET unit = ? WHERE id = ?",
            (unit, &course_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(elective) = patch.get("elective").and_then(|v| v.as_bool()) {
        if let Err(e) = conn.execute(
            "UPDATE courses SET elective = ? WHERE id = ?",
            (elective as i64, &course_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "courseId": course_id }))
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
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

    let result_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM results WHERE course_id = ?",
        [&course_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if result_count > 0 {
        return err(
            &req.id,
            "conflict",
            "course has recorded results",
            Some(json!({ "resultCount": result_count })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for sql in [
        "DELETE FROM registrations WHERE course_id = ?",
        "DELETE FROM course_approvals WHERE course_id = ?",
        "DELETE FROM courses WHERE id = ?",
    ] {
        if let Err(e) = tx.execute(sql, [&course_id]) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

/// Replaces the approved course list for one programme/session/level/semester
/// scope. The whole list is swapped atomically so a partial edit never leaves
/// a mixed old/new approval set behind.
fn handle_approvals_set(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let Some(course_ids) = req.params.get("courseIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing courseIds array", None);
    };
    let course_ids: Vec<String> = course_ids
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.to_string())
        .collect();

    for course_id in &course_ids {
        let found: Option<i64> = match conn
            .query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if found.is_none() {
            return err(
                &req.id,
                "not_found",
                "course not found",
                Some(json!({ "courseId": course_id })),
            );
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM course_approvals
         WHERE programme_id = ? AND session_id = ? AND level = ? AND semester = ?",
        (&programme_id, &session_id, level, semester),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    for course_id in &course_ids {
        if let Err(e) = tx.execute(
            "INSERT INTO course_approvals(id, programme_id, session_id, level, semester, course_id)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &programme_id,
                &session_id,
                level,
                semester,
                course_id,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "courseId": course_id })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "approvedCount": course_ids.len() }))
}

fn handle_approvals_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut stmt = match conn.prepare(
        "SELECT c.id, c.code, c.title, c.unit, c.elective
         FROM course_approvals a
         JOIN courses c ON c.id = a.course_id
         WHERE a.programme_id = ? AND a.session_id = ? AND a.level = ? AND a.semester = ?
         ORDER BY c.unit, c.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&programme_id, &session_id, level, semester), |row| {
            Ok(json!({
                "courseId": row.get::<_, String>(0)?,
                "code": row.get::<_, String>(1)?,
                "title": row.get::<_, String>(2)?,
                "unit": row.get::<_, i64>(3)?,
                "elective": row.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.update" => Some(handle_courses_update(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        "approvals.set" => Some(handle_approvals_set(state, req)),
        "approvals.list" => Some(handle_approvals_list(state, req)),
        _ => None,
    }
}
