use crate::grading::normalize_reg_no;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_i64, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const STANDINGS: [&str; 4] = ["good", "deferred", "withdrawn", "readmitted"];

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };
    let programme_id = optional_str(req, "programmeId");
    let level = optional_i64(req, "level");

    let mut stmt = match conn.prepare(
        "SELECT id, reg_no, full_name, programme_id, level, standing
         FROM students
         WHERE (?1 IS NULL OR programme_id = ?1)
           AND (?2 IS NULL OR level = ?2)
         ORDER BY reg_no",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&programme_id, &level), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "regNo": row.get::<_, String>(1)?,
                "fullName": row.get::<_, String>(2)?,
                "programmeId": row.get::<_, String>(3)?,
                "level": row.get::<_, i64>(4)?,
                "standing": row.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let reg_no = match required_str(req, "regNo") {
        Ok(v) => normalize_reg_no(&v),
        Err(e) => return e,
    };
    let full_name = match required_str(req, "fullName") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    let programme_id = match required_str(req, "programmeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = match optional_i64(req, "level") {
        Some(v) if v >= 100 && v % 100 == 0 => v,
        Some(v) => {
            return err(
                &req.id,
                "bad_params",
                "level must be a multiple of 100",
                Some(json!({ "level": v })),
            )
        }
        None => 100,
    };
    if reg_no.is_empty() || full_name.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "regNo and fullName must not be empty",
            None,
        );
    }

    let programme_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM programmes WHERE id = ?",
            [&programme_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if programme_exists.is_none() {
        return err(&req.id, "not_found", "programme not found", None);
    }

    let student_id = Uuid::new_v4().to_string();
    let updated_at = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, reg_no, full_name, programme_id, level, standing, updated_at)
         VALUES(?, ?, ?, ?, ?, 'good', ?)",
        (&student_id, &reg_no, &full_name, &programme_id, level, &updated_at),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students", "regNo": reg_no })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id, "regNo": reg_no }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let found: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if found.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    if let Some(full_name) = patch.get("fullName").and_then(|v| v.as_str()) {
        if let Err(e) = conn.execute(
            "UPDATE students SET full_name = ?, updated_at = ? WHERE id = ?",
            (full_name.trim(), Utc::now().to_rfc3339(), &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(level) = patch.get("level").and_then(|v| v.as_i64()) {
        if level < 100 || level % 100 != 0 {
            return err(
                &req.id,
                "bad_params",
                "level must be a multiple of 100",
                Some(json!({ "level": level })),
            );
        }
        if let Err(e) = conn.execute(
            "UPDATE students SET level = ?, updated_at = ? WHERE id = ?",
            (level, Utc::now().to_rfc3339(), &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(standing) = patch.get("standing").and_then(|v| v.as_str()) {
        let standing = standing.trim().to_ascii_lowercase();
        if !STANDINGS.contains(&standing.as_str()) {
            return err(
                &req.id,
                "bad_params",
                "standing must be one of: good, deferred, withdrawn, readmitted",
                Some(json!({ "standing": standing })),
            );
        }
        if let Err(e) = conn.execute(
            "UPDATE students SET standing = ?, updated_at = ? WHERE id = ?",
            (&standing, Utc::now().to_rfc3339(), &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let reg_no: Option<String> = match conn
        .query_row(
            "SELECT reg_no FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(reg_no) = reg_no else {
        return err(&req.id, "not_found", "student not found", None);
    };

    // A student with recorded results is history, not a typo; refuse.
    let result_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM results WHERE reg_no = ?",
        [&reg_no],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if result_count > 0 {
        return err(
            &req.id,
            "conflict",
            "student has recorded results",
            Some(json!({ "resultCount": result_count })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM registrations WHERE reg_no = ?", [&reg_no]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
