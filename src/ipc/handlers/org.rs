use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_i64, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, rusqlite::Error> {
    Ok(conn
        .query_row(sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

fn dependent_count(
    conn: &Connection,
    sql: &str,
    id: &str,
) -> Result<i64, rusqlite::Error> {
    conn.query_row(sql, [id], |r| r.get(0))
}

fn handle_colleges_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "colleges": [] }));
    };

    // Include department counts so a dashboard can be drawn from one call.
    let mut stmt = match conn.prepare(
        "SELECT c.id, c.code, c.name,
           (SELECT COUNT(*) FROM departments d WHERE d.college_id = c.id) AS department_count
         FROM colleges c
         ORDER BY c.code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "code": row.get::<_, String>(1)?,
                "name": row.get::<_, String>(2)?,
                "departmentCount": row.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(colleges) => ok(&req.id, json!({ "colleges": colleges })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_colleges_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v.trim().to_ascii_uppercase(),
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    if code.is_empty() || name.is_empty() {
        return err(&req.id, "bad_params", "code and name must not be empty", None);
    }

    let college_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO colleges(id, code, name) VALUES(?, ?, ?)",
        (&college_id, &code, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "colleges" })),
        );
    }
    ok(&req.id, json!({ "collegeId": college_id, "code": code }))
}

fn handle_colleges_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let college_id = match required_str(req, "collegeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match exists(conn, "SELECT 1 FROM colleges WHERE id = ?", &college_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "college not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if let Some(name) = optional_str(req, "name") {
        if let Err(e) = conn.execute(
            "UPDATE colleges SET name = ? WHERE id = ?",
            (name.trim(), &college_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(code) = optional_str(req, "code") {
        if let Err(e) = conn.execute(
            "UPDATE colleges SET code = ? WHERE id = ?",
            (code.trim().to_ascii_uppercase(), &college_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    ok(&req.id, json!({ "collegeId": college_id }))
}

fn handle_colleges_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let college_id = match required_str(req, "collegeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match exists(conn, "SELECT 1 FROM colleges WHERE id = ?", &college_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "college not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    // Refuse instead of cascading; departments must be moved or removed first.
    match dependent_count(
        conn,
        "SELECT COUNT(*) FROM departments WHERE college_id = ?",
        &college_id,
    ) {
        Ok(0) => {}
        Ok(n) => {
            return err(
                &req.id,
                "conflict",
                "college still has departments",
                Some(json!({ "departmentCount": n })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Err(e) = conn.execute("DELETE FROM colleges WHERE id = ?", [&college_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_departments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "departments": [] }));
    };
    let college_id = optional_str(req, "collegeId");

    let sql = "SELECT d.id, d.college_id, d.code, d.name,
           (SELECT COUNT(*) FROM programmes p WHERE p.department_id = d.id) AS programme_count
         FROM departments d
         WHERE (?1 IS NULL OR d.college_id = ?1)
         ORDER BY d.code";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&college_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "collegeId": row.get::<_, String>(1)?,
                "code": row.get::<_, String>(2)?,
                "name": row.get::<_, String>(3)?,
                "programmeCount": row.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(departments) => ok(&req.id, json!({ "departments": departments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_departments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let college_id = match required_str(req, "collegeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v.trim().to_ascii_uppercase(),
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    match exists(conn, "SELECT 1 FROM colleges WHERE id = ?", &college_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "college not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if code.is_empty() || name.is_empty() {
        return err(&req.id, "bad_params", "code and name must not be empty", None);
    }

    let department_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO departments(id, college_id, code, name) VALUES(?, ?, ?, ?)",
        (&department_id, &college_id, &code, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "departments" })),
        );
    }
    ok(
        &req.id,
        json!({ "departmentId": department_id, "code": code }),
    )
}

fn handle_departments_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let department_id = match required_str(req, "departmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match exists(conn, "SELECT 1 FROM departments WHERE id = ?", &department_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "department not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Some(name) = optional_str(req, "name") {
        if let Err(e) = conn.execute(
            "UPDATE departments SET name = ? WHERE id = ?",
            (name.trim(), &department_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(code) = optional_str(req, "code") {
        if let Err(e) = conn.execute(
            "UPDATE departments SET code = ? WHERE id = ?",
            (code.trim().to_ascii_uppercase(), &department_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    ok(&req.id, json!({ "departmentId": department_id }))
}

fn handle_departments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let department_id = match required_str(req, "departmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match exists(conn, "SELECT 1 FROM departments WHERE id = ?", &department_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "department not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match dependent_count(
        conn,
        "SELECT COUNT(*) FROM programmes WHERE department_id = ?",
        &department_id,
    ) {
        Ok(0) => {}
        Ok(n) => {
            return err(
                &req.id,
                "conflict",
                "department still has programmes",
                Some(json!({ "programmeCount": n })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Err(e) = conn.execute("DELETE FROM departments WHERE id = ?", [&department_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_programmes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "programmes": [] }));
    };
    let department_id = optional_str(req, "departmentId");

    let sql = "SELECT p.id, p.department_id, p.name, p.degree, p.duration_years,
           (SELECT COUNT(*) FROM students s WHERE s.programme_id = p.id) AS student_count
         FROM programmes p
         WHERE (?1 IS NULL OR p.department_id = ?1)
         ORDER BY p.name";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&department_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "departmentId": row.get::<_, String>(1)?,
                "name": row.get::<_, String>(2)?,
                "degree": row.get::<_, String>(3)?,
                "durationYears": row.get::<_, i64>(4)?,
                "studentCount": row.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(programmes) => ok(&req.id, json!({ "programmes": programmes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_programmes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let department_id = match required_str(req, "departmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    let degree = match required_str(req, "degree") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    let duration_years = optional_i64(req, "durationYears").unwrap_or(4);
    if !(1..=8).contains(&duration_years) {
        return err(
            &req.id,
            "bad_params",
            "durationYears must be between 1 and 8",
            Some(json!({ "durationYears": duration_years })),
        );
    }
    match exists(conn, "SELECT 1 FROM departments WHERE id = ?", &department_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "department not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if name.is_empty() || degree.is_empty() {
        return err(&req.id, "bad_params", "name and degree must not be empty", None);
    }

    let programme_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO programmes(id, department_id, name, degree, duration_years)
         VALUES(?, ?, ?, ?, ?)",
        (&programme_id, &department_id, &name, &degree, duration_years),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "programmes" })),
        );
    }
    ok(&req.id, json!({ "programmeId": programme_id, "name": name }))
}

fn handle_programmes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let programme_id = match required_str(req, "programmeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match exists(conn, "SELECT 1 FROM programmes WHERE id = ?", &programme_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "programme not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Some(name) = optional_str(req, "name") {
        if let Err(e) = conn.execute(
            "UPDATE programmes SET name = ? WHERE id = ?",
            (name.trim(), &programme_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(degree) = optional_str(req, "degree") {
        if let Err(e) = conn.execute(
            "UPDATE programmes SET degree = ? WHERE id = ?",
            (degree.trim(), &programme_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(duration) = optional_i64(req, "durationYears") {
        if let Err(e) = conn.execute(
            "UPDATE programmes SET duration_years = ? WHERE id = ?",
            (duration, &programme_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    ok(&req.id, json!({ "programmeId": programme_id }))
}

fn handle_programmes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let programme_id = match required_str(req, "programmeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match exists(conn, "SELECT 1 FROM programmes WHERE id = ?", &programme_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "programme not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match dependent_count(
        conn,
        "SELECT COUNT(*) FROM students WHERE programme_id = ?",
        &programme_id,
    ) {
        Ok(0) => {}
        Ok(n) => {
            return err(
                &req.id,
                "conflict",
                "programme still has students",
                Some(json!({ "studentCount": n })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Err(e) = conn.execute(
        "DELETE FROM course_approvals WHERE programme_id = ?",
        [&programme_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = conn.execute("DELETE FROM programmes WHERE id = ?", [&programme_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "colleges.list" => Some(handle_colleges_list(state, req)),
        "colleges.create" => Some(handle_colleges_create(state, req)),
        "colleges.update" => Some(handle_colleges_update(state, req)),
        "colleges.delete" => Some(handle_colleges_delete(state, req)),
        "departments.list" => Some(handle_departments_list(state, req)),
        "departments.create" => Some(handle_departments_create(state, req)),
        "departments.update" => Some(handle_departments_update(state, req)),
        "departments.delete" => Some(handle_departments_delete(state, req)),
        "programmes.list" => Some(handle_programmes_list(state, req)),
        "programmes.create" => Some(handle_programmes_create(state, req)),
        "programmes.update" => Some(handle_programmes_update(state, req)),
        "programmes.delete" => Some(handle_programmes_delete(state, req)),
        _ => None,
    }
}
