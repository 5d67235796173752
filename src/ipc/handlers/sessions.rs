use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_sessions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "sessions": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, closed, created_at, closed_at
         FROM sessions
         ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "closed": row.get::<_, i64>(2)? != 0,
                "createdAt": row.get::<_, String>(3)?,
                "closedAt": row.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(sessions) => ok(&req.id, json!({ "sessions": sessions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_sessions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e,
    };
    // Session names follow the "YYYY/YYYY" convention; enforce the shape so
    // chronological text ordering holds.
    let valid = name.len() == 9
        && name.as_bytes()[4] == b'/'
        && name[..4].chars().all(|c| c.is_ascii_digit())
        && name[5..].chars().all(|c| c.is_ascii_digit());
    if !valid {
        return err(
            &req.id,
            "bad_params",
            "session name must look like 2023/2024",
            Some(json!({ "name": name })),
        );
    }

    let session_id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO sessions(id, name, closed, created_at) VALUES(?, ?, 0, ?)",
        (&session_id, &name, &created_at),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "sessions" })),
        );
    }

    ok(&req.id, json!({ "sessionId": session_id, "name": name }))
}

fn handle_sessions_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let session_id = match required_str(req, "sessionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let closed: Option<i64> = match conn
        .query_row(
            "SELECT closed FROM sessions WHERE id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(closed) = closed else {
        return err(&req.id, "not_found", "session not found", None);
    };
    if closed != 0 {
        // Closing twice is a no-op.
        return ok(&req.id, json!({ "sessionId": session_id, "closed": true }));
    }

    let closed_at = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "UPDATE sessions SET closed = 1, closed_at = ? WHERE id = ?",
        (&closed_at, &session_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "sessionId": session_id, "closed": true, "closedAt": closed_at }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.list" => Some(handle_sessions_list(state, req)),
        "sessions.create" => Some(handle_sessions_create(state, req)),
        "sessions.close" => Some(handle_sessions_close(state, req)),
        _ => None,
    }
}
