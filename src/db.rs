use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("examrec.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            closed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            closed_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS colleges(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            college_id TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            FOREIGN KEY(college_id) REFERENCES colleges(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_departments_college ON departments(college_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS programmes(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            name TEXT NOT NULL,
            degree TEXT NOT NULL,
            duration_years INTEGER NOT NULL,
            FOREIGN KEY(department_id) REFERENCES departments(id),
            UNIQUE(department_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_programmes_department ON programmes(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            reg_no TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            programme_id TEXT NOT NULL,
            level INTEGER NOT NULL,
            standing TEXT NOT NULL DEFAULT 'good',
            updated_at TEXT,
            FOREIGN KEY(programme_id) REFERENCES programmes(id)
        )",
        [],
    )?;
    ensure_students_standing(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_programme ON students(programme_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            title TEXT NOT NULL,
            unit INTEGER NOT NULL,
            elective INTEGER NOT NULL DEFAULT 0,
            level INTEGER NOT NULL,
            semester INTEGER NOT NULL,
            session_id TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            UNIQUE(code, session_id, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_session ON courses(session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_session_semester ON courses(session_id, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_approvals(
            id TEXT PRIMARY KEY,
            programme_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            level INTEGER NOT NULL,
            semester INTEGER NOT NULL,
            course_id TEXT NOT NULL,
            FOREIGN KEY(programme_id) REFERENCES programmes(id),
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(programme_id, session_id, level, semester, course_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_approvals_scope
         ON course_approvals(programme_id, session_id, level, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS registrations(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            reg_no TEXT NOT NULL,
            session_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            UNIQUE(course_id, reg_no)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_course ON registrations(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_reg_no ON registrations(reg_no)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_term ON registrations(session_id, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            reg_no TEXT NOT NULL,
            q1 REAL, q2 REAL, q3 REAL, q4 REAL,
            q5 REAL, q6 REAL, q7 REAL, q8 REAL,
            ca REAL,
            totalexam REAL,
            grandtotal REAL,
            grade TEXT,
            moderated INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, reg_no)
        )",
        [],
    )?;
    ensure_results_moderated(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_course ON results(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_reg_no ON results(reg_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS metrics(
            id TEXT PRIMARY KEY,
            reg_no TEXT NOT NULL,
            session_id TEXT NOT NULL,
            semester INTEGER NOT NULL,
            tcc INTEGER NOT NULL,
            tce INTEGER NOT NULL,
            tpe REAL NOT NULL,
            gpa REAL NOT NULL,
            ccc INTEGER NOT NULL,
            cce INTEGER NOT NULL,
            cpe REAL NOT NULL,
            cgpa REAL NOT NULL,
            remark TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            UNIQUE(reg_no, session_id, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_metrics_reg_no ON metrics(reg_no)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_metrics_term ON metrics(session_id, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS metric_approvals(
            metric_id TEXT NOT NULL,
            officer TEXT NOT NULL,
            name TEXT NOT NULL,
            approved INTEGER NOT NULL DEFAULT 0,
            flagged INTEGER NOT NULL DEFAULT 0,
            note TEXT,
            response TEXT,
            PRIMARY KEY(metric_id, officer),
            FOREIGN KEY(metric_id) REFERENCES metrics(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS upload_batches(
            id TEXT PRIMARY KEY,
            fingerprint TEXT NOT NULL UNIQUE,
            filename TEXT NOT NULL,
            course_id TEXT NOT NULL,
            row_count INTEGER NOT NULL,
            imported_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;

    Ok(conn)
}

// Older workspaces predate result moderation. Add the column if needed.
fn ensure_results_moderated(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "results", "moderated")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE results ADD COLUMN moderated INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_students_standing(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "standing")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN standing TEXT NOT NULL DEFAULT 'good'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
