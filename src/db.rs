use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("rollcall.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            department_id TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            grace_period_minutes INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    // Backs the one-active-session-per-(teacher, class, subject) invariant
    // behind the explicit conflict check in sessions.start.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active_singleton
         ON sessions(teacher_id, class_id, subject_id) WHERE status = 'active'",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_class ON sessions(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_subject ON sessions(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_department ON sessions(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            marked_at TEXT NOT NULL,
            marked_by_id TEXT NOT NULL,
            confidence REAL,
            note TEXT,
            FOREIGN KEY(session_id) REFERENCES sessions(id),
            UNIQUE(session_id, student_id)
        )",
        [],
    )?;
    // Existing workspaces may predate the confidence column from external
    // recognition sources. Add it if needed.
    ensure_attendance_records_confidence(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_session
         ON attendance_records(session_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student
         ON attendance_records(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS change_requests(
            id TEXT PRIMARY KEY,
            attendance_record_id TEXT NOT NULL,
            requested_by_id TEXT NOT NULL,
            requested_by_role TEXT NOT NULL,
            old_status TEXT NOT NULL,
            new_status TEXT NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL,
            reviewed_by_id TEXT,
            review_note TEXT,
            created_at TEXT NOT NULL,
            resolved_at TEXT,
            FOREIGN KEY(attendance_record_id) REFERENCES attendance_records(id)
        )",
        [],
    )?;
    // One outstanding dispute per record.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_change_requests_pending_singleton
         ON change_requests(attendance_record_id) WHERE status = 'pending'",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_change_requests_record
         ON change_requests(attendance_record_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events(
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            recipient_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_recipient ON events(recipient_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_attendance_records_confidence(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendance_records", "confidence")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attendance_records ADD COLUMN confidence REAL", [])?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    use rusqlite::OptionalExtension;
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, &text),
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
