use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    fmt_ts, get_optional_str, get_optional_ts, get_required_str, now_utc, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::Actor;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const GRACE_PERIOD_MIN: i64 = 1;
const GRACE_PERIOD_MAX: i64 = 120;
const DEFAULT_GRACE_PERIOD_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub class_id: String,
    pub subject_id: String,
    pub teacher_id: String,
    pub department_id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub grace_period_minutes: i64,
    pub status: String,
    pub created_at: String,
}

impl SessionRow {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "classId": self.class_id,
            "subjectId": self.subject_id,
            "teacherId": self.teacher_id,
            "departmentId": self.department_id,
            "startTime": self.start_time,
            "endTime": self.end_time,
            "gracePeriodMinutes": self.grace_period_minutes,
            "status": self.status,
            "createdAt": self.created_at
        })
    }
}

fn row_to_session(r: &rusqlite::Row) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: r.get(0)?,
        class_id: r.get(1)?,
        subject_id: r.get(2)?,
        teacher_id: r.get(3)?,
        department_id: r.get(4)?,
        start_time: r.get(5)?,
        end_time: r.get(6)?,
        grace_period_minutes: r.get(7)?,
        status: r.get(8)?,
        created_at: r.get(9)?,
    })
}

const SESSION_COLUMNS: &str = "id, class_id, subject_id, teacher_id, department_id,
    start_time, end_time, grace_period_minutes, status, created_at";

pub fn load_session(conn: &Connection, session_id: &str) -> Result<SessionRow, HandlerErr> {
    let sql = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
    conn.query_row(&sql, [session_id], |r| row_to_session(r))
        .optional()
        .map_err(HandlerErr::db_query)?
        .ok_or_else(|| HandlerErr::not_found("session not found"))
}

fn configured_default_grace(conn: &Connection) -> Result<i64, HandlerErr> {
    let saved = db::settings_get_json(conn, "setup.attendance").map_err(HandlerErr::db_query)?;
    Ok(saved
        .as_ref()
        .and_then(|v| v.get("defaultGracePeriodMinutes"))
        .and_then(|v| v.as_i64())
        .filter(|n| (GRACE_PERIOD_MIN..=GRACE_PERIOD_MAX).contains(n))
        .unwrap_or(DEFAULT_GRACE_PERIOD_MINUTES))
}

fn sessions_start(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = Actor::from_params(params).map_err(HandlerErr::bad_params)?;
    if !actor.may_start_sessions() {
        return Err(HandlerErr::permission_denied(
            "only teachers and admins may start sessions",
        ));
    }

    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let department_id = get_required_str(params, "departmentId")?;
    let start_time = get_optional_ts(params, "startTime")?.unwrap_or_else(now_utc);

    let grace_period_minutes = match params.get("gracePeriodMinutes") {
        None | Some(serde_json::Value::Null) => configured_default_grace(conn)?,
        Some(v) => {
            let n = v.as_i64().ok_or_else(|| {
                HandlerErr::bad_params("gracePeriodMinutes must be an integer")
            })?;
            if !(GRACE_PERIOD_MIN..=GRACE_PERIOD_MAX).contains(&n) {
                return Err(HandlerErr::bad_params(format!(
                    "gracePeriodMinutes must be in {}..={}",
                    GRACE_PERIOD_MIN, GRACE_PERIOD_MAX
                )));
            }
            n
        }
    };

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM sessions
             WHERE teacher_id = ? AND class_id = ? AND subject_id = ? AND status = 'active'",
            (&actor.user_id, &class_id, &subject_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if let Some(session_id) = existing {
        return Err(HandlerErr::conflict(
            "an active session already exists for this teacher, class and subject",
            Some(json!({ "sessionId": session_id })),
        ));
    }

    let session = SessionRow {
        id: Uuid::new_v4().to_string(),
        class_id,
        subject_id,
        teacher_id: actor.user_id,
        department_id,
        start_time: fmt_ts(start_time),
        end_time: None,
        grace_period_minutes,
        status: "active".to_string(),
        created_at: fmt_ts(now_utc()),
    };
    conn.execute(
        "INSERT INTO sessions(id, class_id, subject_id, teacher_id, department_id,
             start_time, end_time, grace_period_minutes, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &session.id,
            &session.class_id,
            &session.subject_id,
            &session.teacher_id,
            &session.department_id,
            &session.start_time,
            &session.end_time,
            session.grace_period_minutes,
            &session.status,
            &session.created_at,
        ),
    )
    .map_err(|e| HandlerErr::db_insert(e, "sessions"))?;

    Ok(json!({ "session": session.to_json() }))
}

fn sessions_end(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = Actor::from_params(params).map_err(HandlerErr::bad_params)?;
    let session_id = get_required_str(params, "sessionId")?;

    let mut session = load_session(conn, &session_id)?;
    if !actor.may_manage_session(&session.teacher_id) {
        return Err(HandlerErr::permission_denied(
            "only the session's teacher or an admin may end it",
        ));
    }
    // A second end is an error, not a no-op: the caller must learn that
    // their end did not take effect. end_time keeps its first value.
    if !session.is_active() {
        return Err(HandlerErr::conflict(
            "session is already ended",
            Some(json!({ "endTime": session.end_time })),
        ));
    }

    let end_time = fmt_ts(now_utc());
    conn.execute(
        "UPDATE sessions SET status = 'ended', end_time = ? WHERE id = ?",
        (&end_time, &session_id),
    )
    .map_err(|e| HandlerErr::db_update(e, "sessions"))?;
    session.status = "ended".to_string();
    session.end_time = Some(end_time);

    Ok(json!({ "session": session.to_json() }))
}

fn sessions_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let session = load_session(conn, &session_id)?;
    let marked_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM attendance_records WHERE session_id = ?",
            [&session_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;

    Ok(json!({ "session": session.to_json(), "markedCount": marked_count }))
}

fn sessions_list_active(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_optional_str(params, "teacherId")?;

    let sql = format!(
        "SELECT {} FROM sessions WHERE status = 'active' ORDER BY start_time, id",
        SESSION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map([], |r| row_to_session(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let sessions: Vec<serde_json::Value> = rows
        .iter()
        .filter(|s| teacher_id.as_deref().map_or(true, |t| s.teacher_id == t))
        .map(|s| s.to_json())
        .collect();

    Ok(json!({ "sessions": sessions }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sessions.start" => Some(with_conn(state, req, sessions_start)),
        "sessions.end" => Some(with_conn(state, req, sessions_end)),
        "sessions.get" => Some(with_conn(state, req, sessions_get)),
        "sessions.listActive" => Some(with_conn(state, req, sessions_list_active)),
        _ => None,
    }
}
