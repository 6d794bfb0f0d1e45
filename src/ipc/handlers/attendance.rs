use crate::calc::{self, RecordStatus};
use crate::db;
use crate::events;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    fmt_ts, get_optional_ts, get_required_str, now_utc, parse_ts, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::ipc::handlers::sessions::{load_session, SessionRow};
use crate::policy::Actor;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const BULK_MARK_MAX_ENTRIES: usize = 500;
const NOTE_MAX_CHARS: usize = 500;
const DEFAULT_LOW_ATTENDANCE_THRESHOLD: f64 = 75.0;

#[derive(Debug, Clone)]
pub struct RecordRow {
    pub id: String,
    pub session_id: String,
    pub student_id: String,
    pub status: String,
    pub marked_at: String,
    pub marked_by_id: String,
    pub confidence: Option<f64>,
    pub note: Option<String>,
}

impl RecordRow {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "sessionId": self.session_id,
            "studentId": self.student_id,
            "status": self.status,
            "markedAt": self.marked_at,
            "markedById": self.marked_by_id,
            "confidence": self.confidence,
            "note": self.note
        })
    }
}

const RECORD_COLUMNS: &str =
    "id, session_id, student_id, status, marked_at, marked_by_id, confidence, note";

fn row_to_record(r: &rusqlite::Row) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: r.get(0)?,
        session_id: r.get(1)?,
        student_id: r.get(2)?,
        status: r.get(3)?,
        marked_at: r.get(4)?,
        marked_by_id: r.get(5)?,
        confidence: r.get(6)?,
        note: r.get(7)?,
    })
}

pub fn load_record(conn: &Connection, record_id: &str) -> Result<RecordRow, HandlerErr> {
    let sql = format!("SELECT {} FROM attendance_records WHERE id = ?", RECORD_COLUMNS);
    conn.query_row(&sql, [record_id], |r| row_to_record(r))
        .optional()
        .map_err(HandlerErr::db_query)?
        .ok_or_else(|| HandlerErr::not_found("attendance record not found"))
}

fn parse_status(raw: &str) -> Result<RecordStatus, HandlerErr> {
    RecordStatus::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params("status must be one of: present, absent, late"))
}

fn parse_confidence(v: Option<&serde_json::Value>) -> Result<Option<f64>, HandlerErr> {
    match v {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => {
            let c = v
                .as_f64()
                .ok_or_else(|| HandlerErr::bad_params("confidence must be a number"))?;
            if !(0.0..=1.0).contains(&c) {
                return Err(HandlerErr::bad_params("confidence must be in 0..=1"));
            }
            Ok(Some(c))
        }
    }
}

fn parse_note(v: Option<&serde_json::Value>) -> Result<Option<String>, HandlerErr> {
    match v {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| HandlerErr::bad_params("note must be a string"))?
                .trim();
            if s.chars().count() > NOTE_MAX_CHARS {
                return Err(HandlerErr::bad_params(format!(
                    "note length must be <= {}",
                    NOTE_MAX_CHARS
                )));
            }
            if s.is_empty() {
                return Ok(None);
            }
            Ok(Some(s.to_string()))
        }
    }
}

/// The requested status is reclassified against the session's grace window
/// before it is stored.
fn classify_for_session(
    session: &SessionRow,
    requested: RecordStatus,
    marked_at: chrono::DateTime<chrono::Utc>,
) -> Result<RecordStatus, HandlerErr> {
    let start_time = parse_ts(&session.start_time, "session.startTime")?;
    Ok(calc::classify_marking(
        requested,
        marked_at,
        start_time,
        session.grace_period_minutes,
    ))
}

fn upsert_record(
    conn: &Connection,
    session_id: &str,
    student_id: &str,
    status: RecordStatus,
    marked_at: &str,
    marked_by_id: &str,
    confidence: Option<f64>,
    note: Option<&str>,
) -> Result<RecordRow, HandlerErr> {
    let record_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO attendance_records(id, session_id, student_id, status,
             marked_at, marked_by_id, confidence, note)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(session_id, student_id) DO UPDATE SET
           status = excluded.status,
           marked_at = excluded.marked_at,
           marked_by_id = excluded.marked_by_id,
           confidence = excluded.confidence,
           note = excluded.note",
        (
            &record_id,
            session_id,
            student_id,
            status.as_str(),
            marked_at,
            marked_by_id,
            confidence,
            note,
        ),
    )
    .map_err(|e| HandlerErr::db_insert(e, "attendance_records"))?;

    let sql = format!(
        "SELECT {} FROM attendance_records WHERE session_id = ? AND student_id = ?",
        RECORD_COLUMNS
    );
    conn.query_row(&sql, (session_id, student_id), |r| row_to_record(r))
        .map_err(HandlerErr::db_query)
}

fn warnings_enabled(conn: &Connection) -> Result<bool, HandlerErr> {
    let saved = db::settings_get_json(conn, "setup.notifications").map_err(HandlerErr::db_query)?;
    Ok(saved
        .as_ref()
        .and_then(|v| v.get("emitLowAttendanceWarnings"))
        .and_then(|v| v.as_bool())
        .unwrap_or(true))
}

fn low_attendance_threshold(conn: &Connection) -> Result<f64, HandlerErr> {
    let saved = db::settings_get_json(conn, "setup.attendance").map_err(HandlerErr::db_query)?;
    Ok(saved
        .as_ref()
        .and_then(|v| v.get("lowAttendanceThresholdPercent"))
        .and_then(|v| v.as_f64())
        .filter(|t| (50.0..=100.0).contains(t))
        .unwrap_or(DEFAULT_LOW_ATTENDANCE_THRESHOLD))
}

/// Warn the student when their attended share of the subject's ended
/// sessions sits below the configured threshold. Runs in the same
/// transaction as the mark that triggered the check; deduplication across
/// repeated warnings is the notifier's concern.
fn maybe_emit_low_attendance_warning(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    emitted_at: &str,
) -> Result<(), HandlerErr> {
    if !warnings_enabled(conn)? {
        return Ok(());
    }
    let threshold = low_attendance_threshold(conn)?;

    let mut stmt = conn
        .prepare(
            "SELECT r.status FROM attendance_records r
             JOIN sessions s ON s.id = r.session_id
             WHERE r.student_id = ? AND s.subject_id = ? AND s.status = 'ended'",
        )
        .map_err(HandlerErr::db_query)?;
    let statuses = stmt
        .query_map((student_id, subject_id), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let breakdown = calc::breakdown(
        statuses
            .iter()
            .filter_map(|s| RecordStatus::parse(s)),
    );
    if breakdown.total == 0 {
        return Ok(());
    }
    let attended = breakdown.attended_percent();
    if attended >= threshold {
        return Ok(());
    }

    events::emit(
        conn,
        events::KIND_LOW_ATTENDANCE_WARNING,
        student_id,
        &json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "attendedPercent": attended,
            "thresholdPercent": threshold
        }),
        emitted_at,
    )
    .map_err(|e| HandlerErr::db_insert(e, "events"))?;
    Ok(())
}

fn attendance_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = Actor::from_params(params).map_err(HandlerErr::bad_params)?;
    let session_id = get_required_str(params, "sessionId")?;
    let student_id = get_required_str(params, "studentId")?;
    let status_raw = get_required_str(params, "status")?;
    let requested = parse_status(&status_raw)?;
    let confidence = parse_confidence(params.get("confidence"))?;
    let note = parse_note(params.get("note"))?;
    // External recognition sources pass their detection time as `at`.
    let marked_at = get_optional_ts(params, "at")?.unwrap_or_else(now_utc);

    let session = load_session(conn, &session_id)?;
    if !session.is_active() {
        return Err(HandlerErr::conflict(
            "session is not active; corrections go through a change request",
            None,
        ));
    }
    if !actor.may_manage_session(&session.teacher_id) {
        return Err(HandlerErr::permission_denied(
            "only the session's teacher or an admin may mark attendance",
        ));
    }

    let stored = classify_for_session(&session, requested, marked_at)?;
    let marked_at_ts = fmt_ts(marked_at);

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    let record = upsert_record(
        &tx,
        &session_id,
        &student_id,
        stored,
        &marked_at_ts,
        &actor.user_id,
        confidence,
        note.as_deref(),
    )?;
    maybe_emit_low_attendance_warning(&tx, &student_id, &session.subject_id, &marked_at_ts)?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "record": record.to_json() }))
}

fn attendance_bulk_mark(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = Actor::from_params(params).map_err(HandlerErr::bad_params)?;
    let session_id = get_required_str(params, "sessionId")?;
    let Some(entries) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing entries[]"));
    };

    if entries.len() > BULK_MARK_MAX_ENTRIES {
        let rejected = entries.len();
        return Ok(json!({
            "marked": 0,
            "rejected": rejected,
            "limitExceeded": true,
            "errors": [{
                "index": -1,
                "code": "too_many_entries",
                "message": format!(
                    "bulk payload exceeds max entries: {} > {}",
                    rejected, BULK_MARK_MAX_ENTRIES
                )
            }]
        }));
    }

    // Session state and authority are preconditions of the whole batch;
    // entry-level problems are reported per entry instead.
    let session = load_session(conn, &session_id)?;
    if !session.is_active() {
        return Err(HandlerErr::conflict(
            "session is not active; corrections go through a change request",
            None,
        ));
    }
    if !actor.may_manage_session(&session.teacher_id) {
        return Err(HandlerErr::permission_denied(
            "only the session's teacher or an admin may mark attendance",
        ));
    }

    let marked_at = get_optional_ts(params, "at")?.unwrap_or_else(now_utc);
    let marked_at_ts = fmt_ts(marked_at);

    let mut marked: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    for (i, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("entry at index {} must be an object", i),
            }));
            continue;
        };
        let entry_value = serde_json::Value::Object(obj.clone());

        let student_id = match get_required_str(&entry_value, "studentId") {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({ "index": i, "code": e.code, "message": e.message }));
                continue;
            }
        };
        let requested = match get_required_str(&entry_value, "status").and_then(|s| parse_status(&s))
        {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "studentId": student_id,
                    "code": e.code,
                    "message": e.message
                }));
                continue;
            }
        };
        let confidence = match parse_confidence(obj.get("confidence")) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "studentId": student_id,
                    "code": e.code,
                    "message": e.message
                }));
                continue;
            }
        };
        let note = match parse_note(obj.get("note")) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "studentId": student_id,
                    "code": e.code,
                    "message": e.message
                }));
                continue;
            }
        };

        let stored = classify_for_session(&session, requested, marked_at)?;
        match upsert_record(
            &tx,
            &session_id,
            &student_id,
            stored,
            &marked_at_ts,
            &actor.user_id,
            confidence,
            note.as_deref(),
        ) {
            Ok(_) => marked += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "studentId": student_id,
                "code": e.code,
                "message": e.message
            })),
        }
    }
    tx.commit().map_err(HandlerErr::db_commit)?;

    let rejected = errors.len();
    let mut result = json!({ "marked": marked });
    if rejected > 0 {
        let obj = result.as_object_mut().expect("result should be object");
        obj.insert("rejected".into(), json!(rejected));
        obj.insert("errors".into(), json!(errors));
    }
    Ok(result)
}

fn attendance_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let _ = load_session(conn, &session_id)?;

    let sql = format!(
        "SELECT {} FROM attendance_records WHERE session_id = ? ORDER BY student_id",
        RECORD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let records = stmt
        .query_map([&session_id], |r| row_to_record(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let records_json: Vec<serde_json::Value> = records.iter().map(|r| r.to_json()).collect();
    Ok(json!({ "records": records_json }))
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
        "attendance.mark" => Some(with_conn(state, req, attendance_mark)),
        "attendance.bulkMark" => Some(with_conn(state, req, attendance_bulk_mark)),
        "attendance.list" => Some(with_conn(state, req, attendance_list)),
        _ => None,
    }
}
