use crate::calc::{self, Breakdown, RecordStatus};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{fmt_ts, get_optional_str, get_optional_ts, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::ipc::handlers::sessions::load_session;
use rusqlite::Connection;
use serde_json::json;
use std::collections::BTreeMap;

const DEFAULT_LOW_ATTENDANCE_THRESHOLD: f64 = 75.0;

fn breakdown_json(b: &Breakdown) -> serde_json::Value {
    json!({
        "present": b.present,
        "absent": b.absent,
        "late": b.late,
        "total": b.total,
        "percentPresent": b.percent_present()
    })
}

fn statuses_to_breakdown(statuses: &[String]) -> Breakdown {
    calc::breakdown(statuses.iter().filter_map(|s| RecordStatus::parse(s)))
}

fn scope_exists(conn: &Connection, column: &str, id: &str) -> Result<bool, HandlerErr> {
    use rusqlite::OptionalExtension;
    let sql = format!("SELECT 1 FROM sessions WHERE {} = ? LIMIT 1", column);
    conn.query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::db_query)
}

fn stats_session_breakdown(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session_id = get_required_str(params, "sessionId")?;
    let _ = load_session(conn, &session_id)?;

    let mut stmt = conn
        .prepare("SELECT status FROM attendance_records WHERE session_id = ?")
        .map_err(HandlerErr::db_query)?;
    let statuses = stmt
        .query_map([&session_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    Ok(breakdown_json(&statuses_to_breakdown(&statuses)))
}

/// Breakdown over every session of one class or one department, with an
/// optional marked_at range. Recomputed from the ledger on each call.
fn scoped_breakdown(
    conn: &Connection,
    params: &serde_json::Value,
    scope_key: &str,
    scope_column: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let scope_id = get_required_str(params, scope_key)?;
    if !scope_exists(conn, scope_column, &scope_id)? {
        return Err(HandlerErr::not_found(format!("{} not found", scope_key)));
    }
    let from = get_optional_ts(params, "from")?.map(fmt_ts);
    let to = get_optional_ts(params, "to")?.map(fmt_ts);

    let mut sql = format!(
        "SELECT r.status FROM attendance_records r
         JOIN sessions s ON s.id = r.session_id
         WHERE s.{} = ?",
        scope_column
    );
    let mut args: Vec<&str> = vec![&scope_id];
    if let Some(f) = &from {
        sql.push_str(" AND r.marked_at >= ?");
        args.push(f);
    }
    if let Some(t) = &to {
        sql.push_str(" AND r.marked_at <= ?");
        args.push(t);
    }

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let statuses = stmt
        .query_map(rusqlite::params_from_iter(args), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut result = breakdown_json(&statuses_to_breakdown(&statuses));
    let obj = result.as_object_mut().expect("breakdown json should be object");
    obj.insert(scope_key.into(), json!(scope_id));
    Ok(result)
}

/// Per-student standing in a subject, counted over ended sessions only.
fn stats_student_subject(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let class_id = get_optional_str(params, "classId")?;
    if !scope_exists(conn, "subject_id", &subject_id)? {
        return Err(HandlerErr::not_found("subjectId not found"));
    }

    let mut held_sql =
        "SELECT COUNT(*) FROM sessions WHERE subject_id = ? AND status = 'ended'".to_string();
    let mut held_args: Vec<&str> = vec![&subject_id];
    if let Some(c) = &class_id {
        held_sql.push_str(" AND class_id = ?");
        held_args.push(c);
    }
    let sessions_held: i64 = conn
        .query_row(&held_sql, rusqlite::params_from_iter(held_args), |r| {
            r.get(0)
        })
        .map_err(HandlerErr::db_query)?;

    let mut sql = "SELECT r.status FROM attendance_records r
         JOIN sessions s ON s.id = r.session_id
         WHERE r.student_id = ? AND s.subject_id = ? AND s.status = 'ended'"
        .to_string();
    let mut args: Vec<&str> = vec![&student_id, &subject_id];
    if let Some(c) = &class_id {
        sql.push_str(" AND s.class_id = ?");
        args.push(c);
    }
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let statuses = stmt
        .query_map(rusqlite::params_from_iter(args), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let b = statuses_to_breakdown(&statuses);
    Ok(json!({
        "studentId": student_id,
        "subjectId": subject_id,
        "sessionsHeld": sessions_held,
        "present": b.present,
        "absent": b.absent,
        "late": b.late,
        "total": b.total,
        "percentPresent": b.percent_present(),
        "attendedPercent": b.attended_percent()
    }))
}

fn stats_low_attendance(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let subject_id = get_optional_str(params, "subjectId")?;
    let class_id = get_optional_str(params, "classId")?;
    let threshold = match params.get("threshold") {
        None | Some(serde_json::Value::Null) => {
            let saved =
                db::settings_get_json(conn, "setup.attendance").map_err(HandlerErr::db_query)?;
            saved
                .as_ref()
                .and_then(|v| v.get("lowAttendanceThresholdPercent"))
                .and_then(|v| v.as_f64())
                .unwrap_or(DEFAULT_LOW_ATTENDANCE_THRESHOLD)
        }
        Some(v) => {
            let t = v
                .as_f64()
                .ok_or_else(|| HandlerErr::bad_params("threshold must be a number"))?;
            if !(0.0..=100.0).contains(&t) {
                return Err(HandlerErr::bad_params("threshold must be in 0..=100"));
            }
            t
        }
    };

    let mut sql = "SELECT r.student_id, s.subject_id, r.status
         FROM attendance_records r
         JOIN sessions s ON s.id = r.session_id
         WHERE s.status = 'ended'"
        .to_string();
    let mut args: Vec<&str> = Vec::new();
    if let Some(sub) = &subject_id {
        sql.push_str(" AND s.subject_id = ?");
        args.push(sub);
    }
    if let Some(c) = &class_id {
        sql.push_str(" AND s.class_id = ?");
        args.push(c);
    }

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut groups: BTreeMap<(String, String), Breakdown> = BTreeMap::new();
    for (student, subject, status) in rows {
        if let Some(s) = RecordStatus::parse(&status) {
            groups.entry((student, subject)).or_default().add(s);
        }
    }

    let below: Vec<serde_json::Value> = groups
        .iter()
        .filter(|(_, b)| b.attended_percent() < threshold)
        .map(|((student, subject), b)| {
            json!({
                "studentId": student,
                "subjectId": subject,
                "present": b.present,
                "absent": b.absent,
                "late": b.late,
                "total": b.total,
                "attendedPercent": b.attended_percent()
            })
        })
        .collect();

    Ok(json!({ "thresholdPercent": threshold, "rows": below }))
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
        "stats.sessionBreakdown" => Some(with_conn(state, req, stats_session_breakdown)),
        "stats.classBreakdown" => Some(with_conn(state, req, |c, p| {
            scoped_breakdown(c, p, "classId", "class_id")
        })),
        "stats.departmentBreakdown" => Some(with_conn(state, req, |c, p| {
            scoped_breakdown(c, p, "departmentId", "department_id")
        })),
        "stats.studentSubject" => Some(with_conn(state, req, stats_student_subject)),
        "stats.lowAttendance" => Some(with_conn(state, req, stats_low_attendance)),
        _ => None,
    }
}
