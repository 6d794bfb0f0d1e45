use crate::calc::RecordStatus;
use crate::db;
use crate::events;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{fmt_ts, get_optional_str, get_required_str, now_utc, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::ipc::handlers::attendance::load_record;
use crate::ipc::handlers::sessions::{load_session, SessionRow};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::policy::Actor;

const REVIEW_NOTE_MAX_CHARS: usize = 500;

#[derive(Debug, Clone)]
struct ChangeRow {
    id: String,
    attendance_record_id: String,
    requested_by_id: String,
    requested_by_role: String,
    old_status: String,
    new_status: String,
    reason: String,
    status: String,
    reviewed_by_id: Option<String>,
    review_note: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl ChangeRow {
    fn is_pending(&self) -> bool {
        self.status == "pending"
    }

    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "attendanceRecordId": self.attendance_record_id,
            "requestedById": self.requested_by_id,
            "requestedByRole": self.requested_by_role,
            "oldStatus": self.old_status,
            "newStatus": self.new_status,
            "reason": self.reason,
            "status": self.status,
            "reviewedById": self.reviewed_by_id,
            "reviewNote": self.review_note,
            "createdAt": self.created_at,
            "resolvedAt": self.resolved_at
        })
    }
}

const CHANGE_COLUMNS: &str = "id, attendance_record_id, requested_by_id, requested_by_role,
    old_status, new_status, reason, status, reviewed_by_id, review_note, created_at, resolved_at";

fn row_to_change(r: &rusqlite::Row) -> rusqlite::Result<ChangeRow> {
    Ok(ChangeRow {
        id: r.get(0)?,
        attendance_record_id: r.get(1)?,
        requested_by_id: r.get(2)?,
        requested_by_role: r.get(3)?,
        old_status: r.get(4)?,
        new_status: r.get(5)?,
        reason: r.get(6)?,
        status: r.get(7)?,
        reviewed_by_id: r.get(8)?,
        review_note: r.get(9)?,
        created_at: r.get(10)?,
        resolved_at: r.get(11)?,
    })
}

fn load_request(conn: &Connection, request_id: &str) -> Result<ChangeRow, HandlerErr> {
    let sql = format!("SELECT {} FROM change_requests WHERE id = ?", CHANGE_COLUMNS);
    conn.query_row(&sql, [request_id], |r| row_to_change(r))
        .optional()
        .map_err(HandlerErr::db_query)?
        .ok_or_else(|| HandlerErr::not_found("change request not found"))
}

fn parse_review_note(params: &serde_json::Value) -> Result<Option<String>, HandlerErr> {
    let note = get_optional_str(params, "note")?;
    if let Some(n) = &note {
        if n.chars().count() > REVIEW_NOTE_MAX_CHARS {
            return Err(HandlerErr::bad_params(format!(
                "note length must be <= {}",
                REVIEW_NOTE_MAX_CHARS
            )));
        }
    }
    Ok(note)
}

fn resolution_events_enabled(conn: &Connection) -> Result<bool, HandlerErr> {
    let saved = db::settings_get_json(conn, "setup.notifications").map_err(HandlerErr::db_query)?;
    Ok(saved
        .as_ref()
        .and_then(|v| v.get("emitResolutionEvents"))
        .and_then(|v| v.as_bool())
        .unwrap_or(true))
}

/// Requester and the session's teacher both hear about a resolution, once
/// each even when they are the same user.
fn emit_resolution_events(
    conn: &Connection,
    kind: &str,
    request: &ChangeRow,
    session: &SessionRow,
    reviewer_id: &str,
    resolved_at: &str,
) -> Result<(), HandlerErr> {
    if !resolution_events_enabled(conn)? {
        return Ok(());
    }
    let payload = json!({
        "requestId": request.id,
        "recordId": request.attendance_record_id,
        "sessionId": session.id,
        "oldStatus": request.old_status,
        "newStatus": request.new_status,
        "reviewerId": reviewer_id
    });
    let mut recipients = vec![request.requested_by_id.as_str()];
    if session.teacher_id != request.requested_by_id {
        recipients.push(session.teacher_id.as_str());
    }
    for recipient in recipients {
        events::emit(conn, kind, recipient, &payload, resolved_at)
            .map_err(|e| HandlerErr::db_insert(e, "events"))?;
    }
    Ok(())
}

fn changes_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = Actor::from_params(params).map_err(HandlerErr::bad_params)?;
    let record_id = get_required_str(params, "recordId")?;
    let new_status_raw = get_required_str(params, "newStatus")?;
    let new_status = RecordStatus::parse(&new_status_raw)
        .ok_or_else(|| HandlerErr::bad_params("newStatus must be one of: present, absent, late"))?;
    let reason = params
        .get("reason")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params("reason must be a non-empty string"))?
        .to_string();

    let record = load_record(conn, &record_id)?;
    let session = load_session(conn, &record.session_id)?;
    if !actor.may_dispute_record(&record.student_id, &session.teacher_id) {
        return Err(HandlerErr::permission_denied(
            "only the record's student, the session's teacher or an admin may request a change",
        ));
    }
    if new_status.as_str() == record.status {
        return Err(HandlerErr::bad_params(
            "newStatus must differ from the record's current status",
        ));
    }

    let pending: Option<String> = conn
        .query_row(
            "SELECT id FROM change_requests
             WHERE attendance_record_id = ? AND status = 'pending'",
            [&record_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db_query)?;
    if let Some(request_id) = pending {
        return Err(HandlerErr::conflict(
            "a pending change request already exists for this record",
            Some(json!({ "requestId": request_id })),
        ));
    }

    let request = ChangeRow {
        id: Uuid::new_v4().to_string(),
        attendance_record_id: record_id,
        requested_by_id: actor.user_id.clone(),
        requested_by_role: actor.role.as_str().to_string(),
        // Snapshot of the record's status at creation time; approval applies
        // new_status regardless of later drift (last-approval-wins).
        old_status: record.status.clone(),
        new_status: new_status.as_str().to_string(),
        reason,
        status: "pending".to_string(),
        reviewed_by_id: None,
        review_note: None,
        created_at: fmt_ts(now_utc()),
        resolved_at: None,
    };
    conn.execute(
        "INSERT INTO change_requests(id, attendance_record_id, requested_by_id,
             requested_by_role, old_status, new_status, reason, status,
             reviewed_by_id, review_note, created_at, resolved_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &request.id,
            &request.attendance_record_id,
            &request.requested_by_id,
            &request.requested_by_role,
            &request.old_status,
            &request.new_status,
            &request.reason,
            &request.status,
            &request.reviewed_by_id,
            &request.review_note,
            &request.created_at,
            &request.resolved_at,
        ),
    )
    .map_err(|e| HandlerErr::db_insert(e, "change_requests"))?;

    Ok(json!({ "request": request.to_json() }))
}

fn load_review_context(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(Actor, ChangeRow, SessionRow), HandlerErr> {
    let actor = Actor::from_params(params).map_err(HandlerErr::bad_params)?;
    let request_id = get_required_str(params, "requestId")?;
    let request = load_request(conn, &request_id)?;
    let record = load_record(conn, &request.attendance_record_id)?;
    let session = load_session(conn, &record.session_id)?;

    if !request.is_pending() {
        return Err(HandlerErr::conflict(
            "change request is already resolved",
            Some(json!({ "status": request.status })),
        ));
    }
    if !actor.may_review_changes(&session.department_id) {
        return Err(HandlerErr::permission_denied(
            "only an hod of the session's department or an admin may resolve change requests",
        ));
    }
    Ok((actor, request, session))
}

fn changes_approve(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (actor, mut request, session) = load_review_context(conn, params)?;
    let note = parse_review_note(params)?;
    let resolved_at = fmt_ts(now_utc());

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    // The record may have drifted since the request snapshotted old_status.
    // Approval writes new_status regardless; the prior value is reported so
    // the caller can see the drift.
    let previous_status: String = tx
        .query_row(
            "SELECT status FROM attendance_records WHERE id = ?",
            [&request.attendance_record_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db_query)?;
    tx.execute(
        "UPDATE attendance_records SET status = ? WHERE id = ?",
        (&request.new_status, &request.attendance_record_id),
    )
    .map_err(|e| HandlerErr::db_update(e, "attendance_records"))?;
    tx.execute(
        "UPDATE change_requests
         SET status = 'approved', reviewed_by_id = ?, review_note = ?, resolved_at = ?
         WHERE id = ?",
        (&actor.user_id, &note, &resolved_at, &request.id),
    )
    .map_err(|e| HandlerErr::db_update(e, "change_requests"))?;

    request.status = "approved".to_string();
    request.reviewed_by_id = Some(actor.user_id.clone());
    request.review_note = note;
    request.resolved_at = Some(resolved_at.clone());

    emit_resolution_events(
        &tx,
        events::KIND_CHANGE_REQUEST_APPROVED,
        &request,
        &session,
        &actor.user_id,
        &resolved_at,
    )?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({
        "request": request.to_json(),
        "previousStatus": previous_status
    }))
}

fn changes_reject(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let (actor, mut request, session) = load_review_context(conn, params)?;
    let note = parse_review_note(params)?;
    let resolved_at = fmt_ts(now_utc());

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db_tx)?;
    tx.execute(
        "UPDATE change_requests
         SET status = 'rejected', reviewed_by_id = ?, review_note = ?, resolved_at = ?
         WHERE id = ?",
        (&actor.user_id, &note, &resolved_at, &request.id),
    )
    .map_err(|e| HandlerErr::db_update(e, "change_requests"))?;

    request.status = "rejected".to_string();
    request.reviewed_by_id = Some(actor.user_id.clone());
    request.review_note = note;
    request.resolved_at = Some(resolved_at.clone());

    emit_resolution_events(
        &tx,
        events::KIND_CHANGE_REQUEST_REJECTED,
        &request,
        &session,
        &actor.user_id,
        &resolved_at,
    )?;
    tx.commit().map_err(HandlerErr::db_commit)?;

    Ok(json!({ "request": request.to_json() }))
}

fn changes_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let request_id = get_required_str(params, "requestId")?;
    let request = load_request(conn, &request_id)?;
    Ok(json!({ "request": request.to_json() }))
}

fn changes_list_pending(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = Actor::from_params(params).map_err(HandlerErr::bad_params)?;
    if !actor.may_list_pending() {
        return Err(HandlerErr::permission_denied(
            "only hod and admin may list pending change requests",
        ));
    }
    let department_filter = match actor.role {
        crate::policy::Role::Admin => None,
        _ => Some(actor.department_id.clone().ok_or_else(|| {
            HandlerErr::permission_denied("hod actor requires a departmentId")
        })?),
    };

    let sql = format!(
        "SELECT {}, s.id, s.department_id
         FROM change_requests c
         JOIN attendance_records r ON r.id = c.attendance_record_id
         JOIN sessions s ON s.id = r.session_id
         WHERE c.status = 'pending'
         ORDER BY c.created_at, c.id",
        CHANGE_COLUMNS
            .split(',')
            .map(|col| format!("c.{}", col.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map([], |r| {
            let change = row_to_change(r)?;
            let session_id: String = r.get(12)?;
            let department_id: String = r.get(13)?;
            Ok((change, session_id, department_id))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let requests: Vec<serde_json::Value> = rows
        .iter()
        .filter(|(_, _, dept)| department_filter.as_deref().map_or(true, |d| dept == d))
        .map(|(change, session_id, department_id)| {
            let mut v = change.to_json();
            let obj = v.as_object_mut().expect("request json should be object");
            obj.insert("sessionId".into(), json!(session_id));
            obj.insert("departmentId".into(), json!(department_id));
            v
        })
        .collect();

    Ok(json!({ "requests": requests }))
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
        "changes.create" => Some(with_conn(state, req, changes_create)),
        "changes.approve" => Some(with_conn(state, req, changes_approve)),
        "changes.reject" => Some(with_conn(state, req, changes_reject)),
        "changes.get" => Some(with_conn(state, req, changes_get)),
        "changes.listPending" => Some(with_conn(state, req, changes_list_pending)),
        _ => None,
    }
}
