use crate::ipc::error::{err, ok};
use crate::ipc::helpers::HandlerErr;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const POLL_DEFAULT_LIMIT: i64 = 100;
const POLL_MAX_LIMIT: i64 = 500;

/// Cursor read over the outbox. Polling never deletes; consumers resume
/// from the returned lastSeq.
fn events_poll(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let after_seq = match params.get("afterSeq") {
        None | Some(serde_json::Value::Null) => 0,
        Some(v) => v
            .as_i64()
            .filter(|n| *n >= 0)
            .ok_or_else(|| HandlerErr::bad_params("afterSeq must be a non-negative integer"))?,
    };
    let limit = match params.get("limit") {
        None | Some(serde_json::Value::Null) => POLL_DEFAULT_LIMIT,
        Some(v) => {
            let n = v
                .as_i64()
                .filter(|n| *n > 0)
                .ok_or_else(|| HandlerErr::bad_params("limit must be a positive integer"))?;
            n.min(POLL_MAX_LIMIT)
        }
    };

    let mut stmt = conn
        .prepare(
            "SELECT seq, kind, recipient_id, payload, created_at
             FROM events WHERE seq > ? ORDER BY seq LIMIT ?",
        )
        .map_err(HandlerErr::db_query)?;
    let rows = stmt
        .query_map((after_seq, limit), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db_query)?;

    let mut last_seq = after_seq;
    let events: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|(seq, kind, recipient_id, payload, created_at)| {
            last_seq = seq;
            let payload_json: serde_json::Value =
                serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null);
            json!({
                "seq": seq,
                "kind": kind,
                "recipientId": recipient_id,
                "payload": payload_json,
                "createdAt": created_at
            })
        })
        .collect();

    Ok(json!({ "events": events, "lastSeq": last_seq }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "events.poll" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match events_poll(conn, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(error) => error.response(&req.id),
            })
        }
        _ => None,
    }
}
