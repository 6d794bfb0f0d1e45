use rusqlite::Connection;

pub const KIND_CHANGE_REQUEST_APPROVED: &str = "change_request.approved";
pub const KIND_CHANGE_REQUEST_REJECTED: &str = "change_request.rejected";
pub const KIND_LOW_ATTENDANCE_WARNING: &str = "low_attendance_warning";

/// Append one outbox row. Callers run this inside the same transaction as
/// the mutation the event reports; the surrounding system polls and delivers,
/// the core never pushes.
pub fn emit(
    conn: &Connection,
    kind: &str,
    recipient_id: &str,
    payload: &serde_json::Value,
    created_at: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO events(kind, recipient_id, payload, created_at)
         VALUES(?, ?, ?, ?)",
        (kind, recipient_id, payload.to_string(), created_at),
    )?;
    Ok(())
}
