use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_daemon() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rollcalld");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rollcalld");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("rollcall-router-smoke");
    let bundle_out = workspace.join("smoke-backup.zip");

    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health.get("status").and_then(|v| v.as_str()), Some("ok"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let setup = request_ok(&mut stdin, &mut reader, "3", "setup.get", json!({}));
    assert!(setup.get("attendance").is_some());
    assert!(setup.get("notifications").is_some());

    let teacher = json!({ "userId": "t-1", "role": "teacher" });
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "sessions.start",
        json!({
            "actor": teacher,
            "classId": "c-1",
            "subjectId": "sub-math",
            "departmentId": "d-math"
        }),
    );
    let session_id = started
        .get("session")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("session id")
        .to_string();

    let active = request_ok(&mut stdin, &mut reader, "5", "sessions.listActive", json!({}));
    assert_eq!(
        active
            .get("sessions")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "attendance.mark",
        json!({
            "actor": teacher,
            "sessionId": session_id,
            "studentId": "s-42",
            "status": "present"
        }),
    );
    let record_id = marked
        .get("record")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("record id")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.list",
        json!({ "sessionId": session_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "stats.sessionBreakdown",
        json!({ "sessionId": session_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "sessions.end",
        json!({ "actor": teacher, "sessionId": session_id }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "changes.create",
        json!({
            "actor": { "userId": "s-42", "role": "student" },
            "recordId": record_id,
            "newStatus": "absent",
            "reason": "smoke test dispute"
        }),
    );
    let request_id = created
        .get("request")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("request id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "changes.get",
        json!({ "requestId": request_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "changes.listPending",
        json!({ "actor": { "userId": "a-1", "role": "admin" } }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "changes.reject",
        json!({
            "actor": { "userId": "a-1", "role": "admin" },
            "requestId": request_id
        }),
    );

    let polled = request_ok(&mut stdin, &mut reader, "14", "events.poll", json!({}));
    assert!(polled.get("events").and_then(|v| v.as_array()).is_some());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );

    // Unknown methods fall through the router to not_implemented.
    writeln!(
        stdin,
        "{}",
        json!({ "id": "16", "method": "nonsense.method.check", "params": {} })
    )
    .expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let unknown: serde_json::Value =
        serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(unknown.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        unknown
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
