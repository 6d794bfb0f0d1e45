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

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error object")
}

fn setup_session(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "setup-ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let started = request_ok(
        stdin,
        reader,
        "setup-session",
        "sessions.start",
        json!({
            "actor": { "userId": "t-1", "role": "teacher" },
            "classId": "c-1",
            "subjectId": "sub-math",
            "departmentId": "d-math",
            "gracePeriodMinutes": 30
        }),
    );
    started
        .get("session")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("session id")
        .to_string()
}

#[test]
fn bad_entries_are_rejected_individually() {
    let workspace = temp_dir("rollcall-bulk-partial");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let session_id = setup_session(&mut stdin, &mut reader, &workspace);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.bulkMark",
        json!({
            "actor": { "userId": "t-1", "role": "teacher" },
            "sessionId": session_id,
            "entries": [
                { "studentId": "s-1", "status": "present" },
                { "studentId": "s-2", "status": "excused" },
                { "status": "present" },
                "not-an-object",
                { "studentId": "s-3", "status": "absent", "confidence": 2.0 },
                { "studentId": "s-4", "status": "late" }
            ]
        }),
    );

    assert_eq!(result.get("marked").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(result.get("rejected").and_then(|v| v.as_i64()), Some(4));
    let errors = result
        .get("errors")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let indices: Vec<i64> = errors
        .iter()
        .filter_map(|e| e.get("index").and_then(|v| v.as_i64()))
        .collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
    assert_eq!(
        errors[0].get("studentId").and_then(|v| v.as_str()),
        Some("s-2")
    );
    assert!(errors
        .iter()
        .all(|e| e.get("code").and_then(|v| v.as_str()) == Some("bad_params")));

    // Only the accepted entries landed.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.list",
        json!({ "sessionId": session_id }),
    );
    let students: Vec<&str> = listed
        .get("records")
        .and_then(|v| v.as_array())
        .expect("records")
        .iter()
        .filter_map(|r| r.get("studentId").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(students, vec!["s-1", "s-4"]);

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn clean_batch_reports_only_the_marked_count() {
    let workspace = temp_dir("rollcall-bulk-clean");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let session_id = setup_session(&mut stdin, &mut reader, &workspace);

    let entries: Vec<serde_json::Value> = (0..40)
        .map(|i| json!({ "studentId": format!("s-{}", i), "status": "present" }))
        .collect();
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.bulkMark",
        json!({
            "actor": { "userId": "t-1", "role": "teacher" },
            "sessionId": session_id,
            "entries": entries
        }),
    );
    assert_eq!(result.get("marked").and_then(|v| v.as_i64()), Some(40));
    assert!(result.get("rejected").is_none());
    assert!(result.get("errors").is_none());

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn oversized_payload_is_rejected_wholesale() {
    let workspace = temp_dir("rollcall-bulk-oversize");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let session_id = setup_session(&mut stdin, &mut reader, &workspace);

    let entries: Vec<serde_json::Value> = (0..501)
        .map(|i| json!({ "studentId": format!("s-{}", i), "status": "present" }))
        .collect();
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.bulkMark",
        json!({
            "actor": { "userId": "t-1", "role": "teacher" },
            "sessionId": session_id,
            "entries": entries
        }),
    );
    assert_eq!(result.get("marked").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(result.get("rejected").and_then(|v| v.as_i64()), Some(501));
    assert_eq!(result.get("limitExceeded").and_then(|v| v.as_bool()), Some(true));
    let errors = result
        .get("errors")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].get("index").and_then(|v| v.as_i64()), Some(-1));
    assert_eq!(
        errors[0].get("code").and_then(|v| v.as_str()),
        Some("too_many_entries")
    );

    // Nothing was written.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.list",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(
        listed.get("records").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn batch_preconditions_fail_the_whole_call() {
    let workspace = temp_dir("rollcall-bulk-preconditions");
    let (mut child, mut stdin, mut reader) = spawn_daemon();
    let session_id = setup_session(&mut stdin, &mut reader, &workspace);

    let foreign = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.bulkMark",
        json!({
            "actor": { "userId": "t-2", "role": "teacher" },
            "sessionId": session_id,
            "entries": [{ "studentId": "s-1", "status": "present" }]
        }),
    );
    assert_eq!(
        foreign.get("code").and_then(|v| v.as_str()),
        Some("permission_denied")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "sessions.end",
        json!({ "actor": { "userId": "t-1", "role": "teacher" }, "sessionId": session_id }),
    );
    let ended = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.bulkMark",
        json!({
            "actor": { "userId": "t-1", "role": "teacher" },
            "sessionId": session_id,
            "entries": [{ "studentId": "s-1", "status": "present" }]
        }),
    );
    assert_eq!(ended.get("code").and_then(|v| v.as_str()), Some("conflict"));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(workspace);
}
