use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

#[path = "../src/backup.rs"]
mod backup;

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

#[test]
fn export_and_import_preserve_the_database_bytes() {
    let src_workspace = temp_dir("rollcall-bundle-src");
    let dst_workspace = temp_dir("rollcall-bundle-dst");
    let bundle = src_workspace.join("out").join("backup.zip");

    let db_bytes = b"sqlite-stand-in bytes for the bundle roundtrip".to_vec();
    std::fs::write(src_workspace.join("rollcall.sqlite3"), &db_bytes).expect("seed db file");

    let export =
        backup::export_workspace_bundle(&src_workspace, &bundle).expect("export bundle");
    assert_eq!(export.bundle_format, "rollcall-workspace-v1");
    assert_eq!(export.entry_count, 3);
    assert_eq!(export.db_sha256.len(), 64);

    let import =
        backup::import_workspace_bundle(&bundle, &dst_workspace).expect("import bundle");
    assert_eq!(import.bundle_format_detected, "rollcall-workspace-v1");
    let restored = std::fs::read(dst_workspace.join("rollcall.sqlite3")).expect("restored db");
    assert_eq!(restored, db_bytes);

    let _ = std::fs::remove_dir_all(src_workspace);
    let _ = std::fs::remove_dir_all(dst_workspace);
}

#[test]
fn import_rejects_a_tampered_bundle() {
    let src_workspace = temp_dir("rollcall-bundle-tampered-src");
    let dst_workspace = temp_dir("rollcall-bundle-tampered-dst");
    let bundle = src_workspace.join("tampered.zip");

    // Hand-built bundle whose manifest checksum does not match the payload.
    let file = std::fs::File::create(&bundle).expect("create bundle file");
    let mut zip = zip::ZipWriter::new(file);
    let opts = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    zip.start_file("manifest.json", opts).expect("manifest entry");
    zip.write_all(
        json!({
            "format": "rollcall-workspace-v1",
            "version": 1,
            "dbSha256": "0000000000000000000000000000000000000000000000000000000000000000"
        })
        .to_string()
        .as_bytes(),
    )
    .expect("write manifest");
    zip.start_file("db/rollcall.sqlite3", opts).expect("db entry");
    zip.write_all(b"payload that does not match the manifest")
        .expect("write db entry");
    zip.finish().expect("finish zip");

    let error = backup::import_workspace_bundle(&bundle, &dst_workspace)
        .expect_err("tampered bundle must be refused");
    assert!(
        error.to_string().contains("checksum mismatch"),
        "unexpected error: {}",
        error
    );
    assert!(!dst_workspace.join("rollcall.sqlite3").exists());

    let _ = std::fs::remove_dir_all(src_workspace);
    let _ = std::fs::remove_dir_all(dst_workspace);
}

#[test]
fn import_rejects_an_unknown_bundle_format() {
    let src_workspace = temp_dir("rollcall-bundle-format-src");
    let dst_workspace = temp_dir("rollcall-bundle-format-dst");
    let bundle = src_workspace.join("foreign.zip");

    let file = std::fs::File::create(&bundle).expect("create bundle file");
    let mut zip = zip::ZipWriter::new(file);
    let opts = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    zip.start_file("manifest.json", opts).expect("manifest entry");
    zip.write_all(json!({ "format": "someone-elses-backup-v9" }).to_string().as_bytes())
        .expect("write manifest");
    zip.finish().expect("finish zip");

    let error = backup::import_workspace_bundle(&bundle, &dst_workspace)
        .expect_err("foreign bundle must be refused");
    assert!(
        error.to_string().contains("unsupported bundle format"),
        "unexpected error: {}",
        error
    );

    let _ = std::fs::remove_dir_all(src_workspace);
    let _ = std::fs::remove_dir_all(dst_workspace);
}

#[test]
fn raw_sqlite_files_import_without_a_manifest() {
    let src_workspace = temp_dir("rollcall-bundle-raw-src");
    let dst_workspace = temp_dir("rollcall-bundle-raw-dst");
    let raw = src_workspace.join("plain-backup.sqlite3");

    let db_bytes = b"SQLite format 3\0 stand-in".to_vec();
    std::fs::write(&raw, &db_bytes).expect("seed raw file");

    let import =
        backup::import_workspace_bundle(&raw, &dst_workspace).expect("import raw file");
    assert_eq!(import.bundle_format_detected, "raw-sqlite3");
    let restored = std::fs::read(dst_workspace.join("rollcall.sqlite3")).expect("restored db");
    assert_eq!(restored, db_bytes);

    let _ = std::fs::remove_dir_all(src_workspace);
    let _ = std::fs::remove_dir_all(dst_workspace);
}

// Daemon-level roundtrip: session data written in one workspace survives
// export, import into a fresh workspace, and reads back over IPC.
#[test]
fn daemon_roundtrip_restores_sessions_in_a_new_workspace() {
    let src_workspace = temp_dir("rollcall-ipc-roundtrip-src");
    let dst_workspace = temp_dir("rollcall-ipc-roundtrip-dst");
    let bundle = src_workspace.join("bundle.zip");
    let (mut child, mut stdin, mut reader) = spawn_daemon();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": src_workspace.to_string_lossy() }),
    );
    let started = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "sessions.start",
        json!({
            "actor": { "userId": "t-1", "role": "teacher" },
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
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.mark",
        json!({
            "actor": { "userId": "t-1", "role": "teacher" },
            "sessionId": session_id,
            "studentId": "s-42",
            "status": "present"
        }),
    );

    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        exported.get("bundleFormat").and_then(|v| v.as_str()),
        Some("rollcall-workspace-v1")
    );
    assert_eq!(exported.get("entryCount").and_then(|v| v.as_i64()), Some(3));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "workspace.select",
        json!({ "path": dst_workspace.to_string_lossy() }),
    );
    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        imported.get("bundleFormatDetected").and_then(|v| v.as_str()),
        Some("rollcall-workspace-v1")
    );

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "sessions.get",
        json!({ "sessionId": session_id }),
    );
    assert_eq!(
        fetched
            .get("session")
            .and_then(|v| v.get("id"))
            .and_then(|v| v.as_str()),
        Some(session_id.as_str())
    );
    assert_eq!(fetched.get("markedCount").and_then(|v| v.as_i64()), Some(1));

    let _ = child.kill();
    let _ = std::fs::remove_dir_all(src_workspace);
    let _ = std::fs::remove_dir_all(dst_workspace);
}
