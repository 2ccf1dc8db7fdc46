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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campusrecd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusrecd");
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

fn create_user(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    params: serde_json::Value,
) -> String {
    let result = request_ok(stdin, reader, id, "users.create", params);
    result
        .get("userId")
        .and_then(|v| v.as_str())
        .expect("userId")
        .to_string()
}

#[test]
fn resubmit_after_rejection_resets_every_approval_field() {
    let workspace = temp_dir("campusrec-resubmit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let tutor_id = create_user(
        &mut stdin,
        &mut reader,
        "2",
        json!({ "fullName": "Meera Das", "email": "meera@campus.edu", "role": "tutor" }),
    );
    let student_id = create_user(
        &mut stdin,
        &mut reader,
        "3",
        json!({
            "fullName": "Vikram Rao",
            "email": "vikram@campus.edu",
            "role": "student",
            "tutorId": tutor_id
        }),
    );

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "records.submit",
        json!({
            "subjectUserId": student_id,
            "actorId": student_id,
            "kind": "project",
            "payload": {
                "title": "Campus Energy Dashboard",
                "description": "IoT meters with a live dashboard",
                "guide": "Dr. Shah"
            }
        }),
    );
    let record_id = submitted
        .pointer("/record/id")
        .and_then(|v| v.as_str())
        .expect("record id")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "records.resolve",
        json!({
            "recordId": record_id,
            "approverId": tutor_id,
            "decision": "reject",
            "comment": "Guide name does not match department records."
        }),
    );

    // Edit only the guide; everything else must survive the merge, and the
    // approval fields must reset no matter what changed.
    let resubmitted = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "records.resubmit",
        json!({
            "recordId": record_id,
            "actorId": student_id,
            "payload": { "guide": "Dr. Anita Shah" }
        }),
    );
    let record = resubmitted.get("record").expect("record");
    assert_eq!(record.get("pending").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        record.get("approvalStatus").and_then(|v| v.as_str()),
        Some("unresolved")
    );
    assert!(record.get("approverId").expect("approverId").is_null());
    assert!(record.get("approvedAt").expect("approvedAt").is_null());
    assert_eq!(
        record.pointer("/payload/title").and_then(|v| v.as_str()),
        Some("Campus Energy Dashboard")
    );
    assert_eq!(
        record.pointer("/payload/guide").and_then(|v| v.as_str()),
        Some("Dr. Anita Shah")
    );

    let fetched = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "records.get",
        json!({ "recordId": record_id }),
    );
    assert_eq!(
        fetched.pointer("/record/pending").and_then(|v| v.as_bool()),
        Some(true)
    );

    let pending = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "records.listPending",
        json!({ "approverId": tutor_id, "kind": "project" }),
    );
    assert_eq!(
        pending
            .get("records")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );
}

#[test]
fn resubmit_notifies_the_currently_assigned_tutor() {
    let workspace = temp_dir("campusrec-resubmit-reassign");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let first_tutor = create_user(
        &mut stdin,
        &mut reader,
        "2",
        json!({ "fullName": "Meera Das", "email": "meera@campus.edu", "role": "tutor" }),
    );
    let second_tutor = create_user(
        &mut stdin,
        &mut reader,
        "3",
        json!({ "fullName": "Rahul Iyer", "email": "rahul@campus.edu", "role": "tutor" }),
    );
    let student_id = create_user(
        &mut stdin,
        &mut reader,
        "4",
        json!({
            "fullName": "Vikram Rao",
            "email": "vikram@campus.edu",
            "role": "student",
            "tutorId": first_tutor
        }),
    );

    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "records.submit",
        json!({
            "subjectUserId": student_id,
            "actorId": student_id,
            "kind": "leave",
            "payload": {
                "reason": "Medical leave",
                "from_date": "2026-08-10",
                "to_date": "2026-08-14"
            }
        }),
    );
    let record_id = submitted
        .pointer("/record/id")
        .and_then(|v| v.as_str())
        .expect("record id")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "records.resolve",
        json!({ "recordId": record_id, "approverId": first_tutor, "decision": "reject" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "users.assignTutor",
        json!({ "userId": student_id, "tutorId": second_tutor }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "records.resubmit",
        json!({
            "recordId": record_id,
            "actorId": student_id,
            "payload": { "to_date": "2026-08-17" }
        }),
    );

    let outbox = request_ok(&mut stdin, &mut reader, "9", "outbox.list", json!({}));
    let notifications = outbox
        .get("notifications")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let last = notifications.last().expect("resubmit notification");
    assert_eq!(
        last.get("to").and_then(|v| v.as_str()),
        Some("rahul@campus.edu")
    );
    assert!(last
        .get("subject")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .contains("requires review"));
}
