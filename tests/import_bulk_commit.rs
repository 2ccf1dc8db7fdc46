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

const BATCH: &str = "role,full_name,email,register_no,program,year_of_study,tutor_email\n\
    tutor,Noor Fatima,noor@campus.edu,,,,\n\
    student,Ana Lee,ana@campus.edu,R1,CSE,2,noor@campus.edu\n\
    student,Ben Roy,ben@campus.edu,R2,CSE,2,noor@campus.edu\n\
    student,Cara Jo,cara@campus.edu,R3,ECE,3,priya@campus.edu\n\
    student,Dia Sen,dia@campus.edu,R4,ECE,3,priya@campus.edu\n";

#[test]
fn clean_batch_commits_users_profiles_and_assignments_as_one_unit() {
    let workspace = temp_dir("campusrec-import-commit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let admin_id = create_user(
        &mut stdin,
        &mut reader,
        "2",
        json!({ "fullName": "Registrar", "email": "registrar@campus.edu", "role": "admin" }),
    );
    let _ = create_user(
        &mut stdin,
        &mut reader,
        "3",
        json!({ "fullName": "Priya Nair", "email": "priya@campus.edu", "role": "tutor" }),
    );

    let artifact = workspace.join("batch.csv");
    std::fs::write(&artifact, BATCH).expect("write artifact");

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "import.bulk",
        json!({ "artifactPath": artifact.to_string_lossy(), "actorId": admin_id }),
    );
    assert_eq!(imported.get("processed").and_then(|v| v.as_u64()), Some(5));
    assert_eq!(imported.get("totalRows").and_then(|v| v.as_u64()), Some(5));
    assert_eq!(
        imported
            .get("duplicates")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );
    assert!(imported
        .get("artifactDigest")
        .and_then(|v| v.as_str())
        .map(|d| d.len() == 64)
        .unwrap_or(false));
    assert!(!artifact.exists(), "artifact must be removed after success");

    // 2 seeded + 1 imported tutor + 4 imported students.
    let users = request_ok(&mut stdin, &mut reader, "5", "users.list", json!({}));
    let users = users
        .get("users")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(users.len(), 7);

    // A student from the batch got a detail row and a resolved tutor link,
    // including the tutor that arrived in the same batch.
    let ana = users
        .iter()
        .find(|u| u.get("email").and_then(|v| v.as_str()) == Some("ana@campus.edu"))
        .expect("imported student");
    let noor = users
        .iter()
        .find(|u| u.get("email").and_then(|v| v.as_str()) == Some("noor@campus.edu"))
        .expect("imported tutor");
    assert_eq!(
        ana.get("tutorId").and_then(|v| v.as_str()),
        noor.get("id").and_then(|v| v.as_str())
    );

    let ana_id = ana.get("id").and_then(|v| v.as_str()).expect("id");
    let detail = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "users.get",
        json!({ "userId": ana_id }),
    );
    assert_eq!(
        detail.pointer("/profile/registerNo").and_then(|v| v.as_str()),
        Some("R1")
    );
    assert_eq!(
        detail.pointer("/profile/program").and_then(|v| v.as_str()),
        Some("CSE")
    );

    // Submitting against the imported assignment works end to end.
    let submitted = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "records.submit",
        json!({
            "subjectUserId": ana_id,
            "actorId": ana_id,
            "kind": "achievement",
            "payload": {
                "title": "Best paper award",
                "description": "Department symposium",
                "achieved_on": "2026-01-22"
            }
        }),
    );
    assert_eq!(
        submitted.pointer("/record/pending").and_then(|v| v.as_bool()),
        Some(true)
    );

    // Replaying the same batch now trips the store-duplicate guard for every
    // row, which doubles as proof the first commit landed.
    std::fs::write(&artifact, BATCH).expect("rewrite artifact");
    let replay = request(
        &mut stdin,
        &mut reader,
        "8",
        "import.bulk",
        json!({ "artifactPath": artifact.to_string_lossy(), "actorId": admin_id }),
    );
    assert_eq!(
        replay.pointer("/error/code").and_then(|v| v.as_str()),
        Some("conflict")
    );
    let dups = replay
        .pointer("/error/details/duplicates")
        .and_then(|v| v.as_array())
        .map(|a| a.len());
    assert_eq!(dups, Some(5));
}
