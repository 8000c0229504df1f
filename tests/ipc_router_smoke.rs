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
    let exe = env!("CARGO_BIN_EXE_resultd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultd");
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

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn router_covers_handler_families_and_rejects_unknown_methods() {
    let workspace = temp_dir("resultd-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert!(health["result"]["version"].as_str().is_some());
    assert!(health["result"]["workspacePath"].is_null());

    // Data methods before a workspace is selected fail uniformly.
    for (i, method) in [
        "students.list",
        "results.list",
        "performance.summary",
        "setup.get",
        "imports.validateResults",
    ]
    .iter()
    .enumerate()
    {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("pre-{}", i),
            method,
            json!({ "studentId": "x" }),
        );
        assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
        assert_eq!(error_code(&resp), "no_workspace", "method {}", method);
    }

    let selected = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(selected.get("ok").and_then(|v| v.as_bool()), Some(true));

    let setup = request(&mut stdin, &mut reader, "3", "setup.get", json!({}));
    assert_eq!(
        setup["result"]["institutionName"].as_str(),
        Some("Federal Polytechnic")
    );

    let updated = request(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "institutionName": "Kano State Polytechnic" }),
    );
    assert_eq!(
        updated["result"]["institutionName"].as_str(),
        Some("Kano State Polytechnic")
    );
    let setup_again = request(&mut stdin, &mut reader, "5", "setup.get", json!({}));
    assert_eq!(
        setup_again["result"]["institutionName"].as_str(),
        Some("Kano State Polytechnic")
    );
    assert_eq!(
        setup_again["result"]["departmentName"].as_str(),
        Some("Department of Computer Science")
    );

    let unknown = request(&mut stdin, &mut reader, "6", "grades.remit", json!({}));
    assert_eq!(unknown.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&unknown), "not_implemented");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn workspace_reopen_preserves_data() {
    let workspace = temp_dir("resultd-reopen");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({
            "matricNo": "FPN/CS/23/010",
            "lastName": "Bello",
            "firstName": "Sani",
            "level": "ND1",
        }),
    );
    assert_eq!(created.get("ok").and_then(|v| v.as_bool()), Some(true));
    drop(stdin);
    let _ = child.wait();

    let (mut child2, mut stdin2, mut reader2) = spawn_sidecar();
    let _ = request(
        &mut stdin2,
        &mut reader2,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let listed = request(&mut stdin2, &mut reader2, "2", "students.list", json!({}));
    let students = listed["result"]["students"].as_array().expect("students");
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["matricNo"].as_str(), Some("FPN/CS/23/010"));
    drop(stdin2);
    let _ = child2.wait();
}
