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

struct Harness {
    _child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Harness {
    fn new(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, mut stdin, mut reader) = spawn_sidecar();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "ws",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        Self {
            _child: child,
            stdin,
            reader,
            next_id: 1,
        }
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = format!("{}", self.next_id);
        self.next_id += 1;
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn call_raw(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = format!("{}", self.next_id);
        self.next_id += 1;
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn create_student(&mut self, matric: &str) -> String {
        let created = self.call(
            "students.create",
            json!({
                "matricNo": matric,
                "lastName": "Obi",
                "firstName": "Ada",
                "level": "ND1",
            }),
        );
        created["id"].as_str().expect("student id").to_string()
    }

    fn add_result(
        &mut self,
        student_id: &str,
        code: &str,
        unit: i64,
        grade: &str,
        semester: &str,
        session: &str,
    ) {
        let _ = self.call(
            "results.upsert",
            json!({
                "studentId": student_id,
                "courseCode": code,
                "courseTitle": format!("Course {}", code),
                "creditUnit": unit,
                "grade": grade,
                "semester": semester,
                "session": session,
                "level": "ND1",
            }),
        );
    }
}

#[test]
fn semester_gpa_is_the_credit_weighted_average() {
    let mut h = Harness::new("resultd-gpa");
    let sid = h.create_student("FPN/CS/23/001");
    // units 3 and 2, points 5.0 (A) and 3.0 (C): (15 + 6) / 5 = 4.2
    h.add_result(&sid, "COM101", 3, "A", "first", "2023/2024");
    h.add_result(&sid, "COM102", 2, "C", "first", "2023/2024");

    let summary = h.call("performance.summary", json!({ "studentId": sid }));
    let semesters = summary["semesters"].as_array().expect("semesters");
    assert_eq!(semesters.len(), 1);
    assert_eq!(semesters[0]["gpa"].as_f64(), Some(4.2));
    assert_eq!(semesters[0]["totalCredits"].as_i64(), Some(5));
    assert_eq!(semesters[0]["courseCount"].as_i64(), Some(2));
    assert_eq!(summary["cumulative"]["cgpa"].as_f64(), Some(4.2));
}

#[test]
fn new_semester_changes_cgpa_but_not_earlier_semester_gpa() {
    let mut h = Harness::new("resultd-cgpa-history");
    let sid = h.create_student("FPN/CS/23/002");
    h.add_result(&sid, "COM101", 3, "B", "first", "2023/2024");
    h.add_result(&sid, "COM102", 2, "D", "first", "2023/2024");

    let before = h.call("performance.summary", json!({ "studentId": sid }));
    let first_gpa_before = before["semesters"][0]["gpa"].as_f64().expect("gpa");
    assert_eq!(first_gpa_before, 3.2);

    h.add_result(&sid, "COM201", 4, "A", "second", "2023/2024");
    let after = h.call("performance.summary", json!({ "studentId": sid }));
    assert_eq!(after["semesters"][0]["gpa"].as_f64(), Some(first_gpa_before));
    // (3*4 + 2*2 + 4*5) / 9 = 4.0
    assert_eq!(after["cumulative"]["cgpa"].as_f64(), Some(4.0));
    assert_eq!(after["cumulative"]["totalCreditUnits"].as_i64(), Some(9));
}

#[test]
fn carryovers_list_failing_courses_with_credit_sum() {
    let mut h = Harness::new("resultd-carryovers");
    let sid = h.create_student("FPN/CS/23/003");
    h.add_result(&sid, "COM101", 3, "A", "first", "2023/2024");
    h.add_result(&sid, "COM102", 2, "F", "first", "2023/2024");
    h.add_result(&sid, "COM103", 4, "C", "first", "2023/2024");

    let carry = h.call("performance.carryovers", json!({ "studentId": sid }));
    let courses = carry["courses"].as_array().expect("courses");
    assert_eq!(courses.len(), 1);
    assert_eq!(courses[0]["courseCode"].as_str(), Some("COM102"));
    assert_eq!(carry["totalCredits"].as_i64(), Some(2));

    // No carryovers is a success payload with an empty list.
    let sid2 = h.create_student("FPN/CS/23/004");
    h.add_result(&sid2, "COM101", 3, "B", "first", "2023/2024");
    let none = h.call("performance.carryovers", json!({ "studentId": sid2 }));
    assert_eq!(none["courses"].as_array().map(|a| a.len()), Some(0));
    assert_eq!(none["totalCredits"].as_i64(), Some(0));
}

#[test]
fn trend_is_chronological_with_running_cgpa() {
    let mut h = Harness::new("resultd-trend");
    let sid = h.create_student("FPN/CS/23/005");
    // Inserted out of order on purpose.
    h.add_result(&sid, "COM301", 2, "B", "first", "2024/2025");
    h.add_result(&sid, "COM201", 3, "C", "second", "2023/2024");
    h.add_result(&sid, "COM101", 3, "A", "first", "2023/2024");

    let trend = h.call("performance.trend", json!({ "studentId": sid }));
    let points = trend["points"].as_array().expect("points");
    assert_eq!(points.len(), 3);
    assert_eq!(points[0]["session"].as_str(), Some("2023/2024"));
    assert_eq!(points[0]["semester"].as_str(), Some("first"));
    assert_eq!(points[1]["semester"].as_str(), Some("second"));
    assert_eq!(points[2]["session"].as_str(), Some("2024/2025"));

    assert_eq!(points[0]["gpa"].as_f64(), Some(5.0));
    assert_eq!(points[1]["gpa"].as_f64(), Some(3.0));
    assert_eq!(points[2]["gpa"].as_f64(), Some(4.0));
    // Running CGPA over 6 units then 8 units: 24/6 = 4.0, 32/8 = 4.0
    assert_eq!(points[1]["runningCgpa"].as_f64(), Some(4.0));
    assert_eq!(points[2]["runningCgpa"].as_f64(), Some(4.0));
}

#[test]
fn grade_distribution_counts_letters() {
    let mut h = Harness::new("resultd-distribution");
    let sid = h.create_student("FPN/CS/23/006");
    h.add_result(&sid, "COM101", 3, "A", "first", "2023/2024");
    h.add_result(&sid, "COM102", 2, "A", "first", "2023/2024");
    h.add_result(&sid, "COM103", 2, "F", "first", "2023/2024");

    let summary = h.call("performance.summary", json!({ "studentId": sid }));
    let dist = &summary["cumulative"]["gradeDistribution"];
    assert_eq!(dist["A"].as_i64(), Some(2));
    assert_eq!(dist["F"].as_i64(), Some(1));
    assert!(dist.get("B").is_none());
    assert_eq!(summary["carryoverCount"].as_i64(), Some(1));
}

#[test]
fn upsert_rejects_bad_fields_and_replaces_on_same_key() {
    let mut h = Harness::new("resultd-upsert");
    let sid = h.create_student("FPN/CS/23/007");

    let bad_grade = h.call_raw(
        "results.upsert",
        json!({
            "studentId": sid,
            "courseCode": "COM101",
            "courseTitle": "Intro",
            "creditUnit": 3,
            "grade": "G",
            "semester": "first",
            "session": "2023/2024",
            "level": "ND1",
        }),
    );
    assert_eq!(bad_grade["ok"].as_bool(), Some(false));
    assert_eq!(bad_grade["error"]["code"].as_str(), Some("bad_params"));

    let bad_unit = h.call_raw(
        "results.upsert",
        json!({
            "studentId": sid,
            "courseCode": "COM101",
            "courseTitle": "Intro",
            "creditUnit": 0,
            "grade": "A",
            "semester": "first",
            "session": "2023/2024",
            "level": "ND1",
        }),
    );
    assert_eq!(bad_unit["ok"].as_bool(), Some(false));

    h.add_result(&sid, "COM101", 3, "D", "first", "2023/2024");
    h.add_result(&sid, "COM101", 3, "A", "first", "2023/2024");
    let results = h.call("results.list", json!({ "studentId": sid }));
    let rows = results["results"].as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["grade"].as_str(), Some("A"));
    assert_eq!(rows[0]["point"].as_f64(), Some(5.0));
    assert_eq!(rows[0]["isCarryover"].as_bool(), Some(false));
}

#[test]
fn student_delete_is_guarded_by_results() {
    let mut h = Harness::new("resultd-delete-guard");
    let sid = h.create_student("FPN/CS/23/008");
    h.add_result(&sid, "COM101", 3, "A", "first", "2023/2024");

    let blocked = h.call_raw("students.delete", json!({ "studentId": sid }));
    assert_eq!(blocked["ok"].as_bool(), Some(false));
    assert_eq!(blocked["error"]["code"].as_str(), Some("has_results"));

    let results = h.call("results.list", json!({ "studentId": sid }));
    let result_id = results["results"][0]["id"].as_str().expect("id").to_string();
    let _ = h.call("results.delete", json!({ "resultId": result_id }));
    let deleted = h.call("students.delete", json!({ "studentId": sid }));
    assert_eq!(deleted["deleted"].as_bool(), Some(true));
}

#[test]
fn duplicate_matric_is_rejected() {
    let mut h = Harness::new("resultd-dup-matric");
    let _ = h.create_student("FPN/CS/23/009");
    let dup = h.call_raw(
        "students.create",
        json!({
            "matricNo": "FPN/CS/23/009",
            "lastName": "Umar",
            "firstName": "Zain",
            "level": "ND2",
        }),
    );
    assert_eq!(dup["ok"].as_bool(), Some(false));
    assert_eq!(dup["error"]["code"].as_str(), Some("duplicate_matric"));
}
