use crate::aggregate::{self, round2, PerfError};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn perf_err(req: &Request, e: PerfError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, None)
}

fn handle_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let model = match aggregate::compute_student_performance(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return perf_err(req, e),
    };

    // Full precision internally; round once at the wire boundary.
    let semesters: Vec<serde_json::Value> = model
        .semesters
        .iter()
        .map(|s| {
            json!({
                "session": s.session,
                "semester": s.semester,
                "gpa": round2(s.gpa),
                "totalCredits": s.total_credits,
                "courseCount": s.course_count,
                "skippedRows": s.skipped_rows,
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "student": model.student,
            "semesters": semesters,
            "cumulative": {
                "cgpa": round2(model.cumulative.cgpa),
                "totalCreditUnits": model.cumulative.total_credit_units,
                "courseCount": model.cumulative.course_count,
                "gradeDistribution": model.cumulative.grade_distribution,
                "skippedRows": model.cumulative.skipped_rows,
            },
            "carryoverCount": model.carryover_count,
            "carryoverCredits": model.carryover_credits,
        }),
    )
}

fn handle_trend(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student = match aggregate::load_student(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return perf_err(req, e),
    };
    let rows = match aggregate::load_results(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return perf_err(req, e),
    };

    // Chronological series for charts. Per-semester GPA and the running
    // CGPA both come off the same grouped rows, at full precision.
    let mut running = aggregate::GpaAccumulator::default();
    let mut points: Vec<serde_json::Value> = Vec::new();
    for (key, group) in aggregate::group_by_semester(&rows) {
        let mut term = aggregate::GpaAccumulator::default();
        for row in &group {
            term.add(row);
            running.add(row);
        }
        points.push(json!({
            "session": key.session,
            "semester": key.semester.as_str(),
            "gpa": round2(term.gpa()),
            "runningCgpa": round2(running.gpa()),
        }));
    }

    ok(&req.id, json!({ "student": student, "points": points }))
}

fn handle_carryovers(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let student = match aggregate::load_student(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return perf_err(req, e),
    };
    let rows = match aggregate::load_results(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return perf_err(req, e),
    };

    let set = aggregate::carryovers(&rows);
    let courses: Vec<serde_json::Value> = set
        .courses
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "courseCode": r.course_code,
                "courseTitle": r.course_title,
                "creditUnit": r.credit_unit,
                "grade": r.grade,
                "semester": r.semester,
                "session": r.session,
            })
        })
        .collect();

    // An empty list is the success state, not an error.
    ok(
        &req.id,
        json!({
            "student": student,
            "courses": courses,
            "totalCredits": set.total_credits,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "performance.summary" => Some(handle_summary(state, req)),
        "performance.trend" => Some(handle_trend(state, req)),
        "performance.carryovers" => Some(handle_carryovers(state, req)),
        _ => None,
    }
}
