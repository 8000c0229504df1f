use crate::aggregate::{self, Grade, Semester};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, ToSql};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

fn result_json(row: &aggregate::ResultRow, student_id: &str) -> serde_json::Value {
    json!({
        "id": row.id,
        "studentId": student_id,
        "courseCode": row.course_code,
        "courseTitle": row.course_title,
        "creditUnit": row.credit_unit,
        "grade": row.grade,
        "point": row.point,
        "semester": row.semester,
        "session": row.session,
        "level": row.level,
        "isCarryover": row.is_carryover,
    })
}

fn results_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    let session = params
        .get("session")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let semester = match params.get("semester").and_then(|v| v.as_str()) {
        None => None,
        Some(raw) => match Semester::parse(raw) {
            Some(s) => Some(s),
            None => {
                return Err(HandlerErr::new(
                    "bad_params",
                    "semester must be one of: first, second",
                ))
            }
        },
    };

    let mut sql = String::from(
        "SELECT id, course_code, course_title, credit_unit, grade, point,
                semester, session, level, is_carryover
         FROM results
         WHERE student_id = ?",
    );
    let mut binds: Vec<&dyn ToSql> = vec![&student_id];
    if let Some(ref s) = session {
        sql.push_str(" AND session = ?");
        binds.push(s);
    }
    let semester_str = semester.map(|s| s.as_str().to_string());
    if let Some(ref s) = semester_str {
        sql.push_str(" AND semester = ?");
        binds.push(s);
    }
    sql.push_str(" ORDER BY session, semester, course_code");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map(&binds[..], |r| {
            Ok(aggregate::ResultRow {
                id: r.get(0)?,
                course_code: r.get(1)?,
                course_title: r.get(2)?,
                credit_unit: r.get(3)?,
                grade: r.get(4)?,
                point: r.get(5)?,
                semester: r.get(6)?,
                session: r.get(7)?,
                level: r.get(8)?,
                is_carryover: r.get::<_, i64>(9)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let out: Vec<serde_json::Value> = rows.iter().map(|r| result_json(r, &student_id)).collect();
    Ok(json!({ "results": out }))
}

fn results_upsert(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    let course_code = get_required_str(params, "courseCode")?.to_ascii_uppercase();
    let course_title = get_required_str(params, "courseTitle")?;
    let session = get_required_str(params, "session")?;

    let Some(credit_unit) = params.get("creditUnit").and_then(|v| v.as_i64()).filter(|n| *n > 0)
    else {
        return Err(HandlerErr::new(
            "bad_params",
            "creditUnit must be a positive integer",
        ));
    };
    let grade_raw = get_required_str(params, "grade")?;
    let Some(grade) = Grade::parse(&grade_raw) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "grade must be one of: A, B, C, D, E, F".to_string(),
            details: Some(json!({ "grade": grade_raw })),
        });
    };
    let semester_raw = get_required_str(params, "semester")?;
    let Some(semester) = Semester::parse(&semester_raw) else {
        return Err(HandlerErr::new(
            "bad_params",
            "semester must be one of: first, second",
        ));
    };
    let level_raw = get_required_str(params, "level")?;
    let Some(level) = aggregate::parse_level(&level_raw) else {
        return Err(HandlerErr::new(
            "bad_params",
            format!("level must be one of: {}", aggregate::VALID_LEVELS.join(", ")),
        ));
    };

    // Point is always derived from the grade; storing an independent
    // point invites the scale drift the migration exists to undo.
    let point = grade.point();
    let is_carryover = grade.is_fail();
    let id = Uuid::new_v4().to_string();

    conn.execute(
        "INSERT INTO results(id, student_id, course_code, course_title, credit_unit,
                             grade, point, semester, session, level, is_carryover, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_code, session, semester) DO UPDATE SET
             course_title = excluded.course_title,
             credit_unit = excluded.credit_unit,
             grade = excluded.grade,
             point = excluded.point,
             level = excluded.level,
             is_carryover = excluded.is_carryover,
             updated_at = excluded.updated_at",
        (
            &id,
            &student_id,
            &course_code,
            &course_title,
            credit_unit,
            grade.letter(),
            point,
            semester.as_str(),
            &session,
            &level,
            is_carryover as i64,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(HandlerErr::db)?;

    let stored: String = conn
        .query_row(
            "SELECT id FROM results
             WHERE student_id = ? AND course_code = ? AND session = ? AND semester = ?",
            (&student_id, &course_code, &session, semester.as_str()),
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;

    Ok(json!({
        "id": stored,
        "studentId": student_id,
        "courseCode": course_code,
        "courseTitle": course_title,
        "creditUnit": credit_unit,
        "grade": grade.letter(),
        "point": point,
        "semester": semester.as_str(),
        "session": session,
        "level": level,
        "isCarryover": is_carryover,
    }))
}

fn results_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let result_id = get_required_str(params, "resultId")?;
    let affected = conn
        .execute("DELETE FROM results WHERE id = ?", [&result_id])
        .map_err(HandlerErr::db)?;
    if affected == 0 {
        return Err(HandlerErr::new("not_found", "result not found"));
    }
    Ok(json!({ "deleted": true, "resultId": result_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run = |f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>| {
        let conn = match db_conn(state) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        match f(conn, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        }
    };

    match req.method.as_str() {
        "results.list" => Some(run(results_list)),
        "results.upsert" => Some(run(results_upsert)),
        "results.delete" => Some(run(results_delete)),
        _ => None,
    }
}
