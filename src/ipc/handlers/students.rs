use crate::aggregate;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
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

fn student_json(conn: &Connection, student_id: &str) -> Result<serde_json::Value, HandlerErr> {
    conn.query_row(
        "SELECT id, matric_no, last_name, first_name, level, active, sort_order
         FROM students
         WHERE id = ?",
        [student_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "matricNo": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "firstName": r.get::<_, String>(3)?,
                "level": r.get::<_, String>(4)?,
                "active": r.get::<_, i64>(5)? != 0,
                "sortOrder": r.get::<_, i64>(6)?,
            }))
        },
    )
    .optional()
    .map_err(HandlerErr::db)?
    .ok_or_else(|| HandlerErr::new("not_found", "student not found"))
}

fn matric_taken(
    conn: &Connection,
    matric_no: &str,
    exclude_id: Option<&str>,
) -> Result<bool, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE matric_no = ?",
            [matric_no],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    Ok(match existing {
        None => false,
        Some(id) => exclude_id != Some(id.as_str()),
    })
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let active_only = params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let mut stmt = conn
        .prepare(
            "SELECT id, matric_no, last_name, first_name, level, active, sort_order
             FROM students
             ORDER BY sort_order, matric_no",
        )
        .map_err(HandlerErr::db)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, i64>(5)? != 0,
                r.get::<_, i64>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let students: Vec<serde_json::Value> = rows
        .into_iter()
        .filter(|(_, _, _, _, _, active, _)| !active_only || *active)
        .map(|(id, matric, last, first, level, active, sort)| {
            json!({
                "id": id,
                "matricNo": matric,
                "lastName": last,
                "firstName": first,
                "level": level,
                "active": active,
                "sortOrder": sort,
            })
        })
        .collect();
    Ok(json!({ "students": students }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let matric_no = get_required_str(params, "matricNo")?;
    let last_name = get_required_str(params, "lastName")?;
    let first_name = get_required_str(params, "firstName")?;
    let level_raw = get_required_str(params, "level")?;
    let Some(level) = aggregate::parse_level(&level_raw) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("level must be one of: {}", aggregate::VALID_LEVELS.join(", ")),
            details: Some(json!({ "level": level_raw })),
        });
    };
    let active = params.get("active").and_then(|v| v.as_bool()).unwrap_or(true);

    if matric_taken(conn, &matric_no, None)? {
        return Err(HandlerErr {
            code: "duplicate_matric",
            message: "a student with this matric number already exists".to_string(),
            details: Some(json!({ "matricNo": matric_no })),
        });
    }

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students",
            [],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, matric_no, last_name, first_name, level, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &matric_no,
            &last_name,
            &first_name,
            &level,
            active as i64,
            next_sort,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(HandlerErr::db)?;

    student_json(conn, &id)
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    // Validate existence up front for a stable not_found.
    let _ = student_json(conn, &student_id)?;

    if let Some(v) = params.get("matricNo") {
        let Some(matric) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(HandlerErr::new("bad_params", "matricNo must be a non-empty string"));
        };
        if matric_taken(conn, matric, Some(student_id.as_str()))? {
            return Err(HandlerErr {
                code: "duplicate_matric",
                message: "a student with this matric number already exists".to_string(),
                details: Some(json!({ "matricNo": matric })),
            });
        }
        conn.execute(
            "UPDATE students SET matric_no = ? WHERE id = ?",
            (matric, &student_id),
        )
        .map_err(HandlerErr::db)?;
    }
    if let Some(v) = params.get("lastName") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(HandlerErr::new("bad_params", "lastName must be a non-empty string"));
        };
        conn.execute("UPDATE students SET last_name = ? WHERE id = ?", (s, &student_id))
            .map_err(HandlerErr::db)?;
    }
    if let Some(v) = params.get("firstName") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(HandlerErr::new("bad_params", "firstName must be a non-empty string"));
        };
        conn.execute("UPDATE students SET first_name = ? WHERE id = ?", (s, &student_id))
            .map_err(HandlerErr::db)?;
    }
    if let Some(v) = params.get("level") {
        let Some(level) = v.as_str().and_then(aggregate::parse_level) else {
            return Err(HandlerErr::new(
                "bad_params",
                format!("level must be one of: {}", aggregate::VALID_LEVELS.join(", ")),
            ));
        };
        conn.execute("UPDATE students SET level = ? WHERE id = ?", (level, &student_id))
            .map_err(HandlerErr::db)?;
    }
    if let Some(v) = params.get("active") {
        let Some(active) = v.as_bool() else {
            return Err(HandlerErr::new("bad_params", "active must be a boolean"));
        };
        conn.execute(
            "UPDATE students SET active = ? WHERE id = ?",
            (active as i64, &student_id),
        )
        .map_err(HandlerErr::db)?;
    }
    conn.execute(
        "UPDATE students SET updated_at = ? WHERE id = ?",
        (Utc::now().to_rfc3339(), &student_id),
    )
    .map_err(HandlerErr::db)?;

    student_json(conn, &student_id)
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let _ = student_json(conn, &student_id)?;

    let result_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM results WHERE student_id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;
    if result_count > 0 {
        return Err(HandlerErr {
            code: "has_results",
            message: "student has result rows; delete those first".to_string(),
            details: Some(json!({ "resultCount": result_count })),
        });
    }

    conn.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(HandlerErr::db)?;
    Ok(json!({ "deleted": true, "studentId": student_id }))
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
        "students.list" => Some(run(students_list)),
        "students.create" => Some(run(students_create)),
        "students.update" => Some(run(students_update)),
        "students.delete" => Some(run(students_delete)),
        _ => None,
    }
}
