use crate::aggregate::{self, Grade, Semester};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const DEFAULT_CHUNK_SIZE: usize = 100;

pub const TEMPLATE_COLUMNS: [&str; 8] = [
    "matric_number",
    "course_code",
    "course_title",
    "credit_unit",
    "grade",
    "semester",
    "level",
    "session",
];

#[derive(Debug)]
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

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn non_empty_trimmed(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[derive(Debug, Clone)]
struct ValidatedRow {
    row_no: usize,
    matric_no: String,
    course_code: String,
    course_title: String,
    credit_unit: i64,
    grade: Grade,
    semester: Semester,
    level: String,
    session: String,
}

#[derive(Debug, Clone)]
struct RowError {
    row_no: usize,
    field: &'static str,
    message: String,
}

impl RowError {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "row": self.row_no,
            "field": self.field,
            "message": self.message,
        })
    }
}

fn matric_index(conn: &Connection) -> Result<HashMap<String, String>, HandlerErr> {
    // Prefetched once so every row's foreign key is checked before any
    // insert happens.
    let mut stmt = conn
        .prepare("SELECT matric_no, id FROM students")
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(rows
        .into_iter()
        .map(|(matric, id)| (matric.trim().to_ascii_uppercase(), id))
        .collect())
}

/// Validates a whole CSV batch. Row numbers are 1-indexed counting the
/// header, so the first data row reports as row 2.
fn validate_csv(
    text: &str,
    known_matrics: &HashMap<String, String>,
) -> Result<(Vec<ValidatedRow>, Vec<RowError>, usize), HandlerErr> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() || lines[0].trim().is_empty() {
        return Err(HandlerErr::new("bad_csv", "csv is empty"));
    }

    let header_fields = parse_csv_record(lines[0])
        .into_iter()
        .map(|s| s.trim().to_ascii_lowercase())
        .collect::<Vec<_>>();
    let mut idx = HashMap::<String, usize>::new();
    for (i, f) in header_fields.iter().enumerate() {
        idx.insert(f.clone(), i);
    }

    let matric_col = idx
        .get("matric_number")
        .or_else(|| idx.get("student_matric_number"))
        .copied();
    let mut missing: Vec<&str> = Vec::new();
    if matric_col.is_none() {
        missing.push("matric_number");
    }
    for col in &TEMPLATE_COLUMNS[1..] {
        if !idx.contains_key(*col) {
            missing.push(col);
        }
    }
    if !missing.is_empty() {
        return Err(HandlerErr {
            code: "bad_csv",
            message: "csv is missing required columns".to_string(),
            details: Some(json!({ "missingColumns": missing })),
        });
    }
    let matric_col = matric_col.unwrap_or(0);
    let col = |name: &str| idx.get(name).copied().unwrap_or(0);

    let mut rows: Vec<ValidatedRow> = Vec::new();
    let mut errors: Vec<RowError> = Vec::new();
    let mut seen: HashSet<(String, String, String, String)> = HashSet::new();
    let mut total = 0usize;

    for (line_idx, raw_line) in lines.iter().enumerate().skip(1) {
        if raw_line.trim().is_empty() {
            continue;
        }
        total += 1;
        let row_no = line_idx + 1;
        let fields = parse_csv_record(raw_line);
        let field = |i: usize| fields.get(i).map(|s| s.as_str()).unwrap_or("");
        let before = errors.len();

        let matric_no = match non_empty_trimmed(field(matric_col)) {
            Some(v) => {
                let key = v.to_ascii_uppercase();
                if !known_matrics.contains_key(&key) {
                    errors.push(RowError {
                        row_no,
                        field: "matric_number",
                        message: format!("no student with matric number {}", v),
                    });
                }
                key
            }
            None => {
                errors.push(RowError {
                    row_no,
                    field: "matric_number",
                    message: "matric_number is required".to_string(),
                });
                String::new()
            }
        };

        let course_code = match non_empty_trimmed(field(col("course_code"))) {
            Some(v) => v.to_ascii_uppercase(),
            None => {
                errors.push(RowError {
                    row_no,
                    field: "course_code",
                    message: "course_code is required".to_string(),
                });
                String::new()
            }
        };

        let course_title = match non_empty_trimmed(field(col("course_title"))) {
            Some(v) => v,
            None => {
                errors.push(RowError {
                    row_no,
                    field: "course_title",
                    message: "course_title is required".to_string(),
                });
                String::new()
            }
        };

        let credit_unit = match field(col("credit_unit")).trim().parse::<i64>() {
            Ok(n) if n > 0 => n,
            _ => {
                errors.push(RowError {
                    row_no,
                    field: "credit_unit",
                    message: "credit_unit must be a positive integer".to_string(),
                });
                0
            }
        };

        let grade = match Grade::parse(field(col("grade"))) {
            Some(g) => g,
            None => {
                errors.push(RowError {
                    row_no,
                    field: "grade",
                    message: "valid grade (A, B, C, D, E, F) required".to_string(),
                });
                Grade::F
            }
        };

        let semester = match Semester::parse(field(col("semester"))) {
            Some(s) => s,
            None => {
                errors.push(RowError {
                    row_no,
                    field: "semester",
                    message: "semester must be one of: first, second".to_string(),
                });
                Semester::First
            }
        };

        let level = match aggregate::parse_level(field(col("level"))) {
            Some(l) => l,
            None => {
                errors.push(RowError {
                    row_no,
                    field: "level",
                    message: format!(
                        "level must be one of: {}",
                        aggregate::VALID_LEVELS.join(", ")
                    ),
                });
                String::new()
            }
        };

        let session = match non_empty_trimmed(field(col("session"))) {
            Some(v) => v,
            None => {
                errors.push(RowError {
                    row_no,
                    field: "session",
                    message: "session is required".to_string(),
                });
                String::new()
            }
        };

        if errors.len() > before {
            continue;
        }

        let dup_key = (
            matric_no.clone(),
            course_code.clone(),
            session.clone(),
            semester.as_str().to_string(),
        );
        if !seen.insert(dup_key) {
            errors.push(RowError {
                row_no,
                field: "course_code",
                message: "duplicate course for this student, session and semester in batch"
                    .to_string(),
            });
            continue;
        }

        rows.push(ValidatedRow {
            row_no,
            matric_no,
            course_code,
            course_title,
            credit_unit,
            grade,
            semester,
            level,
            session,
        });
    }

    Ok((rows, errors, total))
}

fn csv_input(req: &Request) -> Result<String, HandlerErr> {
    if let Some(text) = req.params.get("csvText").and_then(|v| v.as_str()) {
        return Ok(text.to_string());
    }
    if let Some(path) = req.params.get("csvPath").and_then(|v| v.as_str()) {
        return std::fs::read_to_string(path)
            .map_err(|e| HandlerErr::new("read_failed", format!("{}: {}", path, e)));
    }
    Err(HandlerErr::new(
        "bad_params",
        "provide csvText or csvPath",
    ))
}

fn validation_report(rows: usize, total: usize, errors: &[RowError]) -> serde_json::Value {
    json!({
        "valid": errors.is_empty(),
        "totalRows": total,
        "validRows": rows,
        "errorCount": errors.len(),
        "errors": errors.iter().map(RowError::to_json).collect::<Vec<_>>(),
    })
}

fn handle_template_csv(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing outPath", None),
    };

    let mut csv = TEMPLATE_COLUMNS.join(",");
    csv.push('\n');
    let samples = [
        [
            "FPN/CS/23/001",
            "COM101",
            "Introduction to Computing",
            "3",
            "A",
            "first",
            "ND1",
            "2023/2024",
        ],
        [
            "FPN/CS/23/001",
            "MTH102",
            "Algebra and Trigonometry",
            "2",
            "B",
            "second",
            "ND1",
            "2023/2024",
        ],
    ];
    for sample in &samples {
        let line = sample
            .iter()
            .map(|f| csv_quote(f))
            .collect::<Vec<_>>()
            .join(",");
        csv.push_str(&line);
        csv.push('\n');
    }

    match std::fs::write(&out_path, &csv) {
        Ok(()) => ok(
            &req.id,
            json!({ "path": out_path, "sampleRows": samples.len() }),
        ),
        Err(e) => err(&req.id, "export_failed", e.to_string(), None),
    }
}

fn handle_validate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let text = match csv_input(req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let matrics = match matric_index(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match validate_csv(&text, &matrics) {
        Ok((rows, errors, total)) => ok(&req.id, validation_report(rows.len(), total, &errors)),
        Err(e) => e.response(&req.id),
    }
}

fn handle_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let text = match csv_input(req) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let chunk_size = req
        .params
        .get("chunkSize")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_CHUNK_SIZE);

    let matrics = match matric_index(conn) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let (rows, errors, total) = match validate_csv(&text, &matrics) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // All-or-nothing: any row error rejects the whole batch before a
    // single insert runs.
    if !errors.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            format!("{} of {} rows failed validation; nothing imported", errors.len(), total),
            Some(validation_report(rows.len(), total, &errors)),
        );
    }

    // Chunked sequentially for request-size parity with the hosted
    // backend; a failed chunk aborts the remainder and reports exactly
    // how far the import got.
    let mut inserted = 0usize;
    let now = Utc::now().to_rfc3339();
    for chunk in rows.chunks(chunk_size) {
        let tx = match conn.unchecked_transaction() {
            Ok(v) => v,
            Err(e) => {
                return err(
                    &req.id,
                    "partial_insert",
                    e.to_string(),
                    Some(json!({
                        "insertedRows": inserted,
                        "remainingRows": rows.len() - inserted,
                    })),
                )
            }
        };
        let mut chunk_failed: Option<rusqlite::Error> = None;
        for row in chunk {
            let student_id = match matrics.get(&row.matric_no) {
                Some(v) => v,
                None => continue, // matric existence already checked in validate_csv
            };
            let res = tx.execute(
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
                    Uuid::new_v4().to_string(),
                    student_id,
                    &row.course_code,
                    &row.course_title,
                    row.credit_unit,
                    row.grade.letter(),
                    row.grade.point(),
                    row.semester.as_str(),
                    &row.session,
                    &row.level,
                    row.grade.is_fail() as i64,
                    &now,
                ),
            );
            if let Err(e) = res {
                chunk_failed = Some(e);
                break;
            }
        }

        let commit_result = match chunk_failed {
            Some(e) => Err(e),
            None => tx.commit(),
        };
        match commit_result {
            Ok(()) => inserted += chunk.len(),
            Err(e) => {
                return err(
                    &req.id,
                    "partial_insert",
                    format!("import aborted after {} rows: {}", inserted, e),
                    Some(json!({
                        "insertedRows": inserted,
                        "remainingRows": rows.len() - inserted,
                    })),
                );
            }
        }
    }

    ok(
        &req.id,
        json!({
            "insertedRows": inserted,
            "totalRows": total,
            "chunkSize": chunk_size,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "imports.templateCsv" => Some(handle_template_csv(state, req)),
        "imports.validateResults" => Some(handle_validate(state, req)),
        "imports.importResults" => Some(handle_import(state, req)),
        _ => None,
    }
}
