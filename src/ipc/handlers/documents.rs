use crate::aggregate::{self, Semester};
use crate::document::{self, DocumentHeader, DocumentKind};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use std::path::{Path, PathBuf};

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn out_dir(state: &AppState, req: &Request) -> Result<PathBuf, serde_json::Value> {
    if let Some(dir) = req.params.get("outDir").and_then(|v| v.as_str()) {
        return Ok(PathBuf::from(dir));
    }
    // Default next to the workspace database.
    state
        .workspace
        .as_ref()
        .map(|w| w.join("exports"))
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn doc_header(conn: &Connection) -> DocumentHeader {
    let (institution, department) = setup::identity_section(conn);
    DocumentHeader {
        institution,
        department,
    }
}

fn export_response(
    req: &Request,
    kind: DocumentKind,
    dir: &Path,
    rendered: document::RenderedDocument,
    full_name: &str,
    generated_at: chrono::DateTime<Utc>,
) -> serde_json::Value {
    let file_name = document::document_filename(full_name, kind, generated_at);
    match document::write_document(dir, &file_name, &rendered.text) {
        Ok(path) => ok(
            &req.id,
            json!({
                "fileName": file_name,
                "path": path.to_string_lossy(),
                "documentType": kind.as_str(),
                "pageCount": rendered.page_count,
                "generatedAt": generated_at.to_rfc3339(),
            }),
        ),
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

fn handle_generate_transcript(state: &mut AppState, req: &Request) -> serde_json::Value {
    let dir = match out_dir(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
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
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };
    let rows = match aggregate::load_results(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };

    let generated_at = Utc::now();
    let rendered = match document::render_transcript(&doc_header(conn), &student, &rows, generated_at)
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };

    export_response(
        req,
        DocumentKind::Transcript,
        &dir,
        rendered,
        &student.full_name,
        generated_at,
    )
}

fn handle_generate_result_sheet(state: &mut AppState, req: &Request) -> serde_json::Value {
    let dir = match out_dir(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let session = match required_str(req, "session") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let semester_raw = match required_str(req, "semester") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(semester) = Semester::parse(&semester_raw) else {
        return err(
            &req.id,
            "bad_params",
            "semester must be one of: first, second",
            None,
        );
    };

    let student = match aggregate::load_student(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };
    let rows = match aggregate::load_results(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };
    let selected: Vec<aggregate::ResultRow> = rows
        .into_iter()
        .filter(|r| {
            r.session == session && Semester::parse(&r.semester) == Some(semester)
        })
        .collect();

    let generated_at = Utc::now();
    let rendered = match document::render_result_sheet(
        &doc_header(conn),
        &student,
        &session,
        semester,
        &selected,
        generated_at,
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, None),
    };

    export_response(
        req,
        DocumentKind::ResultSheet,
        &dir,
        rendered,
        &student.full_name,
        generated_at,
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "documents.generateTranscript" => Some(handle_generate_transcript(state, req)),
        "documents.generateResultSheet" => Some(handle_generate_result_sheet(state, req)),
        _ => None,
    }
}
