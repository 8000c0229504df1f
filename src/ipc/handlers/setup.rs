use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

const IDENTITY_KEY: &str = "setup.identity";

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn identity_section(conn: &Connection) -> (String, String) {
    let section = db::settings_get_json(conn, IDENTITY_KEY)
        .ok()
        .flatten()
        .unwrap_or_else(|| json!({}));
    let institution = section
        .get("institutionName")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("Federal Polytechnic")
        .to_string();
    let department = section
        .get("departmentName")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("Department of Computer Science")
        .to_string();
    (institution, department)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (institution, department) = identity_section(conn);
    ok(
        &req.id,
        json!({
            "institutionName": institution,
            "departmentName": department,
            "gradingScale": "5-point (A=5.0 .. F=0.0)",
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(obj) = req.params.as_object() else {
        return err(&req.id, "bad_params", "params must be an object", None);
    };

    let (mut institution, mut department) = identity_section(conn);
    if let Some(v) = obj.get("institutionName") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(
                &req.id,
                "bad_params",
                "institutionName must be a non-empty string",
                None,
            );
        };
        institution = s.to_string();
    }
    if let Some(v) = obj.get("departmentName") {
        let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return err(
                &req.id,
                "bad_params",
                "departmentName must be a non-empty string",
                None,
            );
        };
        department = s.to_string();
    }

    let section = json!({
        "institutionName": institution,
        "departmentName": department,
    });
    if let Err(e) = db::settings_set_json(conn, IDENTITY_KEY, &section) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, section)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
