use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("resultdesk.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            matric_no TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            level TEXT NOT NULL,
            active INTEGER NOT NULL,
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_matric ON students(matric_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            course_code TEXT NOT NULL,
            course_title TEXT NOT NULL,
            credit_unit INTEGER NOT NULL,
            grade TEXT NOT NULL,
            point REAL NOT NULL,
            semester TEXT NOT NULL,
            session TEXT NOT NULL,
            level TEXT NOT NULL,
            is_carryover INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, course_code, session, semester)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_student ON results(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_student_session ON results(student_id, session, semester)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    // Existing workspaces may predate the carryover flag. Add and backfill if needed.
    ensure_results_is_carryover(&conn)?;
    ensure_students_updated_at(&conn)?;

    // Migrate older workspaces to the unified 5-point grading scale:
    // some stored points on a 4-point scale (A=4.0 .. F=0.0). The grade
    // letter is authoritative, so recompute point wherever it disagrees.
    migrate_result_points(&conn)?;

    Ok(conn)
}

fn ensure_results_is_carryover(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "results", "is_carryover")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE results ADD COLUMN is_carryover INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    conn.execute(
        "UPDATE results SET is_carryover = 1 WHERE UPPER(grade) = 'F'",
        [],
    )?;
    Ok(())
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn migrate_result_points(conn: &Connection) -> anyhow::Result<()> {
    // 5-point scale: A=5, B=4, C=3, D=2, E=1, F=0.
    conn.execute(
        "UPDATE results SET point =
            CASE UPPER(grade)
                WHEN 'A' THEN 5.0
                WHEN 'B' THEN 4.0
                WHEN 'C' THEN 3.0
                WHEN 'D' THEN 2.0
                WHEN 'E' THEN 1.0
                WHEN 'F' THEN 0.0
                ELSE point
            END
         WHERE UPPER(grade) IN ('A','B','C','D','E','F')
           AND point <> CASE UPPER(grade)
                WHEN 'A' THEN 5.0
                WHEN 'B' THEN 4.0
                WHEN 'C' THEN 3.0
                WHEN 'D' THEN 2.0
                WHEN 'E' THEN 1.0
                ELSE 0.0
            END",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        None => Ok(None),
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
