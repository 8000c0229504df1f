use crate::aggregate::{
    self, group_by_semester, GpaAccumulator, ResultRow, StudentIdentity,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Body lines per page, footer excluded. A new page starts when the
/// next line would not fit; continuation pages do not repeat table
/// headers.
const PAGE_BODY_LINES: usize = 54;
const PAGE_WIDTH: usize = 78;
const TITLE_COL_WIDTH: usize = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Transcript,
    ResultSheet,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Transcript => "transcript",
            DocumentKind::ResultSheet => "result_sheet",
        }
    }

    fn heading(self) -> &'static str {
        match self {
            DocumentKind::Transcript => "STUDENT ACADEMIC TRANSCRIPT",
            DocumentKind::ResultSheet => "SEMESTER RESULT SHEET",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentError {
    pub code: String,
    pub message: String,
}

impl DocumentError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentHeader {
    pub institution: String,
    pub department: String,
}

#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub kind: DocumentKind,
    pub text: String,
    pub page_count: usize,
}

struct Paginator {
    pages: Vec<Vec<String>>,
    current: Vec<String>,
}

impl Paginator {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            current: Vec::new(),
        }
    }

    fn push(&mut self, line: String) {
        if self.current.len() >= PAGE_BODY_LINES {
            self.pages.push(std::mem::take(&mut self.current));
        }
        self.current.push(line);
    }

    /// Keeps a block of `n` lines together on one page when possible.
    fn ensure_room(&mut self, n: usize) {
        if n <= PAGE_BODY_LINES && self.current.len() + n > PAGE_BODY_LINES {
            self.pages.push(std::mem::take(&mut self.current));
        }
    }

    fn finish(mut self) -> (String, usize) {
        if !self.current.is_empty() || self.pages.is_empty() {
            self.pages.push(self.current);
        }
        let total = self.pages.len();
        let mut out = String::new();
        for (i, page) in self.pages.iter().enumerate() {
            if i > 0 {
                out.push('\x0c');
            }
            for line in page {
                out.push_str(line);
                out.push('\n');
            }
            let footer = format!("Page {} of {}", i + 1, total);
            out.push_str(&format!("{:>width$}\n", footer, width = PAGE_WIDTH));
        }
        (out, total)
    }
}

fn centered(s: &str) -> String {
    let len = s.chars().count();
    if len >= PAGE_WIDTH {
        return s.to_string();
    }
    let pad = (PAGE_WIDTH - len) / 2;
    format!("{}{}", " ".repeat(pad), s)
}

fn rule() -> String {
    "-".repeat(PAGE_WIDTH)
}

fn truncate_title(title: &str) -> String {
    let mut out = String::new();
    for (i, ch) in title.chars().enumerate() {
        if i >= TITLE_COL_WIDTH {
            break;
        }
        out.push(ch);
    }
    out
}

fn table_header() -> String {
    format!(
        "{:<10} {:<42} {:>4} {:>5} {:>6}",
        "CODE", "COURSE TITLE", "UNIT", "GRADE", "POINT"
    )
}

fn table_row(row: &ResultRow) -> String {
    format!(
        "{:<10} {:<42} {:>4} {:>5} {:>6.1}",
        row.course_code,
        truncate_title(&row.course_title),
        row.credit_unit,
        row.grade.to_ascii_uppercase(),
        row.point
    )
}

fn push_front_matter(
    pager: &mut Paginator,
    header: &DocumentHeader,
    student: &StudentIdentity,
    kind: DocumentKind,
    generated_at: DateTime<Utc>,
) {
    pager.push(centered(&header.institution.to_ascii_uppercase()));
    pager.push(centered(&header.department));
    pager.push(centered(kind.heading()));
    pager.push(rule());
    pager.push(format!("Name:       {}", student.full_name));
    pager.push(format!("Matric No:  {}", student.matric_no));
    pager.push(format!("Level:      {}", student.level));
    pager.push(format!(
        "Issued:     {}",
        generated_at.format("%Y-%m-%d %H:%M UTC")
    ));
    pager.push(rule());
}

fn push_semester_table(pager: &mut Paginator, label: &str, rows: &[&ResultRow]) {
    // Keep the label, column header and first row together.
    pager.ensure_room(4);
    pager.push(String::new());
    pager.push(label.to_string());
    pager.push(table_header());

    let mut acc = GpaAccumulator::default();
    for row in rows {
        acc.add(row);
        pager.push(table_row(row));
    }
    pager.ensure_room(1);
    pager.push(format!(
        "Semester GPA: {:.2}  ({} units, {} courses)",
        aggregate::round2(acc.gpa()),
        acc.total_credits,
        acc.course_count
    ));
}

fn semester_label(session: &str, semester: aggregate::Semester) -> String {
    format!(
        "SESSION {}  {} SEMESTER",
        session,
        semester.as_str().to_ascii_uppercase()
    )
}

pub fn render_transcript(
    header: &DocumentHeader,
    student: &StudentIdentity,
    rows: &[ResultRow],
    generated_at: DateTime<Utc>,
) -> Result<RenderedDocument, DocumentError> {
    if rows.is_empty() {
        return Err(DocumentError::new(
            "no_results",
            "student has no results to render",
        ));
    }

    let mut pager = Paginator::new();
    push_front_matter(
        &mut pager,
        header,
        student,
        DocumentKind::Transcript,
        generated_at,
    );

    for (key, group) in group_by_semester(rows) {
        push_semester_table(
            &mut pager,
            &semester_label(&key.session, key.semester),
            &group,
        );
    }

    let summary = aggregate::cumulative_summary(rows);
    let carry = aggregate::carryovers(rows);
    pager.ensure_room(5);
    pager.push(String::new());
    pager.push(rule());
    pager.push(format!(
        "Total credit units: {}    Courses: {}",
        summary.total_credit_units, summary.course_count
    ));
    pager.push(format!("CGPA: {:.2}", aggregate::round2(summary.cgpa)));
    pager.push(format!(
        "Carryovers: {} ({} units)",
        carry.courses.len(),
        carry.total_credits
    ));

    let (text, page_count) = pager.finish();
    Ok(RenderedDocument {
        kind: DocumentKind::Transcript,
        text,
        page_count,
    })
}

pub fn render_result_sheet(
    header: &DocumentHeader,
    student: &StudentIdentity,
    session: &str,
    semester: aggregate::Semester,
    rows: &[ResultRow],
    generated_at: DateTime<Utc>,
) -> Result<RenderedDocument, DocumentError> {
    if rows.is_empty() {
        return Err(DocumentError::new(
            "no_results",
            format!("no results for {} {} semester", session, semester.as_str()),
        ));
    }

    let mut pager = Paginator::new();
    push_front_matter(
        &mut pager,
        header,
        student,
        DocumentKind::ResultSheet,
        generated_at,
    );

    let refs: Vec<&ResultRow> = rows.iter().collect();
    push_semester_table(&mut pager, &semester_label(session, semester), &refs);

    let (text, page_count) = pager.finish();
    Ok(RenderedDocument {
        kind: DocumentKind::ResultSheet,
        text,
        page_count,
    })
}

/// `{student_name_with_underscores}_{document_type}_{timestamp}.txt`
pub fn document_filename(full_name: &str, kind: DocumentKind, at: DateTime<Utc>) -> String {
    let mut name = String::new();
    for ch in full_name.trim().chars() {
        if ch.is_alphanumeric() || ch == '-' {
            name.push(ch);
        } else if ch.is_whitespace() || ch == '_' {
            if !name.ends_with('_') {
                name.push('_');
            }
        }
    }
    let name = name.trim_matches('_');
    let name = if name.is_empty() { "student" } else { name };
    format!(
        "{}_{}_{}.txt",
        name,
        kind.as_str(),
        at.format("%Y%m%d%H%M%S")
    )
}

/// Writes through a temp file and renames into place so a failed export
/// never leaves a partial file that looks complete.
pub fn write_document(dir: &Path, file_name: &str, text: &str) -> Result<PathBuf, DocumentError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| DocumentError::new("document_write_failed", e.to_string()))?;
    let final_path = dir.join(file_name);
    let tmp_path = dir.join(format!("{}.tmp", file_name));
    std::fs::write(&tmp_path, text)
        .map_err(|e| DocumentError::new("document_write_failed", e.to_string()))?;
    std::fs::rename(&tmp_path, &final_path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        DocumentError::new("document_write_failed", e.to_string())
    })?;
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Grade, Semester};
    use chrono::TimeZone;

    fn header() -> DocumentHeader {
        DocumentHeader {
            institution: "Federal Polytechnic".to_string(),
            department: "Department of Computer Science".to_string(),
        }
    }

    fn student() -> StudentIdentity {
        StudentIdentity {
            student_id: "sid-1".to_string(),
            matric_no: "FPN/CS/23/001".to_string(),
            full_name: "Ada Obi".to_string(),
            level: "ND1".to_string(),
        }
    }

    fn row(code: &str, unit: i64, grade: &str, semester: &str, session: &str) -> ResultRow {
        ResultRow {
            id: code.to_string(),
            course_code: code.to_string(),
            course_title: format!("Course {}", code),
            credit_unit: unit,
            grade: grade.to_string(),
            point: Grade::parse(grade).map(Grade::point).unwrap_or(0.0),
            semester: semester.to_string(),
            session: session.to_string(),
            level: "ND1".to_string(),
            is_carryover: grade.eq_ignore_ascii_case("F"),
        }
    }

    fn fixed_now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 5, 9, 30, 0).unwrap()
    }

    #[test]
    fn filename_convention_uses_underscores_and_timestamp() {
        let name = document_filename("Ada  Obi", DocumentKind::Transcript, fixed_now());
        assert_eq!(name, "Ada_Obi_transcript_20241105093000.txt");
        let sheet = document_filename("  ", DocumentKind::ResultSheet, fixed_now());
        assert_eq!(sheet, "student_result_sheet_20241105093000.txt");
    }

    #[test]
    fn transcript_contains_semester_tables_and_cumulative_block() {
        let rows = vec![
            row("COM101", 3, "B", "first", "2023/2024"),
            row("COM102", 2, "D", "first", "2023/2024"),
            row("COM201", 4, "A", "second", "2023/2024"),
        ];
        let doc = render_transcript(&header(), &student(), &rows, fixed_now()).expect("render");
        assert!(doc.text.contains("FEDERAL POLYTECHNIC"));
        assert!(doc.text.contains("SESSION 2023/2024  FIRST SEMESTER"));
        assert!(doc.text.contains("SESSION 2023/2024  SECOND SEMESTER"));
        assert!(doc.text.contains("Semester GPA: 3.20"));
        // (3*4 + 2*2 + 4*5) / 9 = 4.0
        assert!(doc.text.contains("CGPA: 4.00"));
        assert!(doc.text.contains("Carryovers: 0 (0 units)"));
        assert_eq!(doc.page_count, 1);
        assert!(doc.text.contains("Page 1 of 1"));
    }

    #[test]
    fn long_transcript_paginates_without_repeating_headers() {
        let mut rows = Vec::new();
        for session_idx in 0..3 {
            let session = format!("202{}/202{}", 3 + session_idx, 4 + session_idx);
            for sem in ["first", "second"] {
                for i in 0..15 {
                    rows.push(row(
                        &format!("COM{}{:02}", session_idx, i),
                        3,
                        "B",
                        sem,
                        &session,
                    ));
                }
            }
        }
        let doc = render_transcript(&header(), &student(), &rows, fixed_now()).expect("render");
        assert!(doc.page_count > 1, "expected pagination, got one page");
        assert!(doc
            .text
            .contains(&format!("Page 1 of {}", doc.page_count)));
        assert!(doc
            .text
            .contains(&format!("Page {} of {}", doc.page_count, doc.page_count)));
        assert_eq!(doc.text.matches('\x0c').count(), doc.page_count - 1);
        // Front matter appears once; it is not re-drawn on continuation pages.
        assert_eq!(doc.text.matches("FEDERAL POLYTECHNIC").count(), 1);
    }

    #[test]
    fn empty_history_is_a_generation_error() {
        let err = render_transcript(&header(), &student(), &[], fixed_now()).unwrap_err();
        assert_eq!(err.code, "no_results");
        let err = render_result_sheet(
            &header(),
            &student(),
            "2023/2024",
            Semester::First,
            &[],
            fixed_now(),
        )
        .unwrap_err();
        assert_eq!(err.code, "no_results");
    }

    #[test]
    fn result_sheet_renders_single_semester() {
        let rows = vec![
            row("COM101", 3, "A", "first", "2023/2024"),
            row("COM102", 2, "C", "first", "2023/2024"),
        ];
        let doc = render_result_sheet(
            &header(),
            &student(),
            "2023/2024",
            Semester::First,
            &rows,
            fixed_now(),
        )
        .expect("render");
        assert!(doc.text.contains("SEMESTER RESULT SHEET"));
        assert!(doc.text.contains("Semester GPA: 4.20"));
        assert!(!doc.text.contains("CGPA:"));
    }

    #[test]
    fn write_document_is_atomic_and_leaves_no_temp_file() {
        let dir = std::env::temp_dir().join(format!(
            "resultd-doc-test-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let path = write_document(&dir, "out.txt", "hello\n").expect("write");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "hello\n");
        assert!(!dir.join("out.txt.tmp").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
