use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;

/// Institutional 5-point grading scale. The grade letter is the source
/// of truth; stored point values that disagree are rescaled on open
/// (see db::migrate_result_points).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Grade {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl Grade {
    pub fn parse(s: &str) -> Option<Grade> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Grade::A),
            "B" => Some(Grade::B),
            "C" => Some(Grade::C),
            "D" => Some(Grade::D),
            "E" => Some(Grade::E),
            "F" => Some(Grade::F),
            _ => None,
        }
    }

    pub fn point(self) -> f64 {
        match self {
            Grade::A => 5.0,
            Grade::B => 4.0,
            Grade::C => 3.0,
            Grade::D => 2.0,
            Grade::E => 1.0,
            Grade::F => 0.0,
        }
    }

    pub fn letter(self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::E => "E",
            Grade::F => "F",
        }
    }

    pub fn is_fail(self) -> bool {
        matches!(self, Grade::F)
    }
}

pub const MAX_POINT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Semester {
    First,
    Second,
}

impl Semester {
    pub fn parse(s: &str) -> Option<Semester> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "1" => Some(Semester::First),
            "second" | "2" => Some(Semester::Second),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Semester::First => "first",
            Semester::Second => "second",
        }
    }
}

pub const VALID_LEVELS: [&str; 4] = ["ND1", "ND2", "HND1", "HND2"];

pub fn parse_level(s: &str) -> Option<String> {
    let t = s.trim().to_ascii_uppercase();
    VALID_LEVELS.iter().find(|l| **l == t).map(|l| l.to_string())
}

/// Display rounding only. Aggregation keeps full precision; values are
/// rounded once, at the IPC/document boundary.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone)]
pub struct ResultRow {
    pub id: String,
    pub course_code: String,
    pub course_title: String,
    pub credit_unit: i64,
    pub grade: String,
    pub point: f64,
    pub semester: String,
    pub session: String,
    pub level: String,
    pub is_carryover: bool,
}

impl ResultRow {
    /// A row is well-formed when it can contribute to a weighted
    /// average. Malformed rows are skipped and counted, never fatal.
    pub fn contributes(&self) -> bool {
        self.credit_unit > 0 && self.point >= 0.0 && self.point <= MAX_POINT
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpaAccumulator {
    pub total_points: f64,
    pub total_credits: i64,
    pub course_count: usize,
    pub skipped: usize,
}

impl GpaAccumulator {
    pub fn add(&mut self, row: &ResultRow) {
        if !row.contributes() {
            self.skipped += 1;
            return;
        }
        self.total_points += row.point * row.credit_unit as f64;
        self.total_credits += row.credit_unit;
        self.course_count += 1;
    }

    pub fn gpa(&self) -> f64 {
        if self.total_credits > 0 {
            self.total_points / self.total_credits as f64
        } else {
            0.0
        }
    }
}

pub fn semester_gpa<'a, I>(rows: I) -> f64
where
    I: IntoIterator<Item = &'a ResultRow>,
{
    let mut acc = GpaAccumulator::default();
    for row in rows {
        acc.add(row);
    }
    acc.gpa()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemesterKey {
    pub session: String,
    pub semester: Semester,
}

/// Groups rows by (session, semester) in chronological order: ascending
/// session string, first semester before second. The upstream query does
/// not guarantee order, so the sort is explicit here.
pub fn group_by_semester(rows: &[ResultRow]) -> Vec<(SemesterKey, Vec<&ResultRow>)> {
    let mut grouped: BTreeMap<SemesterKey, Vec<&ResultRow>> = BTreeMap::new();
    for row in rows {
        let Some(semester) = Semester::parse(&row.semester) else {
            continue;
        };
        let key = SemesterKey {
            session: row.session.clone(),
            semester,
        };
        grouped.entry(key).or_default().push(row);
    }
    grouped.into_iter().collect()
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeSummary {
    pub cgpa: f64,
    pub total_credit_units: i64,
    pub course_count: usize,
    pub grade_distribution: BTreeMap<String, usize>,
    pub skipped_rows: usize,
}

pub fn cumulative_summary(rows: &[ResultRow]) -> CumulativeSummary {
    let mut acc = GpaAccumulator::default();
    let mut distribution: BTreeMap<String, usize> = BTreeMap::new();
    for row in rows {
        acc.add(row);
        if let Some(grade) = Grade::parse(&row.grade) {
            *distribution.entry(grade.letter().to_string()).or_insert(0) += 1;
        }
    }
    CumulativeSummary {
        cgpa: acc.gpa(),
        total_credit_units: acc.total_credits,
        course_count: acc.course_count,
        grade_distribution: distribution,
        skipped_rows: acc.skipped,
    }
}

#[derive(Debug, Clone, Default)]
pub struct CarryoverSet {
    pub courses: Vec<ResultRow>,
    pub total_credits: i64,
}

/// Failing grade or persisted carryover flag. Empty set means "no
/// carryovers", a success state for callers, not an error.
pub fn carryovers(rows: &[ResultRow]) -> CarryoverSet {
    let mut set = CarryoverSet::default();
    for row in rows {
        let failed = Grade::parse(&row.grade).map(Grade::is_fail).unwrap_or(false);
        if failed || row.is_carryover {
            set.total_credits += row.credit_unit.max(0);
            set.courses.push(row.clone());
        }
    }
    set
}

#[derive(Debug, Clone, Serialize)]
pub struct PerfError {
    pub code: String,
    pub message: String,
}

impl PerfError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentIdentity {
    pub student_id: String,
    pub matric_no: String,
    pub full_name: String,
    pub level: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterAggregate {
    pub session: String,
    pub semester: String,
    pub gpa: f64,
    pub total_credits: i64,
    pub course_count: usize,
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceModel {
    pub student: StudentIdentity,
    pub semesters: Vec<SemesterAggregate>,
    pub cumulative: CumulativeSummary,
    pub carryover_count: usize,
    pub carryover_credits: i64,
}

pub fn load_student(conn: &Connection, student_id: &str) -> Result<StudentIdentity, PerfError> {
    conn.query_row(
        "SELECT id, matric_no, last_name, first_name, level
         FROM students
         WHERE id = ?",
        [student_id],
        |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(StudentIdentity {
                student_id: r.get(0)?,
                matric_no: r.get(1)?,
                full_name: format!("{} {}", first, last),
                level: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(|e| PerfError::new("db_query_failed", e.to_string()))?
    .ok_or_else(|| PerfError::new("not_found", "student not found"))
}

pub fn load_results(conn: &Connection, student_id: &str) -> Result<Vec<ResultRow>, PerfError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, course_code, course_title, credit_unit, grade, point,
                    semester, session, level, is_carryover
             FROM results
             WHERE student_id = ?
             ORDER BY session, semester, course_code",
        )
        .map_err(|e| PerfError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([student_id], |r| {
        Ok(ResultRow {
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
    .map_err(|e| PerfError::new("db_query_failed", e.to_string()))
}

/// Loads one student's full result history and folds it into the
/// derived model consumed by dashboards, trend charts and document
/// generation. Recomputed per request; nothing derived is persisted.
pub fn compute_student_performance(
    conn: &Connection,
    student_id: &str,
) -> Result<PerformanceModel, PerfError> {
    let student = load_student(conn, student_id)?;
    let rows = load_results(conn, student_id)?;

    let mut semesters = Vec::new();
    for (key, group) in group_by_semester(&rows) {
        let mut acc = GpaAccumulator::default();
        for row in &group {
            acc.add(row);
        }
        semesters.push(SemesterAggregate {
            session: key.session,
            semester: key.semester.as_str().to_string(),
            gpa: acc.gpa(),
            total_credits: acc.total_credits,
            course_count: acc.course_count,
            skipped_rows: acc.skipped,
        });
    }

    let cumulative = cumulative_summary(&rows);
    let carry = carryovers(&rows);

    Ok(PerformanceModel {
        student,
        semesters,
        cumulative,
        carryover_count: carry.courses.len(),
        carryover_credits: carry.total_credits,
    })
}
