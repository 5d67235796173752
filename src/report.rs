use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::grading::{
    accumulate, classify_bucket, compute_term_metrics, grade_distribution, normalize_code,
    normalize_reg_no, remark_for, result_for_course, separate_courses, CourseOutcome, CourseRef,
    CumulativeMetrics, DegreeClass, Grade, GradeDistribution, RawResult, ResultCell,
    SeparatedCourses, StandingBucket, TermMetrics,
};

/// Fixed institutional letterhead used across the generated documents.
const LETTERHEAD_LINES: [&str; 3] = [
    "UNIVERSITY EXAMINATION RECORDS",
    "OFFICE OF THE REGISTRAR (EXAMINATIONS DIVISION)",
    "P.M.B. 65, UNIVERSITY ROAD",
];

pub const ROWS_PER_PAGE: usize = 25;

#[derive(Debug, Clone, Serialize)]
pub struct ReportError {
    pub code: String,
    pub message: String,
}

impl ReportError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn db_err(e: impl std::fmt::Display) -> ReportError {
    ReportError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone)]
pub struct ReportContext<'a> {
    pub conn: &'a Connection,
    pub programme_id: &'a str,
    pub session_id: &'a str,
    pub level: i64,
    pub semester: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Letterhead {
    pub lines: Vec<String>,
    pub title: String,
    pub subtitle: String,
}

fn letterhead(title: &str, scope: &ScopeInfo) -> Letterhead {
    Letterhead {
        lines: LETTERHEAD_LINES.iter().map(|s| s.to_string()).collect(),
        title: title.to_string(),
        subtitle: format!(
            "{} — {} Level, {} Semester, {} Session",
            scope.programme,
            scope.level,
            if scope.semester == 1 { "First" } else { "Second" },
            scope.session
        ),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Signatory {
    pub role: String,
    pub name: Option<String>,
}

fn signatories() -> Vec<Signatory> {
    ["Course Examinations Officer", "Head of Department", "Dean of College"]
        .iter()
        .map(|role| Signatory {
            role: role.to_string(),
            name: None,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeInfo {
    pub programme_id: String,
    pub programme: String,
    pub degree: String,
    pub department: String,
    pub college: String,
    pub session_id: String,
    pub session: String,
    pub level: i64,
    pub semester: i64,
}

fn resolve_scope(ctx: &ReportContext<'_>) -> Result<ScopeInfo, ReportError> {
    let row: Option<(String, String, String, String)> = ctx
        .conn
        .query_row(
            "SELECT p.name, p.degree, d.name, c.name
             FROM programmes p
             JOIN departments d ON d.id = p.department_id
             JOIN colleges c ON c.id = d.college_id
             WHERE p.id = ?",
            [ctx.programme_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((programme, degree, department, college)) = row else {
        return Err(ReportError::new("not_found", "programme not found"));
    };

    let session: Option<String> = ctx
        .conn
        .query_row(
            "SELECT name FROM sessions WHERE id = ?",
            [ctx.session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(session) = session else {
        return Err(ReportError::new("not_found", "session not found"));
    };

    Ok(ScopeInfo {
        programme_id: ctx.programme_id.to_string(),
        programme,
        degree,
        department,
        college,
        session_id: ctx.session_id.to_string(),
        session,
        level: ctx.level,
        semester: ctx.semester,
    })
}

fn in_placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

fn text_params(ids: &[String]) -> Vec<Value> {
    ids.iter().map(|s| Value::Text(s.clone())).collect()
}

#[derive(Debug, Clone)]
struct CohortStudent {
    reg_no: String,
    full_name: String,
    standing: String,
}

fn cohort_students(ctx: &ReportContext<'_>) -> Result<Vec<CohortStudent>, ReportError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT reg_no, full_name, standing
             FROM students
             WHERE programme_id = ? AND level = ?
             ORDER BY reg_no",
        )
        .map_err(db_err)?;
    stmt.query_map((ctx.programme_id, ctx.level), |r| {
        Ok(CohortStudent {
            reg_no: r.get(0)?,
            full_name: r.get(1)?,
            standing: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

/// Courses in scope for the term: everything approved for the curriculum
/// plus everything the cohort actually registered for, separated into
/// regular and carry-over.
fn scope_courses(ctx: &ReportContext<'_>) -> Result<SeparatedCourses, ReportError> {
    let mut approved_ids: HashSet<String> = HashSet::new();
    {
        let mut stmt = ctx
            .conn
            .prepare(
                "SELECT course_id FROM course_approvals
                 WHERE programme_id = ? AND session_id = ? AND level = ? AND semester = ?",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                (ctx.programme_id, ctx.session_id, ctx.level, ctx.semester),
                |r| r.get::<_, String>(0),
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err)?;
        approved_ids.extend(rows);
    }

    let mut course_ids: HashSet<String> = approved_ids.clone();
    {
        let mut stmt = ctx
            .conn
            .prepare(
                "SELECT DISTINCT r.course_id
                 FROM registrations r
                 JOIN students s ON s.reg_no = r.reg_no
                 WHERE r.session_id = ? AND r.semester = ?
                   AND s.programme_id = ? AND s.level = ?",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                (ctx.session_id, ctx.semester, ctx.programme_id, ctx.level),
                |r| r.get::<_, String>(0),
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err)?;
        course_ids.extend(rows);
    }

    let ids: Vec<String> = course_ids.into_iter().collect();
    let courses = fetch_courses(ctx.conn, &ids)?;

    let approved_codes: HashSet<String> = courses
        .iter()
        .filter(|c| approved_ids.contains(&c.id))
        .map(|c| normalize_code(&c.code))
        .collect();

    Ok(separate_courses(&courses, &approved_ids, &approved_codes))
}

fn fetch_courses(conn: &Connection, ids: &[String]) -> Result<Vec<CourseRef>, ReportError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT id, code, title, unit, elective, level, semester
         FROM courses WHERE id IN ({})",
        in_placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    stmt.query_map(params_from_iter(text_params(ids)), |r| {
        Ok(CourseRef {
            id: r.get(0)?,
            code: r.get(1)?,
            title: r.get(2)?,
            unit: r.get(3)?,
            elective: r.get::<_, i64>(4)? != 0,
            level: r.get(5)?,
            semester: r.get(6)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(db_err)
}

/// Per-course registration sets: the existence index behind the NR/00F
/// decision.
fn registration_sets(
    conn: &Connection,
    course_ids: &[String],
) -> Result<HashMap<String, HashSet<String>>, ReportError> {
    let mut sets: HashMap<String, HashSet<String>> = HashMap::new();
    if course_ids.is_empty() {
        return Ok(sets);
    }
    let sql = format!(
        "SELECT course_id, reg_no FROM registrations WHERE course_id IN ({})",
        in_placeholders(course_ids.len())
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(text_params(course_ids)), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for (course_id, reg_no) in rows {
        sets.entry(course_id)
            .or_default()
            .insert(normalize_reg_no(&reg_no));
    }
    Ok(sets)
}

/// Raw results per course, keyed by normalized registration number.
fn result_maps(
    conn: &Connection,
    course_ids: &[String],
) -> Result<HashMap<String, HashMap<String, RawResult>>, ReportError> {
    let mut maps: HashMap<String, HashMap<String, RawResult>> = HashMap::new();
    if course_ids.is_empty() {
        return Ok(maps);
    }
    let sql = format!(
        "SELECT course_id, reg_no, grandtotal, grade
         FROM results WHERE course_id IN ({})",
        in_placeholders(course_ids.len())
    );
    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(text_params(course_ids)), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for (course_id, reg_no, grandtotal, grade) in rows {
        maps.entry(course_id).or_default().insert(
            normalize_reg_no(&reg_no),
            RawResult {
                grandtotal,
                grade: grade.as_deref().and_then(Grade::from_letter),
            },
        );
    }
    Ok(maps)
}

#[derive(Debug, Clone, Default)]
struct PriorMetrics {
    cumulative: Option<CumulativeMetrics>,
    gpa: Option<f64>,
}

/// Latest stored metrics strictly before the context term, per student.
/// Session names ("2023/2024") order chronologically as text.
fn prior_metrics(
    ctx: &ReportContext<'_>,
    session_name: &str,
    reg_nos: &[String],
) -> Result<HashMap<String, PriorMetrics>, ReportError> {
    let mut out: HashMap<String, PriorMetrics> = HashMap::new();
    if reg_nos.is_empty() {
        return Ok(out);
    }
    let sql = format!(
        "SELECT m.reg_no, s.name, m.semester, m.gpa, m.ccc, m.cce, m.cpe, m.cgpa
         FROM metrics m
         JOIN sessions s ON s.id = m.session_id
         WHERE m.reg_no IN ({})
         ORDER BY s.name, m.semester",
        in_placeholders(reg_nos.len())
    );
    let mut stmt = ctx.conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params_from_iter(text_params(reg_nos)), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, f64>(6)?,
                r.get::<_, f64>(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let current_key = (session_name.to_string(), ctx.semester);
    for (reg_no, sess, semester, gpa, ccc, cce, cpe, cgpa) in rows {
        if (sess.clone(), semester) >= current_key {
            continue;
        }
        // Rows arrive ordered; the last one kept is the latest prior term.
        out.insert(
            reg_no,
            PriorMetrics {
                cumulative: Some(CumulativeMetrics {
                    ccc,
                    cce,
                    cpe,
                    cgpa,
                }),
                gpa: Some(gpa),
            },
        );
    }
    Ok(out)
}

fn section_cells(
    section: &[CourseRef],
    reg_no: &str,
    reg_sets: &HashMap<String, HashSet<String>>,
    by_key: &HashMap<String, RawResult>,
    outcomes: &mut Vec<CourseOutcome>,
    registered_count: &mut usize,
) -> Vec<String> {
    section
        .iter()
        .map(|c| {
            let registered = reg_sets
                .get(&c.id)
                .map(|set| set.contains(reg_no))
                .unwrap_or(false);
            let cell = ResultCell::classify(registered, result_for_course(by_key, c).copied());
            if let Some(grade) = cell.effective_grade() {
                *registered_count += 1;
                outcomes.push(CourseOutcome {
                    code: c.code.clone(),
                    unit: c.unit,
                    grade,
                });
            }
            cell.display()
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub reg_no: String,
    pub full_name: String,
    pub standing: String,
    pub regular_cells: Vec<String>,
    pub carry_over_cells: Vec<String>,
    pub registered_count: usize,
    pub current: TermMetrics,
    pub previous: Option<CumulativeMetrics>,
    pub previous_gpa: Option<f64>,
    pub cumulative: CumulativeMetrics,
    pub remark: String,
    pub bucket: StandingBucket,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortComputation {
    pub scope: ScopeInfo,
    pub courses: SeparatedCourses,
    pub rows: Vec<StudentRow>,
}

/// Joins raw results against registration sets for the whole cohort and
/// computes cells, metrics, remarks and buckets. The single source of truth
/// behind result sheets, pass/fail lists and metrics recomputation.
pub fn compute_cohort(ctx: &ReportContext<'_>) -> Result<CohortComputation, ReportError> {
    let scope = resolve_scope(ctx)?;
    let students = cohort_students(ctx)?;
    let courses = scope_courses(ctx)?;

    let all_courses: Vec<&CourseRef> = courses
        .regular
        .iter()
        .chain(courses.carry_over.iter())
        .collect();
    let course_ids: Vec<String> = all_courses.iter().map(|c| c.id.clone()).collect();

    let reg_sets = registration_sets(ctx.conn, &course_ids)?;
    let results = result_maps(ctx.conn, &course_ids)?;

    let reg_nos: Vec<String> = students.iter().map(|s| s.reg_no.clone()).collect();
    let priors = prior_metrics(ctx, &scope.session, &reg_nos)?;

    let mut rows: Vec<StudentRow> = Vec::with_capacity(students.len());
    for s in &students {
        let reg_no = normalize_reg_no(&s.reg_no);

        // Per-student result map keyed the loose way payloads arrive: course
        // id plus normalized code, resolved through the candidate-key lookup.
        let mut by_key: HashMap<String, RawResult> = HashMap::new();
        for c in &all_courses {
            if let Some(r) = results.get(&c.id).and_then(|m| m.get(&reg_no)) {
                by_key.insert(c.id.clone(), *r);
                by_key.insert(normalize_code(&c.code), *r);
            }
        }

        let mut outcomes: Vec<CourseOutcome> = Vec::new();
        let mut registered_count = 0usize;
        let regular_cells = section_cells(
            &courses.regular,
            &reg_no,
            &reg_sets,
            &by_key,
            &mut outcomes,
            &mut registered_count,
        );
        let carry_over_cells = section_cells(
            &courses.carry_over,
            &reg_no,
            &reg_sets,
            &by_key,
            &mut outcomes,
            &mut registered_count,
        );

        let current = compute_term_metrics(&outcomes);
        let prior = priors.get(&reg_no).cloned().unwrap_or_default();
        let cumulative = accumulate(prior.cumulative, &current);
        let remark = remark_for(&outcomes);
        let has_failure = outcomes.iter().any(|o| o.grade == Grade::F);
        let bucket = classify_bucket(registered_count, has_failure, current.gpa, prior.gpa);

        rows.push(StudentRow {
            reg_no,
            full_name: s.full_name.clone(),
            standing: s.standing.clone(),
            regular_cells,
            carry_over_cells,
            registered_count,
            current,
            previous: prior.cumulative,
            previous_gpa: prior.gpa,
            cumulative,
            remark,
            bucket,
        });
    }

    Ok(CohortComputation {
        scope,
        courses,
        rows,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T: Serialize> {
    pub number: usize,
    pub rows: Vec<T>,
}

fn paginate<T: Serialize + Clone>(rows: &[T]) -> Vec<Page<T>> {
    rows.chunks(ROWS_PER_PAGE)
        .enumerate()
        .map(|(i, chunk)| Page {
            number: i + 1,
            rows: chunk.to_vec(),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseColumn {
    pub key: String,
    pub code: String,
    pub title: String,
    pub unit: i64,
    pub elective: bool,
}

fn course_columns(courses: &[CourseRef]) -> Vec<CourseColumn> {
    courses
        .iter()
        .map(|c| CourseColumn {
            key: c.column_key(),
            code: c.code.clone(),
            title: c.title.clone(),
            unit: c.unit,
            elective: c.elective,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSheetModel {
    pub letterhead: Letterhead,
    pub scope: ScopeInfo,
    pub regular_courses: Vec<CourseColumn>,
    pub carry_over_courses: Vec<CourseColumn>,
    pub pages: Vec<Page<StudentRow>>,
    pub page_count: usize,
    pub student_count: usize,
    pub signatories: Vec<Signatory>,
}

pub fn result_sheet_model(ctx: &ReportContext<'_>) -> Result<ResultSheetModel, ReportError> {
    let cohort = compute_cohort(ctx)?;
    let pages = paginate(&cohort.rows);
    Ok(ResultSheetModel {
        letterhead: letterhead("RESULT SHEET", &cohort.scope),
        regular_courses: course_columns(&cohort.courses.regular),
        carry_over_courses: course_columns(&cohort.courses.carry_over),
        page_count: pages.len(),
        student_count: cohort.rows.len(),
        pages,
        scope: cohort.scope,
        signatories: signatories(),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSummaryRow {
    pub key: String,
    pub code: String,
    pub title: String,
    pub unit: i64,
    pub elective: bool,
    #[serde(flatten)]
    pub distribution: GradeDistribution,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSummaryModel {
    pub letterhead: Letterhead,
    pub scope: ScopeInfo,
    pub pages: Vec<Page<GradeSummaryRow>>,
    pub page_count: usize,
    pub course_count: usize,
    pub signatories: Vec<Signatory>,
}

/// Per-course grade distribution across each course's registered cohort
/// (not just the level cohort: repeaters from other levels count too).
pub fn grade_summary_model(ctx: &ReportContext<'_>) -> Result<GradeSummaryModel, ReportError> {
    let scope = resolve_scope(ctx)?;
    let courses = scope_courses(ctx)?;
    let all_courses: Vec<CourseRef> = courses
        .regular
        .iter()
        .chain(courses.carry_over.iter())
        .cloned()
        .collect();
    let course_ids: Vec<String> = all_courses.iter().map(|c| c.id.clone()).collect();
    let reg_sets = registration_sets(ctx.conn, &course_ids)?;
    let results = result_maps(ctx.conn, &course_ids)?;

    let empty_set = HashSet::new();
    let empty_map = HashMap::new();
    let mut rows: Vec<GradeSummaryRow> = Vec::new();
    for c in &all_courses {
        let set = reg_sets.get(&c.id).unwrap_or(&empty_set);
        let map = results.get(&c.id).unwrap_or(&empty_map);
        let cells = set
            .iter()
            .map(|reg_no| ResultCell::classify(true, map.get(reg_no).copied()));
        rows.push(GradeSummaryRow {
            key: c.column_key(),
            code: c.code.clone(),
            title: c.title.clone(),
            unit: c.unit,
            elective: c.elective,
            distribution: grade_distribution(cells),
        });
    }

    let pages = paginate(&rows);
    Ok(GradeSummaryModel {
        letterhead: letterhead("GRADE SUMMARY", &scope),
        page_count: pages.len(),
        course_count: rows.len(),
        pages,
        scope,
        signatories: signatories(),
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketEntry {
    pub reg_no: String,
    pub full_name: String,
    pub gpa: f64,
    pub cgpa: f64,
    pub remark: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassFailModel {
    pub letterhead: Letterhead,
    pub scope: ScopeInfo,
    pub pass: Vec<BucketEntry>,
    pub repeat: Vec<BucketEntry>,
    pub probation: Vec<BucketEntry>,
    pub withdrawal: Vec<BucketEntry>,
    pub non_registration: Vec<BucketEntry>,
    pub student_count: usize,
    pub signatories: Vec<Signatory>,
}

pub fn pass_fail_model(ctx: &ReportContext<'_>) -> Result<PassFailModel, ReportError> {
    let cohort = compute_cohort(ctx)?;
    let mut model = PassFailModel {
        letterhead: letterhead("PASS / FAIL CLASSIFICATION", &cohort.scope),
        scope: cohort.scope,
        pass: Vec::new(),
        repeat: Vec::new(),
        probation: Vec::new(),
        withdrawal: Vec::new(),
        non_registration: Vec::new(),
        student_count: cohort.rows.len(),
        signatories: signatories(),
    };
    for row in &cohort.rows {
        let entry = BucketEntry {
            reg_no: row.reg_no.clone(),
            full_name: row.full_name.clone(),
            gpa: row.current.gpa,
            cgpa: row.cumulative.cgpa,
            remark: row.remark.clone(),
        };
        match row.bucket {
            StandingBucket::Pass => model.pass.push(entry),
            StandingBucket::Repeat => model.repeat.push(entry),
            StandingBucket::Probation => model.probation.push(entry),
            StandingBucket::Withdrawal => model.withdrawal.push(entry),
            StandingBucket::NonRegistration => model.non_registration.push(entry),
        }
    }
    Ok(model)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraduandEntry {
    pub reg_no: String,
    pub full_name: String,
    pub cgpa: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DegreeClassGroup {
    pub class_label: String,
    pub students: Vec<GraduandEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedGraduand {
    pub reg_no: String,
    pub full_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraduatingListModel {
    pub letterhead: Letterhead,
    pub scope: ScopeInfo,
    pub groups: Vec<DegreeClassGroup>,
    pub skipped: Vec<SkippedGraduand>,
    pub graduand_count: usize,
    pub signatories: Vec<Signatory>,
}

/// Final-level students with no outstanding failure and a classifiable CGPA,
/// grouped by degree class in descending order of class.
pub fn graduating_list_model(
    conn: &Connection,
    programme_id: &str,
    session_id: &str,
) -> Result<GraduatingListModel, ReportError> {
    let duration_years: Option<i64> = conn
        .query_row(
            "SELECT duration_years FROM programmes WHERE id = ?",
            [programme_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(duration_years) = duration_years else {
        return Err(ReportError::new("not_found", "programme not found"));
    };
    let final_level = duration_years * 100;

    let ctx = ReportContext {
        conn,
        programme_id,
        session_id,
        level: final_level,
        semester: 2,
    };
    let scope = resolve_scope(&ctx)?;

    let mut stmt = conn
        .prepare(
            "SELECT reg_no, full_name FROM students
             WHERE programme_id = ? AND level = ?
             ORDER BY reg_no",
        )
        .map_err(db_err)?;
    let students: Vec<(String, String)> = stmt
        .query_map((programme_id, final_level), |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut by_class: HashMap<DegreeClass, Vec<GraduandEntry>> = HashMap::new();
    let mut skipped: Vec<SkippedGraduand> = Vec::new();

    for (reg_no, full_name) in students {
        let reg_no = normalize_reg_no(&reg_no);
        let cgpa: Option<f64> = conn
            .query_row(
                "SELECT m.cgpa FROM metrics m
                 JOIN sessions s ON s.id = m.session_id
                 WHERE m.reg_no = ?
                 ORDER BY s.name DESC, m.semester DESC
                 LIMIT 1",
                [&reg_no],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(cgpa) = cgpa else {
            skipped.push(SkippedGraduand {
                reg_no,
                full_name,
                reason: "no computed metrics".to_string(),
            });
            continue;
        };

        if let Some(code) = outstanding_failure(conn, &reg_no)? {
            skipped.push(SkippedGraduand {
                reg_no,
                full_name,
                reason: format!("outstanding failure in {}", code),
            });
            continue;
        }

        match DegreeClass::from_cgpa(cgpa) {
            Some(class) => by_class.entry(class).or_default().push(GraduandEntry {
                reg_no,
                full_name,
                cgpa,
            }),
            None => skipped.push(SkippedGraduand {
                reg_no,
                full_name,
                reason: format!("CGPA {:.2} below graduation minimum", cgpa),
            }),
        }
    }

    let order = [
        DegreeClass::First,
        DegreeClass::SecondUpper,
        DegreeClass::SecondLower,
        DegreeClass::Third,
        DegreeClass::Pass,
    ];
    let mut groups: Vec<DegreeClassGroup> = Vec::new();
    let mut graduand_count = 0usize;
    for class in order {
        if let Some(students) = by_class.remove(&class) {
            graduand_count += students.len();
            groups.push(DegreeClassGroup {
                class_label: class.label().to_string(),
                students,
            });
        }
    }

    Ok(GraduatingListModel {
        letterhead: Letterhead {
            lines: LETTERHEAD_LINES.iter().map(|s| s.to_string()).collect(),
            title: "GRADUATING LIST".to_string(),
            subtitle: format!("{} ({}) — {} Session", scope.programme, scope.degree, scope.session),
        },
        scope,
        groups,
        skipped,
        graduand_count,
        signatories: signatories(),
    })
}

/// A course whose latest attempt (by session name, semester) still grades F.
fn outstanding_failure(conn: &Connection, reg_no: &str) -> Result<Option<String>, ReportError> {
    let mut stmt = conn
        .prepare(
            "SELECT c.code, r.grandtotal, r.grade, s.name, c.semester
             FROM results r
             JOIN courses c ON c.id = r.course_id
             JOIN sessions s ON s.id = c.session_id
             WHERE r.reg_no = ?
             ORDER BY s.name, c.semester",
        )
        .map_err(db_err)?;
    let rows: Vec<(String, Option<f64>, Option<String>)> = stmt
        .query_map([reg_no], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get::<_, Option<String>>(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    // Rows arrive in term order, so the last write per code is the latest
    // attempt.
    let mut latest: HashMap<String, Grade> = HashMap::new();
    for (code, grandtotal, grade) in rows {
        let cell = ResultCell::classify(
            true,
            Some(RawResult {
                grandtotal,
                grade: grade.as_deref().and_then(Grade::from_letter),
            }),
        );
        if let Some(g) = cell.effective_grade() {
            latest.insert(normalize_code(&code), g);
        }
    }
    let mut failed: Vec<String> = latest
        .into_iter()
        .filter(|(_, g)| *g == Grade::F)
        .map(|(code, _)| code)
        .collect();
    failed.sort();
    Ok(failed.into_iter().next())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementCourseRow {
    pub code: String,
    pub title: String,
    pub unit: i64,
    pub cell: String,
    pub grade: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementTerm {
    pub session: String,
    pub semester: i64,
    pub courses: Vec<StatementCourseRow>,
    pub metrics: TermMetrics,
    pub cumulative: CumulativeMetrics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementModel {
    pub letterhead: Letterhead,
    pub reg_no: String,
    pub full_name: String,
    pub programme: String,
    pub degree: String,
    pub department: String,
    pub college: String,
    pub standing: String,
    pub terms: Vec<StatementTerm>,
    pub cumulative: CumulativeMetrics,
    pub degree_class: Option<String>,
    pub signatories: Vec<Signatory>,
}

/// Statement of result for one student: every registered term in order,
/// with metrics recomputed from raw results.
pub fn statement_model(conn: &Connection, reg_no: &str) -> Result<StatementModel, ReportError> {
    let reg_no = normalize_reg_no(reg_no);
    let student: Option<(String, String, String)> = conn
        .query_row(
            "SELECT full_name, standing, programme_id FROM students WHERE reg_no = ?",
            [&reg_no],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((full_name, standing, programme_id)) = student else {
        return Err(ReportError::new("not_found", "student not found"));
    };
    let prog: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT p.name, p.degree, d.name, c.name
             FROM programmes p
             JOIN departments d ON d.id = p.department_id
             JOIN colleges c ON c.id = d.college_id
             WHERE p.id = ?",
            [&programme_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((programme, degree, department, college)) = prog else {
        return Err(ReportError::new("not_found", "programme not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT s.name, reg.semester, c.id, c.code, c.title, c.unit,
                    res.grandtotal, res.grade
             FROM registrations reg
             JOIN courses c ON c.id = reg.course_id
             JOIN sessions s ON s.id = reg.session_id
             LEFT JOIN results res
               ON res.course_id = reg.course_id AND res.reg_no = reg.reg_no
             WHERE reg.reg_no = ?
             ORDER BY s.name, reg.semester, c.unit, c.code",
        )
        .map_err(db_err)?;
    let rows: Vec<(String, i64, String, String, String, i64, Option<f64>, Option<String>)> = stmt
        .query_map([&reg_no], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut terms: Vec<StatementTerm> = Vec::new();
    let mut cumulative = CumulativeMetrics::default();
    let mut current_key: Option<(String, i64)> = None;
    let mut course_rows: Vec<StatementCourseRow> = Vec::new();
    let mut outcomes: Vec<CourseOutcome> = Vec::new();

    let mut flush = |key: &Option<(String, i64)>,
                     course_rows: &mut Vec<StatementCourseRow>,
                     outcomes: &mut Vec<CourseOutcome>,
                     cumulative: &mut CumulativeMetrics,
                     terms: &mut Vec<StatementTerm>| {
        if let Some((session, semester)) = key.clone() {
            let metrics = compute_term_metrics(outcomes);
            *cumulative = accumulate(Some(*cumulative), &metrics);
            terms.push(StatementTerm {
                session,
                semester,
                courses: std::mem::take(course_rows),
                metrics,
                cumulative: *cumulative,
            });
            outcomes.clear();
        }
    };

    for (session, semester, _id, code, title, unit, grandtotal, grade) in rows {
        let key = (session.clone(), semester);
        if current_key.as_ref() != Some(&key) {
            flush(
                &current_key,
                &mut course_rows,
                &mut outcomes,
                &mut cumulative,
                &mut terms,
            );
            current_key = Some(key);
        }
        let cell = ResultCell::classify(
            true,
            grandtotal.map(|gt| RawResult {
                grandtotal: Some(gt),
                grade: grade.as_deref().and_then(Grade::from_letter),
            }),
        );
        let effective = cell.effective_grade();
        if let Some(g) = effective {
            outcomes.push(CourseOutcome {
                code: code.clone(),
                unit,
                grade: g,
            });
        }
        course_rows.push(StatementCourseRow {
            code,
            title,
            unit,
            cell: cell.display(),
            grade: effective.map(|g| g.letter().to_string()),
        });
    }
    flush(
        &current_key,
        &mut course_rows,
        &mut outcomes,
        &mut cumulative,
        &mut terms,
    );

    Ok(StatementModel {
        letterhead: Letterhead {
            lines: LETTERHEAD_LINES.iter().map(|s| s.to_string()).collect(),
            title: "STATEMENT OF RESULT".to_string(),
            subtitle: format!("{} — {}", reg_no, full_name),
        },
        reg_no,
        full_name,
        programme,
        degree,
        department,
        college,
        standing,
        terms,
        degree_class: DegreeClass::from_cgpa(cumulative.cgpa).map(|c| c.label().to_string()),
        cumulative,
        signatories: signatories(),
    })
}
