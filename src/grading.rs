use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Fixed institutional grade letters on the 5-point scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl Grade {
    /// Fixed cutoffs: A>=70, B>=60, C>=50, D>=45, E>=40, else F.
    pub fn from_score(score: f64) -> Grade {
        if score >= 70.0 {
            Grade::A
        } else if score >= 60.0 {
            Grade::B
        } else if score >= 50.0 {
            Grade::C
        } else if score >= 45.0 {
            Grade::D
        } else if score >= 40.0 {
            Grade::E
        } else {
            Grade::F
        }
    }

    pub fn from_letter(s: &str) -> Option<Grade> {
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

    pub fn points(self) -> f64 {
        match self {
            Grade::A => 5.0,
            Grade::B => 4.0,
            Grade::C => 3.0,
            Grade::D => 2.0,
            Grade::E => 1.0,
            Grade::F => 0.0,
        }
    }

    pub fn is_pass(self) -> bool {
        self != Grade::F
    }
}

/// Half-up rounding to 2 decimals, used for GPA-family values.
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Half-up rounding to 1 decimal, used for percentages.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Registration numbers are compared trimmed and uppercased.
pub fn normalize_reg_no(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Course codes are compared trimmed, uppercased, with internal spaces removed.
pub fn normalize_code(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Backend ids are opaque; comparison is on the trimmed form only.
pub fn normalize_id(raw: &str) -> String {
    raw.trim().to_string()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseRef {
    pub id: String,
    pub code: String,
    pub title: String,
    pub unit: i64,
    pub elective: bool,
    pub level: i64,
    pub semester: i64,
}

impl CourseRef {
    /// Column key used across report documents: `<unit><code>`.
    pub fn column_key(&self) -> String {
        format!("{}{}", self.unit, normalize_code(&self.code))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeparatedCourses {
    pub regular: Vec<CourseRef>,
    pub carry_over: Vec<CourseRef>,
}

/// Partitions a term's courses into the approved ("regular") set and
/// everything else ("carry-over"), deduplicated by normalized id first and
/// normalized code as fallback, each partition sorted by (unit, code).
pub fn separate_courses(
    courses: &[CourseRef],
    approved_ids: &HashSet<String>,
    approved_codes: &HashSet<String>,
) -> SeparatedCourses {
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_codes: HashSet<String> = HashSet::new();
    let mut regular: Vec<CourseRef> = Vec::new();
    let mut carry_over: Vec<CourseRef> = Vec::new();

    for c in courses {
        let id = normalize_id(&c.id);
        let code = normalize_code(&c.code);
        if !id.is_empty() {
            if seen_ids.contains(&id) {
                continue;
            }
            seen_ids.insert(id.clone());
        } else if seen_codes.contains(&code) {
            continue;
        }
        seen_codes.insert(code.clone());

        if approved_ids.contains(&id) || approved_codes.contains(&code) {
            regular.push(c.clone());
        } else {
            carry_over.push(c.clone());
        }
    }

    let by_unit_then_code = |a: &CourseRef, b: &CourseRef| {
        a.unit
            .cmp(&b.unit)
            .then_with(|| normalize_code(&a.code).cmp(&normalize_code(&b.code)))
    };
    regular.sort_by(by_unit_then_code);
    carry_over.sort_by(by_unit_then_code);

    SeparatedCourses {
        regular,
        carry_over,
    }
}

/// A raw per-course result as stored; grade may be absent and is then
/// derived from the score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawResult {
    pub grandtotal: Option<f64>,
    pub grade: Option<Grade>,
}

/// One cell of a result sheet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResultCell {
    /// No registration record for the course.
    NotRegistered,
    /// Registered but no recorded score, or a score of zero.
    MissingScore,
    Scored { score: f64, grade: Grade },
}

impl ResultCell {
    pub fn classify(registered: bool, result: Option<RawResult>) -> ResultCell {
        if !registered {
            return ResultCell::NotRegistered;
        }
        let Some(r) = result else {
            return ResultCell::MissingScore;
        };
        match r.grandtotal {
            None => ResultCell::MissingScore,
            Some(score) if score == 0.0 => ResultCell::MissingScore,
            Some(score) => ResultCell::Scored {
                score,
                grade: r.grade.unwrap_or_else(|| Grade::from_score(score)),
            },
        }
    }

    pub fn display(&self) -> String {
        match self {
            ResultCell::NotRegistered => "NR".to_string(),
            ResultCell::MissingScore => "00F".to_string(),
            ResultCell::Scored { score, grade } => {
                format!("{}{}", score.round() as i64, grade.letter())
            }
        }
    }

    /// Grade the cell contributes to metrics and distributions. NR cells
    /// contribute nothing; a missing score counts as F.
    pub fn effective_grade(&self) -> Option<Grade> {
        match self {
            ResultCell::NotRegistered => None,
            ResultCell::MissingScore => Some(Grade::F),
            ResultCell::Scored { grade, .. } => Some(*grade),
        }
    }
}

/// Looks up a student's result for a course, trying several candidate keys
/// against the loosely keyed result map: course id, exact code, normalized
/// code.
pub fn result_for_course<'a>(
    results: &'a HashMap<String, RawResult>,
    course: &CourseRef,
) -> Option<&'a RawResult> {
    let id = normalize_id(&course.id);
    if !id.is_empty() {
        if let Some(r) = results.get(&id) {
            return Some(r);
        }
    }
    if let Some(r) = results.get(course.code.trim()) {
        return Some(r);
    }
    results.get(&normalize_code(&course.code))
}

/// One registered course outcome feeding metrics and remarks.
#[derive(Debug, Clone)]
pub struct CourseOutcome {
    pub code: String,
    pub unit: i64,
    pub grade: Grade,
}

/// Overall remark: "Pass" when nothing failed, else a repeat list in the
/// order the outcomes are given (callers pass sheet column order).
pub fn remark_for(outcomes: &[CourseOutcome]) -> String {
    let failed: Vec<String> = outcomes
        .iter()
        .filter(|o| !o.grade.is_pass())
        .map(|o| format!("{}{}", o.unit, normalize_code(&o.code)))
        .collect();
    if failed.is_empty() {
        "Pass".to_string()
    } else {
        format!("Repeat {}", failed.join(" "))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermMetrics {
    /// Total credits carried (units registered).
    pub tcc: i64,
    /// Total credits earned (units with a non-F grade).
    pub tce: i64,
    /// Total points earned (unit * grade points).
    pub tpe: f64,
    pub gpa: f64,
}

pub fn compute_term_metrics(outcomes: &[CourseOutcome]) -> TermMetrics {
    let mut tcc = 0_i64;
    let mut tce = 0_i64;
    let mut tpe = 0.0_f64;
    for o in outcomes {
        tcc += o.unit;
        if o.grade.is_pass() {
            tce += o.unit;
        }
        tpe += (o.unit as f64) * o.grade.points();
    }
    let gpa = if tcc > 0 {
        round_off_2_decimals(tpe / tcc as f64)
    } else {
        0.0
    };
    TermMetrics { tcc, tce, tpe, gpa }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeMetrics {
    /// Cumulative credits carried.
    pub ccc: i64,
    /// Cumulative credits earned.
    pub cce: i64,
    /// Cumulative points earned.
    pub cpe: f64,
    pub cgpa: f64,
}

/// Rolls a term's totals onto the running cumulative figures.
pub fn accumulate(prev: Option<CumulativeMetrics>, term: &TermMetrics) -> CumulativeMetrics {
    let prev = prev.unwrap_or_default();
    let ccc = prev.ccc + term.tcc;
    let cce = prev.cce + term.tce;
    let cpe = prev.cpe + term.tpe;
    let cgpa = if ccc > 0 {
        round_off_2_decimals(cpe / ccc as f64)
    } else {
        0.0
    };
    CumulativeMetrics {
        ccc,
        cce,
        cpe,
        cgpa,
    }
}

pub const PROBATION_GPA: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StandingBucket {
    NonRegistration,
    Pass,
    Repeat,
    Probation,
    Withdrawal,
}

impl StandingBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            StandingBucket::NonRegistration => "nonRegistration",
            StandingBucket::Pass => "pass",
            StandingBucket::Repeat => "repeat",
            StandingBucket::Probation => "probation",
            StandingBucket::Withdrawal => "withdrawal",
        }
    }
}

/// Cohort bucket for the term. Two consecutive terms under the probation
/// line escalate to withdrawal.
pub fn classify_bucket(
    registered_count: usize,
    has_failure: bool,
    gpa: f64,
    previous_gpa: Option<f64>,
) -> StandingBucket {
    if registered_count == 0 {
        return StandingBucket::NonRegistration;
    }
    if gpa < PROBATION_GPA {
        if previous_gpa.map(|g| g < PROBATION_GPA).unwrap_or(false) {
            return StandingBucket::Withdrawal;
        }
        return StandingBucket::Probation;
    }
    if has_failure {
        StandingBucket::Repeat
    } else {
        StandingBucket::Pass
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DegreeClass {
    First,
    SecondUpper,
    SecondLower,
    Third,
    Pass,
}

impl DegreeClass {
    pub fn from_cgpa(cgpa: f64) -> Option<DegreeClass> {
        if cgpa >= 4.5 {
            Some(DegreeClass::First)
        } else if cgpa >= 3.5 {
            Some(DegreeClass::SecondUpper)
        } else if cgpa >= 2.4 {
            Some(DegreeClass::SecondLower)
        } else if cgpa >= 1.5 {
            Some(DegreeClass::Third)
        } else if cgpa >= 1.0 {
            Some(DegreeClass::Pass)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DegreeClass::First => "First Class Honours",
            DegreeClass::SecondUpper => "Second Class Honours (Upper Division)",
            DegreeClass::SecondLower => "Second Class Honours (Lower Division)",
            DegreeClass::Third => "Third Class Honours",
            DegreeClass::Pass => "Pass",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeDistribution {
    pub registered: usize,
    pub a: usize,
    pub b: usize,
    pub c: usize,
    pub d: usize,
    pub e: usize,
    pub f: usize,
    pub percent_pass: f64,
}

/// Counts grades across the registered cohort for one course. NR cells are
/// excluded; missing scores count as F via `effective_grade`.
pub fn grade_distribution<I>(cells: I) -> GradeDistribution
where
    I: IntoIterator<Item = ResultCell>,
{
    let mut dist = GradeDistribution::default();
    for cell in cells {
        let Some(grade) = cell.effective_grade() else {
            continue;
        };
        dist.registered += 1;
        match grade {
            Grade::A => dist.a += 1,
            Grade::B => dist.b += 1,
            Grade::C => dist.c += 1,
            Grade::D => dist.d += 1,
            Grade::E => dist.e += 1,
            Grade::F => dist.f += 1,
        }
    }
    if dist.registered > 0 {
        let passed = dist.registered - dist.f;
        dist.percent_pass =
            round_off_1_decimal(100.0 * passed as f64 / dist.registered as f64);
    }
    dist
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course(id: &str, code: &str, unit: i64) -> CourseRef {
        CourseRef {
            id: id.to_string(),
            code: code.to_string(),
            title: code.to_string(),
            unit,
            elective: false,
            level: 100,
            semester: 1,
        }
    }

    #[test]
    fn grade_cutoffs_match_fixed_thresholds() {
        assert_eq!(Grade::from_score(70.0), Grade::A);
        assert_eq!(Grade::from_score(69.9), Grade::B);
        assert_eq!(Grade::from_score(60.0), Grade::B);
        assert_eq!(Grade::from_score(50.0), Grade::C);
        assert_eq!(Grade::from_score(45.0), Grade::D);
        assert_eq!(Grade::from_score(44.9), Grade::E);
        assert_eq!(Grade::from_score(40.0), Grade::E);
        assert_eq!(Grade::from_score(39.9), Grade::F);
        assert_eq!(Grade::from_score(0.0), Grade::F);
    }

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_reg_no("  u2019/123  "), "U2019/123");
        assert_eq!(normalize_code(" mth 101 "), "MTH101");
        assert_eq!(normalize_id("  abc-1 "), "abc-1");
    }

    #[test]
    fn separation_dedupes_by_id_then_code_and_sorts() {
        let courses = vec![
            course("c2", "PHY101", 3),
            course("c1", "MTH101", 3),
            course("c1", "MTH101", 3), // duplicate id
            course("", "mth 101", 3),  // id-less duplicate of an already-seen code
            course("c3", "GSS111", 2),
            course("c4", "CHM101", 3),
        ];
        let approved_ids: HashSet<String> = ["c1", "c3"].iter().map(|s| s.to_string()).collect();
        let approved_codes: HashSet<String> = ["PHY101"].iter().map(|s| s.to_string()).collect();

        let sep = separate_courses(&courses, &approved_ids, &approved_codes);
        let regular: Vec<&str> = sep.regular.iter().map(|c| c.code.as_str()).collect();
        let carry: Vec<&str> = sep.carry_over.iter().map(|c| c.code.as_str()).collect();
        // Sorted by (unit, code) within each partition.
        assert_eq!(regular, vec!["GSS111", "MTH101", "PHY101"]);
        assert_eq!(carry, vec!["CHM101"]);
    }

    #[test]
    fn cell_classification_nr_00f_scored() {
        let nr = ResultCell::classify(false, None);
        assert_eq!(nr.display(), "NR");
        assert_eq!(nr.effective_grade(), None);

        let missing = ResultCell::classify(true, None);
        assert_eq!(missing.display(), "00F");
        assert_eq!(missing.effective_grade(), Some(Grade::F));

        let zero = ResultCell::classify(
            true,
            Some(RawResult {
                grandtotal: Some(0.0),
                grade: None,
            }),
        );
        assert_eq!(zero.display(), "00F");

        let scored = ResultCell::classify(
            true,
            Some(RawResult {
                grandtotal: Some(64.0),
                grade: None,
            }),
        );
        assert_eq!(scored.display(), "64B");

        // A stored grade wins over derivation.
        let moderated = ResultCell::classify(
            true,
            Some(RawResult {
                grandtotal: Some(64.0),
                grade: Some(Grade::A),
            }),
        );
        assert_eq!(moderated.display(), "64A");
    }

    #[test]
    fn result_lookup_tries_id_then_code_then_normalized_code() {
        let mut results: HashMap<String, RawResult> = HashMap::new();
        results.insert(
            "MTH101".to_string(),
            RawResult {
                grandtotal: Some(55.0),
                grade: None,
            },
        );
        let c = course("", "mth 101", 3);
        let found = result_for_course(&results, &c).expect("normalized code key");
        assert_eq!(found.grandtotal, Some(55.0));

        results.insert(
            "id-1".to_string(),
            RawResult {
                grandtotal: Some(70.0),
                grade: None,
            },
        );
        let c2 = course("id-1", "mth 101", 3);
        let found2 = result_for_course(&results, &c2).expect("id key wins");
        assert_eq!(found2.grandtotal, Some(70.0));
    }

    #[test]
    fn remark_lists_failed_courses_in_order() {
        let outcomes = vec![
            CourseOutcome {
                code: "MTH101".into(),
                unit: 3,
                grade: Grade::F,
            },
            CourseOutcome {
                code: "PHY101".into(),
                unit: 3,
                grade: Grade::C,
            },
            CourseOutcome {
                code: "gss 111".into(),
                unit: 2,
                grade: Grade::F,
            },
        ];
        assert_eq!(remark_for(&outcomes), "Repeat 3MTH101 2GSS111");

        let all_pass = vec![CourseOutcome {
            code: "MTH101".into(),
            unit: 3,
            grade: Grade::E,
        }];
        assert_eq!(remark_for(&all_pass), "Pass");
    }

    #[test]
    fn term_metrics_and_cumulative_roll_forward() {
        let outcomes = vec![
            CourseOutcome {
                code: "MTH101".into(),
                unit: 3,
                grade: Grade::A,
            },
            CourseOutcome {
                code: "PHY101".into(),
                unit: 3,
                grade: Grade::C,
            },
            CourseOutcome {
                code: "GSS111".into(),
                unit: 2,
                grade: Grade::F,
            },
        ];
        let term = compute_term_metrics(&outcomes);
        assert_eq!(term.tcc, 8);
        assert_eq!(term.tce, 6);
        assert_eq!(term.tpe, 24.0);
        assert_eq!(term.gpa, 3.0);

        let cum1 = accumulate(None, &term);
        assert_eq!(cum1.ccc, 8);
        assert_eq!(cum1.cgpa, 3.0);

        let term2 = compute_term_metrics(&[CourseOutcome {
            code: "MTH102".into(),
            unit: 4,
            grade: Grade::B,
        }]);
        let cum2 = accumulate(Some(cum1), &term2);
        assert_eq!(cum2.ccc, 12);
        assert_eq!(cum2.cce, 10);
        assert_eq!(cum2.cpe, 40.0);
        // 40 / 12 = 3.333..., to 2 decimals.
        assert_eq!(cum2.cgpa, 3.33);
    }

    #[test]
    fn empty_term_yields_zero_gpa() {
        let term = compute_term_metrics(&[]);
        assert_eq!(term.gpa, 0.0);
        let cum = accumulate(None, &term);
        assert_eq!(cum.cgpa, 0.0);
    }

    #[test]
    fn bucket_classification() {
        assert_eq!(
            classify_bucket(0, false, 0.0, None),
            StandingBucket::NonRegistration
        );
        assert_eq!(classify_bucket(5, false, 3.2, None), StandingBucket::Pass);
        assert_eq!(classify_bucket(5, true, 3.2, None), StandingBucket::Repeat);
        assert_eq!(
            classify_bucket(5, true, 1.2, Some(2.0)),
            StandingBucket::Probation
        );
        assert_eq!(
            classify_bucket(5, true, 1.2, Some(1.4)),
            StandingBucket::Withdrawal
        );
        assert_eq!(
            classify_bucket(5, true, 1.2, None),
            StandingBucket::Probation
        );
    }

    #[test]
    fn degree_class_boundaries() {
        assert_eq!(DegreeClass::from_cgpa(4.5), Some(DegreeClass::First));
        assert_eq!(DegreeClass::from_cgpa(4.49), Some(DegreeClass::SecondUpper));
        assert_eq!(DegreeClass::from_cgpa(2.4), Some(DegreeClass::SecondLower));
        assert_eq!(DegreeClass::from_cgpa(1.5), Some(DegreeClass::Third));
        assert_eq!(DegreeClass::from_cgpa(1.0), Some(DegreeClass::Pass));
        assert_eq!(DegreeClass::from_cgpa(0.99), None);
    }

    #[test]
    fn distribution_counts_missing_scores_as_f() {
        let cells = vec![
            ResultCell::NotRegistered,
            ResultCell::MissingScore,
            ResultCell::Scored {
                score: 71.0,
                grade: Grade::A,
            },
            ResultCell::Scored {
                score: 52.0,
                grade: Grade::C,
            },
            ResultCell::Scored {
                score: 30.0,
                grade: Grade::F,
            },
        ];
        let dist = grade_distribution(cells);
        assert_eq!(dist.registered, 4);
        assert_eq!(dist.a, 1);
        assert_eq!(dist.c, 1);
        assert_eq!(dist.f, 2);
        assert_eq!(dist.percent_pass, 50.0);
    }

    #[test]
    fn rounding_is_half_up() {
        assert_eq!(round_off_2_decimals(3.125), 3.13);
        assert_eq!(round_off_2_decimals(3.124), 3.12);
        assert_eq!(round_off_1_decimal(66.66), 66.7);
        assert_eq!(round_off_1_decimal(66.64), 66.6);
    }
}
