use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_examrecd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn examrecd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn expect_ok(value: serde_json::Value, what: &str) -> serde_json::Value {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        what,
        value
    );
    value.get("result").cloned().expect("result payload")
}

fn result_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {}", key))
        .to_string()
}

struct Seeded {
    session_id: String,
    programme_id: String,
    student_ids: Vec<String>,
}

/// Two level-100 students, three approved courses, one unapproved carry-over
/// course, and results:
///   U2023/001: GST103 42E, PHY101 55C, MTH101 75A, CSC111 45D (carry-over)
///   U2023/002: GST103 unscored, PHY101 62B, MTH101 35F, CSC111 not registered
fn seed_cohort(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seeded {
    let session = expect_ok(
        request(stdin, reader, "s1", "sessions.create", json!({ "name": "2023/2024" })),
        "sessions.create",
    );
    let session_id = result_str(&session, "sessionId");
    let college = expect_ok(
        request(
            stdin,
            reader,
            "s2",
            "colleges.create",
            json!({ "code": "SC", "name": "College of Science" }),
        ),
        "colleges.create",
    );
    let department = expect_ok(
        request(
            stdin,
            reader,
            "s3",
            "departments.create",
            json!({
                "collegeId": result_str(&college, "collegeId"),
                "code": "MTH",
                "name": "Mathematics"
            }),
        ),
        "departments.create",
    );
    let programme = expect_ok(
        request(
            stdin,
            reader,
            "s4",
            "programmes.create",
            json!({
                "departmentId": result_str(&department, "departmentId"),
                "name": "Mathematics",
                "degree": "B.Sc.",
                "durationYears": 4
            }),
        ),
        "programmes.create",
    );
    let programme_id = result_str(&programme, "programmeId");

    let mut student_ids = Vec::new();
    for (i, (reg_no, name)) in [("U2023/001", "ADAMS, Bola"), ("U2023/002", "BELLO, Chidi")]
        .iter()
        .enumerate()
    {
        let created = expect_ok(
            request(
                stdin,
                reader,
                &format!("st{}", i),
                "students.create",
                json!({
                    "regNo": reg_no,
                    "fullName": name,
                    "programmeId": programme_id,
                    "level": 100
                }),
            ),
            "students.create",
        );
        student_ids.push(result_str(&created, "studentId"));
    }

    let mut course_ids = Vec::new();
    for (i, (code, unit)) in [("MTH101", 3), ("PHY101", 2), ("GST103", 1), ("CSC111", 2)]
        .iter()
        .enumerate()
    {
        let course = expect_ok(
            request(
                stdin,
                reader,
                &format!("c{}", i),
                "courses.create",
                json!({
                    "code": code,
                    "title": code,
                    "unit": unit,
                    "level": 100,
                    "semester": 1,
                    "sessionId": session_id
                }),
            ),
            "courses.create",
        );
        course_ids.push(result_str(&course, "courseId"));
    }
    // CSC111 stays out of the approved list on purpose.
    let _ = expect_ok(
        request(
            stdin,
            reader,
            "a1",
            "approvals.set",
            json!({
                "programmeId": programme_id,
                "sessionId": session_id,
                "level": 100,
                "semester": 1,
                "courseIds": [course_ids[0], course_ids[1], course_ids[2]]
            }),
        ),
        "approvals.set",
    );

    for (i, (course_id, reg_nos)) in [
        (&course_ids[0], vec!["U2023/001", "U2023/002"]),
        (&course_ids[1], vec!["U2023/001", "U2023/002"]),
        (&course_ids[2], vec!["U2023/001", "U2023/002"]),
        (&course_ids[3], vec!["U2023/001"]),
    ]
    .iter()
    .enumerate()
    {
        let _ = expect_ok(
            request(
                stdin,
                reader,
                &format!("r{}", i),
                "registrations.register",
                json!({ "courseId": course_id, "regNos": reg_nos }),
            ),
            "registrations.register",
        );
    }

    for (i, (course_id, reg_no, total)) in [
        (&course_ids[0], "U2023/001", 75.0),
        (&course_ids[1], "U2023/001", 55.0),
        (&course_ids[2], "U2023/001", 42.0),
        (&course_ids[3], "U2023/001", 45.0),
        (&course_ids[0], "U2023/002", 35.0),
        (&course_ids[1], "U2023/002", 62.0),
    ]
    .iter()
    .enumerate()
    {
        let _ = expect_ok(
            request(
                stdin,
                reader,
                &format!("u{}", i),
                "results.upsert",
                json!({ "courseId": course_id, "regNo": reg_no, "grandTotal": total }),
            ),
            "results.upsert",
        );
    }

    Seeded {
        session_id,
        programme_id,
        student_ids,
    }
}

fn cohort_params(seeded: &Seeded) -> serde_json::Value {
    json!({
        "programmeId": seeded.programme_id,
        "sessionId": seeded.session_id,
        "level": 100,
        "semester": 1
    })
}

fn row_for<'a>(rows: &'a [serde_json::Value], reg_no: &str) -> &'a serde_json::Value {
    rows.iter()
        .find(|r| r.get("regNo").and_then(|v| v.as_str()) == Some(reg_no))
        .unwrap_or_else(|| panic!("no row for {}", reg_no))
}

fn cells(row: &serde_json::Value, key: &str) -> Vec<String> {
    row.get(key)
        .and_then(|v| v.as_array())
        .expect("cells array")
        .iter()
        .map(|v| v.as_str().expect("cell string").to_string())
        .collect()
}

#[test]
fn result_sheet_separates_sections_and_formats_cells() {
    let workspace = temp_dir("examrec-result-sheet");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "w",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        ),
        "workspace.select",
    );
    let seeded = seed_cohort(&mut stdin, &mut reader);

    let model = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "1",
            "reports.resultSheetModel",
            cohort_params(&seeded),
        ),
        "reports.resultSheetModel",
    );

    let keys = |section: &str| -> Vec<String> {
        model
            .get(section)
            .and_then(|v| v.as_array())
            .expect("course columns")
            .iter()
            .map(|c| c.get("key").and_then(|v| v.as_str()).expect("key").to_string())
            .collect()
    };
    assert_eq!(keys("regularCourses"), ["1GST103", "2PHY101", "3MTH101"]);
    assert_eq!(keys("carryOverCourses"), ["2CSC111"]);

    assert_eq!(model.get("pageCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(model.get("studentCount").and_then(|v| v.as_u64()), Some(2));
    let letterhead = model.get("letterhead").expect("letterhead");
    assert_eq!(
        letterhead.get("title").and_then(|v| v.as_str()),
        Some("RESULT SHEET")
    );
    assert_eq!(
        model
            .get("signatories")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(3)
    );

    let rows = model.get("pages").and_then(|v| v.as_array()).expect("pages")[0]
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows")
        .clone();

    let first = row_for(&rows, "U2023/001");
    assert_eq!(cells(first, "regularCells"), ["42E", "55C", "75A"]);
    assert_eq!(cells(first, "carryOverCells"), ["45D"]);
    assert_eq!(first.get("remark").and_then(|v| v.as_str()), Some("Pass"));
    // 1E + 2C*3 + 3A*5 + 2D*2 over 8 units.
    assert_eq!(
        first
            .get("current")
            .and_then(|m| m.get("gpa"))
            .and_then(|v| v.as_f64()),
        Some(3.25)
    );

    let second = row_for(&rows, "U2023/002");
    assert_eq!(cells(second, "regularCells"), ["00F", "62B", "35F"]);
    assert_eq!(cells(second, "carryOverCells"), ["NR"]);
    assert_eq!(
        second.get("remark").and_then(|v| v.as_str()),
        Some("Repeat 1GST103 3MTH101")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn pass_fail_and_grade_summary_models_classify_the_cohort() {
    let workspace = temp_dir("examrec-pass-fail");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "w",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        ),
        "workspace.select",
    );
    let seeded = seed_cohort(&mut stdin, &mut reader);

    let pass_fail = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "1",
            "reports.passFailModel",
            cohort_params(&seeded),
        ),
        "reports.passFailModel",
    );
    let bucket_reg_nos = |bucket: &str| -> Vec<String> {
        pass_fail
            .get(bucket)
            .and_then(|v| v.as_array())
            .expect("bucket array")
            .iter()
            .map(|e| e.get("regNo").and_then(|v| v.as_str()).expect("regNo").to_string())
            .collect()
    };
    assert_eq!(bucket_reg_nos("pass"), ["U2023/001"]);
    // GPA 8/6 = 1.33 sits under the probation line.
    assert_eq!(bucket_reg_nos("probation"), ["U2023/002"]);
    assert!(bucket_reg_nos("repeat").is_empty());
    assert!(bucket_reg_nos("withdrawal").is_empty());

    let summary = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "2",
            "reports.gradeSummaryModel",
            cohort_params(&seeded),
        ),
        "reports.gradeSummaryModel",
    );
    assert_eq!(summary.get("courseCount").and_then(|v| v.as_u64()), Some(4));
    let rows = summary.get("pages").and_then(|v| v.as_array()).expect("pages")[0]
        .get("rows")
        .and_then(|v| v.as_array())
        .expect("rows")
        .clone();
    let mth = rows
        .iter()
        .find(|r| r.get("key").and_then(|v| v.as_str()) == Some("3MTH101"))
        .expect("MTH101 summary row");
    assert_eq!(mth.get("registered").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(mth.get("a").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(mth.get("f").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(mth.get("percentPass").and_then(|v| v.as_f64()), Some(50.0));

    let gst = rows
        .iter()
        .find(|r| r.get("key").and_then(|v| v.as_str()) == Some("1GST103"))
        .expect("GST103 summary row");
    // Registered with no score counts as a failure.
    assert_eq!(gst.get("f").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(gst.get("e").and_then(|v| v.as_u64()), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn second_failing_term_escalates_probation_to_withdrawal() {
    let workspace = temp_dir("examrec-withdrawal");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "w",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        ),
        "workspace.select",
    );

    let session = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "1",
            "sessions.create",
            json!({ "name": "2024/2025" }),
        ),
        "sessions.create",
    );
    let session_id = result_str(&session, "sessionId");
    let college = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "2",
            "colleges.create",
            json!({ "code": "SC", "name": "College of Science" }),
        ),
        "colleges.create",
    );
    let department = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "3",
            "departments.create",
            json!({
                "collegeId": result_str(&college, "collegeId"),
                "code": "MTH",
                "name": "Mathematics"
            }),
        ),
        "departments.create",
    );
    let programme = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "4",
            "programmes.create",
            json!({
                "departmentId": result_str(&department, "departmentId"),
                "name": "Mathematics",
                "degree": "B.Sc.",
                "durationYears": 4
            }),
        ),
        "programmes.create",
    );
    let programme_id = result_str(&programme, "programmeId");
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "5",
            "students.create",
            json!({
                "regNo": "U2024/007",
                "fullName": "DANJUMA, Efe",
                "programmeId": programme_id,
                "level": 100
            }),
        ),
        "students.create",
    );

    // One failed 3-unit course in each semester of the same session.
    for (i, (code, semester)) in [("MTH101", 1), ("MTH102", 2)].iter().enumerate() {
        let course = expect_ok(
            request(
                &mut stdin,
                &mut reader,
                &format!("c{}", i),
                "courses.create",
                json!({
                    "code": code,
                    "title": code,
                    "unit": 3,
                    "level": 100,
                    "semester": semester,
                    "sessionId": session_id
                }),
            ),
            "courses.create",
        );
        let course_id = result_str(&course, "courseId");
        let _ = expect_ok(
            request(
                &mut stdin,
                &mut reader,
                &format!("a{}", i),
                "approvals.set",
                json!({
                    "programmeId": programme_id,
                    "sessionId": session_id,
                    "level": 100,
                    "semester": semester,
                    "courseIds": [course_id]
                }),
            ),
            "approvals.set",
        );
        let _ = expect_ok(
            request(
                &mut stdin,
                &mut reader,
                &format!("r{}", i),
                "registrations.register",
                json!({ "courseId": course_id, "regNos": ["U2024/007"] }),
            ),
            "registrations.register",
        );
        let _ = expect_ok(
            request(
                &mut stdin,
                &mut reader,
                &format!("u{}", i),
                "results.upsert",
                json!({ "courseId": course_id, "regNo": "U2024/007", "grandTotal": 30.0 }),
            ),
            "results.upsert",
        );
    }

    let bucket_reg_nos = |model: &serde_json::Value, bucket: &str| -> Vec<String> {
        model
            .get(bucket)
            .and_then(|v| v.as_array())
            .expect("bucket array")
            .iter()
            .map(|e| e.get("regNo").and_then(|v| v.as_str()).expect("regNo").to_string())
            .collect()
    };

    let scope = |semester: i64| {
        json!({
            "programmeId": programme_id,
            "sessionId": session_id,
            "level": 100,
            "semester": semester
        })
    };

    // First failing term: no history yet, so probation.
    let first_term = expect_ok(
        request(&mut stdin, &mut reader, "p1", "reports.passFailModel", scope(1)),
        "reports.passFailModel semester 1",
    );
    assert_eq!(bucket_reg_nos(&first_term, "probation"), ["U2024/007"]);
    assert!(bucket_reg_nos(&first_term, "withdrawal").is_empty());

    // Store the first term so the second one can see the prior GPA.
    let _ = expect_ok(
        request(&mut stdin, &mut reader, "m1", "metrics.recompute", scope(1)),
        "metrics.recompute semester 1",
    );

    let second_term = expect_ok(
        request(&mut stdin, &mut reader, "p2", "reports.passFailModel", scope(2)),
        "reports.passFailModel semester 2",
    );
    assert_eq!(bucket_reg_nos(&second_term, "withdrawal"), ["U2024/007"]);
    assert!(bucket_reg_nos(&second_term, "probation").is_empty());
    assert!(bucket_reg_nos(&second_term, "pass").is_empty());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn statement_and_graduating_list_models() {
    let workspace = temp_dir("examrec-statement");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "w",
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        ),
        "workspace.select",
    );
    let seeded = seed_cohort(&mut stdin, &mut reader);

    let statement = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "1",
            "reports.statementModel",
            json!({ "regNo": "U2023/001" }),
        ),
        "reports.statementModel",
    );
    let terms = statement
        .get("terms")
        .and_then(|v| v.as_array())
        .expect("terms");
    assert_eq!(terms.len(), 1);
    let courses = terms[0]
        .get("courses")
        .and_then(|v| v.as_array())
        .expect("term courses");
    assert_eq!(courses.len(), 4);
    assert_eq!(
        statement
            .get("cumulative")
            .and_then(|c| c.get("cgpa"))
            .and_then(|v| v.as_f64()),
        Some(3.25)
    );
    assert_eq!(
        statement.get("degreeClass").and_then(|v| v.as_str()),
        Some("Second Class Honours (Lower Division)")
    );

    // Graduating list works off stored metrics and final-level students.
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "2",
            "metrics.recompute",
            cohort_params(&seeded),
        ),
        "metrics.recompute",
    );
    for (i, student_id) in seeded.student_ids.iter().enumerate() {
        let _ = expect_ok(
            request(
                &mut stdin,
                &mut reader,
                &format!("lv{}", i),
                "students.update",
                json!({ "studentId": student_id, "patch": { "level": 400 } }),
            ),
            "students.update",
        );
    }

    let graduating = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "3",
            "reports.graduatingListModel",
            json!({
                "programmeId": seeded.programme_id,
                "sessionId": seeded.session_id
            }),
        ),
        "reports.graduatingListModel",
    );
    assert_eq!(
        graduating.get("graduandCount").and_then(|v| v.as_u64()),
        Some(1)
    );
    let groups = graduating
        .get("groups")
        .and_then(|v| v.as_array())
        .expect("groups");
    assert_eq!(groups.len(), 1);
    assert_eq!(
        groups[0].get("classLabel").and_then(|v| v.as_str()),
        Some("Second Class Honours (Lower Division)")
    );
    let skipped = graduating
        .get("skipped")
        .and_then(|v| v.as_array())
        .expect("skipped");
    assert_eq!(skipped.len(), 1);
    assert_eq!(
        skipped[0].get("regNo").and_then(|v| v.as_str()),
        Some("U2023/002")
    );
    assert!(skipped[0]
        .get("reason")
        .and_then(|v| v.as_str())
        .expect("reason")
        .contains("MTH101"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
