use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
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
}

fn seed_minimal(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seeded {
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
                "degree": "B.Sc."
            }),
        ),
        "programmes.create",
    );
    let programme_id = result_str(&programme, "programmeId");

    let _ = expect_ok(
        request(
            stdin,
            reader,
            "s5",
            "students.create",
            json!({
                "regNo": "U2023/001",
                "fullName": "ADAMS, Bola",
                "programmeId": programme_id,
                "level": 100
            }),
        ),
        "students.create",
    );
    let course = expect_ok(
        request(
            stdin,
            reader,
            "s6",
            "courses.create",
            json!({
                "code": "MTH101",
                "title": "General Mathematics I",
                "unit": 3,
                "level": 100,
                "semester": 1,
                "sessionId": session_id
            }),
        ),
        "courses.create",
    );
    let course_id = result_str(&course, "courseId");
    let _ = expect_ok(
        request(
            stdin,
            reader,
            "s7",
            "approvals.set",
            json!({
                "programmeId": programme_id,
                "sessionId": session_id,
                "level": 100,
                "semester": 1,
                "courseIds": [course_id]
            }),
        ),
        "approvals.set",
    );
    let _ = expect_ok(
        request(
            stdin,
            reader,
            "s8",
            "registrations.register",
            json!({ "courseId": course_id, "regNos": ["U2023/001"] }),
        ),
        "registrations.register",
    );
    let _ = expect_ok(
        request(
            stdin,
            reader,
            "s9",
            "results.upsert",
            json!({ "courseId": course_id, "regNo": "U2023/001", "grandTotal": 75.0 }),
        ),
        "results.upsert",
    );

    Seeded {
        session_id,
        programme_id,
    }
}

fn cohort_params(seeded: &Seeded, out_path: &std::path::Path) -> serde_json::Value {
    json!({
        "programmeId": seeded.programme_id,
        "sessionId": seeded.session_id,
        "level": 100,
        "semester": 1,
        "outPath": out_path.to_string_lossy()
    })
}

#[test]
fn csv_export_writes_letterhead_and_student_rows() {
    let workspace = temp_dir("examrec-export-csv");
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
    let seeded = seed_minimal(&mut stdin, &mut reader);

    let out = workspace.join("result-sheet.csv");
    let exported = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "1",
            "exports.resultSheetCsv",
            cohort_params(&seeded, &out),
        ),
        "exports.resultSheetCsv",
    );
    assert!(exported.get("rowCount").and_then(|v| v.as_u64()).unwrap_or(0) > 0);

    let content = std::fs::read_to_string(&out).expect("read exported csv");
    assert!(content.contains("UNIVERSITY EXAMINATION RECORDS"));
    assert!(content.contains("RESULT SHEET"));
    assert!(content.contains("3MTH101"));
    assert!(content.contains("U2023/001"));
    assert!(content.contains("75A"));
    assert!(content.contains("Pass"));

    let summary_out = workspace.join("grade-summary.csv");
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "2",
            "exports.gradeSummaryCsv",
            cohort_params(&seeded, &summary_out),
        ),
        "exports.gradeSummaryCsv",
    );
    let summary = std::fs::read_to_string(&summary_out).expect("read grade summary csv");
    assert!(summary.contains("GRADE SUMMARY"));
    assert!(summary.contains("MTH101"));
    assert!(summary.contains("100.0"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn xlsx_export_produces_a_zip_package() {
    let workspace = temp_dir("examrec-export-xlsx");
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
    let seeded = seed_minimal(&mut stdin, &mut reader);

    let out = workspace.join("result-sheet.xlsx");
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "1",
            "exports.resultSheetXlsx",
            cohort_params(&seeded, &out),
        ),
        "exports.resultSheetXlsx",
    );

    let mut magic = [0u8; 2];
    std::fs::File::open(&out)
        .expect("open xlsx")
        .read_exact(&mut magic)
        .expect("read xlsx magic");
    assert_eq!(&magic, b"PK");

    // The workbook must contain the standard SpreadsheetML entries.
    let file = std::fs::File::open(&out).expect("reopen xlsx");
    let mut archive = zip::ZipArchive::new(file).expect("open xlsx as zip");
    for entry in [
        "[Content_Types].xml",
        "_rels/.rels",
        "xl/workbook.xml",
        "xl/worksheets/sheet1.xml",
    ] {
        assert!(
            archive.by_name(entry).is_ok(),
            "missing xlsx entry {}",
            entry
        );
    }

    let mut sheet = String::new();
    archive
        .by_name("xl/worksheets/sheet1.xml")
        .expect("sheet entry")
        .read_to_string(&mut sheet)
        .expect("read sheet xml");
    assert!(sheet.contains("U2023/001"));
    assert!(sheet.contains("75A"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
