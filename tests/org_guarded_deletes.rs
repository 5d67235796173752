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

fn expect_error_code(value: serde_json::Value, code: &str, what: &str) {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        what,
        value
    );
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some(code),
        "{} wrong error code: {}",
        what,
        value
    );
}

fn result_str(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {}", key))
        .to_string()
}

#[test]
fn deletes_refuse_while_dependents_exist() {
    let workspace = temp_dir("examrec-org-deletes");
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
            json!({ "name": "2023/2024" }),
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
    let college_id = result_str(&college, "collegeId");
    let department = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "3",
            "departments.create",
            json!({ "collegeId": college_id, "code": "MTH", "name": "Mathematics" }),
        ),
        "departments.create",
    );
    let department_id = result_str(&department, "departmentId");
    let programme = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "4",
            "programmes.create",
            json!({
                "departmentId": department_id,
                "name": "Mathematics",
                "degree": "B.Sc."
            }),
        ),
        "programmes.create",
    );
    let programme_id = result_str(&programme, "programmeId");
    let student = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "5",
            "students.create",
            json!({
                "regNo": "u2023/001 ",
                "fullName": "ADAMS, Bola",
                "programmeId": programme_id,
                "level": 100
            }),
        ),
        "students.create",
    );
    // Registration numbers are normalized on the way in.
    assert_eq!(
        student.get("regNo").and_then(|v| v.as_str()),
        Some("U2023/001")
    );
    let student_id = result_str(&student, "studentId");

    expect_error_code(
        request(
            &mut stdin,
            &mut reader,
            "6",
            "colleges.delete",
            json!({ "collegeId": college_id }),
        ),
        "conflict",
        "colleges.delete with departments",
    );
    expect_error_code(
        request(
            &mut stdin,
            &mut reader,
            "7",
            "departments.delete",
            json!({ "departmentId": department_id }),
        ),
        "conflict",
        "departments.delete with programmes",
    );
    expect_error_code(
        request(
            &mut stdin,
            &mut reader,
            "8",
            "programmes.delete",
            json!({ "programmeId": programme_id }),
        ),
        "conflict",
        "programmes.delete with students",
    );

    // A student with recorded results cannot be deleted either.
    let course = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "9",
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
            &mut stdin,
            &mut reader,
            "10",
            "registrations.register",
            json!({ "courseId": course_id, "regNos": ["U2023/001"] }),
        ),
        "registrations.register",
    );
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "11",
            "results.upsert",
            json!({ "courseId": course_id, "regNo": "U2023/001", "grandTotal": 70.0 }),
        ),
        "results.upsert",
    );
    expect_error_code(
        request(
            &mut stdin,
            &mut reader,
            "12",
            "students.delete",
            json!({ "studentId": student_id }),
        ),
        "conflict",
        "students.delete with results",
    );
    expect_error_code(
        request(
            &mut stdin,
            &mut reader,
            "13",
            "registrations.delete",
            json!({ "courseId": course_id, "regNo": "U2023/001" }),
        ),
        "conflict",
        "registrations.delete with result",
    );
    expect_error_code(
        request(
            &mut stdin,
            &mut reader,
            "14",
            "courses.delete",
            json!({ "courseId": course_id }),
        ),
        "conflict",
        "courses.delete with results",
    );

    // Clearing the results unblocks the chain bottom-up.
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "15",
            "results.bulkDelete",
            json!({ "courseId": course_id }),
        ),
        "results.bulkDelete",
    );
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "16",
            "students.delete",
            json!({ "studentId": student_id }),
        ),
        "students.delete",
    );
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "17",
            "programmes.delete",
            json!({ "programmeId": programme_id }),
        ),
        "programmes.delete",
    );
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "18",
            "departments.delete",
            json!({ "departmentId": department_id }),
        ),
        "departments.delete",
    );
    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "19",
            "colleges.delete",
            json!({ "collegeId": college_id }),
        ),
        "colleges.delete",
    );

    // Sessions close rather than delete; closing is idempotent.
    let closed = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "20",
            "sessions.close",
            json!({ "sessionId": session_id }),
        ),
        "sessions.close",
    );
    assert_eq!(closed.get("closed").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_standing_patch_validates_values() {
    let workspace = temp_dir("examrec-standing");
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
    let college = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "1",
            "colleges.create",
            json!({ "code": "SC", "name": "College of Science" }),
        ),
        "colleges.create",
    );
    let department = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "2",
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
            "3",
            "programmes.create",
            json!({
                "departmentId": result_str(&department, "departmentId"),
                "name": "Mathematics",
                "degree": "B.Sc."
            }),
        ),
        "programmes.create",
    );
    let student = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "4",
            "students.create",
            json!({
                "regNo": "U2023/001",
                "fullName": "ADAMS, Bola",
                "programmeId": result_str(&programme, "programmeId"),
                "level": 100
            }),
        ),
        "students.create",
    );
    let student_id = result_str(&student, "studentId");

    let _ = expect_ok(
        request(
            &mut stdin,
            &mut reader,
            "5",
            "students.update",
            json!({ "studentId": student_id, "patch": { "standing": "withdrawn" } }),
        ),
        "students.update standing",
    );
    let listed = expect_ok(
        request(&mut stdin, &mut reader, "6", "students.list", json!({})),
        "students.list",
    );
    let students = listed
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students array");
    assert_eq!(
        students[0].get("standing").and_then(|v| v.as_str()),
        Some("withdrawn")
    );

    expect_error_code(
        request(
            &mut stdin,
            &mut reader,
            "7",
            "students.update",
            json!({ "studentId": student_id, "patch": { "standing": "expelled" } }),
        ),
        "bad_params",
        "students.update invalid standing",
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
