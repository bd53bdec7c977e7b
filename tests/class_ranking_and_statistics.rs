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
    let exe = env!("CARGO_BIN_EXE_bulletind");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bulletind");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing string field {}", key))
        .to_string()
}

#[test]
fn class_generation_ranks_ties_and_isolates_failing_students() {
    let workspace = temp_dir("bulletin-ranking");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let io = (&mut stdin, &mut reader);

    let _ = request_ok(
        io.0,
        io.1,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let math = request_ok(
        io.0,
        io.1,
        "2",
        "subjects.create",
        json!({ "code": "MATH", "name": "Mathematics" }),
    );
    let math_id = str_field(&math, "subjectId");
    let _ = request_ok(
        io.0,
        io.1,
        "3",
        "coefficients.set",
        json!({ "subjectId": math_id, "level": "3e", "coefficient": 1 }),
    );
    let class = request_ok(
        io.0,
        io.1,
        "4",
        "classes.create",
        json!({ "name": "3e B", "level": "3e", "academicYearId": "2025-2026" }),
    );
    let class_id = str_field(&class, "classId");

    let mut student_ids: Vec<String> = Vec::new();
    for (n, last) in ["Traore", "Kone", "Diallo", "Sanogo", "Zongo"].iter().enumerate() {
        let res = request_ok(
            io.0,
            io.1,
            &format!("s{}", n),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": "Test" }),
        );
        student_ids.push(str_field(&res, "studentId"));
    }

    let eval = request_ok(
        io.0,
        io.1,
        "e1",
        "evaluations.create",
        json!({
            "subjectId": math_id,
            "classId": class_id,
            "academicYearId": "2025-2026",
            "term": 1,
            "title": "Term exam",
            "kind": "exam",
        }),
    );
    let eval_id = str_field(&eval, "evaluationId");
    let _ = request_ok(
        io.0,
        io.1,
        "e1-done",
        "evaluations.setStatus",
        json!({ "evaluationId": eval_id, "status": "completed" }),
    );

    // The fifth student gets no grade at all and must fail in isolation.
    let scores = [18.5, 14.0, 14.0, 9.5];
    for (n, score) in scores.iter().enumerate() {
        let _ = request_ok(
            io.0,
            io.1,
            &format!("g{}", n),
            "grades.record",
            json!({ "studentId": student_ids[n], "evaluationId": eval_id, "score": score }),
        );
    }

    let outcome = request_ok(
        io.0,
        io.1,
        "gen",
        "reports.generateClass",
        json!({ "classId": class_id, "academicYearId": "2025-2026", "term": 1 }),
    );

    let built = outcome.get("built").and_then(|v| v.as_array()).expect("built");
    assert_eq!(built.len(), 4);
    let failures = outcome
        .get("failures")
        .and_then(|v| v.as_array())
        .expect("failures");
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].get("studentId").and_then(|v| v.as_str()),
        Some(student_ids[4].as_str())
    );
    assert_eq!(
        failures[0].get("reason").and_then(|v| v.as_str()),
        Some("no_grades_available")
    );

    let stats = outcome.get("statistics").expect("statistics");
    assert_eq!(stats.get("classSize").and_then(|v| v.as_i64()), Some(4));
    assert_eq!(stats.get("classAverage").and_then(|v| v.as_f64()), Some(14.0));
    assert_eq!(stats.get("classMax").and_then(|v| v.as_f64()), Some(18.5));
    assert_eq!(stats.get("classMin").and_then(|v| v.as_f64()), Some(9.5));

    // Competition ranking: a shared 14.0 consumes positions 2 and 3.
    let ranks = stats.get("ranks").and_then(|v| v.as_array()).expect("ranks");
    assert_eq!(ranks.len(), 4);
    let rank_of = |student_id: &str| -> i64 {
        ranks
            .iter()
            .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
            .and_then(|r| r.get("rank"))
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| panic!("no rank for {}", student_id))
    };
    assert_eq!(rank_of(&student_ids[0]), 1);
    assert_eq!(rank_of(&student_ids[1]), 2);
    assert_eq!(rank_of(&student_ids[2]), 2);
    assert_eq!(rank_of(&student_ids[3]), 4);

    // Every built snapshot carries the back-filled statistics and is finalized.
    for snapshot in built {
        assert_eq!(snapshot.get("state").and_then(|v| v.as_str()), Some("finalized"));
        assert_eq!(snapshot.get("classSize").and_then(|v| v.as_i64()), Some(4));
        assert_eq!(
            snapshot.get("classAverage").and_then(|v| v.as_f64()),
            Some(14.0)
        );
        assert!(snapshot.get("rank").and_then(|v| v.as_i64()).is_some());
    }

    // The stored card for the top student agrees with the batch response.
    let card = request_ok(
        io.0,
        io.1,
        "get-top",
        "reports.get",
        json!({
            "classId": class_id,
            "academicYearId": "2025-2026",
            "term": 1,
            "studentId": student_ids[0],
        }),
    );
    assert_eq!(card.get("rank").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(card.get("generalAverage").and_then(|v| v.as_f64()), Some(18.5));
    assert_eq!(card.get("mention").and_then(|v| v.as_str()), Some("Excellent"));
    assert_eq!(card.get("state").and_then(|v| v.as_str()), Some("finalized"));

    // Each finalized snapshot left an audit event for the period.
    let events = request_ok(
        io.0,
        io.1,
        "ev",
        "reports.events",
        json!({ "classId": class_id, "academicYearId": "2025-2026", "term": 1 }),
    );
    let finalized = events
        .get("events")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter(|e| e.get("kind").and_then(|v| v.as_str()) == Some("finalized"))
                .count()
        })
        .unwrap_or(0);
    assert_eq!(finalized, 4);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
