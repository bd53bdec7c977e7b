use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{bool_flag, db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};

struct EvaluationRow {
    class_id: String,
    status: String,
    min_score: f64,
    max_score: f64,
    coefficient: f64,
}

fn load_evaluation(
    conn: &rusqlite::Connection,
    evaluation_id: &str,
) -> Result<Option<EvaluationRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT class_id, status, min_score, max_score, coefficient
         FROM evaluations WHERE id = ?",
        [evaluation_id],
        |r| {
            Ok(EvaluationRow {
                class_id: r.get(0)?,
                status: r.get(1)?,
                min_score: r.get(2)?,
                max_score: r.get(3)?,
                coefficient: r.get(4)?,
            })
        },
    )
    .optional()
}

fn handle_grades_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let absent = bool_flag(req, "absent");
    let recorded_by = optional_str(req, "recordedBy");

    let evaluation = match load_evaluation(conn, &evaluation_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(evaluation) = evaluation else {
        return err(&req.id, "not_found", "evaluation not found", None);
    };
    if evaluation.status == "cancelled" {
        return err(
            &req.id,
            "bad_params",
            "cannot record a grade on a cancelled evaluation",
            None,
        );
    }

    let in_class: Option<String> = match conn
        .query_row(
            "SELECT id FROM students WHERE id = ? AND class_id = ?",
            (&student_id, &evaluation.class_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_class.is_none() {
        return err(
            &req.id,
            "not_found",
            "student not found in the evaluation's class",
            None,
        );
    }

    // An absent student has no score to bound-check; the minimum stands in so
    // the row still satisfies the schema.
    let score = if absent {
        evaluation.min_score
    } else {
        match req.params.get("score").and_then(|v| v.as_f64()) {
            Some(v) => v,
            None => return err(&req.id, "bad_params", "missing numeric score", None),
        }
    };
    if !absent && (score < evaluation.min_score || score > evaluation.max_score) {
        return err(
            &req.id,
            "score_out_of_range",
            "score is outside the evaluation's declared bounds",
            Some(json!({
                "score": score,
                "minScore": evaluation.min_score,
                "maxScore": evaluation.max_score,
            })),
        );
    }

    let weighted_score = score * evaluation.coefficient;
    let grade_id = Uuid::new_v4().to_string();
    let recorded_at = Utc::now().to_rfc3339();
    match conn.execute(
        "INSERT INTO grades(id, student_id, evaluation_id, score, weighted_score, absent, recorded_by, recorded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &student_id,
            &evaluation_id,
            score,
            weighted_score,
            absent as i64,
            &recorded_by,
            &recorded_at,
        ),
    ) {
        Ok(_) => ok(
            &req.id,
            json!({
                "gradeId": grade_id,
                "score": score,
                "weightedScore": weighted_score,
                "absent": absent,
                "recordedAt": recorded_at,
            }),
        ),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            // The original grade stays untouched; corrections go through
            // grades.update.
            err(
                &req.id,
                "duplicate_grade",
                "a grade already exists for this student and evaluation",
                Some(json!({ "studentId": student_id, "evaluationId": evaluation_id })),
            )
        }
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_grades_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let absent = bool_flag(req, "absent");
    let recorded_by = optional_str(req, "recordedBy");

    let evaluation = match load_evaluation(conn, &evaluation_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(evaluation) = evaluation else {
        return err(&req.id, "not_found", "evaluation not found", None);
    };
    if evaluation.status == "cancelled" {
        return err(
            &req.id,
            "bad_params",
            "cannot correct a grade on a cancelled evaluation",
            None,
        );
    }

    let score = if absent {
        evaluation.min_score
    } else {
        match req.params.get("score").and_then(|v| v.as_f64()) {
            Some(v) => v,
            None => return err(&req.id, "bad_params", "missing numeric score", None),
        }
    };
    if !absent && (score < evaluation.min_score || score > evaluation.max_score) {
        return err(
            &req.id,
            "score_out_of_range",
            "score is outside the evaluation's declared bounds",
            Some(json!({
                "score": score,
                "minScore": evaluation.min_score,
                "maxScore": evaluation.max_score,
            })),
        );
    }

    // Corrections re-derive the weighted score; it is never recomputed as a
    // storage side effect.
    let weighted_score = score * evaluation.coefficient;
    let recorded_at = Utc::now().to_rfc3339();
    let changed = match conn.execute(
        "UPDATE grades SET score = ?, weighted_score = ?, absent = ?, recorded_by = ?, recorded_at = ?
         WHERE student_id = ? AND evaluation_id = ?",
        (
            score,
            weighted_score,
            absent as i64,
            &recorded_by,
            &recorded_at,
            &student_id,
            &evaluation_id,
        ),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(
            &req.id,
            "not_found",
            "no grade exists for this student and evaluation; use grades.record",
            None,
        );
    }
    ok(
        &req.id,
        json!({
            "score": score,
            "weightedScore": weighted_score,
            "absent": absent,
            "recordedAt": recorded_at,
        }),
    )
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.student_id, s.last_name, s.first_name,
                g.score, g.weighted_score, g.absent, g.recorded_by, g.recorded_at
         FROM grades g
         JOIN students s ON s.id = g.student_id
         WHERE g.evaluation_id = ?
         ORDER BY s.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grades = match stmt
        .query_map([&evaluation_id], |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            let score: f64 = r.get(4)?;
            let weighted_score: f64 = r.get(5)?;
            let absent: i64 = r.get(6)?;
            let recorded_by: Option<String> = r.get(7)?;
            let recorded_at: Option<String> = r.get(8)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "displayName": format!("{}, {}", last, first),
                "score": score,
                "weightedScore": weighted_score,
                "absent": absent != 0,
                "recordedBy": recorded_by,
                "recordedAt": recorded_at,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "grades": grades }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.record" => Some(handle_grades_record(state, req)),
        "grades.update" => Some(handle_grades_update(state, req)),
        "grades.list" => Some(handle_grades_list(state, req)),
        _ => None,
    }
}
