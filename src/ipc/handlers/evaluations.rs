use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::academic::{EvaluationKind, EvaluationStatus};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str, required_term};
use crate::ipc::types::{AppState, Request};

fn handle_evaluations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year_id = match required_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match required_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let kind_raw = match required_str(req, "kind") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(kind) = EvaluationKind::parse(&kind_raw) else {
        return err(
            &req.id,
            "bad_params",
            "kind must be one of: exam, test, homework, quiz, participation",
            Some(json!({ "kind": kind_raw })),
        );
    };
    let teacher = optional_str(req, "teacher");
    let min_score = req
        .params
        .get("minScore")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);
    let max_score = req
        .params
        .get("maxScore")
        .and_then(|v| v.as_f64())
        .unwrap_or(20.0);
    let coefficient = req
        .params
        .get("coefficient")
        .and_then(|v| v.as_f64())
        .unwrap_or(1.0);
    if max_score <= min_score {
        return err(
            &req.id,
            "bad_params",
            "maxScore must be greater than minScore",
            Some(json!({ "minScore": min_score, "maxScore": max_score })),
        );
    }
    if coefficient <= 0.0 {
        return err(
            &req.id,
            "bad_params",
            "evaluation coefficient must be strictly positive",
            Some(json!({ "coefficient": coefficient })),
        );
    }

    for (key, id_value, table) in [
        ("subjectId", &subject_id, "subjects"),
        ("classId", &class_id, "classes"),
    ] {
        let sql = format!("SELECT id FROM {} WHERE id = ?", table);
        let known: Option<String> = match conn
            .query_row(&sql, [id_value], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if known.is_none() {
            return err(
                &req.id,
                "not_found",
                format!("{} does not exist", key),
                None,
            );
        }
    }

    let evaluation_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO evaluations(
            id, subject_id, class_id, teacher, academic_year_id, term,
            kind, status, title, min_score, max_score, coefficient)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'planned', ?, ?, ?, ?)",
        (
            &evaluation_id,
            &subject_id,
            &class_id,
            &teacher,
            &academic_year_id,
            term.number(),
            kind.as_str(),
            &title,
            min_score,
            max_score,
            coefficient,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({
            "evaluationId": evaluation_id,
            "status": EvaluationStatus::Planned.as_str(),
        }),
    )
}

fn handle_evaluations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year_id = match required_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match required_term(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT e.id, s.code, e.title, e.kind, e.status, e.teacher,
                e.min_score, e.max_score, e.coefficient
         FROM evaluations e
         JOIN subjects s ON s.id = e.subject_id
         WHERE e.class_id = ? AND e.academic_year_id = ? AND e.term = ?
         ORDER BY s.code, e.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let evaluations = match stmt
        .query_map((&class_id, &academic_year_id, term.number()), |r| {
            let id: String = r.get(0)?;
            let subject_code: String = r.get(1)?;
            let title: String = r.get(2)?;
            let kind: String = r.get(3)?;
            let status: String = r.get(4)?;
            let teacher: Option<String> = r.get(5)?;
            let min_score: f64 = r.get(6)?;
            let max_score: f64 = r.get(7)?;
            let coefficient: f64 = r.get(8)?;
            Ok(json!({
                "id": id,
                "subjectCode": subject_code,
                "title": title,
                "kind": kind,
                "status": status,
                "teacher": teacher,
                "minScore": min_score,
                "maxScore": max_score,
                "coefficient": coefficient,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "evaluations": evaluations }))
}

fn handle_evaluations_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let evaluation_id = match required_str(req, "evaluationId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status_raw = match required_str(req, "status") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(next) = EvaluationStatus::parse(&status_raw) else {
        return err(
            &req.id,
            "bad_params",
            "status must be one of: planned, ongoing, completed, cancelled",
            Some(json!({ "status": status_raw })),
        );
    };

    let current_raw: Option<String> = match conn
        .query_row(
            "SELECT status FROM evaluations WHERE id = ?",
            [&evaluation_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(current_raw) = current_raw else {
        return err(&req.id, "not_found", "evaluation not found", None);
    };
    let Some(current) = EvaluationStatus::parse(&current_raw) else {
        return err(
            &req.id,
            "bad_config",
            "evaluation has an unrecognized status",
            Some(json!({ "status": current_raw })),
        );
    };

    if !current.can_transition_to(next) {
        return err(
            &req.id,
            "invalid_transition",
            "evaluation status can only move forward",
            Some(json!({ "from": current.as_str(), "to": next.as_str() })),
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE evaluations SET status = ? WHERE id = ?",
        (next.as_str(), &evaluation_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "evaluationId": evaluation_id, "status": next.as_str() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evaluations.create" => Some(handle_evaluations_create(state, req)),
        "evaluations.list" => Some(handle_evaluations_list(state, req)),
        "evaluations.setStatus" => Some(handle_evaluations_set_status(state, req)),
        _ => None,
    }
}
