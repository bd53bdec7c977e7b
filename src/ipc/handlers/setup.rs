use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::academic::SchoolLevel;
use crate::calc::{CoefficientPolicy, DecisionThresholds, MentionScale};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_f64, required_level, required_str};
use crate::ipc::types::{AppState, Request};
use crate::report::{
    EngineConfig, SETTING_COEFFICIENT_POLICY, SETTING_DECISION_THRESHOLDS, SETTING_MENTION_SCALE,
};

fn handle_levels_list(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let levels: Vec<serde_json::Value> = SchoolLevel::ALL
        .iter()
        .map(|l| {
            json!({
                "code": l.as_code(),
                "displayName": l.display_name(),
            })
        })
        .collect();
    ok(&req.id, json!({ "levels": levels }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v.trim().to_uppercase(),
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if code.is_empty() {
        return err(&req.id, "bad_params", "code must not be empty", None);
    }

    let subject_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO subjects(id, code, name) VALUES(?, ?, ?)",
        (&subject_id, &code, &name),
    ) {
        Ok(_) => ok(
            &req.id,
            json!({ "subjectId": subject_id, "code": code, "name": name }),
        ),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            err(
                &req.id,
                "duplicate_subject",
                "a subject with this code already exists",
                Some(json!({ "code": code })),
            )
        }
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare("SELECT id, code, name FROM subjects ORDER BY code") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subjects = match stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let code: String = r.get(1)?;
            let name: String = r.get(2)?;
            Ok(json!({ "id": id, "code": code, "name": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "subjects": subjects }))
}

fn handle_coefficients_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level = match required_level(req, "level") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let coefficient = match required_f64(req, "coefficient") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let config = match EngineConfig::load(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    // An explicit 0 means "not counted at this level"; anything else must
    // satisfy the active policy at the boundary, not at report time.
    if coefficient != 0.0 {
        if let Err(e) = config.policy.validate(coefficient) {
            return err(&req.id, &e.code, e.message, e.details);
        }
    }

    let known: Option<String> = match conn
        .query_row("SELECT id FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if known.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    if let Err(e) = conn.execute(
        "INSERT INTO subject_coefficients(subject_id, level, coefficient) VALUES(?, ?, ?)
         ON CONFLICT(subject_id, level) DO UPDATE SET coefficient = excluded.coefficient",
        (&subject_id, level.as_code(), coefficient),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "subjectId": subject_id,
            "level": level.as_code(),
            "coefficient": coefficient,
        }),
    )
}

fn handle_coefficients_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level_filter = match optional_str(req, "level") {
        Some(raw) => match SchoolLevel::parse(&raw) {
            Some(l) => Some(l),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "unrecognized school level",
                    Some(json!({ "level": raw })),
                )
            }
        },
        None => None,
    };

    let mut stmt = match conn.prepare(
        "SELECT sc.subject_id, s.code, sc.level, sc.coefficient
         FROM subject_coefficients sc
         JOIN subjects s ON s.id = sc.subject_id
         ORDER BY s.code, sc.level",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([], |r| {
            let subject_id: String = r.get(0)?;
            let code: String = r.get(1)?;
            let level: String = r.get(2)?;
            let coefficient: f64 = r.get(3)?;
            Ok((subject_id, code, level, coefficient))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let coefficients: Vec<serde_json::Value> = rows
        .into_iter()
        .filter(|(_, _, level, _)| {
            level_filter
                .map(|f| SchoolLevel::parse(level) == Some(f))
                .unwrap_or(true)
        })
        .map(|(subject_id, code, level, coefficient)| {
            json!({
                "subjectId": subject_id,
                "subjectCode": code,
                "level": level,
                "coefficient": coefficient,
            })
        })
        .collect();
    ok(&req.id, json!({ "coefficients": coefficients }))
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let config = match EngineConfig::load(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };
    ok(
        &req.id,
        json!({
            "coefficientPolicy": config.policy.as_str(),
            "mentionScale": config.mention_scale,
            "decisionThresholds": config.decision_thresholds,
        }),
    )
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Some(raw) = req.params.get("coefficientPolicy") {
        let Some(policy) = raw.as_str().and_then(CoefficientPolicy::parse) else {
            return err(
                &req.id,
                "bad_params",
                "coefficientPolicy must be strict_integer or rational",
                Some(json!({ "coefficientPolicy": raw })),
            );
        };
        if let Err(e) = db::settings_set_json(conn, SETTING_COEFFICIENT_POLICY, &json!(policy.as_str()))
        {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    if let Some(raw) = req.params.get("mentionScale") {
        let scale: MentionScale = match serde_json::from_value(raw.clone()) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
        };
        if !scale.is_valid() {
            return err(&req.id, "bad_params", "mention scale is invalid", None);
        }
        let value = match serde_json::to_value(&scale) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "serialize_failed", e.to_string(), None),
        };
        if let Err(e) = db::settings_set_json(conn, SETTING_MENTION_SCALE, &value) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    if let Some(raw) = req.params.get("decisionThresholds") {
        let thresholds: DecisionThresholds = match serde_json::from_value(raw.clone()) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
        };
        if !thresholds.is_valid() {
            return err(
                &req.id,
                "bad_params",
                "promote threshold must not be below conditional",
                None,
            );
        }
        let value = match serde_json::to_value(thresholds) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "serialize_failed", e.to_string(), None),
        };
        if let Err(e) = db::settings_set_json(conn, SETTING_DECISION_THRESHOLDS, &value) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    handle_settings_get(state, req)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "levels.list" => Some(handle_levels_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "coefficients.set" => Some(handle_coefficients_set(state, req)),
        "coefficients.list" => Some(handle_coefficients_list(state, req)),
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
