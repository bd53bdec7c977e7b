use serde_json::json;

use crate::academic::Term;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{bool_flag, calc_err, db_conn, required_str, required_term};
use crate::ipc::types::{AppState, Request};
use crate::report::{self, EngineConfig, ReportContext};

struct PeriodParams {
    class_id: String,
    academic_year_id: String,
    term: Term,
}

fn period_params(req: &Request) -> Result<PeriodParams, serde_json::Value> {
    Ok(PeriodParams {
        class_id: required_str(req, "classId")?,
        academic_year_id: required_str(req, "academicYearId")?,
        term: required_term(req)?,
    })
}

fn handle_generate_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let period = match period_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let force = bool_flag(req, "force");
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let config = match EngineConfig::load(conn) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let ctx = ReportContext {
        conn,
        class_id: &period.class_id,
        academic_year_id: &period.academic_year_id,
        term: period.term,
    };
    match report::build_snapshot(&ctx, &student_id, &config, force) {
        Ok(snapshot) => ok(&req.id, json!({ "snapshot": snapshot })),
        Err(e) => calc_err(req, e),
    }
}

/// Build-all then rank: the two phases run back to back under one
/// regeneration guard so a competing pass cannot interleave between them.
fn handle_generate_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let period = match period_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let force = bool_flag(req, "force");
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }

    let key = (
        period.class_id.clone(),
        period.academic_year_id.clone(),
        period.term.number(),
    );
    if state.stats_in_flight.contains(&key) {
        return err(
            &req.id,
            "concurrent_regeneration",
            "a statistics pass is already running for this class and period; retry after it completes",
            Some(json!({ "classId": period.class_id })),
        );
    }
    state.stats_in_flight.insert(key.clone());

    let result = match state.db.as_ref() {
        Some(conn) => {
            let ctx = ReportContext {
                conn,
                class_id: &period.class_id,
                academic_year_id: &period.academic_year_id,
                term: period.term,
            };
            EngineConfig::load(conn)
                .and_then(|config| report::generate_class(&ctx, &config, force))
        }
        None => Err(crate::calc::CalcError::new(
            "no_workspace",
            "select a workspace first",
        )),
    };
    state.stats_in_flight.remove(&key);

    match result {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "built": outcome.built,
                "failures": outcome.failures,
                "statistics": outcome.statistics,
            }),
        ),
        Err(e) => calc_err(req, e),
    }
}

fn handle_class_statistics(state: &mut AppState, req: &Request) -> serde_json::Value {
    let period = match period_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }

    let key = (
        period.class_id.clone(),
        period.academic_year_id.clone(),
        period.term.number(),
    );
    if state.stats_in_flight.contains(&key) {
        return err(
            &req.id,
            "concurrent_regeneration",
            "a statistics pass is already running for this class and period; retry after it completes",
            Some(json!({ "classId": period.class_id })),
        );
    }
    state.stats_in_flight.insert(key.clone());

    let result = match state.db.as_ref() {
        Some(conn) => {
            let ctx = ReportContext {
                conn,
                class_id: &period.class_id,
                academic_year_id: &period.academic_year_id,
                term: period.term,
            };
            report::update_class_statistics(&ctx)
        }
        None => Err(crate::calc::CalcError::new(
            "no_workspace",
            "select a workspace first",
        )),
    };
    state.stats_in_flight.remove(&key);

    match result {
        Ok(statistics) => ok(&req.id, json!({ "statistics": statistics })),
        Err(e) => calc_err(req, e),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let period = match period_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ctx = ReportContext {
        conn,
        class_id: &period.class_id,
        academic_year_id: &period.academic_year_id,
        term: period.term,
    };
    match report::get_snapshot(&ctx, &student_id) {
        Ok(model) => ok(&req.id, model),
        Err(e) => calc_err(req, e),
    }
}

fn handle_set_published(
    state: &mut AppState,
    req: &Request,
    published: bool,
) -> serde_json::Value {
    let period = match period_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let ctx = ReportContext {
        conn,
        class_id: &period.class_id,
        academic_year_id: &period.academic_year_id,
        term: period.term,
    };
    match report::set_published(&ctx, &student_id, published) {
        Ok(()) => ok(
            &req.id,
            json!({ "studentId": student_id, "published": published }),
        ),
        Err(e) => calc_err(req, e),
    }
}

fn handle_events(state: &mut AppState, req: &Request) -> serde_json::Value {
    let period = match period_params(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, student_id, kind, created_at
         FROM report_card_events
         WHERE class_id = ? AND academic_year_id = ? AND term = ?
         ORDER BY created_at, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let events = match stmt
        .query_map(
            (
                &period.class_id,
                &period.academic_year_id,
                period.term.number(),
            ),
            |r| {
                let id: String = r.get(0)?;
                let student_id: String = r.get(1)?;
                let kind: String = r.get(2)?;
                let created_at: String = r.get(3)?;
                Ok(json!({
                    "id": id,
                    "studentId": student_id,
                    "kind": kind,
                    "createdAt": created_at,
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "events": events }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.generateStudent" => Some(handle_generate_student(state, req)),
        "reports.generateClass" => Some(handle_generate_class(state, req)),
        "reports.classStatistics" => Some(handle_class_statistics(state, req)),
        "reports.get" => Some(handle_get(state, req)),
        "reports.publish" => Some(handle_set_published(state, req, true)),
        "reports.unpublish" => Some(handle_set_published(state, req, false)),
        "reports.events" => Some(handle_events(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn state_with_memory_db() -> AppState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        let mut state = AppState::new();
        state.db = Some(conn);
        state
    }

    fn period_request(method: &str, term: i64) -> Request {
        Request {
            id: "t1".to_string(),
            method: method.to_string(),
            params: json!({
                "classId": "c1",
                "academicYearId": "2025-2026",
                "term": term,
            }),
        }
    }

    fn error_code(resp: &serde_json::Value) -> &str {
        resp.pointer("/error/code")
            .and_then(|v| v.as_str())
            .expect("error code")
    }

    #[test]
    fn in_flight_statistics_pass_rejects_competing_passes_for_the_same_period() {
        let mut state = state_with_memory_db();
        state
            .stats_in_flight
            .insert(("c1".to_string(), "2025-2026".to_string(), 1));

        for method in ["reports.generateClass", "reports.classStatistics"] {
            let resp = try_handle(&mut state, &period_request(method, 1)).expect("routed");
            assert_eq!(error_code(&resp), "concurrent_regeneration", "{method}");
        }

        // The guard is keyed per (class, year, term); another term of the same
        // class proceeds past it.
        let resp =
            try_handle(&mut state, &period_request("reports.classStatistics", 2)).expect("routed");
        assert_eq!(error_code(&resp), "inconsistent_class_state");
    }

    #[test]
    fn guard_is_released_even_when_the_pass_fails() {
        let mut state = state_with_memory_db();

        let resp =
            try_handle(&mut state, &period_request("reports.classStatistics", 1)).expect("routed");
        assert_eq!(error_code(&resp), "inconsistent_class_state");
        assert!(state.stats_in_flight.is_empty());

        let resp =
            try_handle(&mut state, &period_request("reports.generateClass", 1)).expect("routed");
        assert_eq!(error_code(&resp), "not_found");
        assert!(state.stats_in_flight.is_empty());
    }
}
