use rusqlite::Connection;
use serde_json::json;

use crate::academic::{SchoolLevel, Term};
use crate::calc::CalcError;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing numeric {}", key), None))
}

pub fn bool_flag(req: &Request, key: &str) -> bool {
    req.params
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

pub fn required_term(req: &Request) -> Result<Term, serde_json::Value> {
    let n = req
        .params
        .get("term")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| err(&req.id, "bad_params", "missing integer term", None))?;
    Term::from_number(n).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "term must be 1, 2 or 3",
            Some(json!({ "term": n })),
        )
    })
}

pub fn required_level(req: &Request, key: &str) -> Result<SchoolLevel, serde_json::Value> {
    let raw = required_str(req, key)?;
    SchoolLevel::parse(&raw).ok_or_else(|| {
        err(
            &req.id,
            "bad_params",
            "unrecognized school level",
            Some(json!({ "level": raw })),
        )
    })
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn calc_err(req: &Request, e: CalcError) -> serde_json::Value {
    err(&req.id, &e.code, e.message, e.details)
}
