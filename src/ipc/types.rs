use std::collections::HashSet;
use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Regeneration guard: class/year/term tuples with a statistics pass in
    /// flight. A competing pass for the same tuple fails with
    /// `concurrent_regeneration` instead of interleaving writes.
    pub stats_in_flight: HashSet<(String, String, i64)>,
}

impl AppState {
    pub fn new() -> AppState {
        AppState {
            workspace: None,
            db: None,
            stats_in_flight: HashSet::new(),
        }
    }
}
