use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::academic::{SchoolLevel, Term};
use crate::calc::{
    self, round2, CalcError, CoefficientPolicy, DecisionThresholds, MentionScale,
};
use crate::db;

pub const SETTING_COEFFICIENT_POLICY: &str = "engine.coefficient_policy";
pub const SETTING_MENTION_SCALE: &str = "engine.mention_scale";
pub const SETTING_DECISION_THRESHOLDS: &str = "engine.decision_thresholds";

/// One class/year/term slice of the workspace; every engine pass operates on
/// exactly one of these.
#[derive(Debug, Clone)]
pub struct ReportContext<'a> {
    pub conn: &'a Connection,
    pub class_id: &'a str,
    pub academic_year_id: &'a str,
    pub term: Term,
}

/// Engine configuration loaded from workspace settings, falling back to the
/// institutional defaults. Constructed explicitly and passed in; the engine
/// keeps no ambient state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub policy: CoefficientPolicy,
    pub mention_scale: MentionScale,
    pub decision_thresholds: DecisionThresholds,
}

impl EngineConfig {
    pub fn load(conn: &Connection) -> Result<EngineConfig, CalcError> {
        let policy = match db::settings_get_json(conn, SETTING_COEFFICIENT_POLICY)
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?
        {
            Some(v) => v
                .as_str()
                .and_then(CoefficientPolicy::parse)
                .ok_or_else(|| {
                    CalcError::new("bad_config", "stored coefficient policy is invalid")
                })?,
            None => CoefficientPolicy::default(),
        };
        let mention_scale = match db::settings_get_json(conn, SETTING_MENTION_SCALE)
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?
        {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| CalcError::new("bad_config", e.to_string()))?,
            None => MentionScale::default(),
        };
        let decision_thresholds = match db::settings_get_json(conn, SETTING_DECISION_THRESHOLDS)
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?
        {
            Some(v) => serde_json::from_value(v)
                .map_err(|e| CalcError::new("bad_config", e.to_string()))?,
            None => DecisionThresholds::default(),
        };
        Ok(EngineConfig {
            policy,
            mention_scale,
            decision_thresholds,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeDetail {
    pub evaluation_id: String,
    pub title: String,
    pub kind: String,
    pub score: f64,
    pub out_of: f64,
    pub score_on_20: f64,
    pub evaluation_coefficient: f64,
    pub weighted_score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    pub average: f64,
    pub coefficient: f64,
    pub weighted_points: f64,
    pub grade_details: Vec<GradeDetail>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCardSnapshot {
    pub student_id: String,
    pub class_id: String,
    pub academic_year_id: String,
    pub term: i64,
    pub subjects: Vec<SubjectSummary>,
    pub total_points: f64,
    pub total_coefficients: f64,
    pub general_average: f64,
    pub mention: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    pub state: String,
    pub published: bool,
    pub class_size: i64,
    pub class_average: Option<f64>,
    pub class_max: Option<f64>,
    pub class_min: Option<f64>,
    pub rank: Option<i64>,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatistics {
    pub class_id: String,
    pub academic_year_id: String,
    pub term: i64,
    pub class_size: i64,
    pub class_average: f64,
    pub class_max: f64,
    pub class_min: f64,
    pub ranks: Vec<RankEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankEntry {
    pub student_id: String,
    pub general_average: f64,
    pub rank: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentFailure {
    pub student_id: String,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassGenerationOutcome {
    pub built: Vec<ReportCardSnapshot>,
    pub failures: Vec<StudentFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<ClassStatistics>,
}

pub fn class_level(conn: &Connection, class_id: &str) -> Result<SchoolLevel, CalcError> {
    let level_code: Option<String> = conn
        .query_row("SELECT level FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some(level_code) = level_code else {
        return Err(CalcError::new("not_found", "class not found"));
    };
    SchoolLevel::parse(&level_code).ok_or_else(|| {
        CalcError::new("bad_config", "class has an unrecognized level code")
            .with_details(serde_json::json!({ "level": level_code }))
    })
}

/// Look up the report-card weight for a subject at a level.
///
/// `None` means the subject is not taught at that level (no row, or an
/// explicit 0) and must be excluded from the card entirely. A mapped value
/// that violates the active policy is a configuration error, never coerced.
pub fn resolve_coefficient(
    conn: &Connection,
    subject_id: &str,
    level: SchoolLevel,
    policy: CoefficientPolicy,
) -> Result<Option<f64>, CalcError> {
    let coefficient: Option<f64> = conn
        .query_row(
            "SELECT coefficient FROM subject_coefficients WHERE subject_id = ? AND level = ?",
            (subject_id, level.as_code()),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    match coefficient {
        None => Ok(None),
        Some(c) if c == 0.0 => Ok(None),
        Some(c) => {
            policy.validate(c).map_err(|e| {
                e.with_details(serde_json::json!({
                    "subjectId": subject_id,
                    "level": level.as_code(),
                }))
            })?;
            Ok(Some(c))
        }
    }
}

struct GradeRow {
    subject_id: String,
    subject_code: String,
    subject_name: String,
    evaluation_id: String,
    title: String,
    kind: String,
    score: f64,
    out_of: f64,
    evaluation_coefficient: f64,
    weighted_score: f64,
}

/// Group a student's qualifying grades by subject and compute per-subject
/// summaries. Absent grades and non-completed evaluations never contribute.
/// Subjects without a positive coefficient at the class level are excluded
/// entirely, so they touch neither numerator nor denominator downstream.
///
/// An empty result means "no report card producible", which the builder turns
/// into `no_grades_available`; it is never an all-zero card.
pub fn aggregate_subjects(
    ctx: &ReportContext<'_>,
    student_id: &str,
    config: &EngineConfig,
) -> Result<Vec<SubjectSummary>, CalcError> {
    let level = class_level(ctx.conn, ctx.class_id)?;

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT sub.id, sub.code, sub.name,
                    e.id, e.title, e.kind, g.score, e.max_score, e.coefficient, g.weighted_score
             FROM grades g
             JOIN evaluations e ON e.id = g.evaluation_id
             JOIN subjects sub ON sub.id = e.subject_id
             WHERE g.student_id = ?
               AND e.class_id = ?
               AND e.academic_year_id = ?
               AND e.term = ?
               AND e.status = 'completed'
               AND g.absent = 0
             ORDER BY sub.code, e.title, e.id",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let rows: Vec<GradeRow> = stmt
        .query_map(
            (
                student_id,
                ctx.class_id,
                ctx.academic_year_id,
                ctx.term.number(),
            ),
            |r| {
                Ok(GradeRow {
                    subject_id: r.get(0)?,
                    subject_code: r.get(1)?,
                    subject_name: r.get(2)?,
                    evaluation_id: r.get(3)?,
                    title: r.get(4)?,
                    kind: r.get(5)?,
                    score: r.get(6)?,
                    out_of: r.get(7)?,
                    evaluation_coefficient: r.get(8)?,
                    weighted_score: r.get(9)?,
                })
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    // BTreeMap keeps subject order deterministic by code.
    let mut by_subject: BTreeMap<String, Vec<GradeRow>> = BTreeMap::new();
    for row in rows {
        by_subject.entry(row.subject_code.clone()).or_default().push(row);
    }

    let mut summaries: Vec<SubjectSummary> = Vec::new();
    for (_, subject_rows) in by_subject {
        let first = &subject_rows[0];
        let Some(coefficient) =
            resolve_coefficient(ctx.conn, &first.subject_id, level, config.policy)?
        else {
            continue;
        };

        let mut values: Vec<f64> = Vec::with_capacity(subject_rows.len());
        let mut details: Vec<GradeDetail> = Vec::with_capacity(subject_rows.len());
        for row in &subject_rows {
            let score_on_20 = calc::normalize_to_20(row.score, row.out_of);
            values.push(score_on_20);
            details.push(GradeDetail {
                evaluation_id: row.evaluation_id.clone(),
                title: row.title.clone(),
                kind: row.kind.clone(),
                score: row.score,
                out_of: row.out_of,
                score_on_20: round2(score_on_20),
                evaluation_coefficient: row.evaluation_coefficient,
                weighted_score: row.weighted_score,
            });
        }
        // Simple arithmetic mean through the shared calculator: every
        // completed evaluation counts once. The evaluation coefficient only
        // derives the stored weighted score in the grade details.
        let unit_weights = vec![1.0; values.len()];
        let average = calc::weighted_average(&values, &unit_weights, config.policy)?;

        summaries.push(SubjectSummary {
            subject_id: first.subject_id.clone(),
            subject_code: first.subject_code.clone(),
            subject_name: first.subject_name.clone(),
            average,
            coefficient,
            weighted_points: round2(average * coefficient),
            grade_details: details,
        });
    }

    Ok(summaries)
}

fn student_in_class(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<(), CalcError> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE id = ? AND class_id = ?",
            (student_id, class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    if exists.is_none() {
        return Err(CalcError::new("not_found", "student not found in class"));
    }
    Ok(())
}

fn record_event(
    conn: &Connection,
    ctx: &ReportContext<'_>,
    student_id: &str,
    kind: &str,
) -> Result<(), CalcError> {
    conn.execute(
        "INSERT INTO report_card_events(id, student_id, class_id, academic_year_id, term, kind, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            student_id,
            ctx.class_id,
            ctx.academic_year_id,
            ctx.term.number(),
            kind,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
    Ok(())
}

/// Build (or rebuild) one student's snapshot for the context period.
///
/// Upsert keyed by (student, class, year, term). Rebuilding over an already
/// published snapshot requires `force`; a forced rebuild withdraws publication
/// since the published numbers are about to change. Any rebuild resets the
/// snapshot to `built` and clears rank/class-statistics columns, which are
/// stale until the statistics engine runs again.
pub fn build_snapshot(
    ctx: &ReportContext<'_>,
    student_id: &str,
    config: &EngineConfig,
    force: bool,
) -> Result<ReportCardSnapshot, CalcError> {
    student_in_class(ctx.conn, ctx.class_id, student_id)?;

    let existing: Option<(String, i64)> = ctx
        .conn
        .query_row(
            "SELECT id, published FROM report_cards
             WHERE student_id = ? AND class_id = ? AND academic_year_id = ? AND term = ?",
            (
                student_id,
                ctx.class_id,
                ctx.academic_year_id,
                ctx.term.number(),
            ),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let was_published = existing.as_ref().map(|(_, p)| *p != 0).unwrap_or(false);
    if was_published && !force {
        return Err(CalcError::new(
            "published_snapshot_exists",
            "snapshot is published; pass force to regenerate",
        )
        .with_details(serde_json::json!({ "studentId": student_id })));
    }

    let subjects = aggregate_subjects(ctx, student_id, config)?;
    if subjects.is_empty() {
        return Err(CalcError::new(
            "no_grades_available",
            "student has no qualifying grades for this period",
        )
        .with_details(serde_json::json!({ "studentId": student_id })));
    }

    let total_points = round2(subjects.iter().map(|s| s.weighted_points).sum::<f64>());
    let total_coefficients: f64 = subjects.iter().map(|s| s.coefficient).sum();
    let general_average = if total_coefficients > 0.0 {
        round2(total_points / total_coefficients)
    } else {
        0.0
    };
    let mention = config.mention_scale.mention_for(general_average).to_string();
    let decision = ctx
        .term
        .is_year_end()
        .then(|| config.decision_thresholds.decision_for(general_average).to_string());

    let subjects_json = serde_json::to_string(&subjects)
        .map_err(|e| CalcError::new("serialize_failed", e.to_string()))?;
    let generated_at = Utc::now().to_rfc3339();

    let snapshot_id = Uuid::new_v4().to_string();
    ctx.conn
        .execute(
            "INSERT INTO report_cards(
                id, student_id, class_id, academic_year_id, term,
                subjects_json, total_points, total_coefficients, general_average,
                mention, decision, state, published,
                class_size, class_average, class_max, class_min, rank, generated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'built', 0, 0, NULL, NULL, NULL, NULL, ?)
             ON CONFLICT(student_id, class_id, academic_year_id, term) DO UPDATE SET
               subjects_json = excluded.subjects_json,
               total_points = excluded.total_points,
               total_coefficients = excluded.total_coefficients,
               general_average = excluded.general_average,
               mention = excluded.mention,
               decision = excluded.decision,
               state = 'built',
               published = 0,
               class_size = 0,
               class_average = NULL,
               class_max = NULL,
               class_min = NULL,
               rank = NULL,
               generated_at = excluded.generated_at",
            (
                &snapshot_id,
                student_id,
                ctx.class_id,
                ctx.academic_year_id,
                ctx.term.number(),
                &subjects_json,
                total_points,
                total_coefficients,
                general_average,
                &mention,
                decision.as_deref(),
                &generated_at,
            ),
        )
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;

    if was_published {
        record_event(ctx.conn, ctx, student_id, "unpublished")?;
    }

    Ok(ReportCardSnapshot {
        student_id: student_id.to_string(),
        class_id: ctx.class_id.to_string(),
        academic_year_id: ctx.academic_year_id.to_string(),
        term: ctx.term.number(),
        subjects,
        total_points,
        total_coefficients,
        general_average,
        mention,
        decision,
        state: "built".to_string(),
        published: false,
        class_size: 0,
        class_average: None,
        class_max: None,
        class_min: None,
        rank: None,
        generated_at,
    })
}

struct SnapshotRow {
    id: String,
    student_id: String,
    class_id: String,
    academic_year_id: String,
    term: i64,
    general_average: f64,
}

/// Back-fill class statistics and ranks into every snapshot of the period.
///
/// The whole pass is one transaction: either every snapshot gets the new
/// class size/average/extrema/rank and moves to `finalized`, or none do.
/// Callers serialize competing passes through the in-process regeneration
/// guard before invoking this.
pub fn update_class_statistics(
    ctx: &ReportContext<'_>,
) -> Result<ClassStatistics, CalcError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT r.id, r.student_id, r.class_id, r.academic_year_id, r.term, r.general_average
             FROM report_cards r
             WHERE r.class_id = ? AND r.academic_year_id = ? AND r.term = ?
             ORDER BY r.general_average DESC, r.student_id",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let snapshots: Vec<SnapshotRow> = stmt
        .query_map(
            (ctx.class_id, ctx.academic_year_id, ctx.term.number()),
            |r| {
                Ok(SnapshotRow {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    class_id: r.get(2)?,
                    academic_year_id: r.get(3)?,
                    term: r.get(4)?,
                    general_average: r.get(5)?,
                })
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    if snapshots.is_empty() {
        return Err(CalcError::new(
            "inconsistent_class_state",
            "no snapshots exist for this class and period",
        ));
    }
    for s in &snapshots {
        if s.class_id != ctx.class_id
            || s.academic_year_id != ctx.academic_year_id
            || s.term != ctx.term.number()
        {
            return Err(CalcError::new(
                "inconsistent_class_state",
                "snapshot belongs to a different class or period",
            )
            .with_details(serde_json::json!({ "snapshotId": s.id })));
        }
    }

    let averages: Vec<f64> = snapshots.iter().map(|s| s.general_average).collect();
    let class_size = snapshots.len() as i64;
    let class_average = round2(averages.iter().sum::<f64>() / averages.len() as f64);
    let class_max = averages
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let class_min = averages.iter().copied().fold(f64::INFINITY, f64::min);
    let ranks = calc::assign_competition_ranks(&averages);

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;
    for (snapshot, rank) in snapshots.iter().zip(ranks.iter()) {
        tx.execute(
            "UPDATE report_cards SET
               class_size = ?, class_average = ?, class_max = ?, class_min = ?,
               rank = ?, state = 'finalized'
             WHERE id = ?",
            (
                class_size,
                class_average,
                class_max,
                class_min,
                rank,
                &snapshot.id,
            ),
        )
        .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
        tx.execute(
            "INSERT INTO report_card_events(id, student_id, class_id, academic_year_id, term, kind, created_at)
             VALUES(?, ?, ?, ?, ?, 'finalized', ?)",
            (
                Uuid::new_v4().to_string(),
                &snapshot.student_id,
                ctx.class_id,
                ctx.academic_year_id,
                ctx.term.number(),
                Utc::now().to_rfc3339(),
            ),
        )
        .map_err(|e| CalcError::new("db_insert_failed", e.to_string()))?;
    }
    tx.commit()
        .map_err(|e| CalcError::new("db_tx_failed", e.to_string()))?;

    Ok(ClassStatistics {
        class_id: ctx.class_id.to_string(),
        academic_year_id: ctx.academic_year_id.to_string(),
        term: ctx.term.number(),
        class_size,
        class_average,
        class_max,
        class_min,
        ranks: snapshots
            .iter()
            .zip(ranks.iter())
            .map(|(s, r)| RankEntry {
                student_id: s.student_id.clone(),
                general_average: s.general_average,
                rank: *r,
            })
            .collect(),
    })
}

/// Whole-class generation: build every active student's snapshot, then run the
/// statistics pass once. The two phases are sequential stages of one
/// operation. Per-student failures (no grades, broken coefficient
/// configuration) are isolated and reported; they never abort the batch.
pub fn generate_class(
    ctx: &ReportContext<'_>,
    config: &EngineConfig,
    force: bool,
) -> Result<ClassGenerationOutcome, CalcError> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT id FROM students WHERE class_id = ? AND active = 1 ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let student_ids: Vec<String> = stmt
        .query_map([ctx.class_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    if student_ids.is_empty() {
        return Err(CalcError::new("not_found", "class has no active students"));
    }

    let mut built: Vec<ReportCardSnapshot> = Vec::new();
    let mut failures: Vec<StudentFailure> = Vec::new();
    for student_id in &student_ids {
        match build_snapshot(ctx, student_id, config, force) {
            Ok(snapshot) => built.push(snapshot),
            Err(e) => failures.push(StudentFailure {
                student_id: student_id.clone(),
                reason: e.code,
                message: e.message,
            }),
        }
    }

    // Statistics only make sense once at least one snapshot exists for the
    // period; with none the batch reports failures alone.
    let statistics = if built.is_empty() {
        None
    } else {
        Some(update_class_statistics(ctx)?)
    };

    if let Some(stats) = &statistics {
        for snapshot in &mut built {
            snapshot.state = "finalized".to_string();
            snapshot.class_size = stats.class_size;
            snapshot.class_average = Some(stats.class_average);
            snapshot.class_max = Some(stats.class_max);
            snapshot.class_min = Some(stats.class_min);
            snapshot.rank = stats
                .ranks
                .iter()
                .find(|r| r.student_id == snapshot.student_id)
                .map(|r| r.rank);
        }
    }

    Ok(ClassGenerationOutcome {
        built,
        failures,
        statistics,
    })
}

/// Load the stored snapshot fully resolved for a rendering collaborator.
/// Read-only: nothing is recomputed here.
pub fn get_snapshot(
    ctx: &ReportContext<'_>,
    student_id: &str,
) -> Result<serde_json::Value, CalcError> {
    let row: Option<(String, f64, f64, f64, String, Option<String>, String, i64, i64, Option<f64>, Option<f64>, Option<f64>, Option<i64>, Option<String>)> = ctx
        .conn
        .query_row(
            "SELECT subjects_json, total_points, total_coefficients, general_average,
                    mention, decision, state, published,
                    class_size, class_average, class_max, class_min, rank, generated_at
             FROM report_cards
             WHERE student_id = ? AND class_id = ? AND academic_year_id = ? AND term = ?",
            (
                student_id,
                ctx.class_id,
                ctx.academic_year_id,
                ctx.term.number(),
            ),
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                    r.get(11)?,
                    r.get(12)?,
                    r.get(13)?,
                ))
            },
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some((
        subjects_json,
        total_points,
        total_coefficients,
        general_average,
        mention,
        decision,
        state,
        published,
        class_size,
        class_average,
        class_max,
        class_min,
        rank,
        generated_at,
    )) = row
    else {
        return Err(CalcError::new("not_found", "report card not found"));
    };

    let class_row: Option<(String, String)> = ctx
        .conn
        .query_row(
            "SELECT name, level FROM classes WHERE id = ?",
            [ctx.class_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some((class_name, class_level_code)) = class_row else {
        return Err(CalcError::new("not_found", "class not found"));
    };

    let student_row: Option<(String, String, Option<String>)> = ctx
        .conn
        .query_row(
            "SELECT last_name, first_name, student_no FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some((last_name, first_name, student_no)) = student_row else {
        return Err(CalcError::new("not_found", "student not found"));
    };

    let subjects: serde_json::Value = serde_json::from_str(&subjects_json)
        .map_err(|e| CalcError::new("bad_config", e.to_string()))?;

    Ok(serde_json::json!({
        "student": {
            "id": student_id,
            "displayName": format!("{}, {}", last_name, first_name),
            "studentNo": student_no,
        },
        "class": { "id": ctx.class_id, "name": class_name, "level": class_level_code },
        "academicYearId": ctx.academic_year_id,
        "term": ctx.term.number(),
        "subjects": subjects,
        "totalPoints": total_points,
        "totalCoefficients": total_coefficients,
        "generalAverage": general_average,
        "mention": mention,
        "decision": decision,
        "state": state,
        "published": published != 0,
        "classSize": class_size,
        "classAverage": class_average,
        "classMax": class_max,
        "classMin": class_min,
        "rank": rank,
        "generatedAt": generated_at,
    }))
}

/// Flip the publication flag. Publication is an explicit administrative
/// action, orthogonal to the snapshot being finalized.
pub fn set_published(
    ctx: &ReportContext<'_>,
    student_id: &str,
    published: bool,
) -> Result<(), CalcError> {
    let changed = ctx
        .conn
        .execute(
            "UPDATE report_cards SET published = ?
             WHERE student_id = ? AND class_id = ? AND academic_year_id = ? AND term = ?",
            (
                published as i64,
                student_id,
                ctx.class_id,
                ctx.academic_year_id,
                ctx.term.number(),
            ),
        )
        .map_err(|e| CalcError::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(CalcError::new("not_found", "report card not found"));
    }
    record_event(
        ctx.conn,
        ctx,
        student_id,
        if published { "published" } else { "unpublished" },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::academic::Term;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn seed_class(conn: &Connection) {
        conn.execute(
            "INSERT INTO classes(id, name, level, academic_year_id) VALUES('c1', '6e A', '6e', '2025-2026')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO students(id, class_id, last_name, first_name, sort_order) VALUES('s1', 'c1', 'Ouedraogo', 'Awa', 0)",
            [],
        )
        .unwrap();
    }

    fn seed_subject(conn: &Connection, id: &str, code: &str, coefficient: f64) {
        conn.execute(
            "INSERT INTO subjects(id, code, name) VALUES(?, ?, ?)",
            (id, code, code),
        )
        .unwrap();
        conn.execute(
            "INSERT INTO subject_coefficients(subject_id, level, coefficient) VALUES(?, '6e', ?)",
            (id, coefficient),
        )
        .unwrap();
    }

    fn seed_evaluation(conn: &Connection, id: &str, subject_id: &str, out_of: f64) {
        conn.execute(
            "INSERT INTO evaluations(id, subject_id, class_id, academic_year_id, term, kind, status, title, max_score, coefficient)
             VALUES(?, ?, 'c1', '2025-2026', 1, 'test', 'completed', ?, ?, 1)",
            (id, subject_id, id, out_of),
        )
        .unwrap();
    }

    fn seed_grade(conn: &Connection, id: &str, evaluation_id: &str, score: f64) {
        conn.execute(
            "INSERT INTO grades(id, student_id, evaluation_id, score, weighted_score) VALUES(?, 's1', ?, ?, ?)",
            (id, evaluation_id, score, score),
        )
        .unwrap();
    }

    fn ctx(conn: &Connection) -> ReportContext<'_> {
        ReportContext {
            conn,
            class_id: "c1",
            academic_year_id: "2025-2026",
            term: Term::First,
        }
    }

    #[test]
    fn subject_average_normalizes_varying_maxima() {
        let conn = memory_db();
        seed_class(&conn);
        seed_subject(&conn, "sub-math", "MATH", 5.0);
        seed_evaluation(&conn, "e1", "sub-math", 20.0);
        seed_evaluation(&conn, "e2", "sub-math", 40.0);
        seed_grade(&conn, "g1", "e1", 12.0);
        seed_grade(&conn, "g2", "e2", 30.0); // 15/20 once normalized

        let config = EngineConfig {
            policy: CoefficientPolicy::StrictInteger,
            mention_scale: MentionScale::default(),
            decision_thresholds: DecisionThresholds::default(),
        };
        let summaries = aggregate_subjects(&ctx(&conn), "s1", &config).expect("aggregate");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].average, 13.5);
        assert_eq!(summaries[0].weighted_points, 67.5);
    }

    #[test]
    fn subject_mean_rounds_exactly_like_the_shared_calculator() {
        let conn = memory_db();
        seed_class(&conn);
        seed_subject(&conn, "sub-math", "MATH", 3.0);
        seed_evaluation(&conn, "e1", "sub-math", 20.0);
        seed_evaluation(&conn, "e2", "sub-math", 20.0);
        seed_evaluation(&conn, "e3", "sub-math", 20.0);
        seed_grade(&conn, "g1", "e1", 15.0);
        seed_grade(&conn, "g2", "e2", 15.0);
        seed_grade(&conn, "g3", "e3", 10.0);

        let config = EngineConfig {
            policy: CoefficientPolicy::StrictInteger,
            mention_scale: MentionScale::default(),
            decision_thresholds: DecisionThresholds::default(),
        };
        let summaries = aggregate_subjects(&ctx(&conn), "s1", &config).expect("aggregate");
        assert_eq!(summaries.len(), 1);
        // (15 + 15 + 10) / 3 = 13.333... -> 13.33, same half-up rule as
        // weighted_average everywhere else.
        assert_eq!(summaries[0].average, 13.33);
        assert_eq!(
            summaries[0].average,
            calc::weighted_average(
                &[15.0, 15.0, 10.0],
                &[1.0, 1.0, 1.0],
                CoefficientPolicy::StrictInteger
            )
            .expect("shared calculator")
        );
        assert_eq!(summaries[0].weighted_points, 39.99);
    }

    #[test]
    fn zero_coefficient_subject_is_excluded_and_leaves_average_untouched() {
        let conn = memory_db();
        seed_class(&conn);
        seed_subject(&conn, "sub-math", "MATH", 4.0);
        seed_evaluation(&conn, "e1", "sub-math", 20.0);
        seed_grade(&conn, "g1", "e1", 14.0);

        let config = EngineConfig {
            policy: CoefficientPolicy::StrictInteger,
            mention_scale: MentionScale::default(),
            decision_thresholds: DecisionThresholds::default(),
        };
        let before = build_snapshot(&ctx(&conn), "s1", &config, false).expect("first build");

        // A weight-0 subject with low grades must change nothing.
        seed_subject(&conn, "sub-art", "ART", 0.0);
        seed_evaluation(&conn, "e2", "sub-art", 20.0);
        seed_grade(&conn, "g2", "e2", 2.0);
        let after = build_snapshot(&ctx(&conn), "s1", &config, false).expect("second build");

        assert_eq!(before.general_average, after.general_average);
        assert_eq!(before.total_coefficients, after.total_coefficients);
        assert_eq!(before.total_points, after.total_points);
        assert!(after.subjects.iter().all(|s| s.subject_code != "ART"));
    }

    #[test]
    fn fractional_coefficient_under_strict_policy_fails_the_student() {
        let conn = memory_db();
        seed_class(&conn);
        seed_subject(&conn, "sub-math", "MATH", 2.5);
        seed_evaluation(&conn, "e1", "sub-math", 20.0);
        seed_grade(&conn, "g1", "e1", 14.0);

        let config = EngineConfig {
            policy: CoefficientPolicy::StrictInteger,
            mention_scale: MentionScale::default(),
            decision_thresholds: DecisionThresholds::default(),
        };
        let err = build_snapshot(&ctx(&conn), "s1", &config, false).expect_err("must fail");
        assert_eq!(err.code, "invalid_coefficient");
    }

    #[test]
    fn no_grades_is_an_error_not_a_zero_card() {
        let conn = memory_db();
        seed_class(&conn);
        let config = EngineConfig {
            policy: CoefficientPolicy::StrictInteger,
            mention_scale: MentionScale::default(),
            decision_thresholds: DecisionThresholds::default(),
        };
        let err = build_snapshot(&ctx(&conn), "s1", &config, false).expect_err("no grades");
        assert_eq!(err.code, "no_grades_available");
    }

    #[test]
    fn statistics_on_empty_period_is_inconsistent_class_state() {
        let conn = memory_db();
        seed_class(&conn);
        let err = update_class_statistics(&ctx(&conn)).expect_err("no snapshots");
        assert_eq!(err.code, "inconsistent_class_state");
    }

    #[test]
    fn decision_is_only_derived_at_year_end() {
        let conn = memory_db();
        seed_class(&conn);
        seed_subject(&conn, "sub-math", "MATH", 2.0);
        seed_evaluation(&conn, "e1", "sub-math", 20.0);
        seed_grade(&conn, "g1", "e1", 12.0);

        let config = EngineConfig {
            policy: CoefficientPolicy::StrictInteger,
            mention_scale: MentionScale::default(),
            decision_thresholds: DecisionThresholds::default(),
        };
        let term1 = build_snapshot(&ctx(&conn), "s1", &config, false).expect("term 1");
        assert_eq!(term1.decision, None);

        conn.execute("UPDATE evaluations SET term = 3 WHERE id = 'e1'", [])
            .unwrap();
        let year_end_ctx = ReportContext {
            term: Term::Third,
            ..ctx(&conn)
        };
        let term3 = build_snapshot(&year_end_ctx, "s1", &config, false).expect("term 3");
        assert_eq!(term3.decision.as_deref(), Some("promoted"));
    }
}
