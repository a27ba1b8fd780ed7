use clap::Args;
use serde::Serialize;

use crate::{AppContext, DisplayFallback, Result};

#[derive(Args, Debug, Clone)]
pub struct HistoryArgs {
    /// Number of entries to show
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
    /// List failed attempts instead of runs
    #[arg(long)]
    pub failures: bool,
}

#[derive(Debug, Serialize)]
pub struct RunEntry {
    pub ts: Option<String>,
    pub run_id: String,
    pub dry_run: bool,
    pub cancelled: bool,
    pub rounds: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub attempts: i64,
    pub duration_ms: i64,
}

#[derive(Debug, Serialize)]
pub struct AttemptEntry {
    pub ts: Option<String>,
    pub run_id: String,
    pub title: String,
    pub date_hint: String,
    pub round: i64,
    pub attempt: i64,
    pub outcome: String,
    pub detail: Option<String>,
    pub remediation: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoryList {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runs: Vec<RunEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<AttemptEntry>,
}

pub fn list(context: &AppContext, args: &HistoryArgs) -> Result<HistoryList> {
    let conn = context.open_database(&context.history_db())?;
    if args.failures {
        let mut stmt = conn.prepare(
            "SELECT ts, run_id, title, date_hint, round, attempt, outcome, detail, remediation \
             FROM export_attempts \
             WHERE outcome <> 'succeeded' \
             ORDER BY ts DESC, rowid DESC \
             LIMIT ?1",
        )?;
        let failures = stmt
            .query_map([args.limit as i64], |row| {
                Ok(AttemptEntry {
                    ts: row.get::<_, Option<String>>(0)?,
                    run_id: row.get(1)?,
                    title: row.get(2)?,
                    date_hint: row.get(3)?,
                    round: row.get(4)?,
                    attempt: row.get(5)?,
                    outcome: row.get(6)?,
                    detail: row
                        .get::<_, Option<String>>(7)?
                        .filter(|detail| !detail.is_empty()),
                    remediation: row
                        .get::<_, Option<String>>(8)?
                        .filter(|action| !action.is_empty()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        return Ok(HistoryList {
            runs: Vec::new(),
            failures,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT ts, run_id, dry_run, cancelled, rounds, succeeded, failed, attempts, duration_ms \
         FROM export_runs \
         ORDER BY ts DESC, rowid DESC \
         LIMIT ?1",
    )?;
    let runs = stmt
        .query_map([args.limit as i64], |row| {
            Ok(RunEntry {
                ts: row.get::<_, Option<String>>(0)?,
                run_id: row.get(1)?,
                dry_run: row.get::<_, i64>(2)? != 0,
                cancelled: row.get::<_, i64>(3)? != 0,
                rounds: row.get(4)?,
                succeeded: row.get(5)?,
                failed: row.get(6)?,
                attempts: row.get(7)?,
                duration_ms: row.get(8)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(HistoryList {
        runs,
        failures: Vec::new(),
    })
}

impl DisplayFallback for HistoryList {
    fn display(&self) -> String {
        if self.runs.is_empty() && self.failures.is_empty() {
            return "No history recorded".to_string();
        }
        let mut lines = Vec::new();
        for run in &self.runs {
            lines.push(format!(
                "{ts} | {id} | ok={ok} failed={failed} rounds={rounds} attempts={attempts}{flags}",
                ts = run.ts.as_deref().unwrap_or("-"),
                id = run.run_id,
                ok = run.succeeded,
                failed = run.failed,
                rounds = run.rounds,
                attempts = run.attempts,
                flags = match (run.dry_run, run.cancelled) {
                    (true, true) => " [dry run, cancelled]",
                    (true, false) => " [dry run]",
                    (false, true) => " [cancelled]",
                    (false, false) => "",
                },
            ));
        }
        for failure in &self.failures {
            let mut line = format!(
                "{ts} | {title} ({date}) | round {round} attempt {attempt} | {outcome}",
                ts = failure.ts.as_deref().unwrap_or("-"),
                title = failure.title,
                date = failure.date_hint,
                round = failure.round,
                attempt = failure.attempt,
                outcome = failure.outcome,
            );
            if let Some(detail) = &failure.detail {
                line.push_str(&format!(": {detail}"));
            }
            if let Some(remediation) = &failure.remediation {
                line.push_str(&format!(" -> {remediation}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}
