use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::error::BrowserError;
use super::task::{FailureClassification, RecordDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    RequeueSameRound,
    RequeueNextRound,
    Abandon,
}

impl RemediationAction {
    pub fn label(self) -> &'static str {
        match self {
            RemediationAction::RequeueSameRound => "requeue_same_round",
            RemediationAction::RequeueNextRound => "requeue_next_round",
            RemediationAction::Abandon => "abandon",
        }
    }
}

/// Decides what happens to a task after `failure`.
///
/// `popup_requeues` is the number of same-round requeues the task already
/// had in the current round.
pub fn route(
    failure: &FailureClassification,
    popup_requeues: u32,
    max_popup_requeues: u32,
) -> RemediationAction {
    match failure {
        FailureClassification::Popup if popup_requeues < max_popup_requeues => {
            RemediationAction::RequeueSameRound
        }
        FailureClassification::Popup
        | FailureClassification::RateLimited
        | FailureClassification::Timeout
        | FailureClassification::NotFound => RemediationAction::RequeueNextRound,
        FailureClassification::Other(_) => RemediationAction::Abandon,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptContext {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub title: String,
    pub detail_url: String,
    pub date_hint: String,
    pub round: usize,
    pub attempt: u32,
    pub failure: Option<FailureClassification>,
    pub action: Option<RemediationAction>,
    pub artifact: Option<PathBuf>,
}

impl AttemptContext {
    pub fn new(run_id: Uuid, record: &RecordDescriptor, round: usize, attempt: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id,
            title: record.title().to_string(),
            detail_url: record.detail_url().to_string(),
            date_hint: record.date_hint().to_string(),
            round,
            attempt,
            failure: None,
            action: None,
            artifact: None,
        }
    }

    pub fn succeeded(mut self, artifact: PathBuf) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn failed(mut self, failure: FailureClassification, action: RemediationAction) -> Self {
        self.failure = Some(failure);
        self.action = Some(action);
        self
    }

    fn outcome(&self) -> &'static str {
        match &self.failure {
            Some(failure) => failure.label(),
            None => "succeeded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub dry_run: bool,
    pub cancelled: bool,
    pub rounds: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub attempts: u64,
    pub duration_ms: i64,
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<TelemetryError> for BrowserError {
    fn from(error: TelemetryError) -> Self {
        BrowserError::Telemetry(error.to_string())
    }
}

/// Append-only failure log (JSON lines) plus the SQLite attempt history.
#[derive(Debug)]
pub struct AutomationTelemetry {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl AutomationTelemetry {
    pub fn new(
        log_path: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, TelemetryError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let telemetry = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        telemetry.initialize_db()?;
        Ok(telemetry)
    }

    fn initialize_db(&self) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS export_attempts (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                run_id TEXT,
                title TEXT,
                detail_url TEXT,
                date_hint TEXT,
                round INTEGER,
                attempt INTEGER,
                outcome TEXT,
                detail TEXT,
                remediation TEXT,
                artifact TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_export_attempts_ts ON export_attempts(ts DESC);
            CREATE TABLE IF NOT EXISTS export_runs (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                run_id TEXT,
                dry_run INTEGER,
                cancelled INTEGER,
                rounds INTEGER,
                succeeded INTEGER,
                failed INTEGER,
                attempts INTEGER,
                duration_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_export_runs_ts ON export_runs(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, TelemetryError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    /// Stores one attempt. Failed attempts are also appended to the log.
    pub fn record_attempt(&self, attempt: &AttemptContext) -> Result<(), TelemetryError> {
        if attempt.failure.is_some() {
            let json = serde_json::to_string(attempt)?;
            if let Ok(mut guard) = self.log.lock() {
                writeln!(guard, "{json}")?;
                guard.flush()?;
            }
        }
        let detail = match &attempt.failure {
            Some(FailureClassification::Other(detail)) => detail.clone(),
            _ => String::new(),
        };
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO export_attempts (
                run_id, title, detail_url, date_hint, round, attempt, outcome, detail,
                remediation, artifact
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                attempt.run_id.to_string(),
                attempt.title,
                attempt.detail_url,
                attempt.date_hint,
                attempt.round as i64,
                attempt.attempt as i64,
                attempt.outcome(),
                detail,
                attempt.action.map(RemediationAction::label).unwrap_or_default(),
                attempt
                    .artifact
                    .as_ref()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, run: &RunContext) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO export_runs (
                run_id, dry_run, cancelled, rounds, succeeded, failed, attempts, duration_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.run_id.to_string(),
                if run.dry_run { 1 } else { 0 },
                if run.cancelled { 1 } else { 0 },
                run.rounds as i64,
                run.succeeded as i64,
                run.failed as i64,
                run.attempts as i64,
                run.duration_ms,
            ],
        )?;
        Ok(())
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}
