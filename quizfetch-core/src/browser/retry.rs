use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ExporterConfig, PacingSection, RetrySection};

use super::error::BrowserResult;
use super::error_handler::{route, AttemptContext, AutomationTelemetry, RemediationAction, RunContext};
use super::export::ExportError;
use super::metrics::ExportMetrics;
use super::task::{DownloadTask, FailureClassification, RecordDescriptor};

/// Anything that can turn one task into a file on disk.
#[async_trait(?Send)]
pub trait TaskProcessor {
    async fn process(&mut self, task: &DownloadTask) -> Result<PathBuf, ExportError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedTask {
    pub record: RecordDescriptor,
    pub path: PathBuf,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnrecoveredTask {
    pub record: RecordDescriptor,
    pub attempts: u32,
    pub last_failure: Option<FailureClassification>,
}

impl UnrecoveredTask {
    fn from_task(task: &DownloadTask) -> Self {
        Self {
            record: task.record().clone(),
            attempts: task.attempts(),
            last_failure: task.last_failure().cloned(),
        }
    }
}

/// Round 0 is the initial pass; retry rounds are numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundSummary {
    pub round: usize,
    pub backoff_seconds: u64,
    pub attempted: usize,
    pub succeeded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub cancelled: bool,
    pub succeeded: Vec<CompletedTask>,
    pub failed: Vec<UnrecoveredTask>,
    pub rounds: Vec<RoundSummary>,
    pub metrics: ExportMetrics,
    pub duration_ms: i64,
}

impl RunReport {
    pub fn retry_rounds(&self) -> usize {
        self.rounds.iter().filter(|round| round.round > 0).count()
    }

    pub fn total_records(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

struct RunState {
    run_id: Uuid,
    cancelled: bool,
    succeeded: Vec<CompletedTask>,
    failed: Vec<UnrecoveredTask>,
    rounds: Vec<RoundSummary>,
    metrics: ExportMetrics,
}

/// Initial pass plus up to `max_rounds` retry rounds with linear backoff.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    retry: RetrySection,
    pacing: PacingSection,
    dry_run: bool,
    cancel: CancellationToken,
    telemetry: Option<Arc<AutomationTelemetry>>,
}

impl RetryScheduler {
    pub fn new(config: &ExporterConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            pacing: config.pacing.clone(),
            dry_run: false,
            cancel: CancellationToken::new(),
            telemetry: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<AutomationTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Processes every record and reports what happened to each.
    ///
    /// Per-task failures never fail the run; a driver fault aborts it.
    pub async fn run<P>(
        &self,
        processor: &mut P,
        records: Vec<RecordDescriptor>,
    ) -> BrowserResult<RunReport>
    where
        P: TaskProcessor + ?Sized,
    {
        let started = std::time::Instant::now();
        let mut state = RunState {
            run_id: Uuid::new_v4(),
            cancelled: false,
            succeeded: Vec::new(),
            failed: Vec::new(),
            rounds: Vec::new(),
            metrics: ExportMetrics::default(),
        };
        info!(run_id = %state.run_id, records = records.len(), dry_run = self.dry_run, "starting export run");

        let initial = records.into_iter().map(DownloadTask::new).collect();
        let mut holding = self
            .run_round(0, Duration::ZERO, initial, processor, &mut state)
            .await?;

        if !self.dry_run {
            for round in 1..=self.retry.max_rounds {
                if holding.is_empty() || state.cancelled {
                    break;
                }
                let backoff = self.retry.backoff_for_round(round);
                info!(
                    round,
                    backoff_secs = backoff.as_secs(),
                    pending = holding.len(),
                    "waiting before retry round"
                );
                if !self.pause(backoff).await {
                    state.cancelled = true;
                    break;
                }
                holding = self
                    .run_round(round, backoff, holding, processor, &mut state)
                    .await?;
                let stalled = state
                    .rounds
                    .last()
                    .map(|summary| summary.succeeded == 0)
                    .unwrap_or(false);
                if stalled && self.retry.stop_on_stalled_round && !holding.is_empty() {
                    warn!(round, remaining = holding.len(), "retry round recovered nothing, giving up");
                    break;
                }
            }
        }

        for mut task in holding {
            task.fail_permanently(None);
            warn!(
                record = %task.record(),
                attempts = task.attempts(),
                last_failure = ?task.last_failure(),
                "export permanently failed"
            );
            state.failed.push(UnrecoveredTask::from_task(&task));
        }

        let report = RunReport {
            run_id: state.run_id,
            dry_run: self.dry_run,
            cancelled: state.cancelled,
            succeeded: state.succeeded,
            failed: state.failed,
            rounds: state.rounds,
            metrics: state.metrics,
            duration_ms: started.elapsed().as_millis() as i64,
        };
        self.record_run(&report);
        info!(
            run_id = %report.run_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            retry_rounds = report.retry_rounds(),
            cancelled = report.cancelled,
            "export run finished"
        );
        Ok(report)
    }

    /// Returns the tasks held for the next round. When cancelled, every task
    /// not yet attempted is returned as well.
    async fn run_round<P>(
        &self,
        round: usize,
        backoff: Duration,
        tasks: Vec<DownloadTask>,
        processor: &mut P,
        state: &mut RunState,
    ) -> BrowserResult<Vec<DownloadTask>>
    where
        P: TaskProcessor + ?Sized,
    {
        let mut queue: VecDeque<DownloadTask> = tasks
            .into_iter()
            .map(|mut task| {
                task.start_round();
                task
            })
            .collect();
        let mut holding = Vec::new();
        let mut summary = RoundSummary {
            round,
            backoff_seconds: backoff.as_secs(),
            attempted: 0,
            succeeded: 0,
        };

        while let Some(mut task) = queue.pop_front() {
            let paced = summary.attempted == 0 || self.pace().await;
            if !paced || self.cancel.is_cancelled() {
                info!(round, remaining = queue.len() + 1, "run cancelled");
                state.cancelled = true;
                holding.push(task);
                holding.extend(queue.drain(..));
                break;
            }

            task.begin_attempt();
            summary.attempted += 1;
            state.metrics.record_attempt();
            info!(round, attempt = task.attempts(), record = %task.record(), "exporting");

            match processor.process(&task).await {
                Ok(path) => {
                    state.metrics.record_download();
                    summary.succeeded += 1;
                    self.record_attempt(
                        AttemptContext::new(state.run_id, task.record(), round, task.attempts())
                            .succeeded(path.clone()),
                    );
                    task.succeed(path.clone());
                    state.succeeded.push(CompletedTask {
                        record: task.record().clone(),
                        path,
                        attempts: task.attempts(),
                    });
                }
                Err(ExportError::Failed(failure)) => {
                    state.metrics.record_failure(&failure);
                    let action = route(&failure, task.popup_requeues(), self.retry.max_popup_requeues);
                    warn!(
                        round,
                        record = %task.record(),
                        failure = %failure,
                        action = action.label(),
                        "export attempt failed"
                    );
                    self.record_attempt(
                        AttemptContext::new(state.run_id, task.record(), round, task.attempts())
                            .failed(failure.clone(), action),
                    );
                    match action {
                        RemediationAction::RequeueSameRound => {
                            state.metrics.record_same_round_requeue();
                            task.requeue_same_round(failure);
                            queue.push_back(task);
                        }
                        RemediationAction::RequeueNextRound => {
                            state.metrics.record_next_round_requeue();
                            task.requeue_next_round(failure);
                            holding.push(task);
                        }
                        RemediationAction::Abandon => {
                            task.fail_permanently(Some(failure));
                            state.failed.push(UnrecoveredTask::from_task(&task));
                        }
                    }
                }
                Err(ExportError::Driver(err)) => {
                    error!(round, record = %task.record(), error = %err, "session fault, aborting run");
                    return Err(err);
                }
            }
        }

        info!(
            round,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            held = holding.len(),
            "round complete"
        );
        state.rounds.push(summary);
        Ok(holding)
    }

    /// Sleeps unless cancelled first; `false` means cancelled.
    async fn pause(&self, duration: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    async fn pace(&self) -> bool {
        let [low, high] = self.pacing.delay_range_ms;
        if high == 0 {
            return !self.cancel.is_cancelled();
        }
        let delay = rand::thread_rng().gen_range(low.min(high)..=high);
        self.pause(Duration::from_millis(delay)).await
    }

    fn record_attempt(&self, attempt: AttemptContext) {
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.record_attempt(&attempt) {
                warn!(error = %err, "failed to record export attempt");
            }
        }
    }

    fn record_run(&self, report: &RunReport) {
        if let Some(telemetry) = &self.telemetry {
            let run = RunContext {
                timestamp: Utc::now(),
                run_id: report.run_id,
                dry_run: report.dry_run,
                cancelled: report.cancelled,
                rounds: report.retry_rounds(),
                succeeded: report.succeeded.len(),
                failed: report.failed.len(),
                attempts: report.metrics.attempts,
                duration_ms: report.duration_ms,
            };
            if let Err(err) = telemetry.record_run(&run) {
                warn!(error = %err, "failed to record export run");
            }
        }
    }
}
