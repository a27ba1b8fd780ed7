use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quizfetch_core::browser::{
    AuthError, AutomationTelemetry, BrowserLauncher, BrowserResult, BrowserSession,
    CatalogEnumerator, Credentials, ExportOrchestrator, LaunchOverrides, RecordFilter,
    RetryScheduler, RunReport, SessionExporter,
};
use quizfetch_core::ExporterConfig;

use crate::{credentials_from, AppContext, AppError, DisplayFallback, Result};

const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Only export quizzes whose title contains this text (case-insensitive)
    #[arg(long, value_name = "TEXT")]
    pub only: Option<String>,
    /// Export at most this many quizzes
    #[arg(long, value_name = "N")]
    pub max: Option<usize>,
    /// Locate every export link without clicking it
    #[arg(long)]
    pub dry_run: bool,
    /// Show the browser window
    #[arg(long)]
    pub headful: bool,
    /// Directory receiving the exported files
    #[arg(long, value_name = "PATH")]
    pub download_dir: Option<PathBuf>,
}

pub fn execute(
    context: &AppContext,
    args: &RunArgs,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<RunReport> {
    let credentials = credentials_from(env)?;
    let download_dir = context.download_dir(args.download_dir.as_deref(), env);
    fs::create_dir_all(&download_dir).map_err(|source| AppError::OutputDir {
        path: download_dir.clone(),
        source,
    })?;
    info!(download_dir = %download_dir.display(), "exporting into");

    let telemetry = open_telemetry(context);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(export_all(
        context.config().clone(),
        args,
        credentials,
        download_dir,
        telemetry,
    ))
}

fn open_telemetry(context: &AppContext) -> Option<Arc<AutomationTelemetry>> {
    if !context.config().observability.enabled {
        return None;
    }
    match AutomationTelemetry::new(context.failure_log(), context.history_db()) {
        Ok(telemetry) => Some(Arc::new(telemetry)),
        Err(err) => {
            warn!(error = %err, "attempt history disabled");
            None
        }
    }
}

async fn export_all(
    config: Arc<ExporterConfig>,
    args: &RunArgs,
    credentials: Credentials,
    download_dir: PathBuf,
    telemetry: Option<Arc<AutomationTelemetry>>,
) -> Result<RunReport> {
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if interrupt_action(&cancel) == InterruptAction::ForceQuit {
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            }
        })
    };

    let launcher = BrowserLauncher::new(config.clone());
    let overrides = LaunchOverrides {
        headless: args.headful.then_some(false),
    };
    let mut session = launcher
        .launch_with_overrides(&download_dir, overrides)
        .await?;
    let outcome = export_with_session(
        &mut session,
        config,
        args,
        &credentials,
        &download_dir,
        cancel,
        telemetry,
    )
    .await;
    let report = session.finish(outcome).await;
    interrupt.abort();
    Ok(report?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    StopAfterCurrent,
    ForceQuit,
}

/// The first interrupt cancels the run cooperatively; any later one quits.
fn interrupt_action(cancel: &CancellationToken) -> InterruptAction {
    if cancel.is_cancelled() {
        warn!("second interrupt, exiting immediately");
        return InterruptAction::ForceQuit;
    }
    warn!("interrupt received, stopping after the current quiz (press Ctrl-C again to force quit)");
    cancel.cancel();
    InterruptAction::StopAfterCurrent
}

async fn export_with_session(
    session: &mut BrowserSession,
    config: Arc<ExporterConfig>,
    args: &RunArgs,
    credentials: &Credentials,
    download_dir: &Path,
    cancel: CancellationToken,
    telemetry: Option<Arc<AutomationTelemetry>>,
) -> BrowserResult<RunReport> {
    let catalog = CatalogEnumerator::new(config.clone());
    match catalog.login(session, credentials).await {
        Ok(()) => {}
        Err(AuthError::Driver(err)) => return Err(err),
        Err(err @ (AuthError::FieldNotFound(_) | AuthError::FieldStale(_))) => {
            warn!(error = %err, "login form not recognised, continuing as if signed in");
        }
    }
    catalog
        .open_listing(session, &config.site.listing_url)
        .await?;

    let filter = RecordFilter {
        title_contains: args.only.clone(),
        max_records: args.max,
    };
    let records = filter.apply(catalog.list_records(session).await?);
    info!(count = records.len(), "quizzes selected for export");

    let orchestrator = ExportOrchestrator::new(config.clone()).dry_run(args.dry_run);
    let mut scheduler = RetryScheduler::new(&config)
        .dry_run(args.dry_run)
        .with_cancellation(cancel);
    if let Some(telemetry) = telemetry {
        scheduler = scheduler.with_telemetry(telemetry);
    }
    let mut exporter = SessionExporter::new(session, orchestrator, download_dir);
    scheduler.run(&mut exporter, records).await
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Run {} finished in {:.1}s{}",
            self.run_id,
            self.duration_ms as f64 / 1000.0,
            if self.dry_run { " (dry run)" } else { "" }
        )];
        let verb = if self.dry_run { "Would save" } else { "Saved" };
        lines.push(format!("{verb} {} file(s):", self.succeeded.len()));
        for done in &self.succeeded {
            lines.push(format!("  - {}", done.path.display()));
        }
        if !self.failed.is_empty() {
            lines.push(format!(
                "Permanently failed {} quiz(zes):",
                self.failed.len()
            ));
            for failed in &self.failed {
                let reason = failed
                    .last_failure
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "not attempted".to_string());
                lines.push(format!(
                    "  - {} [{}] after {} attempt(s): {}",
                    failed.record.title(),
                    failed.record.date_hint(),
                    failed.attempts,
                    reason
                ));
            }
        }
        for round in &self.rounds {
            lines.push(format!(
                "Round {} (backoff {}s): {} attempted, {} succeeded",
                round.round, round.backoff_seconds, round.attempted, round.succeeded
            ));
        }
        if self.cancelled {
            lines.push("Run cancelled before all quizzes were processed".to_string());
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quizfetch_core::browser::{
        CompletedTask, ExportMetrics, FailureClassification, RecordDescriptor, RoundSummary,
        UnrecoveredTask,
    };
    use tempfile::tempdir;
    use uuid::Uuid;

    fn report() -> RunReport {
        RunReport {
            run_id: Uuid::nil(),
            dry_run: false,
            cancelled: false,
            succeeded: vec![CompletedTask {
                record: RecordDescriptor::new("Unit 1", "https://example.com/1", "2024-05-01"),
                path: PathBuf::from("out/2024-05-01 - Unit 1 - full.csv"),
                attempts: 1,
            }],
            failed: vec![UnrecoveredTask {
                record: RecordDescriptor::new("Unit 2", "https://example.com/2", "2024-05-02"),
                attempts: 4,
                last_failure: Some(FailureClassification::RateLimited),
            }],
            rounds: vec![RoundSummary {
                round: 0,
                backoff_seconds: 0,
                attempted: 2,
                succeeded: 1,
            }],
            metrics: ExportMetrics::default(),
            duration_ms: 1500,
        }
    }

    #[test]
    fn summary_lists_saved_files_and_permanent_failures() {
        let text = report().display();
        assert!(text.contains("Saved 1 file(s):"));
        assert!(text.contains("2024-05-01 - Unit 1 - full.csv"));
        assert!(text.contains("Unit 2 [2024-05-02] after 4 attempt(s): rate_limited"));
    }

    #[test]
    fn second_interrupt_forces_quit() {
        let cancel = CancellationToken::new();
        assert_eq!(interrupt_action(&cancel), InterruptAction::StopAfterCurrent);
        assert!(cancel.is_cancelled());
        assert_eq!(interrupt_action(&cancel), InterruptAction::ForceQuit);
    }

    #[test]
    fn missing_credentials_fail_before_touching_the_filesystem() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("exports");
        let context = AppContext::from_config(ExporterConfig::default(), None);
        let args = RunArgs {
            only: None,
            max: None,
            dry_run: true,
            headful: false,
            download_dir: Some(target.clone()),
        };
        let result = execute(&context, &args, &|_: &str| None);
        assert!(matches!(result, Err(AppError::MissingCredentials)));
        assert!(!target.exists());
    }

    #[test]
    fn uncreatable_output_directory_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "").unwrap();
        let context = AppContext::from_config(ExporterConfig::default(), None);
        let args = RunArgs {
            only: None,
            max: None,
            dry_run: true,
            headful: false,
            download_dir: Some(blocker.join("exports")),
        };
        let env = |key: &str| match key {
            "QUIZFETCH_EMAIL" => Some("a@b.c".to_string()),
            "QUIZFETCH_PASSWORD" => Some("pw".to_string()),
            _ => None,
        };
        let result = execute(&context, &args, &env);
        assert!(matches!(result, Err(AppError::OutputDir { .. })));
    }
}
