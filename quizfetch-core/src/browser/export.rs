use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ExporterConfig;

use super::artifact::{
    canonical_filename, claim_artifact, export_extension, find_new_artifact, today,
    DirectorySnapshot,
};
use super::error::BrowserError;
use super::locator::LocatorResolver;
use super::retry::TaskProcessor;
use super::session::SessionDriver;
use super::task::{DownloadTask, FailureClassification, RecordDescriptor};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export failed: {0}")]
    Failed(FailureClassification),
    /// The session itself misbehaved; the run cannot continue.
    #[error(transparent)]
    Driver(#[from] BrowserError),
}

impl ExportError {
    pub fn classification(&self) -> Option<&FailureClassification> {
        match self {
            ExportError::Failed(failure) => Some(failure),
            ExportError::Driver(_) => None,
        }
    }
}

impl From<FailureClassification> for ExportError {
    fn from(failure: FailureClassification) -> Self {
        ExportError::Failed(failure)
    }
}

fn classify(err: BrowserError) -> ExportError {
    match err {
        BrowserError::Locator(_) | BrowserError::StaleElement(_) => {
            ExportError::Failed(FailureClassification::NotFound)
        }
        BrowserError::Timeout(_) => ExportError::Failed(FailureClassification::Timeout),
        other => ExportError::Driver(other),
    }
}

fn filesystem(context: &str, err: io::Error) -> ExportError {
    ExportError::Failed(FailureClassification::Other(format!("{context}: {err}")))
}

/// Drives one record from its detail page to a renamed file on disk.
#[derive(Debug, Clone)]
pub struct ExportOrchestrator {
    config: Arc<ExporterConfig>,
    resolver: LocatorResolver,
    dry_run: bool,
}

impl ExportOrchestrator {
    pub fn new(config: Arc<ExporterConfig>) -> Self {
        let resolver = LocatorResolver::new(config.timeouts.locator_poll());
        Self {
            config,
            resolver,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn process<D>(
        &self,
        session: &mut D,
        task: &DownloadTask,
        output_dir: &Path,
    ) -> Result<PathBuf, ExportError>
    where
        D: SessionDriver + ?Sized,
    {
        let record = task.record();
        let selectors = &self.config.selectors;
        let timeouts = &self.config.timeouts;
        let export = &self.config.export;

        debug!(record = %record, url = record.detail_url(), "opening detail page");
        session.navigate(record.detail_url()).await.map_err(classify)?;

        match self
            .resolver
            .resolve(session, &selectors.export_trigger, timeouts.short(), None)
            .await
        {
            Ok(trigger) => {
                session.click(&trigger).await.map_err(classify)?;
                sleep(Duration::from_millis(export.trigger_settle_ms)).await;
            }
            Err(BrowserError::Locator(err)) => {
                debug!(record = %record, error = %err, "export trigger not found, trying link directly");
            }
            Err(err) => return Err(classify(err)),
        }

        let link = self
            .resolver
            .resolve(session, &selectors.full_export_link, timeouts.standard(), None)
            .await
            .map_err(classify)?;

        if self.dry_run {
            let intended = output_dir.join(self.target_name(record, "csv"));
            info!(record = %record, target = %intended.display(), "dry run, export link located");
            return Ok(intended);
        }

        let before = DirectorySnapshot::capture(output_dir)
            .map_err(|err| filesystem("snapshot output directory", err))?;
        let original = session.current_window().await.map_err(classify)?;
        let windows_before: HashSet<_> = session
            .current_window_handles()
            .await
            .map_err(classify)?
            .into_iter()
            .collect();

        session.click(&link).await.map_err(classify)?;
        sleep(Duration::from_millis(export.popup_grace_ms)).await;

        let popups: Vec<_> = session
            .current_window_handles()
            .await
            .map_err(classify)?
            .into_iter()
            .filter(|handle| !windows_before.contains(handle))
            .collect();
        if !popups.is_empty() {
            warn!(record = %record, count = popups.len(), "export opened a new window");
            for handle in &popups {
                match session.close_window(handle).await {
                    Ok(()) | Err(BrowserError::WindowNotFound(_)) => {}
                    Err(err) => return Err(classify(err)),
                }
            }
            session
                .switch_to_window(&original)
                .await
                .map_err(classify)?;
            return Err(FailureClassification::Popup.into());
        }

        if session
            .page_contains_text(&export.rate_limit_phrase)
            .await
            .map_err(classify)?
        {
            warn!(record = %record, "rate limit message shown after export click");
            return Err(FailureClassification::RateLimited.into());
        }

        let artifact = self.await_artifact(session, record, output_dir, &before).await?;
        let target = output_dir.join(self.target_name(record, export_extension(&artifact)));
        let saved = claim_artifact(&artifact, &target)
            .map_err(|err| filesystem("rename artifact", err))?;
        info!(record = %record, path = %saved.display(), "export saved");
        Ok(saved)
    }

    async fn await_artifact<D>(
        &self,
        session: &mut D,
        record: &RecordDescriptor,
        output_dir: &Path,
        before: &DirectorySnapshot,
    ) -> Result<PathBuf, ExportError>
    where
        D: SessionDriver + ?Sized,
    {
        let export = &self.config.export;
        let deadline = Instant::now() + export.ceiling();
        loop {
            if let Some(found) = find_new_artifact(output_dir, before, &export.in_progress_suffixes)
                .map_err(|err| filesystem("scan output directory", err))?
            {
                debug!(record = %record, artifact = %found.display(), "artifact detected");
                return Ok(found);
            }
            if session
                .page_contains_text(&export.rate_limit_phrase)
                .await
                .map_err(classify)?
            {
                warn!(record = %record, "rate limit message shown while waiting for download");
                return Err(FailureClassification::RateLimited.into());
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(record = %record, "no artifact before the download ceiling");
                return Err(FailureClassification::Timeout.into());
            }
            sleep(export.poll_interval().min(deadline - now)).await;
        }
    }

    fn target_name(&self, record: &RecordDescriptor, extension: &str) -> String {
        canonical_filename(
            record,
            &self.config.export.export_kind,
            extension,
            today(),
            self.config.export.max_title_chars,
        )
    }
}

/// Binds an orchestrator to one session and output directory so the
/// scheduler can feed it tasks.
pub struct SessionExporter<'a, D: SessionDriver + ?Sized> {
    session: &'a mut D,
    orchestrator: ExportOrchestrator,
    output_dir: PathBuf,
}

impl<'a, D: SessionDriver + ?Sized> SessionExporter<'a, D> {
    pub fn new(
        session: &'a mut D,
        orchestrator: ExportOrchestrator,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session,
            orchestrator,
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[async_trait(?Send)]
impl<'a, D: SessionDriver + ?Sized> TaskProcessor for SessionExporter<'a, D> {
    async fn process(&mut self, task: &DownloadTask) -> Result<PathBuf, ExportError> {
        self.orchestrator
            .process(&mut *self.session, task, &self.output_dir)
            .await
    }
}
