mod artifact;
mod automation;
mod catalog;
mod error;
mod error_handler;
mod export;
mod locator;
mod metrics;
mod retry;
mod session;
mod task;

pub use artifact::{
    canonical_filename, claim_artifact, export_extension, find_new_artifact, sanitize_title,
    DirectorySnapshot,
};
pub use automation::{BrowserLauncher, BrowserSession, LaunchOverrides};
pub use catalog::{AuthError, CatalogEnumerator, Credentials, RecordFilter};
pub use error::{BrowserError, BrowserResult, LocatorError};
pub use error_handler::{
    route, AttemptContext, AutomationTelemetry, RemediationAction, RunContext, TelemetryError,
};
pub use export::{ExportError, ExportOrchestrator, SessionExporter};
pub use locator::{
    ElementHandle, LocatorBackend, LocatorCandidate, LocatorResolver, LocatorSet,
    LocatorStrategy, SelectorQuery,
};
pub use metrics::ExportMetrics;
pub use retry::{
    CompletedTask, RetryScheduler, RoundSummary, RunReport, TaskProcessor, UnrecoveredTask,
};
pub use session::{SessionDriver, WindowHandle};
pub use task::{DownloadTask, FailureClassification, RecordDescriptor, TaskState};
