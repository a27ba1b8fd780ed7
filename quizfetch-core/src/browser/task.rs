use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One downloadable record discovered on the listing page.
///
/// Fields are private: a descriptor is never mutated after the catalog
/// produces it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordDescriptor {
    title: String,
    detail_url: String,
    date_hint: String,
}

impl RecordDescriptor {
    pub fn new(
        title: impl Into<String>,
        detail_url: impl Into<String>,
        date_hint: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            detail_url: detail_url.into(),
            date_hint: date_hint.into(),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn detail_url(&self) -> &str {
        &self.detail_url
    }

    pub fn date_hint(&self) -> &str {
        &self.date_hint
    }
}

impl fmt::Display for RecordDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.title, self.date_hint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureClassification {
    Popup,
    RateLimited,
    Timeout,
    NotFound,
    Other(String),
}

impl FailureClassification {
    /// Transient failures are worth another attempt; `Other` is not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, FailureClassification::Other(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureClassification::Popup => "popup",
            FailureClassification::RateLimited => "rate_limited",
            FailureClassification::Timeout => "timeout",
            FailureClassification::NotFound => "not_found",
            FailureClassification::Other(_) => "other",
        }
    }
}

impl fmt::Display for FailureClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClassification::Other(detail) => write!(f, "other: {detail}"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Succeeded,
    RequeuedSameRound,
    RequeuedNextRound,
    PermanentlyFailed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::PermanentlyFailed)
    }
}

/// A record plus its processing state for the duration of one run.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    record: RecordDescriptor,
    state: TaskState,
    attempts: u32,
    popup_requeues: u32,
    last_failure: Option<FailureClassification>,
    artifact: Option<PathBuf>,
}

impl DownloadTask {
    pub fn new(record: RecordDescriptor) -> Self {
        Self {
            record,
            state: TaskState::Pending,
            attempts: 0,
            popup_requeues: 0,
            last_failure: None,
            artifact: None,
        }
    }

    pub fn record(&self) -> &RecordDescriptor {
        &self.record
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn popup_requeues(&self) -> u32 {
        self.popup_requeues
    }

    pub fn last_failure(&self) -> Option<&FailureClassification> {
        self.last_failure.as_ref()
    }

    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn begin_attempt(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.state = TaskState::InProgress;
        self.attempts += 1;
    }

    pub(crate) fn start_round(&mut self) {
        self.popup_requeues = 0;
    }

    pub(crate) fn succeed(&mut self, artifact: PathBuf) {
        if self.is_terminal() {
            return;
        }
        self.state = TaskState::Succeeded;
        self.artifact = Some(artifact);
    }

    pub(crate) fn requeue_same_round(&mut self, failure: FailureClassification) {
        if self.is_terminal() {
            return;
        }
        self.state = TaskState::RequeuedSameRound;
        self.popup_requeues += 1;
        self.last_failure = Some(failure);
    }

    pub(crate) fn requeue_next_round(&mut self, failure: FailureClassification) {
        if self.is_terminal() {
            return;
        }
        self.state = TaskState::RequeuedNextRound;
        self.last_failure = Some(failure);
    }

    pub(crate) fn fail_permanently(&mut self, failure: Option<FailureClassification>) {
        if self.is_terminal() {
            return;
        }
        self.state = TaskState::PermanentlyFailed;
        if failure.is_some() {
            self.last_failure = failure;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DownloadTask {
        DownloadTask::new(RecordDescriptor::new(
            "Quiz 1",
            "https://example.com/quiz/1",
            "2024-05-01",
        ))
    }

    #[test]
    fn terminal_states_are_never_reverted() {
        let mut task = task();
        task.begin_attempt();
        task.succeed(PathBuf::from("/tmp/out.csv"));
        task.requeue_next_round(FailureClassification::RateLimited);
        task.fail_permanently(Some(FailureClassification::Timeout));
        task.begin_attempt();
        assert_eq!(task.state(), TaskState::Succeeded);
        assert_eq!(task.attempts(), 1);
        assert!(task.last_failure().is_none());
        assert_eq!(task.artifact(), Some(Path::new("/tmp/out.csv")));
    }

    #[test]
    fn permanent_failure_keeps_last_transient_classification() {
        let mut task = task();
        task.begin_attempt();
        task.requeue_next_round(FailureClassification::RateLimited);
        task.fail_permanently(None);
        assert_eq!(task.state(), TaskState::PermanentlyFailed);
        assert_eq!(task.last_failure(), Some(&FailureClassification::RateLimited));
        task.succeed(PathBuf::from("late.csv"));
        assert_eq!(task.state(), TaskState::PermanentlyFailed);
    }

    #[test]
    fn popup_requeues_reset_per_round() {
        let mut task = task();
        task.begin_attempt();
        task.requeue_same_round(FailureClassification::Popup);
        task.begin_attempt();
        task.requeue_same_round(FailureClassification::Popup);
        assert_eq!(task.popup_requeues(), 2);
        task.start_round();
        assert_eq!(task.popup_requeues(), 0);
        assert_eq!(task.attempts(), 2);
    }

    #[test]
    fn only_other_is_permanent() {
        assert!(FailureClassification::Popup.is_transient());
        assert!(FailureClassification::RateLimited.is_transient());
        assert!(FailureClassification::Timeout.is_transient());
        assert!(FailureClassification::NotFound.is_transient());
        assert!(!FailureClassification::Other("disk full".into()).is_transient());
    }
}
