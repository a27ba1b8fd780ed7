use thiserror::Error;

use super::locator::{LocatorCandidate, LocatorSet};

pub type BrowserResult<T> = Result<T, BrowserError>;

/// Every candidate of a [`LocatorSet`] timed out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no locator candidate matched [{}]", join_candidates(.candidates))]
pub struct LocatorError {
    pub candidates: Vec<LocatorCandidate>,
}

impl LocatorError {
    pub fn new(candidates: &LocatorSet) -> Self {
        Self {
            candidates: candidates.candidates().to_vec(),
        }
    }
}

fn join_candidates(candidates: &[LocatorCandidate]) -> String {
    candidates
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Locator(#[from] LocatorError),
    /// A previously located element is no longer attached to the page.
    #[error("element {0} is no longer on the page")]
    StaleElement(String),
    #[error("page script failed: {0}")]
    Script(String),
    #[error("window not found: {0}")]
    WindowNotFound(String),
    #[error("telemetry error: {0}")]
    Telemetry(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}
