//! Ordered fallback element lookup.
//!
//! Remote markup is unversioned, so every element the exporter touches is
//! described by a [`LocatorSet`]: candidates tried strictly in declared
//! order, each with its own timeout. The first candidate is the primary
//! selector; the rest cover known markup drift.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::trace;

use super::error::{BrowserError, BrowserResult, LocatorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStrategy {
    Css,
    #[serde(rename = "xpath")]
    XPath,
    Name,
    Id,
    LinkText,
    PartialLinkText,
}

impl fmt::Display for LocatorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LocatorStrategy::Css => "css",
            LocatorStrategy::XPath => "xpath",
            LocatorStrategy::Name => "name",
            LocatorStrategy::Id => "id",
            LocatorStrategy::LinkText => "link_text",
            LocatorStrategy::PartialLinkText => "partial_link_text",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocatorCandidate {
    pub by: LocatorStrategy,
    pub selector: String,
}

/// Query form understood by the browser: every strategy collapses to either
/// a CSS selector or an XPath expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorQuery {
    Css(String),
    XPath(String),
}

impl LocatorCandidate {
    pub fn new(by: LocatorStrategy, selector: impl Into<String>) -> Self {
        Self {
            by,
            selector: selector.into(),
        }
    }

    pub fn css(selector: impl Into<String>) -> Self {
        Self::new(LocatorStrategy::Css, selector)
    }

    pub fn xpath(selector: impl Into<String>) -> Self {
        Self::new(LocatorStrategy::XPath, selector)
    }

    pub fn name(value: impl Into<String>) -> Self {
        Self::new(LocatorStrategy::Name, value)
    }

    pub fn id(value: impl Into<String>) -> Self {
        Self::new(LocatorStrategy::Id, value)
    }

    pub fn link_text(value: impl Into<String>) -> Self {
        Self::new(LocatorStrategy::LinkText, value)
    }

    pub fn partial_link_text(value: impl Into<String>) -> Self {
        Self::new(LocatorStrategy::PartialLinkText, value)
    }

    pub fn query(&self) -> SelectorQuery {
        match self.by {
            LocatorStrategy::Css => SelectorQuery::Css(self.selector.clone()),
            LocatorStrategy::XPath => SelectorQuery::XPath(self.selector.clone()),
            LocatorStrategy::Name => {
                SelectorQuery::Css(format!("[name=\"{}\"]", css_escape(&self.selector)))
            }
            LocatorStrategy::Id => {
                SelectorQuery::Css(format!("[id=\"{}\"]", css_escape(&self.selector)))
            }
            LocatorStrategy::LinkText => SelectorQuery::XPath(format!(
                ".//a[normalize-space(.)={}]",
                xpath_literal(self.selector.trim())
            )),
            LocatorStrategy::PartialLinkText => SelectorQuery::XPath(format!(
                ".//a[contains(., {})]",
                xpath_literal(&self.selector)
            )),
        }
    }
}

impl fmt::Display for LocatorCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.by, self.selector)
    }
}

fn css_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn xpath_literal(value: &str) -> String {
    if !value.contains('"') {
        format!("\"{value}\"")
    } else if !value.contains('\'') {
        format!("'{value}'")
    } else {
        let parts = value
            .split('"')
            .map(|part| format!("\"{part}\""))
            .collect::<Vec<_>>()
            .join(", '\"', ");
        format!("concat({parts})")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocatorSet(Vec<LocatorCandidate>);

impl LocatorSet {
    pub fn new(candidates: Vec<LocatorCandidate>) -> Self {
        Self(candidates)
    }

    pub fn candidates(&self) -> &[LocatorCandidate] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<LocatorCandidate>> for LocatorSet {
    fn from(candidates: Vec<LocatorCandidate>) -> Self {
        Self(candidates)
    }
}

/// Opaque reference to an element located in the current page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(String);

impl ElementHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait(?Send)]
pub trait LocatorBackend {
    /// Single non-blocking probe. An empty vector means "not present yet".
    async fn find_all(
        &mut self,
        candidate: &LocatorCandidate,
        scope: Option<&ElementHandle>,
    ) -> BrowserResult<Vec<ElementHandle>>;
}

#[derive(Debug, Clone, Copy)]
pub struct LocatorResolver {
    poll_interval: Duration,
}

impl Default for LocatorResolver {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl LocatorResolver {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn resolve<B>(
        &self,
        backend: &mut B,
        candidates: &LocatorSet,
        timeout: Duration,
        scope: Option<&ElementHandle>,
    ) -> BrowserResult<ElementHandle>
    where
        B: LocatorBackend + ?Sized,
    {
        let matches = self.first_match(backend, candidates, timeout, scope).await?;
        matches
            .into_iter()
            .next()
            .ok_or_else(|| BrowserError::Locator(LocatorError::new(candidates)))
    }

    pub async fn resolve_all<B>(
        &self,
        backend: &mut B,
        candidates: &LocatorSet,
        timeout: Duration,
        scope: Option<&ElementHandle>,
    ) -> BrowserResult<Vec<ElementHandle>>
    where
        B: LocatorBackend + ?Sized,
    {
        self.first_match(backend, candidates, timeout, scope).await
    }

    async fn first_match<B>(
        &self,
        backend: &mut B,
        candidates: &LocatorSet,
        timeout: Duration,
        scope: Option<&ElementHandle>,
    ) -> BrowserResult<Vec<ElementHandle>>
    where
        B: LocatorBackend + ?Sized,
    {
        for candidate in candidates.candidates() {
            let deadline = Instant::now() + timeout;
            loop {
                let found = backend.find_all(candidate, scope).await?;
                if !found.is_empty() {
                    trace!(candidate = %candidate, matches = found.len(), "locator matched");
                    return Ok(found);
                }
                let now = Instant::now();
                if now >= deadline {
                    trace!(candidate = %candidate, "locator candidate timed out");
                    break;
                }
                sleep(self.poll_interval.min(deadline - now)).await;
            }
        }
        Err(BrowserError::Locator(LocatorError::new(candidates)))
    }
}
