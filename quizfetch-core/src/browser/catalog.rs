use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ExporterConfig;

use super::error::{BrowserError, BrowserResult, LocatorError};
use super::locator::{ElementHandle, LocatorResolver};
use super::session::SessionDriver;
use super::task::RecordDescriptor;

const UNTITLED: &str = "Untitled Quiz";

#[derive(Clone)]
pub struct Credentials {
    email: String,
    password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login form field not located: {0}")]
    FieldNotFound(LocatorError),
    #[error("login form changed while filling it: {0}")]
    FieldStale(String),
    #[error(transparent)]
    Driver(BrowserError),
}

impl From<BrowserError> for AuthError {
    fn from(err: BrowserError) -> Self {
        match err {
            BrowserError::Locator(locator) => AuthError::FieldNotFound(locator),
            BrowserError::StaleElement(element) => AuthError::FieldStale(element),
            other => AuthError::Driver(other),
        }
    }
}

/// Title substring and count limits applied to the enumerated records.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub title_contains: Option<String>,
    pub max_records: Option<usize>,
}

impl RecordFilter {
    pub fn apply(&self, records: Vec<RecordDescriptor>) -> Vec<RecordDescriptor> {
        let needle = self
            .title_contains
            .as_deref()
            .map(str::trim)
            .filter(|needle| !needle.is_empty())
            .map(str::to_lowercase);
        let filtered = records.into_iter().filter(|record| match &needle {
            Some(needle) => record.title().to_lowercase().contains(needle),
            None => true,
        });
        match self.max_records {
            Some(max) => filtered.take(max).collect(),
            None => filtered.collect(),
        }
    }
}

/// Logs in and reads the quiz listing into [`RecordDescriptor`]s.
#[derive(Debug, Clone)]
pub struct CatalogEnumerator {
    config: Arc<ExporterConfig>,
    resolver: LocatorResolver,
}

impl CatalogEnumerator {
    pub fn new(config: Arc<ExporterConfig>) -> Self {
        let resolver = LocatorResolver::new(config.timeouts.locator_poll());
        Self { config, resolver }
    }

    pub async fn login<D>(&self, session: &mut D, credentials: &Credentials) -> Result<(), AuthError>
    where
        D: SessionDriver + ?Sized,
    {
        let selectors = &self.config.selectors;
        let timeouts = &self.config.timeouts;
        info!(url = %self.config.site.login_url, email = %credentials.email, "logging in");
        session.navigate(&self.config.site.login_url).await?;

        let email = self
            .resolver
            .resolve(session, &selectors.login_email, timeouts.standard(), None)
            .await?;
        session.fill(&email, &credentials.email).await?;

        let password = self
            .resolver
            .resolve(session, &selectors.login_password, timeouts.standard(), None)
            .await?;
        session.fill(&password, &credentials.password).await?;

        let submit = self
            .resolver
            .resolve(session, &selectors.login_submit, timeouts.standard(), None)
            .await?;
        session.click(&submit).await?;

        match self
            .resolver
            .resolve(session, &selectors.listing_link, timeouts.long(), None)
            .await
        {
            Ok(_) => debug!("listing navigation visible after login"),
            Err(BrowserError::Locator(err)) => {
                info!(error = %err, "listing marker not seen after login; continuing");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Follows the quizzes navigation link, or goes straight to
    /// `listing_url` when the link is not on the page.
    pub async fn open_listing<D>(&self, session: &mut D, listing_url: &str) -> BrowserResult<()>
    where
        D: SessionDriver + ?Sized,
    {
        match self
            .resolver
            .resolve(
                session,
                &self.config.selectors.listing_link,
                self.config.timeouts.short(),
                None,
            )
            .await
        {
            Ok(link) => {
                debug!("opening listing through navigation link");
                match session.click(&link).await {
                    Err(BrowserError::StaleElement(_)) => {
                        debug!(url = listing_url, "navigation link went stale, opening listing directly");
                        session.navigate(listing_url).await
                    }
                    clicked => clicked,
                }
            }
            Err(BrowserError::Locator(_)) => {
                debug!(url = listing_url, "navigation link missing, opening listing directly");
                session.navigate(listing_url).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn list_records<D>(&self, session: &mut D) -> BrowserResult<Vec<RecordDescriptor>>
    where
        D: SessionDriver + ?Sized,
    {
        let selectors = &self.config.selectors;
        let rows = match self
            .resolver
            .resolve_all(session, &selectors.rows, self.config.timeouts.long(), None)
            .await
        {
            Ok(rows) => rows,
            Err(BrowserError::Locator(err)) => {
                warn!(error = %err, "no quiz rows found on the listing");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        let page_url = session.current_url().await?;

        let mut records = Vec::with_capacity(rows.len());
        for (index, row) in rows.iter().enumerate() {
            match self.read_row(session, row, page_url.as_deref()).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => warn!(row = index, "skipping row without a quiz link"),
                Err(BrowserError::StaleElement(element)) => {
                    warn!(row = index, element = %element, "row re-rendered while reading, skipping");
                }
                Err(err) => return Err(err),
            }
        }
        info!(count = records.len(), "enumerated quiz records");
        Ok(records)
    }

    async fn read_row<D>(
        &self,
        session: &mut D,
        row: &ElementHandle,
        page_url: Option<&str>,
    ) -> BrowserResult<Option<RecordDescriptor>>
    where
        D: SessionDriver + ?Sized,
    {
        let selectors = &self.config.selectors;
        // rows are already rendered, so a single probe per candidate
        let link = match self
            .resolver
            .resolve(session, &selectors.title_link, Duration::ZERO, Some(row))
            .await
        {
            Ok(link) => link,
            Err(BrowserError::Locator(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let href = match session.attribute(&link, "href").await? {
            Some(href) if !href.trim().is_empty() => href,
            _ => return Ok(None),
        };
        let title = session.text(&link).await?;
        let title = match title.trim() {
            "" => UNTITLED.to_string(),
            trimmed => trimmed.to_string(),
        };
        let date_hint = match self
            .resolver
            .resolve(session, &selectors.date_cell, Duration::ZERO, Some(row))
            .await
        {
            Ok(cell) => session.text(&cell).await?.trim().to_string(),
            Err(BrowserError::Locator(_)) => String::new(),
            Err(err) => return Err(err),
        };
        Ok(Some(RecordDescriptor::new(
            title,
            absolute_url(page_url, href.trim()),
            date_hint,
        )))
    }
}

fn absolute_url(base: Option<&str>, href: &str) -> String {
    base.and_then(|base| Url::parse(base).ok())
        .and_then(|base| base.join(href).ok())
        .map(String::from)
        .unwrap_or_else(|| href.to_string())
}
