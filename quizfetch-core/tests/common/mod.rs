#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use quizfetch_core::browser::{
    BrowserError, BrowserResult, ElementHandle, LocatorBackend, LocatorCandidate, LocatorSet,
    SessionDriver, WindowHandle,
};
use quizfetch_core::ExporterConfig;

pub const TRIGGER: &str = "#csv-menu";
pub const FULL_EXPORT: &str = "#full-export";
pub const RATE_LIMIT_TEXT: &str = "Too Many Attempts. Please wait.";

/// Small, fast timings and single-selector locator sets for the fake site.
pub fn test_config() -> Arc<ExporterConfig> {
    let mut config = ExporterConfig::default();
    config.timeouts.short_seconds = 1;
    config.timeouts.default_seconds = 1;
    config.timeouts.long_seconds = 2;
    config.export.ceiling_seconds = 5;
    config.selectors.login_email = LocatorSet::new(vec![LocatorCandidate::name("email")]);
    config.selectors.login_password = LocatorSet::new(vec![LocatorCandidate::name("password")]);
    config.selectors.login_submit = LocatorSet::new(vec![LocatorCandidate::css("button[type='submit']")]);
    config.selectors.listing_link = LocatorSet::new(vec![LocatorCandidate::link_text("Quizzes")]);
    config.selectors.rows = LocatorSet::new(vec![LocatorCandidate::css("tr.quiz")]);
    config.selectors.title_link = LocatorSet::new(vec![LocatorCandidate::css("a")]);
    config.selectors.date_cell = LocatorSet::new(vec![LocatorCandidate::css("td.date")]);
    config.selectors.export_trigger = LocatorSet::new(vec![LocatorCandidate::css(TRIGGER)]);
    config.selectors.full_export_link = LocatorSet::new(vec![
        LocatorCandidate::css(FULL_EXPORT),
        LocatorCandidate::partial_link_text("Full format"),
    ]);
    Arc::new(config)
}

/// What the fake site does when an element is clicked.
#[derive(Debug, Clone)]
pub enum ClickEffect {
    /// Writes files into the download directory; offsets are mtime seconds
    /// relative to now.
    Download(Vec<(String, i64)>),
    Popup,
    RateLimit,
    /// Rate-limit text appears after this many page text checks.
    RateLimitAfter(usize),
    Nothing,
    /// The element was re-rendered away before the click landed.
    Stale,
    Fault,
}

#[derive(Debug)]
pub struct FakeSite {
    download_dir: PathBuf,
    elements: HashMap<String, Vec<String>>,
    texts: HashMap<String, String>,
    attributes: HashMap<(String, String), String>,
    effects: HashMap<String, VecDeque<ClickEffect>>,
    stale: HashSet<String>,
    url: Option<String>,
    windows: Vec<WindowHandle>,
    current: WindowHandle,
    popup_seq: usize,
    page_text: String,
    rate_limit_in: Option<usize>,
    pub probes: Vec<String>,
    pub navigations: Vec<String>,
    pub clicks: Vec<String>,
    pub fills: Vec<(String, String)>,
    pub closed: Vec<WindowHandle>,
}

impl FakeSite {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        let main = WindowHandle::new("main");
        Self {
            download_dir: download_dir.into(),
            elements: HashMap::new(),
            texts: HashMap::new(),
            attributes: HashMap::new(),
            effects: HashMap::new(),
            stale: HashSet::new(),
            url: None,
            windows: vec![main.clone()],
            current: main,
            popup_seq: 0,
            page_text: String::new(),
            rate_limit_in: None,
            probes: Vec::new(),
            navigations: Vec::new(),
            clicks: Vec::new(),
            fills: Vec::new(),
            closed: Vec::new(),
        }
    }

    /// Registers `ids` as the matches for `selector`, optionally inside
    /// the element `scope`.
    pub fn element(mut self, scope: Option<&str>, selector: &str, ids: &[&str]) -> Self {
        self.elements.insert(
            key(scope, selector),
            ids.iter().map(|id| id.to_string()).collect(),
        );
        self
    }

    pub fn text(mut self, id: &str, text: &str) -> Self {
        self.texts.insert(id.to_string(), text.to_string());
        self
    }

    pub fn attribute(mut self, id: &str, name: &str, value: &str) -> Self {
        self.attributes
            .insert((id.to_string(), name.to_string()), value.to_string());
        self
    }

    pub fn on_click(mut self, id: &str, effects: Vec<ClickEffect>) -> Self {
        self.effects
            .entry(id.to_string())
            .or_default()
            .extend(effects);
        self
    }

    /// Every action on `id` fails as if the node had been detached.
    pub fn stale(mut self, id: &str) -> Self {
        self.stale.insert(id.to_string());
        self
    }

    fn ensure_attached(&self, element: &ElementHandle) -> BrowserResult<()> {
        if self.stale.contains(element.id()) {
            return Err(BrowserError::StaleElement(element.id().to_string()));
        }
        Ok(())
    }

    pub fn at(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// Detail page with a CSV menu and a full export link.
    pub fn with_export_page(self) -> Self {
        self.element(None, TRIGGER, &["trigger"])
            .element(None, FULL_EXPORT, &["full"])
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn current(&self) -> &WindowHandle {
        &self.current
    }

    fn apply(&mut self, effect: ClickEffect) -> BrowserResult<()> {
        match effect {
            ClickEffect::Download(files) => {
                let now = SystemTime::now();
                for (name, offset) in files {
                    let path = self.download_dir.join(name);
                    fs::write(&path, b"quiz,score\n")?;
                    let modified = if offset >= 0 {
                        now + Duration::from_secs(offset as u64)
                    } else {
                        now - Duration::from_secs(offset.unsigned_abs())
                    };
                    fs::File::options()
                        .write(true)
                        .open(&path)?
                        .set_modified(modified)?;
                }
            }
            ClickEffect::Popup => {
                self.popup_seq += 1;
                self.windows
                    .push(WindowHandle::new(format!("popup-{}", self.popup_seq)));
            }
            ClickEffect::RateLimit => self.page_text = RATE_LIMIT_TEXT.to_string(),
            ClickEffect::RateLimitAfter(checks) => self.rate_limit_in = Some(checks),
            ClickEffect::Nothing => {}
            ClickEffect::Stale => unreachable!("stale clicks are handled before effects apply"),
            ClickEffect::Fault => {
                return Err(BrowserError::Unexpected("session lost".into()));
            }
        }
        Ok(())
    }
}

fn key(scope: Option<&str>, selector: &str) -> String {
    match scope {
        Some(scope) => format!("{scope}>>{selector}"),
        None => selector.to_string(),
    }
}

#[async_trait(?Send)]
impl LocatorBackend for FakeSite {
    async fn find_all(
        &mut self,
        candidate: &LocatorCandidate,
        scope: Option<&ElementHandle>,
    ) -> BrowserResult<Vec<ElementHandle>> {
        self.probes.push(candidate.selector.clone());
        let ids = self
            .elements
            .get(&key(scope.map(ElementHandle::id), &candidate.selector))
            .cloned()
            .unwrap_or_default();
        Ok(ids.into_iter().map(ElementHandle::new).collect())
    }
}

#[async_trait(?Send)]
impl SessionDriver for FakeSite {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        self.navigations.push(url.to_string());
        self.url = Some(url.to_string());
        self.page_text.clear();
        self.rate_limit_in = None;
        Ok(())
    }

    async fn current_url(&mut self) -> BrowserResult<Option<String>> {
        Ok(self.url.clone())
    }

    async fn click(&mut self, element: &ElementHandle) -> BrowserResult<()> {
        self.clicks.push(element.id().to_string());
        self.ensure_attached(element)?;
        let effect = self
            .effects
            .get_mut(element.id())
            .and_then(VecDeque::pop_front)
            .unwrap_or(ClickEffect::Nothing);
        if let ClickEffect::Stale = effect {
            return Err(BrowserError::StaleElement(element.id().to_string()));
        }
        self.apply(effect)
    }

    async fn fill(&mut self, element: &ElementHandle, text: &str) -> BrowserResult<()> {
        self.ensure_attached(element)?;
        self.fills.push((element.id().to_string(), text.to_string()));
        Ok(())
    }

    async fn text(&mut self, element: &ElementHandle) -> BrowserResult<String> {
        self.ensure_attached(element)?;
        Ok(self.texts.get(element.id()).cloned().unwrap_or_default())
    }

    async fn attribute(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> BrowserResult<Option<String>> {
        self.ensure_attached(element)?;
        Ok(self
            .attributes
            .get(&(element.id().to_string(), name.to_string()))
            .cloned())
    }

    async fn current_window(&mut self) -> BrowserResult<WindowHandle> {
        Ok(self.current.clone())
    }

    async fn current_window_handles(&mut self) -> BrowserResult<Vec<WindowHandle>> {
        Ok(self.windows.clone())
    }

    async fn switch_to_window(&mut self, handle: &WindowHandle) -> BrowserResult<()> {
        if !self.windows.contains(handle) {
            return Err(BrowserError::WindowNotFound(handle.to_string()));
        }
        self.current = handle.clone();
        Ok(())
    }

    async fn close_window(&mut self, handle: &WindowHandle) -> BrowserResult<()> {
        let before = self.windows.len();
        self.windows.retain(|window| window != handle);
        if self.windows.len() == before {
            return Err(BrowserError::WindowNotFound(handle.to_string()));
        }
        self.closed.push(handle.clone());
        Ok(())
    }

    async fn page_contains_text(&mut self, pattern: &str) -> BrowserResult<bool> {
        if let Some(remaining) = self.rate_limit_in.as_mut() {
            if *remaining == 0 {
                self.page_text = RATE_LIMIT_TEXT.to_string();
                self.rate_limit_in = None;
            } else {
                *remaining -= 1;
            }
        }
        Ok(self
            .page_text
            .to_lowercase()
            .contains(&pattern.to_lowercase()))
    }
}
