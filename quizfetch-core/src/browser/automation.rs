use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ExporterConfig;

use super::error::{BrowserError, BrowserResult};
use super::locator::{ElementHandle, LocatorBackend, LocatorCandidate, SelectorQuery};
use super::session::{SessionDriver, WindowHandle};

const NODE_ATTRIBUTE: &str = "data-quizfetch-node";

// Tags every match with a stable id so later calls can address it again.
const FIND_SCRIPT: &str = r#"
(() => {
    const query = __QUERY__;
    const scopeId = __SCOPE__;
    const root = scopeId === null
        ? document
        : document.querySelector('[__ATTR__="' + scopeId + '"]');
    if (!root) {
        return { ids: [], error: null };
    }
    let nodes = [];
    try {
        if (query.kind === 'css') {
            nodes = Array.from(root.querySelectorAll(query.selector));
        } else {
            const snapshot = document.evaluate(
                query.selector, root, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
            for (let i = 0; i < snapshot.snapshotLength; i += 1) {
                nodes.push(snapshot.snapshotItem(i));
            }
        }
    } catch (err) {
        return { ids: [], error: String(err) };
    }
    const ids = [];
    for (const node of nodes) {
        if (!(node instanceof Element)) {
            continue;
        }
        if (!node.hasAttribute('__ATTR__')) {
            window.__quizfetchNext = (window.__quizfetchNext || 0) + 1;
            node.setAttribute('__ATTR__', String(window.__quizfetchNext));
        }
        ids.push(node.getAttribute('__ATTR__'));
    }
    return { ids, error: null };
})()
"#;

const PAGE_TEXT_SCRIPT: &str = "(() => document.body ? document.body.innerText : '')()";

#[derive(Debug, Deserialize)]
struct FindResult {
    ids: Vec<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOverrides {
    pub headless: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    config: Arc<ExporterConfig>,
}

impl BrowserLauncher {
    pub fn new(config: Arc<ExporterConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    pub async fn launch(&self, download_dir: &Path) -> BrowserResult<BrowserSession> {
        self.launch_with_overrides(download_dir, LaunchOverrides::default())
            .await
    }

    /// Starts Chromium with downloads routed into `download_dir` without
    /// prompting. The returned session must be ended with
    /// [`BrowserSession::finish`] or [`BrowserSession::shutdown`]; dropping
    /// it kills the browser process as a last resort.
    pub async fn launch_with_overrides(
        &self,
        download_dir: &Path,
        overrides: LaunchOverrides,
    ) -> BrowserResult<BrowserSession> {
        std::fs::create_dir_all(download_dir)?;
        let download_dir = std::fs::canonicalize(download_dir)?;
        let headless = overrides.headless.unwrap_or(self.config.chromium.headless);
        let chromium_config = self.build_chromium_config(headless)?;
        info!(
            headless,
            download_dir = %download_dir.display(),
            "Launching Chromium instance"
        );

        let (mut browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        let page = match prepare_browser(&browser, &download_dir).await {
            Ok(page) => page,
            Err(err) => {
                if let Err(close_err) = browser.close().await {
                    warn!(error = %close_err, "Failed to close browser after setup error");
                }
                handler_task.abort();
                return Err(err);
            }
        };

        Ok(BrowserSession {
            browser,
            page,
            handler_task: Some(handler_task),
            download_dir,
        })
    }

    fn build_chromium_config(&self, headless: bool) -> BrowserResult<ChromiumConfig> {
        let chromium = &self.config.chromium;
        let flags = &self.config.flags;
        let [width, height] = chromium.window_size;
        let mut builder = ChromiumConfig::builder()
            .window_size(width, height)
            .viewport(ChromiumViewport {
                width,
                height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: width >= height,
                has_touch: false,
            });

        if let Some(executable) = &chromium.executable_path {
            builder = builder.chrome_executable(executable);
        }
        if !headless {
            builder = builder.with_head();
        }
        if !chromium.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(timeout) = chromium.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(timeout));
        }

        let mut args = vec![format!("--window-size={width},{height}")];
        if chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if flags.no_first_run {
            args.push("--no-first-run".into());
        }
        if flags.disable_dev_shm_usage {
            args.push("--disable-dev-shm-usage".into());
        }
        if let Some(lang) = &flags.lang {
            args.push(format!("--lang={lang}"));
        }
        args.push("--password-store=basic".into());
        args.extend(flags.extra_args.iter().cloned());

        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }
}

async fn prepare_browser(browser: &Browser, download_dir: &Path) -> BrowserResult<Page> {
    let params = SetDownloadBehaviorParams::builder()
        .behavior(SetDownloadBehaviorBehavior::Allow)
        .download_path(download_dir.to_string_lossy().to_string())
        .build()
        .map_err(BrowserError::Configuration)?;
    browser.execute(params).await?;
    let page = browser.new_page("about:blank").await?;
    Ok(page)
}

#[derive(Debug)]
pub struct BrowserSession {
    browser: Browser,
    page: Page,
    handler_task: Option<JoinHandle<()>>,
    download_dir: PathBuf,
}

impl BrowserSession {
    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Tears the session down and hands back `outcome`. A shutdown failure
    /// only surfaces when the work itself succeeded.
    pub async fn finish<T>(self, outcome: BrowserResult<T>) -> BrowserResult<T> {
        let shutdown = self.shutdown().await;
        let value = outcome?;
        shutdown?;
        Ok(value)
    }

    pub async fn shutdown(mut self) -> BrowserResult<()> {
        info!("Shutting down Chromium instance");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "Failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        Ok(())
    }

    /// Looks a tagged node up again. A node dropped by a re-render is
    /// reported as [`BrowserError::StaleElement`], not as a CDP fault.
    async fn element(&self, handle: &ElementHandle) -> BrowserResult<Element> {
        self.ensure_attached(handle).await?;
        Ok(self.page.find_element(node_selector(handle)).await?)
    }

    async fn ensure_attached(&self, handle: &ElementHandle) -> BrowserResult<()> {
        let attached = self.run_on_node(handle, "return node.isConnected === true;").await?;
        if attached == Value::Bool(true) {
            Ok(())
        } else {
            Err(BrowserError::StaleElement(handle.to_string()))
        }
    }

    async fn evaluate<T: DeserializeOwned>(&self, script: &str) -> BrowserResult<T> {
        self.page
            .evaluate(script)
            .await?
            .into_value()
            .map_err(|err| BrowserError::Script(format!("failed to decode script result: {err}")))
    }

    async fn run_on_node(&self, handle: &ElementHandle, body: &str) -> BrowserResult<Value> {
        self.evaluate(&node_script(handle, body)).await
    }

    async fn find_page(&self, handle: &WindowHandle) -> BrowserResult<Page> {
        self.browser
            .pages()
            .await?
            .into_iter()
            .find(|page| window_of(page) == *handle)
            .ok_or_else(|| BrowserError::WindowNotFound(handle.to_string()))
    }
}

fn node_selector(handle: &ElementHandle) -> String {
    format!("[{NODE_ATTRIBUTE}=\"{}\"]", handle.id())
}

// Evaluates to `false` when the tagged node is gone.
fn node_script(handle: &ElementHandle, body: &str) -> String {
    let selector = Value::String(node_selector(handle)).to_string();
    format!(
        "(() => {{ const node = document.querySelector({selector}); if (!node) {{ return false; }} {body} }})()"
    )
}

fn window_of(page: &Page) -> WindowHandle {
    WindowHandle::new(page.target_id().inner().clone())
}

fn find_script(candidate: &LocatorCandidate, scope: Option<&ElementHandle>) -> String {
    let query = match candidate.query() {
        SelectorQuery::Css(selector) => json!({ "kind": "css", "selector": selector }),
        SelectorQuery::XPath(selector) => json!({ "kind": "xpath", "selector": selector }),
    };
    let scope = scope
        .map(|handle| Value::String(handle.id().to_string()))
        .unwrap_or(Value::Null);
    FIND_SCRIPT
        .replace("__QUERY__", &query.to_string())
        .replace("__SCOPE__", &scope.to_string())
        .replace("__ATTR__", NODE_ATTRIBUTE)
}

#[async_trait(?Send)]
impl LocatorBackend for BrowserSession {
    async fn find_all(
        &mut self,
        candidate: &LocatorCandidate,
        scope: Option<&ElementHandle>,
    ) -> BrowserResult<Vec<ElementHandle>> {
        let script = find_script(candidate, scope);
        let result: FindResult = self.evaluate(&script).await?;
        if let Some(error) = result.error {
            warn!(candidate = %candidate, error = %error, "selector rejected by the page");
        }
        Ok(result.ids.into_iter().map(ElementHandle::new).collect())
    }
}

#[async_trait(?Send)]
impl SessionDriver for BrowserSession {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        match self.page.goto(params).await {
            Ok(_) => {}
            Err(CdpError::Timeout) => {
                return Err(BrowserError::Timeout(format!("navigation to {url}")));
            }
            Err(err) => return Err(err.into()),
        }
        debug!(url, "navigated");
        Ok(())
    }

    async fn current_url(&mut self) -> BrowserResult<Option<String>> {
        Ok(self.page.url().await?)
    }

    async fn click(&mut self, element: &ElementHandle) -> BrowserResult<()> {
        let node = self.element(element).await?;
        if let Err(err) = node.scroll_into_view().await {
            debug!(element = %element, error = %err, "scroll into view failed");
        }
        if let Err(err) = node.click().await {
            debug!(element = %element, error = %err, "native click failed, dispatching script click");
            let clicked = self.run_on_node(element, "node.click(); return true;").await?;
            if clicked != Value::Bool(true) {
                return Err(BrowserError::StaleElement(element.to_string()));
            }
        }
        Ok(())
    }

    async fn fill(&mut self, element: &ElementHandle, text: &str) -> BrowserResult<()> {
        let cleared = self
            .run_on_node(
                element,
                "node.focus(); if ('value' in node) { node.value = ''; } return true;",
            )
            .await?;
        if cleared != Value::Bool(true) {
            return Err(BrowserError::StaleElement(element.to_string()));
        }
        let node = self.element(element).await?;
        node.click().await?;
        node.type_str(text).await?;
        Ok(())
    }

    async fn text(&mut self, element: &ElementHandle) -> BrowserResult<String> {
        let node = self.element(element).await?;
        Ok(node.inner_text().await?.unwrap_or_default())
    }

    async fn attribute(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> BrowserResult<Option<String>> {
        let node = self.element(element).await?;
        Ok(node.attribute(name).await?)
    }

    async fn current_window(&mut self) -> BrowserResult<WindowHandle> {
        Ok(window_of(&self.page))
    }

    async fn current_window_handles(&mut self) -> BrowserResult<Vec<WindowHandle>> {
        let pages = self.browser.pages().await?;
        Ok(pages.iter().map(window_of).collect())
    }

    async fn switch_to_window(&mut self, handle: &WindowHandle) -> BrowserResult<()> {
        let page = self.find_page(handle).await?;
        page.activate().await?;
        self.page = page;
        Ok(())
    }

    async fn close_window(&mut self, handle: &WindowHandle) -> BrowserResult<()> {
        let page = self.find_page(handle).await?;
        page.close().await?;
        Ok(())
    }

    async fn page_contains_text(&mut self, pattern: &str) -> BrowserResult<bool> {
        let text: String = self.evaluate(PAGE_TEXT_SCRIPT).await?;
        Ok(text.to_lowercase().contains(&pattern.to_lowercase()))
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(handle) = self.handler_task.take() {
            if !handle.is_finished() {
                warn!("BrowserSession dropped without explicit shutdown");
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_script_embeds_query_and_scope_as_json() {
        let script = find_script(
            &LocatorCandidate::css("a[href*='/quiz/']"),
            Some(&ElementHandle::new("7")),
        );
        assert!(script.contains(r#"{"kind":"css","selector":"a[href*='/quiz/']"}"#));
        assert!(script.contains(r#"const scopeId = "7";"#));
        assert!(script.contains("data-quizfetch-node"));
        assert!(!script.contains("__ATTR__"));
    }

    #[test]
    fn link_text_candidates_become_xpath_queries() {
        let script = find_script(&LocatorCandidate::link_text("Quizzes"), None);
        assert!(script.contains(r#""kind":"xpath""#));
        assert!(script.contains("const scopeId = null;"));
    }

    #[test]
    fn node_script_reports_missing_nodes_as_false() {
        let script = node_script(&ElementHandle::new("7"), "return node.isConnected === true;");
        assert!(script.contains(r#"document.querySelector("[data-quizfetch-node=\"7\"]")"#));
        assert!(script.contains("if (!node) { return false; }"));
        assert!(script.ends_with("return node.isConnected === true; })()"));
    }

    #[test]
    fn node_selector_targets_tag_attribute() {
        assert_eq!(
            node_selector(&ElementHandle::new("12")),
            "[data-quizfetch-node=\"12\"]"
        );
    }
}
