use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::BrowserResult;
use super::locator::{ElementHandle, LocatorBackend};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowHandle(String);

impl WindowHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primitive actions over one live browser session.
///
/// Implementations never retry: a crashed or unresponsive session surfaces
/// as an error and the caller decides what to do with it.
#[async_trait(?Send)]
pub trait SessionDriver: LocatorBackend {
    async fn navigate(&mut self, url: &str) -> BrowserResult<()>;
    async fn current_url(&mut self) -> BrowserResult<Option<String>>;
    async fn click(&mut self, element: &ElementHandle) -> BrowserResult<()>;
    async fn fill(&mut self, element: &ElementHandle, text: &str) -> BrowserResult<()>;
    async fn text(&mut self, element: &ElementHandle) -> BrowserResult<String>;
    async fn attribute(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> BrowserResult<Option<String>>;
    async fn current_window(&mut self) -> BrowserResult<WindowHandle>;
    async fn current_window_handles(&mut self) -> BrowserResult<Vec<WindowHandle>>;
    async fn switch_to_window(&mut self, handle: &WindowHandle) -> BrowserResult<()>;
    async fn close_window(&mut self, handle: &WindowHandle) -> BrowserResult<()>;
    /// Case-insensitive search over the visible page text.
    async fn page_contains_text(&mut self, pattern: &str) -> BrowserResult<bool>;
}
