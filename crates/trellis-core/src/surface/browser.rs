//! Browser surface: current URL, title and navigation history.
//!
//! Page rendering belongs to the embedded browser runtime; this adapter keeps
//! the navigation state that must survive a restart.

use serde::{Deserialize, Serialize};

use super::{BLANK_URL, CaptureLimits, SurfaceAdapter, SurfaceCapture, SurfaceHealth, SurfaceKind};
use crate::error::AdapterError;

/// Captured browser state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserCapture {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub history_index: usize,
}

/// Browser surface state.
#[derive(Debug, Clone)]
pub struct BrowserSurface {
    history: Vec<String>,
    cursor: usize,
    page_title: Option<String>,
    attached: bool,
    visible: bool,
}

impl BrowserSurface {
    #[must_use]
    pub fn new(url: &str) -> Self {
        let url = url.trim();
        let url = if url.is_empty() { BLANK_URL } else { url };
        Self {
            history: vec![url.to_string()],
            cursor: 0,
            page_title: None,
            attached: true,
            visible: false,
        }
    }

    /// A browser surface awaiting [`SurfaceAdapter::restore`].
    #[must_use]
    pub fn detached() -> Self {
        Self {
            attached: false,
            ..Self::new(BLANK_URL)
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        self.history
            .get(self.cursor)
            .map_or(BLANK_URL, String::as_str)
    }

    /// Page title reported by the runtime, or one derived from the URL.
    #[must_use]
    pub fn title(&self) -> String {
        self.page_title
            .clone()
            .unwrap_or_else(|| derive_title(self.url()))
    }

    /// Record the title reported by the browser runtime.
    pub fn set_page_title(&mut self, title: impl Into<String>) {
        let title = title.into();
        self.page_title = if title.trim().is_empty() {
            None
        } else {
            Some(title)
        };
    }

    #[must_use]
    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn navigate(&mut self, url: &str) -> Result<(), AdapterError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(AdapterError::Rejected("url must not be empty".to_string()));
        }
        self.history.truncate(self.cursor + 1);
        self.history.push(url.to_string());
        self.cursor = self.history.len() - 1;
        self.page_title = None;
        Ok(())
    }

    pub fn back(&mut self) -> Result<(), AdapterError> {
        if self.cursor == 0 {
            return Err(AdapterError::Rejected("no earlier history entry".to_string()));
        }
        self.cursor -= 1;
        self.page_title = None;
        Ok(())
    }

    pub fn forward(&mut self) -> Result<(), AdapterError> {
        if self.cursor + 1 >= self.history.len() {
            return Err(AdapterError::Rejected("no later history entry".to_string()));
        }
        self.cursor += 1;
        self.page_title = None;
        Ok(())
    }

    /// Reloading keeps the navigation state untouched.
    pub fn reload(&mut self) -> Result<(), AdapterError> {
        if !self.attached {
            return Err(AdapterError::Unavailable(
                "browser is waiting for state restore".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn attach(&mut self) {
        self.attached = true;
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }
}

fn derive_title(url: &str) -> String {
    if url.starts_with("file://") {
        return url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(url)
            .to_string();
    }
    if let Some((_, rest)) = url.split_once("://") {
        return rest.split('/').next().unwrap_or(rest).to_string();
    }
    url.to_string()
}

impl SurfaceAdapter for BrowserSurface {
    fn capture(&self, limits: &CaptureLimits) -> Result<SurfaceCapture, AdapterError> {
        let keep = limits.history_max_entries.max(1);
        let drop = self.history.len().saturating_sub(keep);
        // Entries dropped from the front must not push the cursor out.
        let drop = drop.min(self.cursor);
        Ok(SurfaceCapture::Browser(BrowserCapture {
            url: self.url().to_string(),
            title: self.page_title.clone(),
            history: self.history[drop..].to_vec(),
            history_index: self.cursor - drop,
        }))
    }

    fn restore(&mut self, capture: &SurfaceCapture) -> Result<(), AdapterError> {
        let SurfaceCapture::Browser(state) = capture else {
            return Err(AdapterError::KindMismatch {
                expected: SurfaceKind::Browser.as_str(),
                actual: capture.kind().as_str(),
            });
        };
        let mut history = state.history.clone();
        let mut cursor = state.history_index.min(history.len().saturating_sub(1));
        if history.get(cursor).map(String::as_str) != Some(state.url.as_str()) {
            // Hand-edited or older snapshots may disagree; the URL wins.
            history.truncate(cursor + 1);
            history.push(state.url.clone());
            cursor = history.len() - 1;
        }
        self.history = history;
        self.cursor = cursor;
        self.page_title = state.title.clone();
        self.attached = true;
        Ok(())
    }

    fn describe_health(&self) -> SurfaceHealth {
        SurfaceHealth {
            variant: SurfaceKind::Browser,
            visible: self.visible,
            attached: self.attached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_truncates_forward_history() {
        let mut browser = BrowserSurface::new("https://a.test");
        browser.navigate("https://b.test").unwrap();
        browser.back().unwrap();
        browser.navigate("https://c.test").unwrap();
        assert_eq!(browser.history(), ["https://a.test", "https://c.test"]);
        assert!(browser.forward().is_err());
        assert_eq!(browser.url(), "https://c.test");
    }

    #[test]
    fn empty_url_is_rejected() {
        let mut browser = BrowserSurface::new("");
        assert_eq!(browser.url(), BLANK_URL);
        assert!(browser.navigate("   ").is_err());
    }

    #[test]
    fn titles_derive_from_url() {
        assert_eq!(
            BrowserSurface::new("file:///tmp/x/local-test.html").title(),
            "local-test.html"
        );
        assert_eq!(
            BrowserSurface::new("https://example.com/a/b").title(),
            "example.com"
        );
        let mut browser = BrowserSurface::new("https://example.com");
        browser.set_page_title("Example Domain");
        assert_eq!(browser.title(), "Example Domain");
    }

    #[test]
    fn capture_keeps_cursor_inside_capped_history() {
        let mut browser = BrowserSurface::new("https://0.test");
        for i in 1..5 {
            browser.navigate(&format!("https://{i}.test")).unwrap();
        }
        browser.back().unwrap();
        let limits = CaptureLimits {
            history_max_entries: 2,
            ..CaptureLimits::default()
        };
        let SurfaceCapture::Browser(capture) = browser.capture(&limits).unwrap() else {
            panic!("expected browser capture");
        };
        assert_eq!(capture.url, "https://3.test");
        assert_eq!(capture.history[capture.history_index], "https://3.test");
    }

    #[test]
    fn restore_reinstates_history_and_clamps_cursor() {
        let mut browser = BrowserSurface::detached();
        let capture = SurfaceCapture::Browser(BrowserCapture {
            url: "https://b.test".into(),
            title: Some("B".into()),
            history: vec!["https://a.test".into(), "https://b.test".into()],
            history_index: 7,
        });
        browser.restore(&capture).unwrap();
        assert_eq!(browser.url(), "https://b.test");
        assert_eq!(browser.title(), "B");
        browser.back().unwrap();
        assert_eq!(browser.url(), "https://a.test");
        assert!(browser.describe_health().attached);
    }
}
