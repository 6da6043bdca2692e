//! Surface adapters: the interactive content of a leaf pane.
//!
//! The session tree never looks inside a surface. It only uses the fixed
//! capability set of [`SurfaceAdapter`]: capture state for a snapshot,
//! restore state from one, and describe health. [`Surface`] is a closed
//! tagged union over the supported variants; adding a variant means adding a
//! tag here, not subclassing.

pub mod browser;
pub mod terminal;

use serde::{Deserialize, Serialize};

pub use browser::{BrowserCapture, BrowserSurface};
pub use terminal::{ReadMode, Scrollback, TerminalCapture, TerminalSurface};

use crate::error::AdapterError;
use crate::identity::SurfaceId;

/// Default URL for browser surfaces created without one.
pub const BLANK_URL: &str = "about:blank";

/// Variant tag of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    Terminal,
    Browser,
}

impl SurfaceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Browser => "browser",
        }
    }

    /// Parse a protocol `type` parameter.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "terminal" | "term" => Some(Self::Terminal),
            "browser" | "web" => Some(Self::Browser),
            _ => None,
        }
    }
}

impl std::fmt::Display for SurfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of a surface to create.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SurfaceSpec {
    #[default]
    Terminal,
    Browser {
        url: Option<String>,
    },
}

impl SurfaceSpec {
    /// Build a spec from protocol `type`/`url` parameters.
    pub fn from_params(kind: Option<&str>, url: Option<&str>) -> Result<Self, AdapterError> {
        let kind = match kind {
            Some(raw) => SurfaceKind::parse(raw)
                .ok_or_else(|| AdapterError::Rejected(format!("unknown surface type '{raw}'")))?,
            None if url.is_some() => SurfaceKind::Browser,
            None => SurfaceKind::Terminal,
        };
        Ok(match kind {
            SurfaceKind::Terminal => Self::Terminal,
            SurfaceKind::Browser => Self::Browser {
                url: url.map(str::to_string),
            },
        })
    }

    #[must_use]
    pub const fn kind(&self) -> SurfaceKind {
        match self {
            Self::Terminal => SurfaceKind::Terminal,
            Self::Browser { .. } => SurfaceKind::Browser,
        }
    }
}

/// Limits applied while capturing surface state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    /// Maximum scrollback bytes written per terminal surface.
    pub scrollback_max_bytes: usize,
    /// Maximum browser history entries kept.
    pub history_max_entries: usize,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            scrollback_max_bytes: 400_000,
            history_max_entries: 50,
        }
    }
}

/// Serializable state captured from a surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SurfaceCapture {
    Terminal(TerminalCapture),
    Browser(BrowserCapture),
}

impl SurfaceCapture {
    #[must_use]
    pub const fn kind(&self) -> SurfaceKind {
        match self {
            Self::Terminal(_) => SurfaceKind::Terminal,
            Self::Browser(_) => SurfaceKind::Browser,
        }
    }
}

/// Health report for a live surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceHealth {
    pub variant: SurfaceKind,
    /// The surface is in the selected workspace of its window.
    pub visible: bool,
    /// The surface is bound to its runtime and accepts input.
    pub attached: bool,
}

/// Capability set every surface variant provides.
pub trait SurfaceAdapter {
    /// Produce a serializable snapshot of the surface state.
    fn capture(&self, limits: &CaptureLimits) -> Result<SurfaceCapture, AdapterError>;

    /// Replay a previously captured state into this surface.
    fn restore(&mut self, capture: &SurfaceCapture) -> Result<(), AdapterError>;

    fn describe_health(&self) -> SurfaceHealth;
}

/// A surface hosted by exactly one leaf pane.
#[derive(Debug, Clone)]
pub struct Surface {
    id: SurfaceId,
    content: SurfaceContent,
}

/// Variant payload of a [`Surface`].
#[derive(Debug, Clone)]
pub enum SurfaceContent {
    Terminal(TerminalSurface),
    Browser(BrowserSurface),
}

impl Surface {
    /// Create a surface from a spec.
    #[must_use]
    pub fn new(id: SurfaceId, spec: &SurfaceSpec, scrollback_limit: usize, rows: usize) -> Self {
        let content = match spec {
            SurfaceSpec::Terminal => {
                SurfaceContent::Terminal(TerminalSurface::new(scrollback_limit, rows))
            }
            SurfaceSpec::Browser { url } => {
                SurfaceContent::Browser(BrowserSurface::new(url.as_deref().unwrap_or(BLANK_URL)))
            }
        };
        Self { id, content }
    }

    /// Create an unattached surface of `kind` awaiting a restore.
    #[must_use]
    pub fn detached(id: SurfaceId, kind: SurfaceKind, scrollback_limit: usize, rows: usize) -> Self {
        let content = match kind {
            SurfaceKind::Terminal => {
                SurfaceContent::Terminal(TerminalSurface::detached(scrollback_limit, rows))
            }
            SurfaceKind::Browser => SurfaceContent::Browser(BrowserSurface::detached()),
        };
        Self { id, content }
    }

    #[must_use]
    pub fn id(&self) -> &SurfaceId {
        &self.id
    }

    #[must_use]
    pub const fn kind(&self) -> SurfaceKind {
        match self.content {
            SurfaceContent::Terminal(_) => SurfaceKind::Terminal,
            SurfaceContent::Browser(_) => SurfaceKind::Browser,
        }
    }

    #[must_use]
    pub fn content(&self) -> &SurfaceContent {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut SurfaceContent {
        &mut self.content
    }

    #[must_use]
    pub fn as_terminal(&self) -> Option<&TerminalSurface> {
        match &self.content {
            SurfaceContent::Terminal(term) => Some(term),
            SurfaceContent::Browser(_) => None,
        }
    }

    pub fn as_terminal_mut(&mut self) -> Option<&mut TerminalSurface> {
        match &mut self.content {
            SurfaceContent::Terminal(term) => Some(term),
            SurfaceContent::Browser(_) => None,
        }
    }

    #[must_use]
    pub fn as_browser(&self) -> Option<&BrowserSurface> {
        match &self.content {
            SurfaceContent::Browser(browser) => Some(browser),
            SurfaceContent::Terminal(_) => None,
        }
    }

    pub fn as_browser_mut(&mut self) -> Option<&mut BrowserSurface> {
        match &mut self.content {
            SurfaceContent::Browser(browser) => Some(browser),
            SurfaceContent::Terminal(_) => None,
        }
    }

    /// Title shown in listings.
    #[must_use]
    pub fn title(&self) -> Option<String> {
        match &self.content {
            SurfaceContent::Terminal(_) => None,
            SurfaceContent::Browser(browser) => Some(browser.title()),
        }
    }

    /// Current URL of a browser surface.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.as_browser().map(BrowserSurface::url)
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        match &mut self.content {
            SurfaceContent::Terminal(term) => term.set_visible(visible),
            SurfaceContent::Browser(browser) => browser.set_visible(visible),
        }
    }

    /// Mark the surface as bound to its runtime without replaying state.
    pub(crate) fn attach(&mut self) {
        match &mut self.content {
            SurfaceContent::Terminal(term) => term.attach(),
            SurfaceContent::Browser(browser) => browser.attach(),
        }
    }
}

impl SurfaceAdapter for Surface {
    fn capture(&self, limits: &CaptureLimits) -> Result<SurfaceCapture, AdapterError> {
        match &self.content {
            SurfaceContent::Terminal(term) => term.capture(limits),
            SurfaceContent::Browser(browser) => browser.capture(limits),
        }
    }

    fn restore(&mut self, capture: &SurfaceCapture) -> Result<(), AdapterError> {
        match &mut self.content {
            SurfaceContent::Terminal(term) => term.restore(capture),
            SurfaceContent::Browser(browser) => browser.restore(capture),
        }
    }

    fn describe_health(&self) -> SurfaceHealth {
        match &self.content {
            SurfaceContent::Terminal(term) => term.describe_health(),
            SurfaceContent::Browser(browser) => browser.describe_health(),
        }
    }
}
