//! Terminal surface: bounded scrollback plus runtime attachment state.
//!
//! PTY byte handling and ANSI parsing live in the external terminal runtime.
//! This adapter keeps the text the runtime produced (escape bytes included),
//! so it can be captured into a snapshot and replayed after a restart.

use serde::{Deserialize, Serialize};

use super::{CaptureLimits, SurfaceAdapter, SurfaceCapture, SurfaceHealth, SurfaceKind};
use crate::error::AdapterError;

/// Default retention for live scrollback (2 MiB).
pub const DEFAULT_SCROLLBACK_LIMIT: usize = 2 * 1024 * 1024;

/// Default visible rows for `ReadMode::Visible`.
pub const DEFAULT_ROWS: usize = 24;

/// Captured terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCapture {
    /// Scrollback text, oldest first.
    pub text: String,
    /// Older content was dropped to honor the capture cap.
    #[serde(default)]
    pub truncated: bool,
}

/// What part of the buffer `read_text` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// The last screenful of lines.
    Visible,
    /// The whole retained scrollback.
    Scrollback,
    /// The last `n` lines.
    Tail(usize),
}

/// Ordered text bounded by a byte budget.
///
/// Trimming drops whole leading lines where possible and never splits a
/// UTF-8 character.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scrollback {
    text: String,
    max_bytes: usize,
    trimmed_bytes: u64,
}

impl Scrollback {
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            text: String::new(),
            max_bytes: max_bytes.max(1),
            trimmed_bytes: 0,
        }
    }

    pub fn push_str(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > self.max_bytes {
            let cut = tail_start(&self.text, self.max_bytes);
            self.trimmed_bytes += cut as u64;
            self.text.drain(..cut);
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.text.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Bytes dropped by the retention policy so far.
    #[must_use]
    pub fn trimmed_bytes(&self) -> u64 {
        self.trimmed_bytes
    }
}

/// Byte offset where the newest `budget` bytes of `text` begin, moved forward
/// to the next line start when one exists inside the kept region.
fn tail_start(text: &str, budget: usize) -> usize {
    if text.len() <= budget {
        return 0;
    }
    let mut cut = text.len() - budget;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    if cut > 0 && text.as_bytes()[cut - 1] == b'\n' {
        return cut;
    }
    match text[cut..].find('\n') {
        Some(offset) if cut + offset + 1 < text.len() => cut + offset + 1,
        _ => cut,
    }
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Runtime {
    /// Created from a snapshot, waiting for its replay.
    Pending,
    Attached,
    /// The runtime died; the reason is kept for health output.
    Lost(String),
}

/// Terminal surface state.
#[derive(Debug, Clone)]
pub struct TerminalSurface {
    scrollback: Scrollback,
    rows: usize,
    runtime: Runtime,
    visible: bool,
    /// The replayed capture had already lost older content.
    replayed_truncated: bool,
}

impl TerminalSurface {
    /// A fresh, attached terminal.
    #[must_use]
    pub fn new(scrollback_limit: usize, rows: usize) -> Self {
        Self {
            scrollback: Scrollback::new(scrollback_limit),
            rows: rows.max(1),
            runtime: Runtime::Attached,
            visible: false,
            replayed_truncated: false,
        }
    }

    /// A terminal awaiting [`SurfaceAdapter::restore`].
    #[must_use]
    pub fn detached(scrollback_limit: usize, rows: usize) -> Self {
        Self {
            runtime: Runtime::Pending,
            ..Self::new(scrollback_limit, rows)
        }
    }

    /// Deliver input. The headless host has no PTY behind the surface, so
    /// input is echoed into the scrollback like a local-echo terminal.
    pub fn send_text(&mut self, text: &str) -> Result<(), AdapterError> {
        self.ensure_attached()?;
        self.scrollback.push_str(text);
        Ok(())
    }

    /// Append output produced by the terminal runtime.
    pub fn feed_output(&mut self, bytes: &[u8]) -> Result<(), AdapterError> {
        self.ensure_attached()?;
        self.scrollback.push_str(&String::from_utf8_lossy(bytes));
        Ok(())
    }

    #[must_use]
    pub fn read_text(&self, mode: ReadMode) -> String {
        let text = self.scrollback.as_str();
        match mode {
            ReadMode::Scrollback => text.to_string(),
            ReadMode::Visible => tail_lines(text, self.rows),
            ReadMode::Tail(count) => tail_lines(text, count),
        }
    }

    #[must_use]
    pub fn scrollback(&self) -> &Scrollback {
        &self.scrollback
    }

    /// Record that the runtime behind this surface is gone.
    pub fn mark_lost(&mut self, reason: impl Into<String>) {
        self.runtime = Runtime::Lost(reason.into());
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.runtime == Runtime::Attached
    }

    pub(crate) fn attach(&mut self) {
        if self.runtime == Runtime::Pending {
            self.runtime = Runtime::Attached;
        }
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    fn ensure_attached(&self) -> Result<(), AdapterError> {
        match &self.runtime {
            Runtime::Attached => Ok(()),
            Runtime::Pending => Err(AdapterError::Unavailable(
                "terminal is waiting for scrollback replay".to_string(),
            )),
            Runtime::Lost(reason) => Err(AdapterError::Unavailable(reason.clone())),
        }
    }
}

impl SurfaceAdapter for TerminalSurface {
    fn capture(&self, limits: &CaptureLimits) -> Result<SurfaceCapture, AdapterError> {
        if let Runtime::Lost(reason) = &self.runtime {
            return Err(AdapterError::Unavailable(reason.clone()));
        }
        let text = self.scrollback.as_str();
        let start = tail_start(text, limits.scrollback_max_bytes);
        Ok(SurfaceCapture::Terminal(TerminalCapture {
            text: text[start..].to_string(),
            truncated: start > 0 || self.scrollback.trimmed_bytes() > 0 || self.replayed_truncated,
        }))
    }

    fn restore(&mut self, capture: &SurfaceCapture) -> Result<(), AdapterError> {
        let SurfaceCapture::Terminal(state) = capture else {
            return Err(AdapterError::KindMismatch {
                expected: SurfaceKind::Terminal.as_str(),
                actual: capture.kind().as_str(),
            });
        };
        self.scrollback.clear();
        self.scrollback.push_str(&state.text);
        self.replayed_truncated = state.truncated;
        self.runtime = Runtime::Attached;
        Ok(())
    }

    fn describe_health(&self) -> SurfaceHealth {
        SurfaceHealth {
            variant: SurfaceKind::Terminal,
            visible: self.visible,
            attached: self.is_attached(),
        }
    }
}
