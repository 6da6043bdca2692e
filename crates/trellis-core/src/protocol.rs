//! Control socket wire format.
//!
//! Requests are newline-terminated. A request whose first non-blank
//! character is `{` is a structured call, anything else is a line command.
//!
//! # Structured calls
//!
//! ```text
//! → {"id":1,"method":"workspace.list","params":{}}
//! ← {"id":1,"ok":true,"result":{...}}
//! ← {"id":1,"ok":false,"error":{"code":"not_found","message":"..."}}
//! ```
//!
//! # Line commands
//!
//! ```text
//! → new_pane --direction=right --type=browser --url=https://example.com
//! ← OK 3C2F…
//! ← .
//! ```
//!
//! A line response is one or more lines followed by a line holding a single
//! `.`; body lines starting with `.` get one extra `.` prepended.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Maximum request size in bytes (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Version of the structured call protocol.
pub const STRUCTURED_PROTOCOL_VERSION: u32 = 2;
/// Version of the line command protocol.
pub const LINE_PROTOCOL_VERSION: u32 = 1;

/// Terminator of a line response.
pub const LINE_TERMINATOR: &str = ".";

/// Structured method catalog, reported by `system.identify`.
pub const METHODS: &[&str] = &[
    "system.ping",
    "system.identify",
    "system.tree",
    "system.save",
    "window.list",
    "window.current",
    "window.create",
    "window.focus",
    "window.close",
    "workspace.list",
    "workspace.current",
    "workspace.create",
    "workspace.select",
    "workspace.close",
    "workspace.rename",
    "workspace.move",
    "pane.list",
    "pane.split",
    "pane.close",
    "pane.focus",
    "pane.resize",
    "surface.list",
    "surface.health",
    "surface.focus",
    "surface.close",
    "surface.send_text",
    "surface.read_text",
    "browser.open_split",
    "browser.navigate",
    "browser.back",
    "browser.forward",
    "browser.reload",
    "browser.url.get",
    "browser.get.title",
    "browser.tab.list",
];

/// Line command verbs with a one-line synopsis, printed by `help`.
pub const LINE_COMMANDS: &[(&str, &str)] = &[
    ("ping", "check the host is alive"),
    ("help", "list commands"),
    ("new_window", "create a window with one workspace"),
    ("list_windows", "list windows (* marks the focused one)"),
    ("current_window", "print the focused window id"),
    ("focus_window", "<window> focus a window"),
    ("close_window", "<window> close a window"),
    ("new_workspace", "create a workspace in the focused window"),
    ("list_workspaces", "list workspaces of the focused window"),
    ("current_workspace", "print the selected workspace id"),
    ("select_workspace", "<workspace> select a workspace"),
    ("close_workspace", "<workspace> close a workspace"),
    ("rename_workspace", "<workspace> <title> rename a workspace"),
    (
        "new_pane",
        "[--direction=left|right|up|down] [--type=terminal|browser] [--url=<url>] split the current pane",
    ),
    ("list_panes", "list panes of the current workspace"),
    ("focus_pane", "<pane> focus a pane"),
    ("close_pane", "<pane> close a pane"),
    ("list_surfaces", "list surfaces of the current workspace"),
    ("focus_surface", "<surface> focus a surface"),
    ("close_surface", "<surface> close a surface"),
    ("surface_health", "report surface health"),
    ("send", "<text> send text to the current terminal"),
    ("send_surface", "<surface> <text> send text to a terminal"),
    ("read_screen", "[--scrollback] [--lines N] [<surface>] read terminal text"),
    ("get_url", "[<surface>] print a browser URL"),
    ("navigate", "<surface> <url> navigate a browser"),
    ("save_session", "write the session snapshot now"),
    ("tree", "[--all] print the window hierarchy"),
];

// =============================================================================
// Structured calls
// =============================================================================

/// Structured request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Request {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Error payload of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Structured response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Value,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: Value, err: &Error) -> Self {
        Self::failure_code(id, err.code(), err.to_string())
    }

    #[must_use]
    pub fn failure_code(id: Value, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

// =============================================================================
// Line commands
// =============================================================================

/// Flags that take a value when written as `--flag value`.
const VALUED_FLAGS: &[&str] = &["direction", "type", "url", "lines", "workspace", "surface", "window"];

/// Verbs that end in free text, with the number of handle arguments in
/// front of the text. The text is never tokenized or scanned for flags.
const TEXT_VERBS: &[(&str, usize)] = &[("send", 0), ("send_surface", 1)];

/// A parsed line command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineCommand {
    pub verb: String,
    pub positionals: Vec<String>,
    /// `--name=value` or `--name value`; bare switches map to `""`.
    pub flags: BTreeMap<String, String>,
    /// Trailing text of `send` and `send_surface`, as written on the line.
    /// Escapes are still encoded; see [`unescape`].
    pub text: Option<String>,
}

impl LineCommand {
    /// Parse one request line.
    pub fn parse(line: &str) -> Result<Self, Error> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, mut rest) =
            next_token(line)?.ok_or_else(|| Error::Protocol("empty command".to_string()))?;
        let mut cmd = Self {
            verb,
            ..Self::default()
        };

        if let Some(&(_, handles)) = TEXT_VERBS.iter().find(|(verb, _)| *verb == cmd.verb) {
            for _ in 0..handles {
                let Some((token, tail)) = next_token(rest)? else {
                    break;
                };
                cmd.positionals.push(token);
                rest = tail;
            }
            cmd.text = text_argument(rest);
            return Ok(cmd);
        }

        let mut iter = tokenize(rest)?.into_iter().peekable();
        while let Some(token) = iter.next() {
            let Some(flag) = token.strip_prefix("--").filter(|f| !f.is_empty()) else {
                cmd.positionals.push(token);
                continue;
            };
            if let Some((name, value)) = flag.split_once('=') {
                cmd.flags.insert(name.to_string(), value.to_string());
            } else if VALUED_FLAGS.contains(&flag)
                && iter.peek().is_some_and(|next| !next.starts_with("--"))
            {
                let value = iter.next().unwrap_or_default();
                cmd.flags.insert(flag.to_string(), value);
            } else {
                cmd.flags.insert(flag.to_string(), String::new());
            }
        }
        Ok(cmd)
    }

    #[must_use]
    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains_key(name)
    }

    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.positionals.get(index).map(String::as_str)
    }

    /// Positionals from `index` on, joined by single spaces.
    #[must_use]
    pub fn rest(&self, index: usize) -> Option<String> {
        if index >= self.positionals.len() {
            return None;
        }
        Some(self.positionals[index..].join(" "))
    }

    /// Like [`LineCommand::arg`] but fails with a usage error.
    pub fn require(&self, index: usize, what: &str) -> Result<&str, Error> {
        self.arg(index).ok_or_else(|| {
            Error::Protocol(format!("usage: {} <{what}>", self.verb))
        })
    }
}

/// Read one token off the front of `input`. Double-quoted segments keep
/// their spaces; backslash escapes are left for [`unescape`]. Returns the
/// token and the unread tail, or `None` when only whitespace is left.
fn next_token(input: &str) -> Result<Option<(String, &str)>, Error> {
    let input = input.trim_start();
    if input.is_empty() {
        return Ok(None);
    }
    let mut token = String::new();
    let mut quoted = false;
    let mut chars = input.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => quoted = !quoted,
            '\\' => {
                token.push('\\');
                if let Some((_, next)) = chars.next() {
                    token.push(next);
                }
            }
            c if c.is_whitespace() && !quoted => return Ok(Some((token, &input[idx..]))),
            c => token.push(c),
        }
    }
    if quoted {
        return Err(Error::Protocol("unterminated quote".to_string()));
    }
    Ok(Some((token, "")))
}

fn tokenize(line: &str) -> Result<Vec<String>, Error> {
    let mut tokens = Vec::new();
    let mut rest = line;
    while let Some((token, tail)) = next_token(rest)? {
        tokens.push(token);
        rest = tail;
    }
    Ok(tokens)
}

/// Free text after the separating blanks. Inner spacing, `--` words and
/// stray quotes are kept as written.
fn text_argument(rest: &str) -> Option<String> {
    let text = rest.trim_start_matches([' ', '\t']);
    if text.is_empty() {
        return None;
    }
    Some(strip_enclosing_quotes(text).to_string())
}

/// Drop one pair of double quotes that wraps the whole text.
fn strip_enclosing_quotes(text: &str) -> &str {
    let Some(inner) = text.strip_prefix('"') else {
        return text;
    };
    let mut escaped = false;
    for (idx, c) in inner.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' if idx + 1 == inner.len() => return &inner[..idx],
            '"' => return text,
            _ => {}
        }
    }
    text
}

/// Expand `\n`, `\r`, `\t`, `\\` and `\"`. Unknown escapes are kept as
/// written.
#[must_use]
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Structured(Request),
    Line(LineCommand),
}

/// Classify and parse one request line.
pub fn parse_frame(line: &str) -> Result<Frame, Error> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('{') {
        let request: Request = serde_json::from_str(trimmed)
            .map_err(|e| Error::Protocol(format!("invalid request: {e}")))?;
        if request.method.trim().is_empty() {
            return Err(Error::Protocol("missing method".to_string()));
        }
        return Ok(Frame::Structured(request));
    }
    LineCommand::parse(trimmed).map(Frame::Line)
}

/// Encode a line response body for the wire.
#[must_use]
pub fn encode_line_response(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 4);
    for line in body.trim_end_matches('\n').split('\n') {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(LINE_TERMINATOR);
    out.push('\n');
    out
}

/// Decode the body lines of a line response (terminator excluded).
#[must_use]
pub fn decode_line_response(lines: &[String]) -> String {
    lines
        .iter()
        .map(|line| line.strip_prefix('.').unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}
