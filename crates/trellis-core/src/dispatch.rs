//! Request dispatch: maps structured methods and line verbs onto session
//! operations.
//!
//! Everything here is synchronous. The server runs each request on the
//! blocking pool; the session lock is taken once per request, so a request
//! observes (or produces) one consistent tree.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::identity::{EntityKind, PaneId, SurfaceId, WindowId, WorkspaceId, positional_ref};
use crate::layout::Direction;
use crate::persistence::{PersistenceEngine, SnapshotTrigger};
use crate::protocol::{
    self, Frame, LINE_COMMANDS, LINE_PROTOCOL_VERSION, LineCommand, METHODS, Request, Response,
    STRUCTURED_PROTOCOL_VERSION,
};
use crate::query::{self, Scope};
use crate::server::SocketMode;
use crate::session::{PaneCreated, Session, SessionTree};
use crate::surface::{ReadMode, SurfaceKind, SurfaceSpec};

/// Static facts about the serving endpoint, reported by `system.identify`.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub socket_path: PathBuf,
    pub socket_mode: SocketMode,
}

/// Routes decoded frames to the session.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    session: Arc<Session>,
    persistence: Option<Arc<PersistenceEngine>>,
    info: ServerInfo,
    mutations: Arc<Notify>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(session: Arc<Session>, info: ServerInfo) -> Self {
        Self {
            session,
            persistence: None,
            info,
            mutations: Arc::new(Notify::new()),
        }
    }

    /// Enable `system.save` / `save_session`.
    #[must_use]
    pub fn with_persistence(mut self, engine: Arc<PersistenceEngine>) -> Self {
        self.persistence = Some(engine);
        self
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Notified after every request that changed the tree.
    #[must_use]
    pub fn mutation_notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.mutations)
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// Handle one raw request line and return the encoded reply.
    pub fn handle_raw(&self, raw: &str) -> String {
        match protocol::parse_frame(raw) {
            Ok(frame) => self.dispatch(frame),
            Err(err) => Self::reject_raw(raw, &err),
        }
    }

    /// Encoded reply for a request that could not be decoded.
    #[must_use]
    pub fn reject_raw(raw: &str, err: &Error) -> String {
        if raw.trim_start().starts_with('{') {
            let id = serde_json::from_str::<Value>(raw.trim())
                .ok()
                .and_then(|v| v.get("id").cloned())
                .unwrap_or(Value::Null);
            encode_json(&Response::failure(id, err))
        } else {
            protocol::encode_line_response(&format!("ERROR: {err}"))
        }
    }

    /// Encoded reply for `frame` when it did not finish in time.
    #[must_use]
    pub fn timeout_reply(frame: &Frame, timeout_ms: u64) -> String {
        let err = Error::Timeout(timeout_ms);
        match frame {
            Frame::Structured(req) => encode_json(&Response::failure(req.id.clone(), &err)),
            Frame::Line(_) => protocol::encode_line_response(&format!("ERROR: {err}")),
        }
    }

    /// Execute a decoded frame and return the encoded reply.
    pub fn dispatch(&self, frame: Frame) -> String {
        let before = self.session.revision();
        let reply = match &frame {
            Frame::Structured(req) => encode_json(&self.call(req)),
            Frame::Line(cmd) => protocol::encode_line_response(&self.run_line(cmd)),
        };
        if self.session.revision() != before {
            self.mutations.notify_one();
        }
        reply
    }

    // =========================================================================
    // Structured calls
    // =========================================================================

    /// Execute a structured call.
    pub fn call(&self, req: &Request) -> Response {
        let params = Params(&req.params);
        match self.call_method(&req.method, &params) {
            Ok(result) => Response::success(req.id.clone(), result),
            Err(err) => {
                tracing::debug!(method = %req.method, code = err.code(), error = %err, "call failed");
                Response::failure(req.id.clone(), &err)
            }
        }
    }

    fn call_method(&self, method: &str, p: &Params<'_>) -> Result<Value> {
        tracing::trace!(method, "structured call");
        match method {
            "system.ping" => Ok(json!({ "pong": true })),
            "system.identify" => Ok(self.identify()),
            "system.tree" => self.system_tree(p),
            "system.save" => self.save(SnapshotTrigger::Manual),

            "window.list" => Ok(window_list(&self.session.read())),
            "window.current" => {
                let tree = self.session.read();
                let id = tree
                    .focused_window_id()
                    .ok_or_else(|| Error::not_found(EntityKind::Window, "focused window"))?;
                Ok(json!({ "window_id": id }))
            }
            "window.create" => self.session.mutate(|tree| {
                let window_id = tree.create_window();
                let created = tree.create_workspace(&window_id, &SurfaceSpec::Terminal, None)?;
                to_value(&created)
            }),
            "window.focus" => self.session.mutate(|tree| {
                let id = tree.resolve_window(p.require("window")?)?;
                tree.focus_window(&id)?;
                Ok(json!({ "window_id": id }))
            }),
            "window.close" => self.session.mutate(|tree| {
                let id = tree.resolve_window(p.require("window")?)?;
                tree.close_window(&id)?;
                Ok(json!({ "window_id": id }))
            }),

            "workspace.list" => {
                let tree = self.session.read();
                let window = window_param(&tree, p)?;
                workspace_list(&tree, &window)
            }
            "workspace.current" => {
                let tree = self.session.read();
                let window = tree
                    .focused_window()
                    .ok_or_else(|| Error::not_found(EntityKind::Window, "focused window"))?;
                let ws = window
                    .selected_workspace()
                    .ok_or_else(|| Error::not_found(EntityKind::Workspace, "current workspace"))?;
                Ok(json!({
                    "window_id": window.id(),
                    "workspace_id": ws.id(),
                    "title": ws.title(),
                }))
            }
            "workspace.create" => self.session.mutate(|tree| {
                let window = window_param(tree, p)?;
                let spec = surface_spec(p)?;
                let created = tree.create_workspace(&window, &spec, p.str("title"))?;
                to_value(&created)
            }),
            "workspace.select" => self.session.mutate(|tree| {
                let ws = scoped_workspace(tree, p, p.str("window"))?;
                let window = owner_window(tree, &ws)?;
                tree.select_workspace(&window, &ws)?;
                Ok(json!({ "window_id": window, "workspace_id": ws }))
            }),
            "workspace.close" => self.session.mutate(|tree| {
                let ws = scoped_workspace(tree, p, p.str("window"))?;
                tree.close_workspace(&ws)?;
                Ok(json!({ "workspace_id": ws }))
            }),
            "workspace.rename" => self.session.mutate(|tree| {
                let ws = match p.str("workspace") {
                    Some(_) => scoped_workspace(tree, p, p.str("window"))?,
                    None => current_workspace_id(tree)?,
                };
                let title = p.require("title")?;
                tree.rename_workspace(&ws, title)?;
                Ok(json!({ "workspace_id": ws, "title": title.trim() }))
            }),
            "workspace.move" => self.session.mutate(|tree| {
                // `window` names the destination here, so aliases use `from_window`.
                let ws = scoped_workspace(tree, p, p.str("from_window"))?;
                let window = tree.resolve_window(p.require("window")?)?;
                tree.move_workspace(&ws, &window)?;
                Ok(json!({ "workspace_id": ws, "window_id": window }))
            }),

            "pane.list" => {
                let tree = self.session.read();
                let ws = workspace_param(&tree, p)?;
                pane_list(&tree, &ws)
            }
            "pane.split" => self.session.mutate(|tree| {
                let spec = surface_spec(p)?;
                to_value(&split(tree, p, &spec)?)
            }),
            "pane.close" => self.session.mutate(|tree| {
                let pane = pane_param(tree, p)?;
                let closed = tree.close_pane(&pane)?;
                let mut out = to_value(&closed)?;
                out["pane_id"] = json!(pane);
                Ok(out)
            }),
            "pane.focus" => self.session.mutate(|tree| {
                let pane = pane_param(tree, p)?;
                tree.focus_pane(&pane)?;
                Ok(json!({ "pane_id": pane }))
            }),
            "pane.resize" => self.session.mutate(|tree| {
                let pane = pane_param(tree, p)?;
                let ratio = p
                    .f64("ratio")?
                    .ok_or_else(|| Error::Protocol("missing param 'ratio'".to_string()))?;
                let applied = tree.resize_split(&pane, ratio)?;
                Ok(json!({ "pane_id": pane, "ratio": applied }))
            }),

            "surface.list" => {
                let tree = self.session.read();
                let ws = workspace_param(&tree, p)?;
                surface_list(&tree, &ws)
            }
            "surface.health" => {
                let tree = self.session.read();
                let scope = p
                    .str("workspace")
                    .map(|raw| tree.resolve_workspace(raw, None))
                    .transpose()?;
                Ok(json!({ "surfaces": tree.surface_health(scope.as_ref()) }))
            }
            "surface.focus" => self.session.mutate(|tree| {
                let surface = surface_param(tree, p)?;
                tree.focus_surface(&surface)?;
                Ok(json!({ "surface_id": surface }))
            }),
            "surface.close" => self.session.mutate(|tree| {
                let surface = surface_param(tree, p)?;
                let closed = tree.close_surface(&surface)?;
                let mut out = to_value(&closed)?;
                out["surface_id"] = json!(surface);
                Ok(out)
            }),
            "surface.send_text" => self.session.mutate(|tree| {
                let surface = surface_param(tree, p)?;
                let text = p.require_raw("text")?;
                tree.send_text(&surface, text)?;
                Ok(json!({ "surface_id": surface, "bytes": text.len() }))
            }),
            "surface.read_text" => {
                let tree = self.session.read();
                let surface = surface_param(&tree, p)?;
                let mode = read_mode(p.bool("scrollback"), p.u64("lines")?);
                let text = tree.read_text(&surface, mode)?;
                Ok(json!({ "surface_id": surface, "text": text }))
            }

            "browser.open_split" => self.session.mutate(|tree| {
                let spec = SurfaceSpec::Browser {
                    url: p.str("url").map(str::to_string),
                };
                let created = split(tree, p, &spec)?;
                let mut out = browser_state(tree, &created.surface_id)?;
                out["pane_id"] = json!(created.pane_id);
                out["workspace_id"] = json!(created.workspace_id);
                Ok(out)
            }),
            "browser.navigate" => self.session.mutate(|tree| {
                let surface = browser_param(tree, p)?;
                tree.navigate(&surface, p.require("url")?)?;
                browser_state(tree, &surface)
            }),
            "browser.back" => self.session.mutate(|tree| {
                let surface = browser_param(tree, p)?;
                tree.back(&surface)?;
                browser_state(tree, &surface)
            }),
            "browser.forward" => self.session.mutate(|tree| {
                let surface = browser_param(tree, p)?;
                tree.forward(&surface)?;
                browser_state(tree, &surface)
            }),
            "browser.reload" => self.session.mutate(|tree| {
                let surface = browser_param(tree, p)?;
                tree.reload(&surface)?;
                browser_state(tree, &surface)
            }),
            "browser.url.get" | "browser.get.title" => {
                let tree = self.session.read();
                let surface = browser_param(&tree, p)?;
                browser_state(&tree, &surface)
            }
            "browser.tab.list" => {
                let tree = self.session.read();
                let ws = workspace_param(&tree, p)?;
                browser_tabs(&tree, &ws)
            }

            other => Err(Error::Protocol(format!("unknown method '{other}'"))),
        }
    }

    fn identify(&self) -> Value {
        json!({
            "name": "trellis",
            "version": crate::VERSION,
            "protocol": {
                "structured": STRUCTURED_PROTOCOL_VERSION,
                "line": LINE_PROTOCOL_VERSION,
            },
            "socket_path": self.info.socket_path.display().to_string(),
            "socket_mode": self.info.socket_mode.as_str(),
            "persistence": self.persistence.is_some(),
            "methods": METHODS,
        })
    }

    fn system_tree(&self, p: &Params<'_>) -> Result<Value> {
        let tree = self.session.read();
        let scope = if let Some(raw) = p.str("workspace") {
            Scope::Workspace(tree.resolve_workspace(raw, None)?)
        } else if p.bool("all") {
            Scope::All
        } else {
            Scope::Focused
        };
        let caller = p.str("caller_surface").map(SurfaceId::new);
        let view = query::describe(&tree, &scope, caller.as_ref())?;
        to_value(&view)
    }

    fn save(&self, trigger: SnapshotTrigger) -> Result<Value> {
        let engine = self
            .persistence
            .as_ref()
            .ok_or_else(|| Error::invalid("session persistence is disabled"))?;
        let report = engine.save(&self.session, trigger)?;
        to_value(&report)
    }

    // =========================================================================
    // Line commands
    // =========================================================================

    /// Execute a line command and return the response body.
    pub fn run_line(&self, cmd: &LineCommand) -> String {
        match self.line_verb(cmd) {
            Ok(body) => body,
            Err(LineError::Unknown) => format!("ERROR: Unknown command '{}'", cmd.verb),
            Err(LineError::Failed(err)) => {
                tracing::debug!(verb = %cmd.verb, code = err.code(), error = %err, "line command failed");
                format!("ERROR: {err}")
            }
        }
    }

    fn line_verb(&self, cmd: &LineCommand) -> std::result::Result<String, LineError> {
        let body = match cmd.verb.as_str() {
            "ping" => "PONG".to_string(),
            "help" => help_text(),

            "new_window" => {
                let created = self.session.mutate(|tree| {
                    let window_id = tree.create_window();
                    tree.create_workspace(&window_id, &SurfaceSpec::Terminal, None)
                })?;
                format!("OK {}", created.window_id)
            }
            "list_windows" => {
                let tree = self.session.read();
                if tree.windows().is_empty() {
                    "No windows".to_string()
                } else {
                    tree.windows()
                        .iter()
                        .enumerate()
                        .map(|(idx, w)| {
                            let mark = if Some(w.id()) == tree.focused_window_id() { "*" } else { " " };
                            format!("{mark} {idx} {} workspaces={}", w.id(), w.workspaces().len())
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            "current_window" => {
                let tree = self.session.read();
                tree.focused_window_id()
                    .map(ToString::to_string)
                    .ok_or_else(|| Error::not_found(EntityKind::Window, "focused window"))?
            }
            "focus_window" => {
                self.session.mutate(|tree| {
                    let id = tree.resolve_window(cmd.require(0, "window")?)?;
                    tree.focus_window(&id)
                })?;
                "OK".to_string()
            }
            "close_window" => {
                self.session.mutate(|tree| {
                    let id = tree.resolve_window(cmd.require(0, "window")?)?;
                    tree.close_window(&id)
                })?;
                "OK".to_string()
            }

            "new_workspace" => {
                let created = self.session.mutate(|tree| {
                    let window = focused_window_id(tree)?;
                    let spec = SurfaceSpec::from_params(cmd.flag("type"), cmd.flag("url"))
                        .map_err(|e| Error::invalid(e.to_string()))?;
                    tree.create_workspace(&window, &spec, cmd.rest(0).as_deref())
                })?;
                format!("OK {}", created.workspace_id)
            }
            "list_workspaces" => {
                let tree = self.session.read();
                let window = tree
                    .focused_window()
                    .ok_or_else(|| Error::not_found(EntityKind::Window, "focused window"))?;
                if window.workspaces().is_empty() {
                    "No workspaces".to_string()
                } else {
                    window
                        .workspaces()
                        .iter()
                        .enumerate()
                        .map(|(idx, ws)| {
                            let mark = if window.selected_workspace_id() == Some(ws.id()) {
                                "*"
                            } else {
                                " "
                            };
                            format!("{mark} {idx} {} {}", ws.id(), ws.title())
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            "current_workspace" => {
                let tree = self.session.read();
                current_workspace_id(&tree)?.to_string()
            }
            "select_workspace" => {
                self.session.mutate(|tree| {
                    let ws = tree.resolve_workspace(cmd.require(0, "workspace")?, None)?;
                    let window = owner_window(tree, &ws)?;
                    tree.select_workspace(&window, &ws)
                })?;
                "OK".to_string()
            }
            "close_workspace" => {
                self.session.mutate(|tree| {
                    let ws = tree.resolve_workspace(cmd.require(0, "workspace")?, None)?;
                    tree.close_workspace(&ws)
                })?;
                "OK".to_string()
            }
            "rename_workspace" => {
                self.session.mutate(|tree| {
                    let ws = tree.resolve_workspace(cmd.require(0, "workspace")?, None)?;
                    let title = cmd.rest(1).ok_or_else(|| {
                        Error::Protocol("usage: rename_workspace <workspace> <title>".to_string())
                    })?;
                    tree.rename_workspace(&ws, &title)
                })?;
                "OK".to_string()
            }

            "new_pane" => {
                let created = self.session.mutate(|tree| {
                    let pane = current_pane_id(tree)?;
                    let direction = parse_direction(cmd.flag("direction"))?;
                    let spec = SurfaceSpec::from_params(cmd.flag("type"), cmd.flag("url"))
                        .map_err(|e| Error::invalid(e.to_string()))?;
                    tree.split_pane(&pane, direction, &spec, None)
                })?;
                format!("OK {}", created.surface_id)
            }
            "list_panes" => {
                let tree = self.session.read();
                let ws = current_workspace_id(&tree)?;
                let (_, workspace) = tree
                    .workspace(&ws)
                    .ok_or_else(|| Error::not_found(EntityKind::Workspace, ws.as_str()))?;
                workspace
                    .layout()
                    .surfaces()
                    .iter()
                    .enumerate()
                    .map(|(idx, (pane, surface))| {
                        let mark = if pane == workspace.selected_pane() { "*" } else { " " };
                        format!("{mark} {idx} {pane} [{}] {}", surface.kind(), surface.id())
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            "focus_pane" => {
                self.session.mutate(|tree| {
                    let pane = tree.resolve_pane(cmd.require(0, "pane")?, None)?;
                    tree.focus_pane(&pane)
                })?;
                "OK".to_string()
            }
            "close_pane" => {
                self.session.mutate(|tree| {
                    let pane = tree.resolve_pane(cmd.require(0, "pane")?, None)?;
                    tree.close_pane(&pane)
                })?;
                "OK".to_string()
            }

            "list_surfaces" => {
                let tree = self.session.read();
                let ws = current_workspace_id(&tree)?;
                let (_, workspace) = tree
                    .workspace(&ws)
                    .ok_or_else(|| Error::not_found(EntityKind::Workspace, ws.as_str()))?;
                workspace
                    .layout()
                    .surfaces()
                    .iter()
                    .enumerate()
                    .map(|(idx, (pane, surface))| {
                        let mark = if pane == workspace.selected_pane() { "*" } else { " " };
                        let mut line = format!("{mark} {idx} {} [{}]", surface.id(), surface.kind());
                        if let Some(url) = surface.url() {
                            line.push(' ');
                            line.push_str(url);
                        }
                        line
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            "focus_surface" => {
                self.session.mutate(|tree| {
                    let surface = tree.resolve_surface(cmd.require(0, "surface")?, None)?;
                    tree.focus_surface(&surface)
                })?;
                "OK".to_string()
            }
            "close_surface" => {
                self.session.mutate(|tree| {
                    let surface = tree.resolve_surface(cmd.require(0, "surface")?, None)?;
                    tree.close_surface(&surface)
                })?;
                "OK".to_string()
            }
            "surface_health" => {
                let tree = self.session.read();
                let rows = tree.surface_health(None);
                if rows.is_empty() {
                    "No surfaces".to_string()
                } else {
                    rows.iter()
                        .map(|row| {
                            format!(
                                "{} {} type={} visible={} attached={} in_window={}",
                                row.index,
                                row.surface_id,
                                row.variant,
                                row.visible,
                                row.attached,
                                row.in_window
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }

            "send" => {
                let text = cmd
                    .text
                    .as_deref()
                    .ok_or_else(|| Error::Protocol("usage: send <text>".to_string()))?;
                self.session.mutate(|tree| {
                    let surface = current_surface_id(tree)?;
                    tree.send_text(&surface, &protocol::unescape(text))
                })?;
                "OK".to_string()
            }
            "send_surface" => {
                let text = cmd.text.as_deref().ok_or_else(|| {
                    Error::Protocol("usage: send_surface <surface> <text>".to_string())
                })?;
                self.session.mutate(|tree| {
                    let surface = tree.resolve_surface(cmd.require(0, "surface")?, None)?;
                    tree.send_text(&surface, &protocol::unescape(text))
                })?;
                "OK".to_string()
            }
            "read_screen" => {
                let lines = match cmd.flag("lines") {
                    Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                        Error::Protocol(format!("--lines expects a number, got '{raw}'"))
                    })?),
                    None => None,
                };
                let mode = read_mode(cmd.has_flag("scrollback"), lines);
                let tree = self.session.read();
                let surface = match cmd.arg(0) {
                    Some(raw) => tree.resolve_surface(raw, None)?,
                    None => current_surface_id(&tree)?,
                };
                tree.read_text(&surface, mode)?
            }

            "get_url" => {
                let tree = self.session.read();
                let surface = match cmd.arg(0) {
                    Some(raw) => tree.resolve_surface(raw, None)?,
                    None => current_surface_id(&tree)?,
                };
                tree.surface(&surface)
                    .and_then(|s| s.url())
                    .map(str::to_string)
                    .ok_or_else(|| Error::invalid(format!("surface {surface} is not a browser")))?
            }
            "navigate" => {
                let url = cmd.require(1, "url")?.to_string();
                self.session.mutate(|tree| {
                    let surface = tree.resolve_surface(cmd.require(0, "surface")?, None)?;
                    tree.navigate(&surface, &url)
                })?;
                "OK".to_string()
            }

            "save_session" => {
                let engine = self
                    .persistence
                    .as_ref()
                    .ok_or_else(|| Error::invalid("session persistence is disabled"))?;
                let report = engine
                    .save(&self.session, SnapshotTrigger::Manual)
                    .map_err(Error::from)?;
                format!("OK {} surfaces={}", report.path.display(), report.surfaces)
            }
            "tree" => {
                let tree = self.session.read();
                let scope = match cmd.flag("workspace") {
                    Some(raw) => Scope::Workspace(tree.resolve_workspace(raw, None)?),
                    None if cmd.has_flag("all") => Scope::All,
                    None => Scope::Focused,
                };
                let caller = cmd.flag("surface").map(SurfaceId::new);
                let view = query::describe(&tree, &scope, caller.as_ref())?;
                query::render_text(&view)
            }

            _ => return Err(LineError::Unknown),
        };
        Ok(body)
    }
}

enum LineError {
    Unknown,
    Failed(Error),
}

impl From<Error> for LineError {
    fn from(err: Error) -> Self {
        Self::Failed(err)
    }
}

fn encode_json(resp: &Response) -> String {
    match serde_json::to_string(resp) {
        Ok(mut line) => {
            line.push('\n');
            line
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to encode response");
            "{\"id\":null,\"ok\":false,\"error\":{\"code\":\"internal\",\"message\":\"response encoding failed\"}}\n".to_string()
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn help_text() -> String {
    let width = LINE_COMMANDS
        .iter()
        .map(|(verb, _)| verb.len())
        .max()
        .unwrap_or(0);
    LINE_COMMANDS
        .iter()
        .map(|(verb, synopsis)| format!("{verb:<width$}  {synopsis}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// =============================================================================
// Parameters
// =============================================================================

/// Typed access to a structured call's params object.
struct Params<'a>(&'a Value);

impl Params<'_> {
    /// Non-blank string param, trimmed.
    fn str(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim()),
            _ => None,
        }
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.str(key)
            .ok_or_else(|| Error::Protocol(format!("missing param '{key}'")))
    }

    /// String param taken verbatim (whitespace is significant).
    fn require_raw(&self, key: &str) -> Result<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol(format!("missing param '{key}'")))
    }

    fn bool(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    fn u64(&self, key: &str) -> Result<Option<u64>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| Error::Protocol(format!("param '{key}' must be a non-negative integer"))),
        }
    }

    fn f64(&self, key: &str) -> Result<Option<f64>> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| Error::Protocol(format!("param '{key}' must be a number"))),
        }
    }
}

fn read_mode(scrollback: bool, lines: Option<u64>) -> ReadMode {
    match lines {
        Some(n) => ReadMode::Tail(usize::try_from(n).unwrap_or(usize::MAX)),
        None if scrollback => ReadMode::Scrollback,
        None => ReadMode::Visible,
    }
}

fn parse_direction(raw: Option<&str>) -> Result<Direction> {
    match raw {
        None => Ok(Direction::default()),
        Some(raw) => Direction::parse(raw).ok_or_else(|| {
            Error::Protocol(format!(
                "invalid direction '{raw}' (expected left, right, up or down)"
            ))
        }),
    }
}

fn surface_spec(p: &Params<'_>) -> Result<SurfaceSpec> {
    SurfaceSpec::from_params(p.str("type"), p.str("url"))
        .map_err(|e| Error::Protocol(e.to_string()))
}

// =============================================================================
// Handle helpers
// =============================================================================

fn focused_window_id(tree: &SessionTree) -> Result<WindowId> {
    tree.focused_window_id()
        .cloned()
        .ok_or_else(|| Error::not_found(EntityKind::Window, "focused window"))
}

fn current_workspace_id(tree: &SessionTree) -> Result<WorkspaceId> {
    tree.current_workspace()
        .map(|ws| ws.id().clone())
        .ok_or_else(|| Error::not_found(EntityKind::Workspace, "current workspace"))
}

fn current_pane_id(tree: &SessionTree) -> Result<PaneId> {
    tree.current_pane()
        .cloned()
        .ok_or_else(|| Error::not_found(EntityKind::Pane, "current pane"))
}

fn current_surface_id(tree: &SessionTree) -> Result<SurfaceId> {
    tree.current_surface()
        .map(|s| s.id().clone())
        .ok_or_else(|| Error::not_found(EntityKind::Surface, "current surface"))
}

fn owner_window(tree: &SessionTree, ws: &WorkspaceId) -> Result<WindowId> {
    tree.workspace(ws)
        .map(|(window, _)| window.id().clone())
        .ok_or_else(|| Error::not_found(EntityKind::Workspace, ws.as_str()))
}

fn window_param(tree: &SessionTree, p: &Params<'_>) -> Result<WindowId> {
    match p.str("window") {
        Some(raw) => tree.resolve_window(raw),
        None => focused_window_id(tree),
    }
}

fn workspace_param(tree: &SessionTree, p: &Params<'_>) -> Result<WorkspaceId> {
    match p.str("workspace") {
        Some(raw) => tree.resolve_workspace(raw, None),
        None => current_workspace_id(tree),
    }
}

/// Required `workspace` handle; positional aliases count within `window`
/// when given, else within the focused window.
fn scoped_workspace(
    tree: &SessionTree,
    p: &Params<'_>,
    window: Option<&str>,
) -> Result<WorkspaceId> {
    let scope = window.map(|raw| tree.resolve_window(raw)).transpose()?;
    tree.resolve_workspace(p.require("workspace")?, scope.as_ref())
}

/// Optional `workspace` param used as the alias scope for pane and surface
/// handles.
fn alias_scope(tree: &SessionTree, p: &Params<'_>) -> Result<Option<WorkspaceId>> {
    p.str("workspace")
        .map(|raw| tree.resolve_workspace(raw, None))
        .transpose()
}

fn pane_param(tree: &SessionTree, p: &Params<'_>) -> Result<PaneId> {
    let scope = alias_scope(tree, p)?;
    match p.str("pane") {
        Some(raw) => tree.resolve_pane(raw, scope.as_ref()),
        None => match &scope {
            Some(ws) => tree
                .workspace(ws)
                .map(|(_, w)| w.selected_pane().clone())
                .ok_or_else(|| Error::not_found(EntityKind::Workspace, ws.as_str())),
            None => current_pane_id(tree),
        },
    }
}

fn surface_param(tree: &SessionTree, p: &Params<'_>) -> Result<SurfaceId> {
    let scope = alias_scope(tree, p)?;
    match p.str("surface") {
        Some(raw) => tree.resolve_surface(raw, scope.as_ref()),
        None => match &scope {
            Some(ws) => tree
                .workspace(ws)
                .and_then(|(_, w)| w.selected_surface())
                .map(|s| s.id().clone())
                .ok_or_else(|| Error::not_found(EntityKind::Surface, "selected surface")),
            None => current_surface_id(tree),
        },
    }
}

fn browser_param(tree: &SessionTree, p: &Params<'_>) -> Result<SurfaceId> {
    let surface = surface_param(tree, p)?;
    match tree.surface(&surface).map(|s| s.kind()) {
        Some(SurfaceKind::Browser) => Ok(surface),
        Some(SurfaceKind::Terminal) => Err(Error::invalid(format!(
            "surface {surface} is not a browser"
        ))),
        None => Err(Error::not_found(EntityKind::Surface, surface.as_str())),
    }
}

fn split(tree: &mut SessionTree, p: &Params<'_>, spec: &SurfaceSpec) -> Result<PaneCreated> {
    let pane = pane_param(tree, p)?;
    let direction = parse_direction(p.str("direction"))?;
    let ratio = p.f64("ratio")?;
    tree.split_pane(&pane, direction, spec, ratio)
}

// =============================================================================
// Listings
// =============================================================================

fn window_list(tree: &SessionTree) -> Value {
    let windows: Vec<Value> = tree
        .windows()
        .iter()
        .enumerate()
        .map(|(index, w)| {
            json!({
                "id": w.id(),
                "ref": positional_ref(EntityKind::Window, index),
                "index": index,
                "focused": Some(w.id()) == tree.focused_window_id(),
                "workspace_count": w.workspaces().len(),
                "selected_workspace_id": w.selected_workspace_id(),
            })
        })
        .collect();
    json!({ "windows": windows })
}

fn workspace_list(tree: &SessionTree, window: &WindowId) -> Result<Value> {
    let w = tree
        .window(window)
        .ok_or_else(|| Error::not_found(EntityKind::Window, window.as_str()))?;
    let workspaces: Vec<Value> = w
        .workspaces()
        .iter()
        .enumerate()
        .map(|(index, ws)| {
            json!({
                "id": ws.id(),
                "ref": positional_ref(EntityKind::Workspace, index),
                "index": index,
                "title": ws.title(),
                "selected": w.selected_workspace_id() == Some(ws.id()),
                "pane_count": ws.panes().len(),
            })
        })
        .collect();
    Ok(json!({ "window_id": window, "workspaces": workspaces }))
}

fn pane_list(tree: &SessionTree, ws: &WorkspaceId) -> Result<Value> {
    let (_, workspace) = tree
        .workspace(ws)
        .ok_or_else(|| Error::not_found(EntityKind::Workspace, ws.as_str()))?;
    let panes: Vec<Value> = workspace
        .layout()
        .surfaces()
        .into_iter()
        .enumerate()
        .map(|(index, (pane, surface))| {
            json!({
                "id": pane,
                "ref": positional_ref(EntityKind::Pane, index),
                "index": index,
                "selected": &pane == workspace.selected_pane(),
                "surface_id": surface.id(),
                "type": surface.kind(),
            })
        })
        .collect();
    Ok(json!({ "workspace_id": ws, "panes": panes }))
}

fn surface_list(tree: &SessionTree, ws: &WorkspaceId) -> Result<Value> {
    let (_, workspace) = tree
        .workspace(ws)
        .ok_or_else(|| Error::not_found(EntityKind::Workspace, ws.as_str()))?;
    let surfaces: Vec<Value> = workspace
        .layout()
        .surfaces()
        .into_iter()
        .enumerate()
        .map(|(index, (pane, surface))| {
            json!({
                "id": surface.id(),
                "ref": positional_ref(EntityKind::Surface, index),
                "index": index,
                "pane_id": pane,
                "type": surface.kind(),
                "title": surface.title(),
                "url": surface.url(),
                "selected": &pane == workspace.selected_pane(),
            })
        })
        .collect();
    Ok(json!({ "workspace_id": ws, "surfaces": surfaces }))
}

fn browser_tabs(tree: &SessionTree, ws: &WorkspaceId) -> Result<Value> {
    let (_, workspace) = tree
        .workspace(ws)
        .ok_or_else(|| Error::not_found(EntityKind::Workspace, ws.as_str()))?;
    let tabs: Vec<Value> = workspace
        .layout()
        .surfaces()
        .into_iter()
        .enumerate()
        .filter(|(_, (_, surface))| surface.kind() == SurfaceKind::Browser)
        .map(|(index, (pane, surface))| {
            json!({
                "surface_id": surface.id(),
                "ref": positional_ref(EntityKind::Surface, index),
                "pane_id": pane,
                "url": surface.url(),
                "title": surface.title(),
                "selected": &pane == workspace.selected_pane(),
            })
        })
        .collect();
    Ok(json!({ "workspace_id": ws, "tabs": tabs }))
}

fn browser_state(tree: &SessionTree, surface: &SurfaceId) -> Result<Value> {
    let target = tree
        .surface(surface)
        .ok_or_else(|| Error::not_found(EntityKind::Surface, surface.as_str()))?;
    let browser = target
        .as_browser()
        .ok_or_else(|| Error::invalid(format!("surface {surface} is not a browser")))?;
    Ok(json!({
        "surface_id": surface,
        "url": browser.url(),
        "title": browser.title(),
        "history_length": browser.history().len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SurfaceSettings;

    fn dispatcher() -> Dispatcher {
        let session = Arc::new(Session::new(SessionTree::bootstrap(SurfaceSettings::default())));
        Dispatcher::new(
            session,
            ServerInfo {
                socket_path: PathBuf::from("/tmp/trellis-test.sock"),
                socket_mode: SocketMode::Restricted,
            },
        )
    }

    fn call(d: &Dispatcher, method: &str, params: Value) -> Response {
        d.call(&Request::new(1, method, params))
    }

    fn ok(d: &Dispatcher, method: &str, params: Value) -> Value {
        let resp = call(d, method, params);
        assert!(resp.ok, "{method} failed: {:?}", resp.error);
        resp.result.unwrap()
    }

    fn line(d: &Dispatcher, raw: &str) -> String {
        d.run_line(&LineCommand::parse(raw).unwrap())
    }

    #[test]
    fn ping_both_protocols() {
        let d = dispatcher();
        assert_eq!(d.handle_raw("ping\n"), "PONG\n.\n");
        let reply = d.handle_raw(r#"{"id":"x","method":"system.ping"}"#);
        let resp: Response = serde_json::from_str(reply.trim_end()).unwrap();
        assert_eq!(resp.id, json!("x"));
        assert_eq!(resp.result, Some(json!({ "pong": true })));
    }

    #[test]
    fn identify_lists_methods() {
        let d = dispatcher();
        let result = ok(&d, "system.identify", json!({}));
        assert_eq!(result["socket_mode"], "restricted");
        let methods = result["methods"].as_array().unwrap();
        assert!(methods.iter().any(|m| m == "system.tree"));
        assert!(methods.iter().any(|m| m == "browser.navigate"));
    }

    #[test]
    fn unknown_method_and_verb() {
        let d = dispatcher();
        let resp = call(&d, "window.explode", json!({}));
        assert_eq!(resp.error.unwrap().code, "protocol_error");
        assert_eq!(line(&d, "frobnicate 1"), "ERROR: Unknown command 'frobnicate'");
    }

    #[test]
    fn malformed_json_keeps_the_id_when_possible() {
        let reply = Dispatcher::reject_raw(
            r#"{"id":4,"method":5}"#,
            &Error::Protocol("bad".to_string()),
        );
        let resp: Response = serde_json::from_str(reply.trim_end()).unwrap();
        assert_eq!(resp.id, json!(4));
        assert!(!resp.ok);
    }

    #[test]
    fn workspace_aliases_follow_current_order() {
        let d = dispatcher();
        let second = ok(&d, "workspace.create", json!({ "title": "logs" }));
        let second_id = second["workspace_id"].as_str().unwrap().to_string();
        ok(&d, "workspace.select", json!({ "workspace": "workspace:1" }));
        let current = ok(&d, "workspace.current", json!({}));
        assert_ne!(current["workspace_id"], json!(second_id));

        let first_id = current["workspace_id"].as_str().unwrap().to_string();
        ok(&d, "workspace.close", json!({ "workspace": first_id }));
        // workspace:1 now names the former second workspace.
        ok(&d, "workspace.select", json!({ "workspace": "workspace:1" }));
        let current = ok(&d, "workspace.current", json!({}));
        assert_eq!(current["workspace_id"], json!(second_id));
        assert_eq!(current["title"], "logs");
    }

    #[test]
    fn closing_terminal_leaves_selected_browser() {
        let d = dispatcher();
        let terminal = ok(&d, "surface.list", json!({}))["surfaces"][0]["id"]
            .as_str()
            .unwrap()
            .to_string();
        let opened = ok(
            &d,
            "browser.open_split",
            json!({ "url": "https://example.com/docs", "direction": "right" }),
        );
        let browser = opened["surface_id"].as_str().unwrap().to_string();

        ok(&d, "surface.close", json!({ "surface": terminal }));
        let panes = ok(&d, "pane.list", json!({}));
        let panes = panes["panes"].as_array().unwrap();
        assert_eq!(panes.len(), 1);
        assert_eq!(panes[0]["selected"], true);
        assert_eq!(panes[0]["surface_id"], json!(browser));
        let url = ok(&d, "browser.url.get", json!({}));
        assert_eq!(url["url"], "https://example.com/docs");

        let health = ok(&d, "surface.health", json!({}));
        let rows = health["surfaces"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["surface_id"], json!(browser));
    }

    #[test]
    fn tree_active_path_matches_focus() {
        let d = dispatcher();
        ok(&d, "window.create", json!({}));
        let tree = ok(&d, "system.tree", json!({ "all": true }));
        let windows = tree["windows"].as_array().unwrap();
        assert_eq!(windows.len(), 2);
        let active = &tree["active"];
        let current = ok(&d, "window.current", json!({}));
        assert_eq!(active["window_id"], current["window_id"]);
        assert_eq!(windows[1]["focused"], true);
        assert!(tree["caller"].is_null());
    }

    #[test]
    fn line_pane_lifecycle() {
        let d = dispatcher();
        let reply = line(&d, "new_pane --direction=down --type=browser --url=about:blank");
        assert!(reply.starts_with("OK "), "{reply}");
        let listing = line(&d, "list_panes");
        assert_eq!(listing.lines().count(), 2);
        assert!(listing.lines().nth(1).unwrap().starts_with('*'));
        assert_eq!(line(&d, "get_url"), "about:blank");
        assert_eq!(line(&d, "close_pane 1"), "OK");
        assert_eq!(line(&d, "list_panes").lines().count(), 1);
        assert!(line(&d, "close_pane 5").starts_with("ERROR: pane not found"));
    }

    #[test]
    fn line_send_and_read_screen() {
        let d = dispatcher();
        assert_eq!(line(&d, r#"send "echo one\necho two\n""#), "OK");
        assert_eq!(line(&d, "read_screen --lines 1"), "echo two");
        assert_eq!(line(&d, "read_screen --scrollback"), "echo one\necho two\n");
        assert!(line(&d, "read_screen --lines x").starts_with("ERROR:"));
    }

    #[test]
    fn send_delivers_text_as_written() {
        let d = dispatcher();
        assert_eq!(line(&d, r"send git log --oneline  -n 3\n"), "OK");
        assert_eq!(line(&d, "read_screen --scrollback"), "git log --oneline  -n 3\n");

        let surface = ok(&d, "surface.list", json!({}))["surfaces"][0]["id"]
            .as_str()
            .unwrap()
            .to_string();
        let reply = line(&d, &format!(r#"send_surface {surface} echo "a  b" --all"#));
        assert_eq!(reply, "OK");
        assert_eq!(line(&d, "read_screen --lines 1"), r#"echo "a  b" --all"#);

        assert!(line(&d, "send").starts_with("ERROR: protocol error: usage: send"));
        assert!(line(&d, &format!("send_surface {surface}")).starts_with("ERROR:"));
    }

    #[test]
    fn workspace_aliases_honor_window_scope() {
        let d = dispatcher();
        let first_window = ok(&d, "window.current", json!({}))["window_id"]
            .as_str()
            .unwrap()
            .to_string();
        let keep = ok(&d, "workspace.create", json!({ "title": "keep" }));
        let created = ok(&d, "window.create", json!({}));
        let second_window = created["window_id"].as_str().unwrap().to_string();
        ok(&d, "workspace.create", json!({ "window": second_window, "title": "other" }));

        // Focus is on the second window; the scope points back at the first.
        let renamed = ok(
            &d,
            "workspace.rename",
            json!({ "window": first_window, "workspace": "workspace:2", "title": "kept" }),
        );
        assert_eq!(renamed["workspace_id"], keep["workspace_id"]);

        let closed = ok(
            &d,
            "workspace.close",
            json!({ "window": first_window, "workspace": "workspace:2" }),
        );
        assert_eq!(closed["workspace_id"], keep["workspace_id"]);
        let listing = ok(&d, "workspace.list", json!({ "window": first_window }));
        assert_eq!(listing["workspaces"].as_array().unwrap().len(), 1);
        let listing = ok(&d, "workspace.list", json!({ "window": second_window }));
        assert_eq!(listing["workspaces"].as_array().unwrap().len(), 2);

        let moved = ok(
            &d,
            "workspace.move",
            json!({ "from_window": first_window, "workspace": "workspace:1", "window": second_window }),
        );
        assert_eq!(moved["window_id"], json!(second_window));
        let listing = ok(&d, "workspace.list", json!({ "window": second_window }));
        assert_eq!(listing["workspaces"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn line_listings() {
        let d = dispatcher();
        let windows = line(&d, "list_windows");
        assert!(windows.starts_with("* 0 "));
        assert!(windows.ends_with("workspaces=1"));
        assert!(line(&d, "new_workspace Build").starts_with("OK "));
        let listing = line(&d, "list_workspaces");
        assert!(listing.lines().nth(1).unwrap().ends_with(" Build"));
        assert!(listing.lines().nth(1).unwrap().starts_with('*'));

        let id = line(&d, "current_window");
        assert_eq!(line(&d, &format!("close_window {id}")), "OK");
        assert_eq!(line(&d, "list_windows"), "No windows");
    }

    #[test]
    fn mutations_bump_revision_only_on_success() {
        let d = dispatcher();
        let before = d.session().revision();
        let _ = d.handle_raw("close_pane nonexistent");
        assert_eq!(d.session().revision(), before);
        let _ = d.handle_raw("new_pane");
        assert_eq!(d.session().revision(), before + 1);
    }

    #[test]
    fn save_without_persistence_is_invalid_state() {
        let d = dispatcher();
        let resp = call(&d, "system.save", json!({}));
        assert_eq!(resp.error.unwrap().code, "invalid_state");
    }

    #[test]
    fn timeout_reply_keeps_id() {
        let frame = Frame::Structured(Request::new(9, "system.tree", json!({})));
        let reply = Dispatcher::timeout_reply(&frame, 5000);
        let resp: Response = serde_json::from_str(reply.trim_end()).unwrap();
        assert_eq!(resp.id, json!(9));
        assert_eq!(resp.error.unwrap().code, "timeout");
    }
}
