//! Read-only views of the session tree and their text rendering.
//!
//! [`describe`] builds a [`TreeView`] under the caller's read lock; the view
//! is plain data, serialized as the `system.tree` result and rendered by the
//! CLI with [`render_text`]:
//!
//! ```text
//! window window:1 5F3C… [focused] [current]
//! └── workspace workspace:1 9A01… "Workspace 1" [selected] [current]
//!     ├── pane pane:1 77D2… [current]
//!     │   └── surface surface:1 0B6E… [terminal] ◀ here
//!     └── pane pane:2 C4A8… [focused]
//!         └── surface surface:2 E119… [browser] https://example.com ◀ active
//! ```

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::{EntityKind, SurfaceId, WorkspaceId, positional_ref};
use crate::session::{SessionTree, Window};
use crate::surface::SurfaceKind;

/// Which part of the tree to describe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    /// The focused window only.
    #[default]
    Focused,
    /// Every window.
    All,
    /// One workspace, inside its window.
    Workspace(WorkspaceId),
}

/// A path from a window down to a surface. Lower levels are absent when the
/// window has no workspaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathView {
    pub window_id: String,
    pub window_ref: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub workspace_ref: Option<String>,
    #[serde(default)]
    pub pane_id: Option<String>,
    #[serde(default)]
    pub pane_ref: Option<String>,
    #[serde(default)]
    pub surface_id: Option<String>,
    #[serde(default)]
    pub surface_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceView {
    pub id: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: SurfaceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub active: bool,
    pub here: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneView {
    pub id: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub index: usize,
    /// Selected pane of its workspace.
    pub focused: bool,
    pub active: bool,
    pub current: bool,
    pub surface: SurfaceView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceView {
    pub id: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub index: usize,
    pub title: String,
    pub selected: bool,
    pub active: bool,
    pub current: bool,
    pub panes: Vec<PaneView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowView {
    pub id: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub index: usize,
    pub focused: bool,
    pub current: bool,
    pub workspaces: Vec<WorkspaceView>,
}

/// Result of `system.tree`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeView {
    /// Focused window → selected workspace → selected pane → surface.
    #[serde(default)]
    pub active: Option<PathView>,
    /// Path of the surface the caller runs in, when known.
    #[serde(default)]
    pub caller: Option<PathView>,
    pub windows: Vec<WindowView>,
}

// =============================================================================
// Building views
// =============================================================================

fn active_path(tree: &SessionTree) -> Option<PathView> {
    let window_index = tree
        .windows()
        .iter()
        .position(|w| Some(w.id()) == tree.focused_window_id())?;
    let window = &tree.windows()[window_index];
    let mut path = PathView {
        window_id: window.id().to_string(),
        window_ref: positional_ref(EntityKind::Window, window_index),
        workspace_id: None,
        workspace_ref: None,
        pane_id: None,
        pane_ref: None,
        surface_id: None,
        surface_ref: None,
    };
    let Some(ws_index) = window
        .workspaces()
        .iter()
        .position(|ws| Some(ws.id()) == window.selected_workspace_id())
    else {
        return Some(path);
    };
    let ws = &window.workspaces()[ws_index];
    path.workspace_id = Some(ws.id().to_string());
    path.workspace_ref = Some(positional_ref(EntityKind::Workspace, ws_index));
    if let Some(pane_index) = ws.panes().iter().position(|p| p == ws.selected_pane()) {
        path.pane_id = Some(ws.selected_pane().to_string());
        path.pane_ref = Some(positional_ref(EntityKind::Pane, pane_index));
        if let Some(surface) = ws.selected_surface() {
            path.surface_id = Some(surface.id().to_string());
            path.surface_ref = Some(positional_ref(EntityKind::Surface, pane_index));
        }
    }
    Some(path)
}

fn caller_path(tree: &SessionTree, caller: &SurfaceId) -> Option<PathView> {
    let loc = tree.locate_surface(caller)?;
    let window_index = tree.windows().iter().position(|w| w.id() == &loc.window_id)?;
    let window = &tree.windows()[window_index];
    let ws_index = window
        .workspaces()
        .iter()
        .position(|ws| ws.id() == &loc.workspace_id)?;
    let pane_index = window.workspaces()[ws_index]
        .panes()
        .iter()
        .position(|p| p == &loc.pane_id)?;
    Some(PathView {
        window_id: loc.window_id.to_string(),
        window_ref: positional_ref(EntityKind::Window, window_index),
        workspace_id: Some(loc.workspace_id.to_string()),
        workspace_ref: Some(positional_ref(EntityKind::Workspace, ws_index)),
        pane_id: Some(loc.pane_id.to_string()),
        pane_ref: Some(positional_ref(EntityKind::Pane, pane_index)),
        surface_id: Some(loc.surface_id.to_string()),
        surface_ref: Some(positional_ref(EntityKind::Surface, pane_index)),
    })
}

fn on_path(path: Option<&PathView>, pick: impl Fn(&PathView) -> Option<&str>, id: &str) -> bool {
    path.and_then(pick).is_some_and(|p| p == id)
}

fn window_view(
    window: &Window,
    index: usize,
    focused: bool,
    only: Option<&WorkspaceId>,
    active: Option<&PathView>,
    caller: Option<&PathView>,
) -> WindowView {
    let wid = window.id().as_str();
    let workspaces = window
        .workspaces()
        .iter()
        .enumerate()
        .filter(|(_, ws)| only.is_none_or(|id| ws.id() == id))
        .map(|(ws_index, ws)| {
            let sid = ws.id().as_str();
            let panes = ws
                .layout()
                .surfaces()
                .into_iter()
                .enumerate()
                .map(|(pane_index, (pane_id, surface))| {
                    let pid = pane_id.as_str();
                    let surface_id = surface.id().as_str();
                    PaneView {
                        id: pid.to_string(),
                        reference: positional_ref(EntityKind::Pane, pane_index),
                        index: pane_index,
                        focused: &pane_id == ws.selected_pane(),
                        active: on_path(active, |p| p.pane_id.as_deref(), pid),
                        current: on_path(caller, |p| p.pane_id.as_deref(), pid),
                        surface: SurfaceView {
                            id: surface_id.to_string(),
                            reference: positional_ref(EntityKind::Surface, pane_index),
                            index: pane_index,
                            kind: surface.kind(),
                            title: surface.title(),
                            url: surface.url().map(str::to_string),
                            active: on_path(active, |p| p.surface_id.as_deref(), surface_id),
                            here: on_path(caller, |p| p.surface_id.as_deref(), surface_id),
                        },
                    }
                })
                .collect();
            WorkspaceView {
                id: sid.to_string(),
                reference: positional_ref(EntityKind::Workspace, ws_index),
                index: ws_index,
                title: ws.title().to_string(),
                selected: window.selected_workspace_id() == Some(ws.id()),
                active: on_path(active, |p| p.workspace_id.as_deref(), sid),
                current: on_path(caller, |p| p.workspace_id.as_deref(), sid),
                panes,
            }
        })
        .collect();
    WindowView {
        id: wid.to_string(),
        reference: positional_ref(EntityKind::Window, index),
        index,
        focused,
        current: caller.is_some_and(|p| p.window_id == wid),
        workspaces,
    }
}

/// Build the view of `scope`. `caller` marks the path of the calling
/// surface; an unknown caller is ignored.
pub fn describe(tree: &SessionTree, scope: &Scope, caller: Option<&SurfaceId>) -> Result<TreeView> {
    let active = active_path(tree);
    let caller = caller.and_then(|id| caller_path(tree, id));
    let only = match scope {
        Scope::Workspace(id) => {
            if tree.workspace(id).is_none() {
                return Err(Error::not_found(EntityKind::Workspace, id.as_str()));
            }
            Some(id)
        }
        Scope::Focused | Scope::All => None,
    };
    let windows = tree
        .windows()
        .iter()
        .enumerate()
        .filter(|(_, w)| match scope {
            Scope::All => true,
            Scope::Focused => Some(w.id()) == tree.focused_window_id(),
            Scope::Workspace(id) => w.workspace(id).is_some(),
        })
        .map(|(index, w)| {
            window_view(
                w,
                index,
                Some(w.id()) == tree.focused_window_id(),
                only,
                active.as_ref(),
                caller.as_ref(),
            )
        })
        .collect();
    Ok(TreeView {
        active,
        caller,
        windows,
    })
}

// =============================================================================
// Text rendering
// =============================================================================

const BRANCH: &str = "├── ";
const LAST_BRANCH: &str = "└── ";
const PIPE: &str = "│   ";
const GAP: &str = "    ";

fn markers(line: &mut String, flags: &[(bool, &str)]) {
    for (on, marker) in flags {
        if *on {
            line.push(' ');
            line.push_str(marker);
        }
    }
}

fn surface_line(surface: &SurfaceView) -> String {
    let mut line = format!(
        "surface {} {} [{}]",
        surface.reference, surface.id, surface.kind
    );
    if surface.kind == SurfaceKind::Browser {
        if let Some(url) = &surface.url {
            line.push(' ');
            line.push_str(url);
        }
    }
    markers(
        &mut line,
        &[(surface.active, "◀ active"), (surface.here, "◀ here")],
    );
    line
}

/// Render a view as an indented tree.
#[must_use]
pub fn render_text(view: &TreeView) -> String {
    let mut out = String::new();
    if view.windows.is_empty() {
        out.push_str("No windows\n");
        return out;
    }
    for window in &view.windows {
        let mut line = format!("window {} {}", window.reference, window.id);
        markers(
            &mut line,
            &[(window.focused, "[focused]"), (window.current, "[current]")],
        );
        let _ = writeln!(out, "{line}");
        if window.workspaces.is_empty() {
            let _ = writeln!(out, "{LAST_BRANCH}(no workspaces)");
        }
        for (wi, ws) in window.workspaces.iter().enumerate() {
            let ws_last = wi + 1 == window.workspaces.len();
            let mut line = format!("workspace {} {} \"{}\"", ws.reference, ws.id, ws.title);
            markers(
                &mut line,
                &[(ws.selected, "[selected]"), (ws.current, "[current]")],
            );
            let _ = writeln!(out, "{}{line}", if ws_last { LAST_BRANCH } else { BRANCH });
            let ws_indent = if ws_last { GAP } else { PIPE };
            for (pi, pane) in ws.panes.iter().enumerate() {
                let pane_last = pi + 1 == ws.panes.len();
                let mut line = format!("pane {} {}", pane.reference, pane.id);
                markers(
                    &mut line,
                    &[(pane.focused, "[focused]"), (pane.current, "[current]")],
                );
                let _ = writeln!(
                    out,
                    "{ws_indent}{}{line}",
                    if pane_last { LAST_BRANCH } else { BRANCH }
                );
                let pane_indent = if pane_last { GAP } else { PIPE };
                let _ = writeln!(
                    out,
                    "{ws_indent}{pane_indent}{LAST_BRANCH}{}",
                    surface_line(&pane.surface)
                );
            }
        }
    }
    out
}
