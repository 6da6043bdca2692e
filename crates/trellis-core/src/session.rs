//! Session tree: windows own workspaces, workspaces own a pane split tree,
//! leaf panes host surfaces.
//!
//! ```text
//! SessionTree ── focused_window
//!   └── Window ── selected_workspace
//!         └── Workspace ── selected_pane
//!               └── PaneTree (layout)
//!                     └── Leaf ── Surface (terminal | browser)
//! ```
//!
//! Every write operation checks all of its inputs before touching the tree,
//! so a failed call leaves the tree exactly as it was. Destroyed IDs are
//! retired in the [`IdentityRegistry`] and never come back.
//!
//! [`Session`] is the shared handle: a reader/writer lock around the tree.
//! Handles resolved under one lock and used under another may name a
//! different entity if the tree changed in between; callers that need a
//! stable reference resolve to an opaque ID first.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;

use crate::error::{AdapterError, Error, Result};
use crate::identity::{
    EntityKind, Handle, IdentityRegistry, PaneId, SurfaceId, WindowId, WorkspaceId,
};
use crate::layout::{DEFAULT_SPLIT_RATIO, Direction, Node, PaneTree};
use crate::surface::terminal::{DEFAULT_ROWS, DEFAULT_SCROLLBACK_LIMIT};
use crate::surface::{
    BrowserSurface, ReadMode, Surface, SurfaceAdapter, SurfaceKind, SurfaceSpec, TerminalSurface,
};

/// Parameters for surfaces created by the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSettings {
    /// Live scrollback retention per terminal, in bytes.
    pub scrollback_limit: usize,
    /// Rows returned by [`ReadMode::Visible`].
    pub rows: usize,
}

impl Default for SurfaceSettings {
    fn default() -> Self {
        Self {
            scrollback_limit: DEFAULT_SCROLLBACK_LIMIT,
            rows: DEFAULT_ROWS,
        }
    }
}

// =============================================================================
// Entities
// =============================================================================

/// A titled container of one pane tree.
#[derive(Debug, Clone)]
pub struct Workspace {
    id: WorkspaceId,
    title: String,
    layout: PaneTree,
    selected_pane: PaneId,
}

impl Workspace {
    pub(crate) fn from_parts(
        id: WorkspaceId,
        title: String,
        layout: PaneTree,
        selected_pane: PaneId,
    ) -> Self {
        Self {
            id,
            title,
            layout,
            selected_pane,
        }
    }

    #[must_use]
    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn layout(&self) -> &PaneTree {
        &self.layout
    }

    #[must_use]
    pub fn selected_pane(&self) -> &PaneId {
        &self.selected_pane
    }

    /// Leaf panes in document order.
    #[must_use]
    pub fn panes(&self) -> Vec<PaneId> {
        self.layout.leaves()
    }

    #[must_use]
    pub fn selected_surface(&self) -> Option<&Surface> {
        self.layout.surface(&self.selected_pane)
    }

    fn destroyed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .layout
            .node_ids()
            .into_iter()
            .map(|id| id.as_str().to_string())
            .collect();
        ids.extend(
            self.layout
                .surfaces()
                .into_iter()
                .map(|(_, surface)| surface.id().as_str().to_string()),
        );
        ids.push(self.id.as_str().to_string());
        ids
    }
}

/// A top-level container of workspaces.
#[derive(Debug, Clone)]
pub struct Window {
    id: WindowId,
    workspaces: Vec<Workspace>,
    selected_workspace: Option<WorkspaceId>,
}

impl Window {
    pub(crate) fn from_parts(
        id: WindowId,
        workspaces: Vec<Workspace>,
        selected_workspace: Option<WorkspaceId>,
    ) -> Self {
        Self {
            id,
            workspaces,
            selected_workspace,
        }
    }

    #[must_use]
    pub fn id(&self) -> &WindowId {
        &self.id
    }

    #[must_use]
    pub fn workspaces(&self) -> &[Workspace] {
        &self.workspaces
    }

    #[must_use]
    pub fn workspace_ids(&self) -> Vec<WorkspaceId> {
        self.workspaces.iter().map(|ws| ws.id.clone()).collect()
    }

    #[must_use]
    pub fn selected_workspace_id(&self) -> Option<&WorkspaceId> {
        self.selected_workspace.as_ref()
    }

    #[must_use]
    pub fn selected_workspace(&self) -> Option<&Workspace> {
        let selected = self.selected_workspace.as_ref()?;
        self.workspaces.iter().find(|ws| &ws.id == selected)
    }

    #[must_use]
    pub fn workspace(&self, id: &WorkspaceId) -> Option<&Workspace> {
        self.workspaces.iter().find(|ws| &ws.id == id)
    }
}

/// Full path from a window down to a surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurfaceLocation {
    pub window_id: WindowId,
    pub workspace_id: WorkspaceId,
    pub pane_id: PaneId,
    pub surface_id: SurfaceId,
}

/// One row of a health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SurfaceHealthRow {
    /// Position among the reported surfaces.
    pub index: usize,
    pub surface_id: SurfaceId,
    pub pane_id: PaneId,
    pub workspace_id: WorkspaceId,
    pub window_id: WindowId,
    #[serde(rename = "type")]
    pub variant: SurfaceKind,
    pub visible: bool,
    pub attached: bool,
    /// Mounted in its window's visible view hierarchy.
    pub in_window: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceCreated {
    pub window_id: WindowId,
    pub workspace_id: WorkspaceId,
    pub pane_id: PaneId,
    pub surface_id: SurfaceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaneCreated {
    pub workspace_id: WorkspaceId,
    pub pane_id: PaneId,
    pub surface_id: SurfaceId,
    /// The split node created around the original pane.
    pub split_id: PaneId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaneClosed {
    pub workspace_id: WorkspaceId,
    /// The pane was the last one, so its workspace closed with it.
    pub workspace_closed: bool,
    /// Selected pane of the workspace afterwards, if it survived.
    pub selected_pane: Option<PaneId>,
}

// =============================================================================
// SessionTree
// =============================================================================

/// The whole window hierarchy of one host process.
#[derive(Debug)]
pub struct SessionTree {
    windows: Vec<Window>,
    focused_window: Option<WindowId>,
    registry: IdentityRegistry,
    settings: SurfaceSettings,
}

impl Default for SessionTree {
    fn default() -> Self {
        Self::new(SurfaceSettings::default())
    }
}

impl SessionTree {
    /// An empty tree with no windows.
    #[must_use]
    pub fn new(settings: SurfaceSettings) -> Self {
        Self {
            windows: Vec::new(),
            focused_window: None,
            registry: IdentityRegistry::new(),
            settings,
        }
    }

    /// The default tree: one window, one workspace, one terminal pane.
    #[must_use]
    pub fn bootstrap(settings: SurfaceSettings) -> Self {
        let mut tree = Self::new(settings);
        tree.create_window();
        let index = tree.windows.len() - 1;
        tree.push_workspace(index, &SurfaceSpec::Terminal, None);
        tree.refresh_visibility();
        tree
    }

    pub(crate) fn from_parts(
        windows: Vec<Window>,
        focused_window: Option<WindowId>,
        registry: IdentityRegistry,
        settings: SurfaceSettings,
    ) -> Self {
        let mut tree = Self {
            windows,
            focused_window,
            registry,
            settings,
        };
        tree.refresh_visibility();
        tree
    }

    #[must_use]
    pub fn settings(&self) -> SurfaceSettings {
        self.settings
    }

    #[must_use]
    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    fn new_surface(&mut self, spec: &SurfaceSpec) -> Surface {
        let id = self.registry.allocate_surface();
        Surface::new(id, spec, self.settings.scrollback_limit, self.settings.rows)
    }

    /// Each surface is visible exactly when its workspace is the selected
    /// workspace of its window.
    fn refresh_visibility(&mut self) {
        for window in &mut self.windows {
            let selected = window.selected_workspace.clone();
            for workspace in &mut window.workspaces {
                let visible = selected.as_ref() == Some(&workspace.id);
                for surface in workspace.layout.surfaces_mut() {
                    surface.set_visible(visible);
                }
            }
        }
    }

    fn retire_all(&mut self, ids: Vec<String>) {
        for id in ids {
            self.registry.retire(&id);
        }
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    #[must_use]
    pub fn window_ids(&self) -> Vec<WindowId> {
        self.windows.iter().map(|w| w.id.clone()).collect()
    }

    #[must_use]
    pub fn window(&self, id: &WindowId) -> Option<&Window> {
        self.windows.iter().find(|w| &w.id == id)
    }

    #[must_use]
    pub fn focused_window_id(&self) -> Option<&WindowId> {
        self.focused_window.as_ref()
    }

    #[must_use]
    pub fn focused_window(&self) -> Option<&Window> {
        self.window(self.focused_window.as_ref()?)
    }

    /// Selected workspace of the focused window.
    #[must_use]
    pub fn current_workspace(&self) -> Option<&Workspace> {
        self.focused_window()?.selected_workspace()
    }

    #[must_use]
    pub fn current_pane(&self) -> Option<&PaneId> {
        self.current_workspace().map(Workspace::selected_pane)
    }

    #[must_use]
    pub fn current_surface(&self) -> Option<&Surface> {
        self.current_workspace()?.selected_surface()
    }

    /// Workspace and its owning window.
    #[must_use]
    pub fn workspace(&self, id: &WorkspaceId) -> Option<(&Window, &Workspace)> {
        self.windows
            .iter()
            .find_map(|w| w.workspace(id).map(|ws| (w, ws)))
    }

    fn workspace_position(&self, id: &WorkspaceId) -> Option<(usize, usize)> {
        self.windows.iter().enumerate().find_map(|(wi, w)| {
            w.workspaces
                .iter()
                .position(|ws| &ws.id == id)
                .map(|si| (wi, si))
        })
    }

    fn window_position(&self, id: &WindowId) -> Option<usize> {
        self.windows.iter().position(|w| &w.id == id)
    }

    fn pane_position(&self, pane: &PaneId) -> Option<(usize, usize)> {
        self.windows.iter().enumerate().find_map(|(wi, w)| {
            w.workspaces
                .iter()
                .position(|ws| ws.layout.contains(pane))
                .map(|si| (wi, si))
        })
    }

    /// Window and workspace containing pane node `pane` (leaf or split).
    #[must_use]
    pub fn locate_pane(&self, pane: &PaneId) -> Option<(&Window, &Workspace)> {
        let (wi, si) = self.pane_position(pane)?;
        let window = &self.windows[wi];
        Some((window, &window.workspaces[si]))
    }

    #[must_use]
    pub fn locate_surface(&self, surface: &SurfaceId) -> Option<SurfaceLocation> {
        self.windows.iter().find_map(|w| {
            w.workspaces.iter().find_map(|ws| {
                ws.layout
                    .pane_of_surface(surface)
                    .map(|pane_id| SurfaceLocation {
                        window_id: w.id.clone(),
                        workspace_id: ws.id.clone(),
                        pane_id,
                        surface_id: surface.clone(),
                    })
            })
        })
    }

    #[must_use]
    pub fn surface(&self, id: &SurfaceId) -> Option<&Surface> {
        let loc = self.locate_surface(id)?;
        let (_, ws) = self.workspace(&loc.workspace_id)?;
        ws.layout.surface(&loc.pane_id)
    }

    fn surface_mut(&mut self, id: &SurfaceId) -> Result<&mut Surface> {
        let loc = self
            .locate_surface(id)
            .ok_or_else(|| Error::not_found(EntityKind::Surface, id.as_str()))?;
        let (wi, si) = self
            .workspace_position(&loc.workspace_id)
            .ok_or_else(|| Error::not_found(EntityKind::Workspace, loc.workspace_id.as_str()))?;
        self.windows[wi].workspaces[si]
            .layout
            .surface_mut(&loc.pane_id)
            .ok_or_else(|| Error::not_found(EntityKind::Surface, id.as_str()))
    }

    /// Every live surface with its location, in listing order.
    #[must_use]
    pub fn all_surfaces(&self) -> Vec<(SurfaceLocation, &Surface)> {
        let mut out = Vec::new();
        for w in &self.windows {
            for ws in &w.workspaces {
                for (pane_id, surface) in ws.layout.surfaces() {
                    out.push((
                        SurfaceLocation {
                            window_id: w.id.clone(),
                            workspace_id: ws.id.clone(),
                            pane_id,
                            surface_id: surface.id().clone(),
                        },
                        surface,
                    ));
                }
            }
        }
        out
    }

    /// Health of every surface, or of one workspace's surfaces.
    #[must_use]
    pub fn surface_health(&self, scope: Option<&WorkspaceId>) -> Vec<SurfaceHealthRow> {
        self.all_surfaces()
            .into_iter()
            .filter(|(loc, _)| scope.is_none_or(|ws| &loc.workspace_id == ws))
            .enumerate()
            .map(|(index, (loc, surface))| {
                let health = surface.describe_health();
                SurfaceHealthRow {
                    index,
                    surface_id: loc.surface_id,
                    pane_id: loc.pane_id,
                    workspace_id: loc.workspace_id,
                    window_id: loc.window_id,
                    variant: health.variant,
                    visible: health.visible,
                    attached: health.attached,
                    in_window: health.visible,
                }
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Handle resolution
    // -------------------------------------------------------------------------

    fn scope_window(&self, scope: Option<&WindowId>) -> Result<&Window> {
        match scope {
            Some(id) => self
                .window(id)
                .ok_or_else(|| Error::not_found(EntityKind::Window, id.as_str())),
            None => self
                .focused_window()
                .ok_or_else(|| Error::not_found(EntityKind::Window, "focused window")),
        }
    }

    fn scope_workspace(&self, scope: Option<&WorkspaceId>) -> Result<&Workspace> {
        match scope {
            Some(id) => self
                .workspace(id)
                .map(|(_, ws)| ws)
                .ok_or_else(|| Error::not_found(EntityKind::Workspace, id.as_str())),
            None => self
                .current_workspace()
                .ok_or_else(|| Error::not_found(EntityKind::Workspace, "current workspace")),
        }
    }

    /// Resolve a window handle against the current window listing.
    pub fn resolve_window(&self, raw: &str) -> Result<WindowId> {
        Handle::parse(raw)?.resolve_in(EntityKind::Window, &self.window_ids())
    }

    /// Resolve a workspace handle. IDs resolve globally; aliases index the
    /// workspaces of `scope` (default: the focused window).
    pub fn resolve_workspace(&self, raw: &str, scope: Option<&WindowId>) -> Result<WorkspaceId> {
        let handle = Handle::parse(raw)?;
        if matches!(handle, Handle::Id(_)) {
            let all: Vec<WorkspaceId> = self
                .windows
                .iter()
                .flat_map(Window::workspace_ids)
                .collect();
            return handle.resolve_in(EntityKind::Workspace, &all);
        }
        let window = self.scope_window(scope)?;
        handle.resolve_in(EntityKind::Workspace, &window.workspace_ids())
    }

    /// Resolve a pane handle. A surface ID or `surface:N` names the pane
    /// hosting that surface. Aliases index the leaves of `scope` (default:
    /// the current workspace) in document order.
    pub fn resolve_pane(&self, raw: &str, scope: Option<&WorkspaceId>) -> Result<PaneId> {
        let handle = Handle::parse(raw)?;
        match &handle {
            Handle::Id(id) => {
                let mut all: Vec<PaneId> = Vec::new();
                for w in &self.windows {
                    for ws in &w.workspaces {
                        all.extend(ws.layout.node_ids());
                    }
                }
                if let Ok(pane) = handle.resolve_in(EntityKind::Pane, &all) {
                    return Ok(pane);
                }
                let surfaces: Vec<SurfaceId> = self
                    .all_surfaces()
                    .into_iter()
                    .map(|(loc, _)| loc.surface_id)
                    .collect();
                let surface = handle
                    .resolve_in(EntityKind::Surface, &surfaces)
                    .map_err(|_| Error::not_found(EntityKind::Pane, id.as_str()))?;
                self.locate_surface(&surface)
                    .map(|loc| loc.pane_id)
                    .ok_or_else(|| Error::not_found(EntityKind::Pane, id.as_str()))
            }
            Handle::Positional { kind, position } => {
                if !matches!(kind, EntityKind::Pane | EntityKind::Surface) {
                    return Err(Error::not_found(EntityKind::Pane, handle.to_string()));
                }
                let leaves = self.scope_workspace(scope)?.panes();
                leaves
                    .get(position - 1)
                    .cloned()
                    .ok_or_else(|| Error::not_found(EntityKind::Pane, handle.to_string()))
            }
            Handle::Index(_) => {
                let leaves = self.scope_workspace(scope)?.panes();
                handle.resolve_in(EntityKind::Pane, &leaves)
            }
        }
    }

    /// Resolve a surface handle. A pane ID or `pane:N` names the surface
    /// hosted by that leaf.
    pub fn resolve_surface(&self, raw: &str, scope: Option<&WorkspaceId>) -> Result<SurfaceId> {
        let handle = Handle::parse(raw)?;
        if let Handle::Id(_) = &handle {
            let surfaces: Vec<SurfaceId> = self
                .all_surfaces()
                .into_iter()
                .map(|(loc, _)| loc.surface_id)
                .collect();
            if let Ok(surface) = handle.resolve_in(EntityKind::Surface, &surfaces) {
                return Ok(surface);
            }
        }
        if let Handle::Positional { kind, .. } = &handle {
            if !matches!(kind, EntityKind::Pane | EntityKind::Surface) {
                return Err(Error::not_found(EntityKind::Surface, handle.to_string()));
            }
        }
        let pane = self
            .resolve_pane(raw, scope)
            .map_err(|_| Error::not_found(EntityKind::Surface, handle.to_string()))?;
        let (_, ws) = self
            .locate_pane(&pane)
            .ok_or_else(|| Error::not_found(EntityKind::Surface, handle.to_string()))?;
        ws.layout
            .surface(&pane)
            .map(|surface| surface.id().clone())
            .ok_or_else(|| Error::not_found(EntityKind::Surface, handle.to_string()))
    }

    // -------------------------------------------------------------------------
    // Structural mutations
    // -------------------------------------------------------------------------

    /// Append an empty window and focus it.
    pub fn create_window(&mut self) -> WindowId {
        let id = self.registry.allocate_window();
        self.windows.push(Window {
            id: id.clone(),
            workspaces: Vec::new(),
            selected_workspace: None,
        });
        self.focused_window = Some(id.clone());
        tracing::debug!(window_id = %id, "window created");
        id
    }

    /// Append a workspace with one pane to `window` and select it.
    pub fn create_workspace(
        &mut self,
        window: &WindowId,
        spec: &SurfaceSpec,
        title: Option<&str>,
    ) -> Result<WorkspaceCreated> {
        let index = self
            .window_position(window)
            .ok_or_else(|| Error::not_found(EntityKind::Window, window.as_str()))?;
        let created = self.push_workspace(index, spec, title);
        self.refresh_visibility();
        Ok(created)
    }

    fn push_workspace(
        &mut self,
        window_index: usize,
        spec: &SurfaceSpec,
        title: Option<&str>,
    ) -> WorkspaceCreated {
        let workspace_id = self.registry.allocate_workspace();
        let pane_id = self.registry.allocate_pane();
        let surface = self.new_surface(spec);
        let surface_id = surface.id().clone();
        let window = &mut self.windows[window_index];
        let title = match title.map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => format!("Workspace {}", window.workspaces.len() + 1),
        };
        window.workspaces.push(Workspace {
            id: workspace_id.clone(),
            title,
            layout: PaneTree::new(pane_id.clone(), surface),
            selected_pane: pane_id.clone(),
        });
        window.selected_workspace = Some(workspace_id.clone());
        tracing::debug!(
            window_id = %window.id,
            workspace_id = %workspace_id,
            surface_id = %surface_id,
            "workspace created"
        );
        WorkspaceCreated {
            window_id: window.id.clone(),
            workspace_id,
            pane_id,
            surface_id,
        }
    }

    /// Split leaf `pane`; the new pane is selected.
    pub fn split_pane(
        &mut self,
        pane: &PaneId,
        direction: Direction,
        spec: &SurfaceSpec,
        ratio: Option<f64>,
    ) -> Result<PaneCreated> {
        let (wi, si) = self
            .pane_position(pane)
            .ok_or_else(|| Error::not_found(EntityKind::Pane, pane.as_str()))?;
        if !self.windows[wi].workspaces[si].layout.is_leaf(pane) {
            return Err(Error::invalid(format!(
                "pane {pane} is a split; only leaf panes can be split"
            )));
        }
        let (orientation, placement) = direction.split_params();
        let split_id = self.registry.allocate_pane();
        let new_pane = self.registry.allocate_pane();
        let surface = self.new_surface(spec);
        let surface_id = surface.id().clone();

        let workspace = &mut self.windows[wi].workspaces[si];
        workspace.layout.split(
            pane,
            split_id.clone(),
            new_pane.clone(),
            surface,
            orientation,
            placement,
            ratio.unwrap_or(DEFAULT_SPLIT_RATIO),
        )?;
        workspace.selected_pane = new_pane.clone();
        let workspace_id = workspace.id.clone();
        self.refresh_visibility();
        tracing::debug!(
            workspace_id = %workspace_id,
            pane_id = %new_pane,
            surface_id = %surface_id,
            orientation = orientation.as_str(),
            "pane split"
        );
        Ok(PaneCreated {
            workspace_id,
            pane_id: new_pane,
            surface_id,
            split_id,
        })
    }

    /// Close leaf `pane`. Closing the last pane closes its workspace.
    pub fn close_pane(&mut self, pane: &PaneId) -> Result<PaneClosed> {
        let (wi, si) = self
            .pane_position(pane)
            .ok_or_else(|| Error::not_found(EntityKind::Pane, pane.as_str()))?;
        let workspace = &self.windows[wi].workspaces[si];
        if !workspace.layout.is_leaf(pane) {
            return Err(Error::invalid(format!(
                "pane {pane} is a split; close its leaves instead"
            )));
        }
        let workspace_id = workspace.id.clone();
        if workspace.layout.root() == pane {
            self.close_workspace(&workspace_id)?;
            return Ok(PaneClosed {
                workspace_id,
                workspace_closed: true,
                selected_pane: None,
            });
        }

        let workspace = &mut self.windows[wi].workspaces[si];
        let removed = workspace.layout.remove_leaf(pane)?;
        if &workspace.selected_pane == pane {
            let next = if workspace.layout.is_leaf(&removed.promoted) {
                Some(removed.promoted.clone())
            } else {
                workspace.layout.first_leaf_of(&removed.promoted)
            };
            if let Some(next) = next {
                workspace.selected_pane = next;
            }
        }
        let selected = workspace.selected_pane.clone();
        self.retire_all(vec![
            pane.as_str().to_string(),
            removed.split.as_str().to_string(),
            removed.surface.id().as_str().to_string(),
        ]);
        self.refresh_visibility();
        tracing::debug!(
            workspace_id = %workspace_id,
            pane_id = %pane,
            surface_id = %removed.surface.id(),
            "pane closed"
        );
        Ok(PaneClosed {
            workspace_id,
            workspace_closed: false,
            selected_pane: Some(selected),
        })
    }

    /// Close the pane hosting `surface`.
    pub fn close_surface(&mut self, surface: &SurfaceId) -> Result<PaneClosed> {
        let loc = self
            .locate_surface(surface)
            .ok_or_else(|| Error::not_found(EntityKind::Surface, surface.as_str()))?;
        self.close_pane(&loc.pane_id)
    }

    /// Remove a workspace from its window and repair the window's selection.
    fn detach_workspace(&mut self, id: &WorkspaceId) -> Result<Workspace> {
        let (wi, si) = self
            .workspace_position(id)
            .ok_or_else(|| Error::not_found(EntityKind::Workspace, id.as_str()))?;
        let window = &mut self.windows[wi];
        let workspace = window.workspaces.remove(si);
        if window.selected_workspace.as_ref() == Some(id) {
            window.selected_workspace = window
                .workspaces
                .get(si)
                .or_else(|| si.checked_sub(1).and_then(|prev| window.workspaces.get(prev)))
                .map(|ws| ws.id.clone());
        }
        Ok(workspace)
    }

    pub fn close_workspace(&mut self, id: &WorkspaceId) -> Result<()> {
        let workspace = self.detach_workspace(id)?;
        self.retire_all(workspace.destroyed_ids());
        self.refresh_visibility();
        tracing::debug!(workspace_id = %id, "workspace closed");
        Ok(())
    }

    pub fn close_window(&mut self, id: &WindowId) -> Result<()> {
        let index = self
            .window_position(id)
            .ok_or_else(|| Error::not_found(EntityKind::Window, id.as_str()))?;
        let window = self.windows.remove(index);
        if self.focused_window.as_ref() == Some(id) {
            self.focused_window = self
                .windows
                .get(index)
                .or_else(|| index.checked_sub(1).and_then(|prev| self.windows.get(prev)))
                .map(|w| w.id.clone());
        }
        let mut ids: Vec<String> = window
            .workspaces
            .iter()
            .flat_map(Workspace::destroyed_ids)
            .collect();
        ids.push(window.id.as_str().to_string());
        self.retire_all(ids);
        tracing::debug!(window_id = %id, "window closed");
        Ok(())
    }

    pub fn select_workspace(&mut self, window: &WindowId, workspace: &WorkspaceId) -> Result<()> {
        let index = self
            .window_position(window)
            .ok_or_else(|| Error::not_found(EntityKind::Window, window.as_str()))?;
        let target = &mut self.windows[index];
        if target.workspace(workspace).is_none() {
            return Err(Error::invalid(format!(
                "workspace {workspace} does not belong to window {window}"
            )));
        }
        target.selected_workspace = Some(workspace.clone());
        self.refresh_visibility();
        Ok(())
    }

    pub fn select_pane(&mut self, workspace: &WorkspaceId, pane: &PaneId) -> Result<()> {
        let (wi, si) = self
            .workspace_position(workspace)
            .ok_or_else(|| Error::not_found(EntityKind::Workspace, workspace.as_str()))?;
        let target = &mut self.windows[wi].workspaces[si];
        if !target.layout.contains(pane) {
            return Err(Error::invalid(format!(
                "pane {pane} does not belong to workspace {workspace}"
            )));
        }
        if !target.layout.is_leaf(pane) {
            return Err(Error::invalid(format!("pane {pane} is a split")));
        }
        target.selected_pane = pane.clone();
        Ok(())
    }

    pub fn focus_window(&mut self, window: &WindowId) -> Result<()> {
        if self.window_position(window).is_none() {
            return Err(Error::not_found(EntityKind::Window, window.as_str()));
        }
        self.focused_window = Some(window.clone());
        Ok(())
    }

    /// Make `pane` the active pane: focus its window, select its workspace
    /// and select the pane.
    pub fn focus_pane(&mut self, pane: &PaneId) -> Result<()> {
        let (wi, si) = self
            .pane_position(pane)
            .ok_or_else(|| Error::not_found(EntityKind::Pane, pane.as_str()))?;
        if !self.windows[wi].workspaces[si].layout.is_leaf(pane) {
            return Err(Error::invalid(format!("pane {pane} is a split")));
        }
        let window = &mut self.windows[wi];
        window.workspaces[si].selected_pane = pane.clone();
        window.selected_workspace = Some(window.workspaces[si].id.clone());
        self.focused_window = Some(window.id.clone());
        self.refresh_visibility();
        Ok(())
    }

    pub fn focus_surface(&mut self, surface: &SurfaceId) -> Result<()> {
        let loc = self
            .locate_surface(surface)
            .ok_or_else(|| Error::not_found(EntityKind::Surface, surface.as_str()))?;
        self.focus_pane(&loc.pane_id)
    }

    pub fn rename_workspace(&mut self, workspace: &WorkspaceId, title: &str) -> Result<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::invalid("workspace title must not be empty"));
        }
        let (wi, si) = self
            .workspace_position(workspace)
            .ok_or_else(|| Error::not_found(EntityKind::Workspace, workspace.as_str()))?;
        self.windows[wi].workspaces[si].title = title.to_string();
        Ok(())
    }

    /// Move a workspace to the end of `window` and select it there.
    pub fn move_workspace(&mut self, workspace: &WorkspaceId, window: &WindowId) -> Result<()> {
        if self.workspace_position(workspace).is_none() {
            return Err(Error::not_found(EntityKind::Workspace, workspace.as_str()));
        }
        if self.window_position(window).is_none() {
            return Err(Error::not_found(EntityKind::Window, window.as_str()));
        }
        let moved = self.detach_workspace(workspace)?;
        let Some(index) = self.window_position(window) else {
            return Err(Error::not_found(EntityKind::Window, window.as_str()));
        };
        let target = &mut self.windows[index];
        target.workspaces.push(moved);
        target.selected_workspace = Some(workspace.clone());
        self.refresh_visibility();
        tracing::debug!(workspace_id = %workspace, window_id = %window, "workspace moved");
        Ok(())
    }

    /// Set the ratio of the split containing `pane` (or of `pane` itself
    /// when it is a split). Returns the clamped ratio.
    pub fn resize_split(&mut self, pane: &PaneId, ratio: f64) -> Result<f64> {
        let (wi, si) = self
            .pane_position(pane)
            .ok_or_else(|| Error::not_found(EntityKind::Pane, pane.as_str()))?;
        let layout = &mut self.windows[wi].workspaces[si].layout;
        let split = match layout.node(pane) {
            Some(Node::Split { .. }) => pane.clone(),
            _ => layout
                .parent(pane)
                .cloned()
                .ok_or_else(|| Error::invalid(format!("pane {pane} is not inside a split")))?,
        };
        layout.set_ratio(&split, ratio)
    }

    // -------------------------------------------------------------------------
    // Surface content
    // -------------------------------------------------------------------------

    fn terminal_mut(&mut self, id: &SurfaceId) -> Result<&mut TerminalSurface> {
        self.surface_mut(id)?
            .as_terminal_mut()
            .ok_or_else(|| Error::invalid(format!("surface {id} is not a terminal")))
    }

    fn browser_mut(&mut self, id: &SurfaceId) -> Result<&mut BrowserSurface> {
        self.surface_mut(id)?
            .as_browser_mut()
            .ok_or_else(|| Error::invalid(format!("surface {id} is not a browser")))
    }

    /// Deliver input to a terminal surface.
    pub fn send_text(&mut self, surface: &SurfaceId, text: &str) -> Result<()> {
        let result = self.terminal_mut(surface)?.send_text(text);
        tracing::trace!(surface_id = %surface, bytes = text.len(), "input delivered");
        result.map_err(|err| adapter_error(surface, err))
    }

    /// Append runtime output to a terminal surface.
    pub fn feed_output(&mut self, surface: &SurfaceId, bytes: &[u8]) -> Result<()> {
        self.terminal_mut(surface)?
            .feed_output(bytes)
            .map_err(|err| adapter_error(surface, err))
    }

    /// Record that the runtime behind a terminal surface is gone.
    pub fn mark_terminal_lost(&mut self, surface: &SurfaceId, reason: &str) -> Result<()> {
        self.terminal_mut(surface)?.mark_lost(reason);
        tracing::warn!(surface_id = %surface, reason, "terminal runtime lost");
        Ok(())
    }

    pub fn read_text(&self, surface: &SurfaceId, mode: ReadMode) -> Result<String> {
        let target = self
            .surface(surface)
            .ok_or_else(|| Error::not_found(EntityKind::Surface, surface.as_str()))?;
        target
            .as_terminal()
            .map(|term| term.read_text(mode))
            .ok_or_else(|| Error::invalid(format!("surface {surface} is not a terminal")))
    }

    pub fn navigate(&mut self, surface: &SurfaceId, url: &str) -> Result<()> {
        self.browser_mut(surface)?
            .navigate(url)
            .map_err(|err| adapter_error(surface, err))
    }

    pub fn back(&mut self, surface: &SurfaceId) -> Result<()> {
        self.browser_mut(surface)?
            .back()
            .map_err(|err| adapter_error(surface, err))
    }

    pub fn forward(&mut self, surface: &SurfaceId) -> Result<()> {
        self.browser_mut(surface)?
            .forward()
            .map_err(|err| adapter_error(surface, err))
    }

    pub fn reload(&mut self, surface: &SurfaceId) -> Result<()> {
        self.browser_mut(surface)?
            .reload()
            .map_err(|err| adapter_error(surface, err))
    }

    // -------------------------------------------------------------------------
    // Invariants
    // -------------------------------------------------------------------------

    /// Check every structural invariant of the tree.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        let claim = |id: &str| -> Result<()> {
            if !self.registry.is_live(id) {
                return Err(Error::invalid(format!("id {id} is not live in the registry")));
            }
            Ok(())
        };
        match &self.focused_window {
            Some(focused) if self.window(focused).is_none() => {
                return Err(Error::invalid(format!("focused window {focused} missing")));
            }
            None if !self.windows.is_empty() => {
                return Err(Error::invalid("windows exist but none is focused"));
            }
            _ => {}
        }
        for window in &self.windows {
            claim(window.id.as_str())?;
            if !seen.insert(window.id.as_str()) {
                return Err(Error::invalid(format!("duplicate id {}", window.id)));
            }
            match &window.selected_workspace {
                Some(selected) if window.workspace(selected).is_none() => {
                    return Err(Error::invalid(format!(
                        "window {} selects foreign workspace {selected}",
                        window.id
                    )));
                }
                None if !window.workspaces.is_empty() => {
                    return Err(Error::invalid(format!(
                        "window {} has workspaces but none selected",
                        window.id
                    )));
                }
                _ => {}
            }
            for ws in &window.workspaces {
                claim(ws.id.as_str())?;
                if !seen.insert(ws.id.as_str()) {
                    return Err(Error::invalid(format!("duplicate id {}", ws.id)));
                }
                ws.layout
                    .validate()
                    .map_err(|msg| Error::invalid(format!("workspace {}: {msg}", ws.id)))?;
                if !ws.layout.is_leaf(&ws.selected_pane) {
                    return Err(Error::invalid(format!(
                        "workspace {} selects {} which is not one of its leaves",
                        ws.id, ws.selected_pane
                    )));
                }
                let visible = window.selected_workspace.as_ref() == Some(&ws.id);
                for pane in ws.layout.node_ids() {
                    claim(pane.as_str())?;
                }
                for (pane, surface) in ws.layout.surfaces() {
                    claim(surface.id().as_str())?;
                    if surface.describe_health().visible != visible {
                        return Err(Error::invalid(format!(
                            "surface {} in pane {pane} has a stale visibility flag",
                            surface.id()
                        )));
                    }
                }
            }
        }
        let mut all: Vec<String> = Vec::new();
        for window in &self.windows {
            for ws in &window.workspaces {
                all.extend(ws.layout.node_ids().into_iter().map(|id| id.as_str().to_string()));
                all.extend(
                    ws.layout
                        .surfaces()
                        .into_iter()
                        .map(|(_, s)| s.id().as_str().to_string()),
                );
            }
        }
        let mut unique: HashSet<&str> = seen;
        for id in &all {
            if !unique.insert(id.as_str()) {
                return Err(Error::invalid(format!("duplicate id {id}")));
            }
        }
        Ok(())
    }
}

/// Map a surface adapter error onto the crate error.
///
/// A rejected request is a state problem of the caller (empty URL, no
/// history left); anything else is an adapter failure.
fn adapter_error(surface: &SurfaceId, err: AdapterError) -> Error {
    match err {
        AdapterError::Rejected(message) => Error::InvalidState(message),
        other => Error::AdapterFailure {
            surface: surface.to_string(),
            source: other,
        },
    }
}

// =============================================================================
// Shared handle
// =============================================================================

/// Shared session: the tree behind a reader/writer lock.
///
/// Mutations take the write lock, queries the read lock, so every read sees
/// a consistent point-in-time tree. No I/O happens while either is held.
#[derive(Debug, Default)]
pub struct Session {
    tree: RwLock<SessionTree>,
    revision: AtomicU64,
}

impl Session {
    #[must_use]
    pub fn new(tree: SessionTree) -> Self {
        Self {
            tree: RwLock::new(tree),
            revision: AtomicU64::new(0),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SessionTree> {
        self.tree.read()
    }

    /// Raw write access. Prefer [`Session::mutate`], which tracks revisions.
    pub fn write(&self) -> RwLockWriteGuard<'_, SessionTree> {
        self.tree.write()
    }

    /// Run `op` under the write lock; a successful call bumps the revision.
    pub fn mutate<T>(&self, op: impl FnOnce(&mut SessionTree) -> Result<T>) -> Result<T> {
        let mut tree = self.tree.write();
        let out = op(&mut tree)?;
        self.revision.fetch_add(1, Ordering::AcqRel);
        Ok(out)
    }

    /// Count of successful mutations since creation.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}
