//! Snapshot persistence for the session tree.
//!
//! One JSON document per application identity holds the whole tree: every
//! window, every workspace (selected or not), every pane tree and a capture
//! of every surface.
//!
//! # Data flow
//!
//! ```text
//! save:    Session (read lock) → SessionSnapshot → JSON → <file>.tmp → rename
//!                 ↑ per-surface capture, failures isolated
//! restore: <file> → SessionSnapshot → adopt ids → detached surfaces
//!                                                  → replay capture → attach
//! ```
//!
//! Restore never fails startup: a missing file yields the default tree, an
//! unreadable one is moved aside to `<file>.corrupt` first.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::identity::{EntityKind, IdentityRegistry, PaneId, SurfaceId, WindowId, WorkspaceId};
use crate::layout::{Node, NodeSeed, Orientation, PaneTree};
use crate::session::{Session, SessionTree, SurfaceSettings, Window, Workspace};
use crate::surface::{CaptureLimits, Surface, SurfaceAdapter, SurfaceCapture, SurfaceKind};

// =============================================================================
// Schema
// =============================================================================

/// Current snapshot schema version.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Suffix appended to a snapshot that could not be restored.
pub const CORRUPT_SUFFIX: &str = ".corrupt";

/// Complete persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub schema_version: u32,
    pub app_id: String,
    /// When the snapshot was taken (epoch ms).
    #[serde(default)]
    pub saved_at_ms: u64,
    pub windows: Vec<WindowRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub id: String,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub selected: bool,
    pub layout: LayoutRecord,
}

/// Persisted pane tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayoutRecord {
    Leaf {
        id: String,
        #[serde(default)]
        selected: bool,
        surface: SurfaceRecord,
    },
    Split {
        id: String,
        orientation: Orientation,
        ratio: f64,
        first: Box<LayoutRecord>,
        second: Box<LayoutRecord>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SurfaceKind,
    /// Absent when the surface could not be captured and no earlier
    /// capture existed.
    #[serde(default)]
    pub capture: Option<SurfaceCapture>,
}

impl SessionSnapshot {
    /// Number of surfaces in the snapshot.
    #[must_use]
    pub fn surface_count(&self) -> usize {
        fn count(node: &LayoutRecord) -> usize {
            match node {
                LayoutRecord::Leaf { .. } => 1,
                LayoutRecord::Split { first, second, .. } => count(first) + count(second),
            }
        }
        self.windows
            .iter()
            .flat_map(|w| &w.workspaces)
            .map(|ws| count(&ws.layout))
            .sum()
    }
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
#[must_use]
pub fn safe_app_id(app_id: &str) -> String {
    app_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Snapshot path for `app_id` inside `dir`.
#[must_use]
pub fn snapshot_path(dir: &Path, app_id: &str) -> PathBuf {
    dir.join(format!("session-{}.json", safe_app_id(app_id)))
}

// =============================================================================
// Reports and errors
// =============================================================================

/// What caused a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    /// Debounced autosave after a mutating control call.
    Mutation,
    /// Final save on shutdown.
    Shutdown,
    /// Explicit request (`system.save`).
    Manual,
}

impl SnapshotTrigger {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mutation => "mutation",
            Self::Shutdown => "shutdown",
            Self::Manual => "manual",
        }
    }
}

/// A surface whose capture failed during a save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureFailure {
    pub surface_id: SurfaceId,
    pub error: String,
    /// The last successfully saved capture was written instead.
    pub reused_previous: bool,
}

/// Result of a successful save.
#[derive(Debug, Clone, Serialize)]
pub struct SaveReport {
    pub trigger: SnapshotTrigger,
    pub path: PathBuf,
    pub bytes: usize,
    pub saved_at_ms: u64,
    pub windows: usize,
    pub workspaces: usize,
    pub surfaces: usize,
    pub capture_failures: Vec<CaptureFailure>,
}

/// How startup obtained its tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// The snapshot was rebuilt.
    Restored,
    /// No snapshot existed; the default tree was created.
    Fresh,
    /// The snapshot was unusable and moved aside; the default tree was
    /// created.
    Fallback {
        reason: String,
        moved_to: Option<PathBuf>,
    },
}

/// A surface whose capture could not be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayFailure {
    pub surface_id: SurfaceId,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    #[serde(flatten)]
    pub outcome: RestoreOutcome,
    pub path: PathBuf,
    pub windows: usize,
    pub workspaces: usize,
    pub surfaces: usize,
    pub replay_failures: Vec<ReplayFailure>,
}

/// Errors raised while reading or writing snapshots.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("snapshot I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(
        "unsupported snapshot schema version {found} (expected {expected})",
        expected = SNAPSHOT_SCHEMA_VERSION
    )]
    IncompatibleSchema { found: u32 },
    #[error("snapshot is structurally invalid: {0}")]
    Invalid(String),
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Where and how snapshots are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceConfig {
    pub app_id: String,
    pub dir: PathBuf,
    pub limits: CaptureLimits,
    pub surfaces: SurfaceSettings,
}

/// Saves and restores the session tree.
///
/// Saves are serialized by an internal lock; captures happen under the
/// session read lock, all file I/O after it is released.
#[derive(Debug)]
pub struct PersistenceEngine {
    config: PersistenceConfig,
    path: PathBuf,
    /// Last capture written per surface, reused when a capture fails.
    last_captures: Mutex<HashMap<SurfaceId, SurfaceCapture>>,
    write_lock: Mutex<()>,
}

impl PersistenceEngine {
    #[must_use]
    pub fn new(config: PersistenceConfig) -> Self {
        let path = snapshot_path(&config.dir, &config.app_id);
        Self {
            config,
            path,
            last_captures: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Build a snapshot of `tree`. Capture failures are appended to
    /// `failures`.
    pub fn capture(&self, tree: &SessionTree, failures: &mut Vec<CaptureFailure>) -> SessionSnapshot {
        let mut last = self.last_captures.lock();
        let mut seen: Vec<SurfaceId> = Vec::new();
        let windows = tree
            .windows()
            .iter()
            .map(|window| WindowRecord {
                id: window.id().to_string(),
                focused: tree.focused_window_id() == Some(window.id()),
                workspaces: window
                    .workspaces()
                    .iter()
                    .map(|ws| WorkspaceRecord {
                        id: ws.id().to_string(),
                        title: ws.title().to_string(),
                        selected: window.selected_workspace_id() == Some(ws.id()),
                        layout: self.layout_record(
                            ws.layout(),
                            ws.layout().root(),
                            ws.selected_pane(),
                            &mut last,
                            &mut seen,
                            failures,
                        ),
                    })
                    .collect(),
            })
            .collect();
        last.retain(|id, _| seen.contains(id));
        SessionSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            app_id: self.config.app_id.clone(),
            saved_at_ms: now_ms(),
            windows,
        }
    }

    fn layout_record(
        &self,
        layout: &PaneTree,
        id: &PaneId,
        selected: &PaneId,
        last: &mut HashMap<SurfaceId, SurfaceCapture>,
        seen: &mut Vec<SurfaceId>,
        failures: &mut Vec<CaptureFailure>,
    ) -> LayoutRecord {
        match layout.node(id) {
            Some(Node::Split {
                orientation,
                ratio,
                first,
                second,
            }) => LayoutRecord::Split {
                id: id.to_string(),
                orientation: *orientation,
                ratio: *ratio,
                first: Box::new(self.layout_record(layout, first, selected, last, seen, failures)),
                second: Box::new(self.layout_record(layout, second, selected, last, seen, failures)),
            },
            Some(Node::Leaf { surface }) => LayoutRecord::Leaf {
                id: id.to_string(),
                selected: id == selected,
                surface: self.surface_record(surface, last, seen, failures),
            },
            // Unreachable for a validated tree; keep the document well-formed.
            None => LayoutRecord::Leaf {
                id: id.to_string(),
                selected: false,
                surface: SurfaceRecord {
                    id: String::new(),
                    kind: SurfaceKind::Terminal,
                    capture: None,
                },
            },
        }
    }

    fn surface_record(
        &self,
        surface: &Surface,
        last: &mut HashMap<SurfaceId, SurfaceCapture>,
        seen: &mut Vec<SurfaceId>,
        failures: &mut Vec<CaptureFailure>,
    ) -> SurfaceRecord {
        let id = surface.id().clone();
        seen.push(id.clone());
        let capture = match surface.capture(&self.config.limits) {
            Ok(capture) => {
                last.insert(id.clone(), capture.clone());
                Some(capture)
            }
            Err(err) => {
                let previous = last.get(&id).cloned();
                tracing::warn!(
                    surface_id = %id,
                    error = %err,
                    reused_previous = previous.is_some(),
                    "surface capture failed"
                );
                failures.push(CaptureFailure {
                    surface_id: id.clone(),
                    error: err.to_string(),
                    reused_previous: previous.is_some(),
                });
                previous
            }
        };
        SurfaceRecord {
            id: id.to_string(),
            kind: surface.kind(),
            capture,
        }
    }

    /// Capture `session` and write it atomically.
    pub fn save(
        &self,
        session: &Session,
        trigger: SnapshotTrigger,
    ) -> Result<SaveReport, PersistenceError> {
        let _serial = self.write_lock.lock();
        let mut capture_failures = Vec::new();
        let snapshot = {
            let tree = session.read();
            self.capture(&tree, &mut capture_failures)
        };
        let bytes = self.write_snapshot(&snapshot)?;
        let report = SaveReport {
            trigger,
            path: self.path.clone(),
            bytes,
            saved_at_ms: snapshot.saved_at_ms,
            windows: snapshot.windows.len(),
            workspaces: snapshot.windows.iter().map(|w| w.workspaces.len()).sum(),
            surfaces: snapshot.surface_count(),
            capture_failures,
        };
        tracing::info!(
            trigger = trigger.as_str(),
            path = %report.path.display(),
            bytes = report.bytes,
            surfaces = report.surfaces,
            capture_failures = report.capture_failures.len(),
            "session snapshot saved"
        );
        Ok(report)
    }

    /// Serialize and write `snapshot` via a temp file and rename.
    pub fn write_snapshot(&self, snapshot: &SessionSnapshot) -> Result<usize, PersistenceError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;
        }
        let tmp_path = sibling_with_suffix(&self.path, ".tmp");
        {
            let mut file =
                std::fs::File::create(&tmp_path).map_err(|e| PersistenceError::io(&tmp_path, e))?;
            file.write_all(&json)
                .and_then(|()| file.sync_all())
                .map_err(|e| PersistenceError::io(&tmp_path, e))?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(|e| PersistenceError::io(&self.path, e))?;
        Ok(json.len())
    }

    /// Read and check the snapshot file. `Ok(None)` when there is none.
    pub fn load(&self) -> Result<Option<SessionSnapshot>, PersistenceError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(PersistenceError::io(&self.path, err)),
        };
        let snapshot: SessionSnapshot = serde_json::from_slice(&raw)?;
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(PersistenceError::IncompatibleSchema {
                found: snapshot.schema_version,
            });
        }
        Ok(Some(snapshot))
    }

    /// Rebuild the session tree from disk. Never fails: unusable snapshots
    /// fall back to the default tree.
    pub fn restore(&self) -> (SessionTree, RestoreReport) {
        let settings = self.config.surfaces;
        let result = self.load().and_then(|snapshot| match snapshot {
            Some(snapshot) if !snapshot.windows.is_empty() => {
                let mut failures = Vec::new();
                let tree = self.rebuild(&snapshot, &mut failures)?;
                Ok(Some((tree, failures)))
            }
            _ => Ok(None),
        });
        let (tree, outcome, replay_failures) = match result {
            Ok(Some((tree, failures))) => (tree, RestoreOutcome::Restored, failures),
            Ok(None) => (SessionTree::bootstrap(settings), RestoreOutcome::Fresh, Vec::new()),
            Err(err) => {
                let moved_to = self.move_aside();
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    moved_to = ?moved_to,
                    "snapshot unusable, starting with a fresh session"
                );
                (
                    SessionTree::bootstrap(settings),
                    RestoreOutcome::Fallback {
                        reason: err.to_string(),
                        moved_to,
                    },
                    Vec::new(),
                )
            }
        };
        let report = RestoreReport {
            outcome,
            path: self.path.clone(),
            windows: tree.windows().len(),
            workspaces: tree.windows().iter().map(|w| w.workspaces().len()).sum(),
            surfaces: tree.all_surfaces().len(),
            replay_failures,
        };
        tracing::info!(
            path = %report.path.display(),
            outcome = ?report.outcome,
            windows = report.windows,
            surfaces = report.surfaces,
            replay_failures = report.replay_failures.len(),
            "session restored"
        );
        (tree, report)
    }

    fn move_aside(&self) -> Option<PathBuf> {
        if !self.path.exists() {
            return None;
        }
        let target = sibling_with_suffix(&self.path, CORRUPT_SUFFIX);
        match std::fs::rename(&self.path, &target) {
            Ok(()) => Some(target),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "could not move snapshot aside");
                None
            }
        }
    }

    /// Build a tree from `snapshot`, adopting every stored ID.
    fn rebuild(
        &self,
        snapshot: &SessionSnapshot,
        failures: &mut Vec<ReplayFailure>,
    ) -> Result<SessionTree, PersistenceError> {
        let mut registry = IdentityRegistry::new();
        let mut restored: HashMap<SurfaceId, SurfaceCapture> = HashMap::new();
        let mut windows = Vec::with_capacity(snapshot.windows.len());
        let mut focused = None;

        for window in &snapshot.windows {
            adopt(&mut registry, EntityKind::Window, &window.id)?;
            let window_id = WindowId::new(window.id.clone());
            if window.focused && focused.is_none() {
                focused = Some(window_id.clone());
            }
            let mut workspaces = Vec::with_capacity(window.workspaces.len());
            let mut selected_ws = None;
            for ws in &window.workspaces {
                adopt(&mut registry, EntityKind::Workspace, &ws.id)?;
                let ws_id = WorkspaceId::new(ws.id.clone());
                if ws.selected && selected_ws.is_none() {
                    selected_ws = Some(ws_id.clone());
                }
                let mut selected_pane = None;
                let seed = self.seed(
                    &ws.layout,
                    &mut registry,
                    &mut selected_pane,
                    &mut restored,
                    failures,
                )?;
                let layout = PaneTree::from_seed(seed)
                    .map_err(|e| PersistenceError::Invalid(e.to_string()))?;
                let selected_pane = match selected_pane {
                    Some(pane) => pane,
                    None => layout.first_leaf_of(layout.root()).ok_or_else(|| {
                        PersistenceError::Invalid(format!("workspace {} has no leaf", ws.id))
                    })?,
                };
                let title = if ws.title.trim().is_empty() {
                    format!("Workspace {}", workspaces.len() + 1)
                } else {
                    ws.title.clone()
                };
                workspaces.push(Workspace::from_parts(ws_id, title, layout, selected_pane));
            }
            if selected_ws.is_none() {
                selected_ws = workspaces.first().map(|ws| ws.id().clone());
            }
            windows.push(Window::from_parts(window_id, workspaces, selected_ws));
        }
        if focused.is_none() {
            focused = windows.first().map(|w| w.id().clone());
        }

        let tree = SessionTree::from_parts(windows, focused, registry, self.config.surfaces);
        tree.validate()
            .map_err(|e| PersistenceError::Invalid(e.to_string()))?;
        *self.last_captures.lock() = restored;
        Ok(tree)
    }

    fn seed(
        &self,
        record: &LayoutRecord,
        registry: &mut IdentityRegistry,
        selected: &mut Option<PaneId>,
        restored: &mut HashMap<SurfaceId, SurfaceCapture>,
        failures: &mut Vec<ReplayFailure>,
    ) -> Result<NodeSeed, PersistenceError> {
        match record {
            LayoutRecord::Leaf {
                id,
                selected: is_selected,
                surface,
            } => {
                adopt(registry, EntityKind::Pane, id)?;
                adopt(registry, EntityKind::Surface, &surface.id)?;
                let pane_id = PaneId::new(id.clone());
                if *is_selected && selected.is_none() {
                    *selected = Some(pane_id.clone());
                }
                let surface_id = SurfaceId::new(surface.id.clone());
                let mut live = Surface::detached(
                    surface_id.clone(),
                    surface.kind,
                    self.config.surfaces.scrollback_limit,
                    self.config.surfaces.rows,
                );
                match &surface.capture {
                    Some(capture) => match live.restore(capture) {
                        Ok(()) => {
                            restored.insert(surface_id, capture.clone());
                        }
                        Err(err) => {
                            tracing::warn!(surface_id = %surface_id, error = %err, "capture replay failed");
                            failures.push(ReplayFailure {
                                surface_id,
                                error: err.to_string(),
                            });
                            live.attach();
                        }
                    },
                    None => live.attach(),
                }
                Ok(NodeSeed::Leaf {
                    id: pane_id,
                    surface: live,
                })
            }
            LayoutRecord::Split {
                id,
                orientation,
                ratio,
                first,
                second,
            } => {
                adopt(registry, EntityKind::Pane, id)?;
                Ok(NodeSeed::Split {
                    id: PaneId::new(id.clone()),
                    orientation: *orientation,
                    ratio: *ratio,
                    first: Box::new(self.seed(first, registry, selected, restored, failures)?),
                    second: Box::new(self.seed(second, registry, selected, restored, failures)?),
                })
            }
        }
    }
}

fn adopt(registry: &mut IdentityRegistry, kind: EntityKind, raw: &str) -> Result<(), PersistenceError> {
    registry
        .adopt(kind, raw)
        .map_err(|e| PersistenceError::Invalid(e.to_string()))
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Direction;
    use crate::surface::SurfaceSpec;

    fn engine(dir: &Path) -> PersistenceEngine {
        PersistenceEngine::new(PersistenceConfig {
            app_id: "dev.trellis/test app".into(),
            dir: dir.to_path_buf(),
            limits: CaptureLimits::default(),
            surfaces: SurfaceSettings::default(),
        })
    }

    #[test]
    fn safe_app_id_replaces_unsafe_chars() {
        assert_eq!(safe_app_id("dev.trellis/test app"), "dev.trellis_test_app");
        assert_eq!(
            snapshot_path(Path::new("/x"), "a:b"),
            PathBuf::from("/x/session-a_b.json")
        );
    }

    #[test]
    fn missing_file_is_fresh() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (tree, report) = engine(tmp.path()).restore();
        assert_eq!(report.outcome, RestoreOutcome::Fresh);
        assert_eq!(tree.windows().len(), 1);
        assert_eq!(tree.all_surfaces().len(), 1);
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(tmp.path());
        std::fs::write(engine.path(), b"{ not json").unwrap();
        let (tree, report) = engine.restore();
        let RestoreOutcome::Fallback { moved_to, .. } = &report.outcome else {
            panic!("expected fallback, got {:?}", report.outcome);
        };
        let moved_to = moved_to.as_ref().unwrap();
        assert!(moved_to.to_string_lossy().ends_with(".json.corrupt"));
        assert!(moved_to.exists());
        assert!(!engine.path().exists());
        assert_eq!(tree.all_surfaces().len(), 1);
        tree.validate().unwrap();
    }

    #[test]
    fn unknown_schema_version_falls_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(tmp.path());
        std::fs::write(
            engine.path(),
            br#"{"schema_version": 99, "app_id": "x", "windows": []}"#,
        )
        .unwrap();
        let (_, report) = engine.restore();
        assert!(matches!(report.outcome, RestoreOutcome::Fallback { .. }));
    }

    #[test]
    fn duplicate_ids_fall_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(tmp.path());
        let doc = serde_json::json!({
            "schema_version": 1,
            "app_id": "x",
            "windows": [{"id": "W", "focused": true, "workspaces": [{
                "id": "W", "title": "dup", "selected": true,
                "layout": {"type": "leaf", "id": "P", "selected": true,
                           "surface": {"id": "S", "type": "terminal"}}
            }]}]
        });
        std::fs::write(engine.path(), doc.to_string()).unwrap();
        let (_, report) = engine.restore();
        assert!(matches!(report.outcome, RestoreOutcome::Fallback { .. }));
    }

    #[test]
    fn missing_markers_are_normalized() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(tmp.path());
        let doc = serde_json::json!({
            "schema_version": 1,
            "app_id": "x",
            "windows": [{"id": "W1", "workspaces": [
                {"id": "A", "title": "a", "layout": {"type": "leaf", "id": "P1",
                    "surface": {"id": "S1", "type": "terminal"}}},
                {"id": "B", "title": "b", "selected": true, "layout": {"type": "split", "id": "X",
                    "orientation": "vertical", "ratio": 0.5,
                    "first": {"type": "leaf", "id": "P2", "surface": {"id": "S2", "type": "terminal"}},
                    "second": {"type": "leaf", "id": "P3", "selected": true,
                               "surface": {"id": "S3", "type": "browser"}}}}
            ]}]
        });
        std::fs::write(engine.path(), doc.to_string()).unwrap();
        let (tree, report) = engine.restore();
        assert_eq!(report.outcome, RestoreOutcome::Restored);
        let window = tree.focused_window().unwrap();
        assert_eq!(window.id().as_str(), "W1");
        assert_eq!(window.selected_workspace_id().unwrap().as_str(), "B");
        assert_eq!(tree.current_pane().unwrap().as_str(), "P3");
        let (_, a) = tree.workspace(&WorkspaceId::new("A")).unwrap();
        assert_eq!(a.selected_pane().as_str(), "P1");
        tree.validate().unwrap();
    }

    #[test]
    fn save_restore_save_is_stable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(tmp.path());
        let mut tree = SessionTree::bootstrap(SurfaceSettings::default());
        let pane = tree.current_pane().unwrap().clone();
        let term = tree.current_surface().unwrap().id().clone();
        tree.send_text(&term, "\u{1b}[1mbold\u{1b}[0m\n").unwrap();
        tree.split_pane(
            &pane,
            Direction::Down,
            &SurfaceSpec::Browser {
                url: Some("https://example.com".into()),
            },
            Some(0.3),
        )
        .unwrap();
        let session = Session::new(tree);
        engine.save(&session, SnapshotTrigger::Manual).unwrap();
        let first = engine.load().unwrap().unwrap();

        let mut previous = first.clone();
        for _ in 0..3 {
            let (tree, report) = engine.restore();
            assert_eq!(report.outcome, RestoreOutcome::Restored);
            let session = Session::new(tree);
            engine.save(&session, SnapshotTrigger::Shutdown).unwrap();
            let mut next = engine.load().unwrap().unwrap();
            next.saved_at_ms = previous.saved_at_ms;
            assert_eq!(next, previous);
            previous = next;
        }
        let (tree, _) = engine.restore();
        assert_eq!(
            tree.read_text(&term, crate::surface::ReadMode::Scrollback).unwrap(),
            "\u{1b}[1mbold\u{1b}[0m\n"
        );
    }

    #[test]
    fn failed_capture_reuses_last_saved_capture() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = engine(tmp.path());
        let tree = SessionTree::bootstrap(SurfaceSettings::default());
        let term = tree.current_surface().unwrap().id().clone();
        let session = Session::new(tree);
        session.write().send_text(&term, "kept\n").unwrap();
        engine.save(&session, SnapshotTrigger::Manual).unwrap();

        session
            .write()
            .mark_terminal_lost(&term, "runtime exited")
            .unwrap();
        let report = engine.save(&session, SnapshotTrigger::Manual).unwrap();
        assert_eq!(report.capture_failures.len(), 1);
        assert!(report.capture_failures[0].reused_previous);

        let (restored, _) = engine.restore();
        assert_eq!(
            restored
                .read_text(&term, crate::surface::ReadMode::Scrollback)
                .unwrap(),
            "kept\n"
        );
    }
}
