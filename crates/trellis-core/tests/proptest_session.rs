//! Property-based tests for the session tree.
//!
//! Random sequences of structural operations must leave the tree valid,
//! keep every selection pointing at a live entity and survive a
//! save/restore cycle unchanged.

use proptest::prelude::*;

use trellis_core::layout::Direction;
use trellis_core::persistence::{
    PersistenceConfig, PersistenceEngine, RestoreOutcome, SnapshotTrigger,
};
use trellis_core::session::{Session, SessionTree, SurfaceSettings};
use trellis_core::surface::{CaptureLimits, SurfaceSpec};

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Split { pane: usize, direction: Direction, browser: bool },
    ClosePane { pane: usize },
    SelectPane { pane: usize },
    NewWorkspace,
    SelectWorkspace { workspace: usize },
    CloseWorkspace { workspace: usize },
    MoveWorkspace { workspace: usize, window: usize },
    NewWindow,
    FocusWindow { window: usize },
    CloseWindow { window: usize },
    Resize { pane: usize, ratio: f64 },
}

fn arb_direction() -> impl Strategy<Value = Direction> {
    prop_oneof![
        Just(Direction::Left),
        Just(Direction::Right),
        Just(Direction::Up),
        Just(Direction::Down),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0usize..8, arb_direction(), any::<bool>())
            .prop_map(|(pane, direction, browser)| Op::Split { pane, direction, browser }),
        4 => (0usize..8).prop_map(|pane| Op::ClosePane { pane }),
        3 => (0usize..8).prop_map(|pane| Op::SelectPane { pane }),
        2 => Just(Op::NewWorkspace),
        2 => (0usize..4).prop_map(|workspace| Op::SelectWorkspace { workspace }),
        1 => (0usize..4).prop_map(|workspace| Op::CloseWorkspace { workspace }),
        1 => (0usize..4, 0usize..3)
            .prop_map(|(workspace, window)| Op::MoveWorkspace { workspace, window }),
        1 => Just(Op::NewWindow),
        1 => (0usize..3).prop_map(|window| Op::FocusWindow { window }),
        1 => (0usize..3).prop_map(|window| Op::CloseWindow { window }),
        1 => (0usize..8, -0.5f64..1.5).prop_map(|(pane, ratio)| Op::Resize { pane, ratio }),
    ]
}

// =============================================================================
// Driver
// =============================================================================

/// Apply `op`; operations on missing targets are skipped and errors from
/// rejected operations are ignored.
fn apply(tree: &mut SessionTree, op: &Op) {
    let panes = tree
        .current_workspace()
        .map(|ws| ws.panes())
        .unwrap_or_default();
    let workspaces = tree
        .focused_window()
        .map(|w| w.workspace_ids())
        .unwrap_or_default();
    let windows = tree.window_ids();

    match op {
        Op::Split { pane, direction, browser } => {
            if let Some(target) = panes.get(pane % panes.len().max(1)) {
                let spec = if *browser {
                    SurfaceSpec::Browser { url: None }
                } else {
                    SurfaceSpec::Terminal
                };
                let _ = tree.split_pane(target, *direction, &spec, None);
            }
        }
        Op::ClosePane { pane } => {
            if let Some(target) = panes.get(pane % panes.len().max(1)) {
                let _ = tree.close_pane(target);
            }
        }
        Op::SelectPane { pane } => {
            if let (Some(target), Some(ws)) = (
                panes.get(pane % panes.len().max(1)),
                tree.current_workspace().map(|ws| ws.id().clone()),
            ) {
                let _ = tree.select_pane(&ws, target);
            }
        }
        Op::NewWorkspace => {
            if let Some(window) = tree.focused_window_id().cloned() {
                let _ = tree.create_workspace(&window, &SurfaceSpec::Terminal, None);
            }
        }
        Op::SelectWorkspace { workspace } => {
            if let (Some(target), Some(window)) = (
                workspaces.get(workspace % workspaces.len().max(1)),
                tree.focused_window_id().cloned(),
            ) {
                let _ = tree.select_workspace(&window, target);
            }
        }
        Op::CloseWorkspace { workspace } => {
            if let Some(target) = workspaces.get(workspace % workspaces.len().max(1)) {
                let _ = tree.close_workspace(target);
            }
        }
        Op::MoveWorkspace { workspace, window } => {
            if let (Some(ws), Some(win)) = (
                workspaces.get(workspace % workspaces.len().max(1)),
                windows.get(window % windows.len().max(1)),
            ) {
                let _ = tree.move_workspace(ws, win);
            }
        }
        Op::NewWindow => {
            let window = tree.create_window();
            let _ = tree.create_workspace(&window, &SurfaceSpec::Terminal, None);
        }
        Op::FocusWindow { window } => {
            if let Some(target) = windows.get(window % windows.len().max(1)) {
                let _ = tree.focus_window(target);
            }
        }
        Op::CloseWindow { window } => {
            // Keep at least one window so later operations have a target.
            if windows.len() > 1 {
                let _ = tree.close_window(&windows[window % windows.len()]);
            }
        }
        Op::Resize { pane, ratio } => {
            if let Some(target) = panes.get(pane % panes.len().max(1)) {
                if let Ok(applied) = tree.resize_split(target, *ratio) {
                    assert!(applied > 0.0 && applied < 1.0, "ratio {applied} not clamped");
                }
            }
        }
    }
}

fn assert_selections_live(tree: &SessionTree) {
    if tree.windows().is_empty() {
        assert!(tree.focused_window_id().is_none());
        return;
    }
    let focused = tree.focused_window_id().expect("focused window");
    assert!(tree.window(focused).is_some());
    for window in tree.windows() {
        match window.selected_workspace_id() {
            None => assert!(window.workspaces().is_empty()),
            Some(id) => assert!(window.workspace(id).is_some()),
        }
        for ws in window.workspaces() {
            assert!(ws.layout().is_leaf(ws.selected_pane()));
            assert!(ws.selected_surface().is_some());
        }
    }
}

fn engine(dir: &std::path::Path) -> PersistenceEngine {
    PersistenceEngine::new(PersistenceConfig {
        app_id: "dev.trellis.proptest".to_string(),
        dir: dir.to_path_buf(),
        limits: CaptureLimits::default(),
        surfaces: SurfaceSettings::default(),
    })
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn random_operations_keep_tree_valid(ops in proptest::collection::vec(arb_op(), 1..60)) {
        let mut tree = SessionTree::bootstrap(SurfaceSettings::default());
        for op in &ops {
            apply(&mut tree, op);
            prop_assert!(tree.validate().is_ok(), "invalid after {:?}: {:?}", op, tree.validate());
            assert_selections_live(&tree);
        }
    }

    #[test]
    fn surface_ids_are_never_reused(ops in proptest::collection::vec(arb_op(), 1..40)) {
        let mut tree = SessionTree::bootstrap(SurfaceSettings::default());
        let mut seen = std::collections::HashSet::new();
        for op in &ops {
            let before: std::collections::HashSet<String> = tree
                .all_surfaces()
                .into_iter()
                .map(|(loc, _)| loc.surface_id.as_str().to_string())
                .collect();
            apply(&mut tree, op);
            for (loc, _) in tree.all_surfaces() {
                let id = loc.surface_id.as_str().to_string();
                if !before.contains(&id) {
                    prop_assert!(seen.insert(id.clone()), "surface id {} reused", id);
                }
                seen.insert(id);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn save_restore_preserves_structure(ops in proptest::collection::vec(arb_op(), 1..30)) {
        let mut tree = SessionTree::bootstrap(SurfaceSettings::default());
        for op in &ops {
            apply(&mut tree, op);
        }
        let windows = tree.window_ids();
        let surfaces: Vec<_> = tree
            .all_surfaces()
            .into_iter()
            .map(|(loc, _)| loc.surface_id)
            .collect();
        let current = tree.current_surface().map(|s| s.id().clone());
        let has_surfaces = !surfaces.is_empty();

        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path());
        engine.save(&Session::new(tree), SnapshotTrigger::Shutdown).unwrap();
        let (restored, report) = engine.restore();

        if windows.is_empty() {
            prop_assert_eq!(report.outcome, RestoreOutcome::Fresh);
        } else {
            prop_assert_eq!(report.outcome, RestoreOutcome::Restored);
            prop_assert_eq!(restored.window_ids(), windows);
            let restored_surfaces: Vec<_> = restored
                .all_surfaces()
                .into_iter()
                .map(|(loc, _)| loc.surface_id)
                .collect();
            prop_assert_eq!(restored_surfaces, surfaces);
            if has_surfaces {
                prop_assert_eq!(restored.current_surface().map(|s| s.id().clone()), current);
            }
        }
        prop_assert!(restored.validate().is_ok());
    }
}
