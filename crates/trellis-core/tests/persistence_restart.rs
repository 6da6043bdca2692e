//! Session survival across simulated host restarts.

use std::path::Path;

use trellis_core::identity::{SurfaceId, WorkspaceId};
use trellis_core::layout::Direction;
use trellis_core::persistence::{
    PersistenceConfig, PersistenceEngine, RestoreOutcome, SnapshotTrigger,
};
use trellis_core::session::{Session, SessionTree, SurfaceSettings};
use trellis_core::surface::{CaptureLimits, ReadMode, SurfaceSpec};

fn engine(dir: &Path) -> PersistenceEngine {
    PersistenceEngine::new(PersistenceConfig {
        app_id: "dev.trellis.restart-test".to_string(),
        dir: dir.to_path_buf(),
        limits: CaptureLimits::default(),
        surfaces: SurfaceSettings::default(),
    })
}

/// Save `tree` the way a shutdown does, then restore it.
fn restart(engine: &PersistenceEngine, tree: SessionTree) -> SessionTree {
    let session = Session::new(tree);
    engine.save(&session, SnapshotTrigger::Shutdown).unwrap();
    let (tree, report) = engine.restore();
    assert_eq!(report.outcome, RestoreOutcome::Restored);
    assert!(report.replay_failures.is_empty());
    tree.validate().unwrap();
    tree
}

fn selected_surface(tree: &SessionTree, ws: &WorkspaceId) -> SurfaceId {
    let (_, workspace) = tree.workspace(ws).unwrap();
    workspace.selected_surface().unwrap().id().clone()
}

#[test]
fn unselected_workspace_keeps_its_scrollback_across_two_restarts() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());

    let mut tree = SessionTree::bootstrap(SurfaceSettings::default());
    let window = tree.focused_window_id().unwrap().clone();
    let a = tree.current_workspace().unwrap().id().clone();
    let b = tree
        .create_workspace(&window, &SurfaceSpec::Terminal, Some("B"))
        .unwrap()
        .workspace_id;

    let a_term = selected_surface(&tree, &a);
    let b_term = selected_surface(&tree, &b);
    tree.send_text(&a_term, "marker-a\n").unwrap();
    tree.send_text(&b_term, "marker-b\n").unwrap();
    tree.select_workspace(&window, &a).unwrap();

    let tree = restart(&engine, tree);
    let tree = restart(&engine, tree);

    assert_eq!(tree.current_workspace().unwrap().id(), &a);
    let b_text = tree.read_text(&b_term, ReadMode::Scrollback).unwrap();
    assert!(b_text.contains("marker-b"), "lost scrollback: {b_text:?}");
    let a_text = tree.read_text(&a_term, ReadMode::Scrollback).unwrap();
    assert!(a_text.contains("marker-a"));
}

#[test]
fn every_window_and_split_survives() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());

    let mut tree = SessionTree::bootstrap(SurfaceSettings::default());
    let first_window = tree.focused_window_id().unwrap().clone();
    let pane = tree.current_pane().unwrap().clone();
    let browser = tree
        .split_pane(
            &pane,
            Direction::Right,
            &SurfaceSpec::Browser {
                url: Some("https://example.com/docs".to_string()),
            },
            Some(0.4),
        )
        .unwrap();
    tree.navigate(&browser.surface_id, "https://example.com/api").unwrap();

    let second_window = tree.create_window();
    tree.create_workspace(&second_window, &SurfaceSpec::Terminal, Some("ops"))
        .unwrap();
    tree.focus_window(&first_window).unwrap();

    let before_windows = tree.window_ids();
    let before_surfaces = tree.all_surfaces().len();
    let tree = restart(&engine, tree);

    assert_eq!(tree.window_ids(), before_windows);
    assert_eq!(tree.all_surfaces().len(), before_surfaces);
    assert_eq!(tree.focused_window_id(), Some(&first_window));
    let restored = tree.surface(&browser.surface_id).unwrap();
    assert_eq!(restored.url(), Some("https://example.com/api"));
    assert_eq!(tree.current_pane(), Some(&browser.pane_id));

    let ops = tree
        .window(&second_window)
        .and_then(|w| w.selected_workspace())
        .unwrap();
    assert_eq!(ops.title(), "ops");
}

#[test]
fn restored_ids_are_reserved_for_new_entities() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());

    let tree = SessionTree::bootstrap(SurfaceSettings::default());
    let mut tree = restart(&engine, tree);
    let old: Vec<SurfaceId> = tree
        .all_surfaces()
        .into_iter()
        .map(|(loc, _)| loc.surface_id)
        .collect();
    let pane = tree.current_pane().unwrap().clone();
    let created = tree
        .split_pane(&pane, Direction::Down, &SurfaceSpec::Terminal, None)
        .unwrap();
    assert!(!old.contains(&created.surface_id));
    tree.validate().unwrap();
}

#[test]
fn empty_snapshot_starts_fresh() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());

    let mut tree = SessionTree::bootstrap(SurfaceSettings::default());
    let window = tree.focused_window_id().unwrap().clone();
    tree.close_window(&window).unwrap();
    engine
        .save(&Session::new(tree), SnapshotTrigger::Manual)
        .unwrap();

    let (tree, report) = engine.restore();
    assert_eq!(report.outcome, RestoreOutcome::Fresh);
    assert_eq!(tree.windows().len(), 1);
    assert!(tree.current_surface().is_some());
}

#[test]
fn truncated_snapshot_is_moved_aside() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = engine(tmp.path());
    engine
        .save(
            &Session::new(SessionTree::bootstrap(SurfaceSettings::default())),
            SnapshotTrigger::Manual,
        )
        .unwrap();
    let raw = std::fs::read(engine.path()).unwrap();
    std::fs::write(engine.path(), &raw[..raw.len() / 2]).unwrap();

    let (tree, report) = engine.restore();
    match report.outcome {
        RestoreOutcome::Fallback { moved_to, .. } => {
            let moved_to = moved_to.unwrap();
            assert!(moved_to.exists());
            assert!(!engine.path().exists());
        }
        other => panic!("expected fallback, got {other:?}"),
    }
    tree.validate().unwrap();
}
