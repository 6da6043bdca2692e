//! End-to-end host runs: restore, serve, mutate over the socket, restart.

use std::path::Path;

use serde_json::json;

use trellis_core::client::ControlClient;
use trellis_core::config::Config;
use trellis_core::host;
use trellis_core::persistence::RestoreOutcome;
use trellis_core::query::TreeView;
use trellis_core::server::SocketMode;

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.app_id = "dev.trellis.e2e".to_string();
    config.socket.path = dir.join("run").join("trellis.sock");
    config.socket.mode = SocketMode::AllowAll;
    config.snapshot.dir = dir.join("sessions");
    config.snapshot.autosave = false;
    config
}

#[tokio::test]
async fn workspace_state_survives_host_restarts() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path());

    // First run: two workspaces with distinct scrollback, A left selected.
    let running = host::start(&config).unwrap();
    let client = ControlClient::new(running.socket_path());
    let a = client.send_line("current_workspace").await.unwrap();
    client.send_line("send \"marker-a\\n\"").await.unwrap();
    let b = client
        .send_line("new_workspace B")
        .await
        .unwrap()
        .trim_start_matches("OK ")
        .to_string();
    client.send_line("send \"marker-b\\n\"").await.unwrap();
    assert_eq!(client.send_line(&format!("select_workspace {a}")).await.unwrap(), "OK");
    running.shutdown().await.unwrap();

    for _ in 0..2 {
        let running = host::start(&config).unwrap();
        assert_eq!(running.restore_report().outcome, RestoreOutcome::Restored);
        let client = ControlClient::new(running.socket_path());
        assert_eq!(client.send_line("current_workspace").await.unwrap(), a);

        let b_surface = client
            .call("surface.list", json!({ "workspace": b }))
            .await
            .unwrap()["surfaces"][0]["id"]
            .as_str()
            .unwrap()
            .to_string();
        let read = client
            .call(
                "surface.read_text",
                json!({ "surface": b_surface, "scrollback": true }),
            )
            .await
            .unwrap();
        assert!(read["text"].as_str().unwrap().contains("marker-b"));
        running.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn manual_save_and_tree_over_the_socket() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path());
    let running = host::start(&config).unwrap();
    let client = ControlClient::new(running.socket_path());

    let saved = client.send_line("save_session").await.unwrap();
    assert!(saved.starts_with("OK "), "{saved}");
    assert!(saved.ends_with("surfaces=1"));
    assert!(running.snapshot_path().exists());

    let opened = client
        .call(
            "browser.open_split",
            json!({ "url": "https://example.com", "direction": "down" }),
        )
        .await
        .unwrap();
    let caller = client.call("surface.list", json!({})).await.unwrap()["surfaces"][0]["id"]
        .as_str()
        .unwrap()
        .to_string();

    let raw = client
        .call("system.tree", json!({ "caller_surface": caller }))
        .await
        .unwrap();
    let view: TreeView = serde_json::from_value(raw).unwrap();
    let active = view.active.unwrap();
    assert_eq!(active.surface_id.as_deref(), opened["surface_id"].as_str());
    assert_eq!(view.caller.unwrap().surface_id.as_deref(), Some(caller.as_str()));
    assert_eq!(view.windows.len(), 1);

    let text = client.send_line("tree").await.unwrap();
    assert!(text.contains("[browser]"), "{text}");

    let report = running.shutdown().await.unwrap();
    assert_eq!(report.surfaces, 2);
}

#[tokio::test]
async fn new_windows_are_counted_and_listed() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path());
    let running = host::start(&config).unwrap();
    let client = ControlClient::new(running.socket_path());

    let created = client.send_line("new_window").await.unwrap();
    assert!(created.starts_with("OK "));
    let tree = client.call("system.tree", json!({ "all": true })).await.unwrap();
    assert_eq!(tree["windows"].as_array().unwrap().len(), 2);
    let focused = client.call("window.current", json!({})).await.unwrap();
    assert_eq!(
        Some(focused["window_id"].as_str().unwrap()),
        created.strip_prefix("OK ")
    );

    let listing = client.send_line("list_windows").await.unwrap();
    assert_eq!(listing.lines().count(), 2);
    assert!(listing.lines().nth(1).unwrap().starts_with("* 1 "));

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn corrupt_snapshot_falls_back_and_host_still_serves() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path());
    let running = host::start(&config).unwrap();
    let snapshot = running.snapshot_path().to_path_buf();
    running.shutdown().await.unwrap();

    std::fs::write(&snapshot, b"{ not json").unwrap();
    let running = host::start(&config).unwrap();
    assert!(matches!(
        running.restore_report().outcome,
        RestoreOutcome::Fallback { .. }
    ));
    let client = ControlClient::new(running.socket_path());
    assert!(client.ping().await.unwrap());
    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_saves_a_request_still_in_flight() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.socket.request_timeout_ms = 50;
    let running = host::start(&config).unwrap();

    let session = std::sync::Arc::clone(running.session());
    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let holder = std::thread::spawn(move || {
        let _guard = session.write();
        let _ = locked_tx.send(());
        std::thread::sleep(std::time::Duration::from_millis(300));
    });
    locked_rx.recv().unwrap();

    let client = ControlClient::new(running.socket_path());
    let reply = client.send_line("new_workspace Pending").await.unwrap();
    assert!(reply.starts_with("ERROR: request timed out"), "{reply}");
    running.shutdown().await.unwrap();
    holder.join().unwrap();

    let running = host::start(&config).unwrap();
    let client = ControlClient::new(running.socket_path());
    let listing = client.send_line("list_workspaces").await.unwrap();
    assert!(listing.lines().any(|l| l.ends_with(" Pending")), "{listing}");
    running.shutdown().await.unwrap();
}
