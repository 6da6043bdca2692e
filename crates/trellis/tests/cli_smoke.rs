//! CLI smoke tests
//!
//! Runs the `trellis` binary against sockets and config files in a temp
//! directory so nothing touches the real runtime or data directories.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Build a trellis command isolated from the caller's environment.
#[allow(deprecated)]
fn trellis_cmd(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("trellis").expect("trellis binary should be built");
    cmd.arg("--config").arg(config);
    cmd.env_remove("TRELLIS_SOCKET_PATH");
    cmd.env_remove("TRELLIS_SURFACE_ID");
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Write a config placing the socket and snapshots under `dir`.
fn write_config(dir: &Path) -> (PathBuf, PathBuf) {
    let socket = dir.join("trellis.sock");
    let config = dir.join("trellis.toml");
    std::fs::write(
        &config,
        format!(
            "app_id = \"dev.trellis.smoke\"\n\n[socket]\npath = \"{}\"\nmode = \"allow-all\"\n\n[snapshot]\ndir = \"{}\"\n",
            socket.display(),
            dir.join("sessions").display()
        ),
    )
    .unwrap();
    (config, socket)
}

/// Emit an artifact for CI debugging.
fn emit_artifact(label: &str, content: &str) {
    eprintln!("[ARTIFACT][cli-smoke] {label}:\n{content}");
}

// =============================================================================
// Offline commands
// =============================================================================

#[test]
fn help_lists_subcommands() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, _) = write_config(tmp.path());
    trellis_cmd(&config)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("tree"))
        .stdout(predicate::str::contains("identify"));
}

#[test]
fn ping_without_host_explains_how_to_start_one() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, _) = write_config(tmp.path());
    trellis_cmd(&config)
        .arg("ping")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not running"))
        .stderr(predicate::str::contains("trellis serve"));
}

#[test]
fn call_rejects_non_object_params() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, _) = write_config(tmp.path());
    trellis_cmd(&config)
        .args(["call", "system.ping", "--params", "[1,2]"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON object"));
}

#[test]
fn invalid_config_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let config = tmp.path().join("bad.toml");
    std::fs::write(&config, "[socket]\nrequest_timeout_ms = 0\n").unwrap();
    trellis_cmd(&config)
        .arg("ping")
        .assert()
        .failure()
        .stderr(predicate::str::contains("request_timeout_ms"));
}

#[test]
fn unknown_socket_mode_is_a_usage_error() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, _) = write_config(tmp.path());
    trellis_cmd(&config)
        .args(["serve", "--socket-mode", "everyone"])
        .assert()
        .failure()
        .code(2);
}

// =============================================================================
// Against a running host
// =============================================================================

struct HostProcess(std::process::Child);

impl Drop for HostProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[allow(deprecated)]
fn spawn_host(config: &Path, socket: &Path) -> HostProcess {
    let child = std::process::Command::new(assert_cmd::cargo::cargo_bin("trellis"))
        .arg("--config")
        .arg(config)
        .arg("serve")
        .env_remove("TRELLIS_SOCKET_PATH")
        .env("TRELLIS_LOG_LEVEL", "warn")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .expect("spawn trellis serve");
    let host = HostProcess(child);
    let deadline = Instant::now() + Duration::from_secs(10);
    while !socket.exists() {
        assert!(Instant::now() < deadline, "host never created {}", socket.display());
        std::thread::sleep(Duration::from_millis(20));
    }
    host
}

#[test]
fn serve_then_drive_over_the_socket() {
    let tmp = tempfile::tempdir().unwrap();
    let (config, socket) = write_config(tmp.path());
    let _host = spawn_host(&config, &socket);

    trellis_cmd(&config)
        .arg("ping")
        .assert()
        .success()
        .stdout(predicate::str::contains("PONG"));

    let output = trellis_cmd(&config)
        .args(["--json", "identify"])
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    emit_artifact("identify", &stdout);
    assert!(output.status.success());
    let identify: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(identify["socket_mode"], "allow-all");

    trellis_cmd(&config)
        .args(["raw", "new_workspace", "Build", "Logs"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("OK "));

    trellis_cmd(&config)
        .args(["raw", "frobnicate"])
        .assert()
        .failure()
        .stdout(predicate::str::starts_with("ERROR: Unknown command"));

    trellis_cmd(&config)
        .arg("tree")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"Build Logs\""));

    trellis_cmd(&config)
        .args(["call", "workspace.list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ok\": true"));

    trellis_cmd(&config)
        .args(["call", "workspace.select", "--params", r#"{"workspace":"workspace:7"}"#])
        .assert()
        .failure()
        .stdout(predicate::str::contains("not_found"));
}
