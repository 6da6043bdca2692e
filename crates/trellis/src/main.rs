//! trellis: host process and control-socket client.

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

use trellis_core::client::{ClientError, ControlClient};
use trellis_core::config::Config;
use trellis_core::logging::{init_logging, is_logging_initialized};
use trellis_core::query::{self, TreeView};
use trellis_core::server::SocketMode;

/// Environment variable naming the surface a command runs in.
const ENV_SURFACE_ID: &str = "TRELLIS_SURFACE_ID";

#[derive(Parser, Debug)]
#[command(
    name = "trellis",
    about = "Terminal/browser multiplexer host and control client",
    author,
    version
)]
struct Cli {
    /// Control socket path
    #[arg(long, global = true, env = "TRELLIS_SOCKET_PATH", value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Config file (default: <config dir>/trellis/trellis.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the host: restore, serve the control socket, save on exit
    Serve {
        /// restricted (default) or allow-all
        #[arg(long, value_parser = parse_socket_mode)]
        socket_mode: Option<SocketMode>,
    },
    /// Print the window hierarchy
    Tree {
        /// Every window instead of the focused one
        #[arg(long)]
        all: bool,
        /// Only this workspace (id or workspace:N)
        #[arg(long, value_name = "HANDLE")]
        workspace: Option<String>,
    },
    /// Show server identity and capabilities
    Identify,
    /// Check that the host answers
    Ping,
    /// Send a structured call
    Call {
        /// Namespaced method, e.g. workspace.list
        method: String,
        /// JSON object of parameters
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Send a line command
    Raw {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        line: Vec<String>,
    },
}

fn parse_socket_mode(raw: &str) -> Result<SocketMode, String> {
    SocketMode::parse(raw).ok_or_else(|| format!("invalid socket mode '{raw}' (restricted or allow-all)"))
}

fn main() {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start runtime: {err}");
            std::process::exit(1);
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(code) => std::process::exit(code),
        Err(err) if is_broken_pipe(&err) => std::process::exit(0),
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(hint) = remediation_for(&err) {
                eprint!("{hint}");
            }
            std::process::exit(1);
        }
    }
}

fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|e| e.kind() == io::ErrorKind::BrokenPipe)
    })
}

fn remediation_for(err: &anyhow::Error) -> Option<String> {
    err.chain().find_map(|cause| {
        if let Some(client) = cause.downcast_ref::<ClientError>() {
            return client.remediation().map(|r| r.render_plain());
        }
        cause
            .downcast_ref::<trellis_core::Error>()
            .and_then(trellis_core::Error::remediation)
            .map(|r| r.render_plain())
    })
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path).map_err(trellis_core::Error::from)?,
        None => Config::load().map_err(trellis_core::Error::from)?,
    };
    config.apply_env().map_err(trellis_core::Error::from)?;
    if let Some(socket) = &cli.socket {
        config.socket.path.clone_from(socket);
    }
    if let Command::Serve {
        socket_mode: Some(mode),
    } = &cli.command
    {
        config.socket.mode = *mode;
    }
    config.validate().map_err(trellis_core::Error::from)?;
    Ok(config)
}

/// Write to stdout; a closed pipe surfaces as `BrokenPipe`.
fn emit(text: &str) -> io::Result<()> {
    let mut out = io::stdout().lock();
    out.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        out.write_all(b"\n")?;
    }
    out.flush()
}

fn emit_json(value: &Value) -> anyhow::Result<()> {
    emit(&serde_json::to_string_pretty(value)?)?;
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(&cli)?;
    match &cli.command {
        Command::Serve { .. } => serve(&config).await,
        Command::Tree { all, workspace } => {
            let client = ControlClient::new(&config.socket.path);
            let mut params = json!({ "all": all });
            if let Some(ws) = workspace {
                params["workspace"] = json!(ws);
            }
            if let Ok(surface) = std::env::var(ENV_SURFACE_ID) {
                if !surface.trim().is_empty() {
                    params["caller_surface"] = json!(surface.trim());
                }
            }
            let result = client.call("system.tree", params).await?;
            if cli.json {
                emit_json(&result)?;
            } else {
                let view: TreeView =
                    serde_json::from_value(result).context("unexpected system.tree result")?;
                emit(&query::render_text(&view))?;
            }
            Ok(0)
        }
        Command::Identify => {
            let client = ControlClient::new(&config.socket.path);
            let result = client.call("system.identify", json!({})).await?;
            if cli.json {
                emit_json(&result)?;
            } else {
                let methods = result["methods"].as_array().map_or(0, Vec::len);
                emit(&format!(
                    "{} {}\nsocket: {} ({})\nmethods: {methods}",
                    result["name"].as_str().unwrap_or("trellis"),
                    result["version"].as_str().unwrap_or("?"),
                    result["socket_path"].as_str().unwrap_or("?"),
                    result["socket_mode"].as_str().unwrap_or("?"),
                ))?;
            }
            Ok(0)
        }
        Command::Ping => {
            let client = ControlClient::new(&config.socket.path);
            let pong = client.ping().await?;
            if cli.json {
                emit_json(&json!({ "pong": pong }))?;
            } else {
                emit(if pong { "PONG" } else { "unexpected ping reply" })?;
            }
            Ok(if pong { 0 } else { 1 })
        }
        Command::Call { method, params } => {
            let params: Value =
                serde_json::from_str(params).context("--params must be a JSON object")?;
            if !params.is_object() {
                bail!("--params must be a JSON object");
            }
            let client = ControlClient::new(&config.socket.path);
            let response = client.call_raw(method, params).await?;
            emit(&serde_json::to_string_pretty(&response)?)?;
            Ok(if response.ok { 0 } else { 1 })
        }
        Command::Raw { line } => {
            let client = ControlClient::new(&config.socket.path);
            let body = client.send_line(&join_line(line)).await?;
            emit(&body)?;
            Ok(if body.starts_with("ERROR") { 1 } else { 0 })
        }
    }
}

/// Rebuild a command line from shell words, quoting words with spaces.
fn join_line(words: &[String]) -> String {
    words
        .iter()
        .map(|word| {
            if word.is_empty() || word.chars().any(char::is_whitespace) {
                format!("\"{}\"", word.replace('"', "\\\""))
            } else {
                word.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

async fn serve(config: &Config) -> anyhow::Result<i32> {
    if !is_logging_initialized() {
        init_logging(&config.logging).context("failed to initialize logging")?;
    }
    let host = trellis_core::host::start(config)
        .with_context(|| format!("failed to start host on {}", config.socket.path.display()))?;
    emit(&format!("listening on {}", host.socket_path().display()))?;

    wait_for_shutdown_signal().await?;
    tracing::info!("shutdown requested");
    let report = host.shutdown().await?;
    tracing::info!(
        path = %report.path.display(),
        surfaces = report.surfaces,
        "final snapshot written"
    );
    Ok(0)
}

async fn wait_for_shutdown_signal() -> io::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
