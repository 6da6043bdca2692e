//! Host lifecycle: restore, serve, autosave, final save.
//!
//! ```text
//! start:    restore snapshot ─► Session ─► bind socket ─► spawn server
//!                                                      └► spawn autosave
//! shutdown: stop server ─► drain requests ─► stop autosave ─► final save (trigger=shutdown)
//! ```
//!
//! All process-wide state lives in [`RunningHost`]; nothing is global.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::persistence::{PersistenceEngine, RestoreReport, SaveReport, SnapshotTrigger};
use crate::server::{ControlServer, ServerOptions};
use crate::session::Session;

/// A started host process.
pub struct RunningHost {
    session: Arc<Session>,
    engine: Arc<PersistenceEngine>,
    restore: RestoreReport,
    options: ServerOptions,
    server_shutdown: mpsc::Sender<()>,
    server_task: JoinHandle<()>,
    autosave: Option<(mpsc::Sender<()>, JoinHandle<()>)>,
}

/// Restore the last snapshot, bind the control socket and start serving.
///
/// Must be called inside a tokio runtime.
pub fn start(config: &Config) -> Result<RunningHost> {
    let engine = Arc::new(PersistenceEngine::new(config.persistence()));
    let (tree, restore) = engine.restore();
    let session = Arc::new(Session::new(tree));

    let options = config.server_options();
    let dispatcher =
        Dispatcher::new(Arc::clone(&session), options.info()).with_persistence(Arc::clone(&engine));
    let mutations = dispatcher.mutation_notifier();
    let server = ControlServer::bind(&options, dispatcher)?;

    let (server_shutdown, shutdown_rx) = mpsc::channel(1);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    let autosave = config.snapshot.autosave.then(|| {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(autosave_loop(
            Arc::clone(&session),
            Arc::clone(&engine),
            mutations,
            Duration::from_millis(config.snapshot.autosave_debounce_ms),
            stop_rx,
        ));
        (stop_tx, task)
    });

    tracing::info!(
        app_id = %config.app_id,
        socket = %options.socket_path.display(),
        snapshot = %engine.path().display(),
        autosave = config.snapshot.autosave,
        "host started"
    );
    Ok(RunningHost {
        session,
        engine,
        restore,
        options,
        server_shutdown,
        server_task,
        autosave,
    })
}

impl RunningHost {
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    #[must_use]
    pub fn restore_report(&self) -> &RestoreReport {
        &self.restore
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.options.socket_path
    }

    #[must_use]
    pub fn snapshot_path(&self) -> &Path {
        self.engine.path()
    }

    /// Stop serving and write the final snapshot. The server task returns
    /// only after running requests finish, so their mutations are saved.
    pub async fn shutdown(self) -> Result<SaveReport> {
        let _ = self.server_shutdown.send(()).await;
        if let Err(e) = self.server_task.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
        if let Some((stop, task)) = self.autosave {
            let _ = stop.send(()).await;
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "autosave task ended abnormally");
            }
        }
        let report = save_blocking(&self.session, &self.engine, SnapshotTrigger::Shutdown).await?;
        tracing::info!(path = %report.path.display(), "host stopped");
        Ok(report)
    }
}

async fn save_blocking(
    session: &Arc<Session>,
    engine: &Arc<PersistenceEngine>,
    trigger: SnapshotTrigger,
) -> Result<SaveReport> {
    let session = Arc::clone(session);
    let engine = Arc::clone(engine);
    tokio::task::spawn_blocking(move || engine.save(&session, trigger))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
        .map_err(Error::from)
}

/// Save after mutations, coalescing bursts within `debounce`.
async fn autosave_loop(
    session: Arc<Session>,
    engine: Arc<PersistenceEngine>,
    mutations: Arc<Notify>,
    debounce: Duration,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut saved_revision = session.revision();
    loop {
        tokio::select! {
            () = mutations.notified() => {}
            _ = stop_rx.recv() => break,
        }
        tokio::select! {
            () = tokio::time::sleep(debounce) => {}
            _ = stop_rx.recv() => break,
        }
        let revision = session.revision();
        if revision == saved_revision {
            continue;
        }
        match save_blocking(&session, &engine, SnapshotTrigger::Mutation).await {
            Ok(_) => saved_revision = revision,
            Err(e) => tracing::warn!(error = %e, "autosave failed"),
        }
    }
    tracing::debug!("autosave stopped");
}
