use crate::constants::deploy as deploy_constants;
use crate::constants::teardown as teardown_constants;
use crate::errors::LaunchError;
use crate::managers::process::ProcessHandle;
use crate::managers::ssh::SessionHandle;
use crate::services::logger::Logger;
use crate::services::registry::{LaunchRegistry, LaunchState};
use crate::utils::shell::double_quote;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;

#[derive(Default)]
struct LaunchResources {
    session: Option<SessionHandle>,
    process: Option<Arc<ProcessHandle>>,
    artifact: Option<String>,
}

/// Releases everything one launch acquired. Resources are registered as the
/// stages acquire them, so a cancelled launch cleans up whatever it got to.
///
/// `run` is idempotent: only the first call touches the network, later and
/// concurrent calls just wait for it to finish. It aborts the stage worker and
/// waits for it to end before releasing the target, and anything the worker
/// tries to register afterwards is closed on the spot.
pub struct Teardown {
    logger: Logger,
    registry: Arc<LaunchRegistry>,
    target_id: String,
    launch_id: String,
    started: AtomicBool,
    resources: Mutex<LaunchResources>,
    worker: Mutex<Option<AbortHandle>>,
    worker_alive: Arc<watch::Sender<bool>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// Held by the stage worker; dropping it (completion or abort) marks the
/// worker as ended.
pub struct WorkerGuard {
    alive: Arc<watch::Sender<bool>>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.alive.send_replace(false);
    }
}

fn torn_down() -> LaunchError {
    LaunchError::cancelled("Launch was torn down while it was in progress")
}

impl Teardown {
    pub fn new(
        logger: Logger,
        registry: Arc<LaunchRegistry>,
        target_id: &str,
        launch_id: &str,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            logger: logger.child("teardown"),
            registry,
            target_id: target_id.to_string(),
            launch_id: launch_id.to_string(),
            started: AtomicBool::new(false),
            resources: Mutex::new(LaunchResources::default()),
            worker: Mutex::new(None),
            worker_alive: Arc::new(watch::channel(false).0),
            done_tx,
            done_rx,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Registers a resource unless teardown has begun. Returns the resource
    /// back when it was refused.
    fn try_track<T>(&self, item: T, store: impl FnOnce(&mut LaunchResources, T)) -> Option<T> {
        let Ok(mut resources) = self.resources.lock() else {
            return Some(item);
        };
        if self.is_started() {
            return Some(item);
        }
        store(&mut *resources, item);
        None
    }

    pub fn track_session(&self, session: SessionHandle) -> Result<(), LaunchError> {
        match self.try_track(session, |r, session| r.session = Some(session)) {
            None => Ok(()),
            Some(session) => {
                tokio::spawn(async move { session.close().await });
                Err(torn_down())
            }
        }
    }

    pub fn track_process(&self, process: Arc<ProcessHandle>) -> Result<(), LaunchError> {
        match self.try_track(process, |r, process| r.process = Some(process)) {
            None => Ok(()),
            Some(process) => {
                tokio::spawn(async move { process.close().await });
                Err(torn_down())
            }
        }
    }

    pub fn track_artifact(&self, remote_path: &str) -> Result<(), LaunchError> {
        match self.try_track(remote_path.to_string(), |r, path| r.artifact = Some(path)) {
            None => Ok(()),
            Some(_) => Err(torn_down()),
        }
    }

    /// Marks the stage worker as alive until the guard is dropped.
    pub fn worker_guard(&self) -> WorkerGuard {
        self.worker_alive.send_replace(true);
        WorkerGuard {
            alive: self.worker_alive.clone(),
        }
    }

    /// Hands over the stage worker so teardown can stop it. A worker attached
    /// after teardown began is aborted immediately.
    pub fn attach_worker(&self, abort: AbortHandle) {
        if let Ok(mut worker) = self.worker.lock() {
            if !self.is_started() {
                *worker = Some(abort);
                return;
            }
        }
        abort.abort();
    }

    async fn stop_worker(&self) {
        let abort = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(abort) = abort {
            abort.abort();
        }
        let mut alive = self.worker_alive.subscribe();
        let ended = async {
            while *alive.borrow_and_update() {
                if alive.changed().await.is_err() {
                    return;
                }
            }
        };
        let grace = Duration::from_millis(teardown_constants::PROCESS_CLOSE_GRACE_MS);
        if tokio::time::timeout(grace, ended).await.is_err() {
            self.logger.warn(
                "launch worker did not stop in time",
                Some(&json!({"target_id": self.target_id, "launch_id": self.launch_id})),
            );
        }
    }

    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Resolves once teardown has completed.
    pub async fn wait(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn run(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            self.wait().await;
            return;
        }
        self.registry
            .set_state(&self.target_id, &self.launch_id, LaunchState::TearingDown);
        self.stop_worker().await;
        let resources = self
            .resources
            .lock()
            .map(|mut guard| std::mem::take(&mut *guard))
            .unwrap_or_default();

        if let Some(process) = resources.process {
            process.close().await;
        }
        if let (Some(path), Some(session)) = (resources.artifact.as_deref(), &resources.session) {
            self.delete_artifact(session, path).await;
        }
        if let Some(session) = resources.session {
            let grace = Duration::from_millis(teardown_constants::PROCESS_CLOSE_GRACE_MS);
            if tokio::time::timeout(grace, session.close()).await.is_err() {
                self.logger.warn(
                    "session close did not finish in time, abandoning it",
                    Some(&json!({"target_id": self.target_id})),
                );
            }
        }

        self.registry.release(&self.target_id, &self.launch_id);
        self.done_tx.send_replace(true);
        self.logger.info(
            "teardown complete",
            Some(&json!({"target_id": self.target_id, "launch_id": self.launch_id})),
        );
    }

    /// Best effort: failures and timeouts are logged, never escalated.
    async fn delete_artifact(&self, session: &SessionHandle, path: &str) {
        let cap = Duration::from_millis(teardown_constants::ARTIFACT_DELETE_TIMEOUT_MS);
        let command = format!("rm -f {}", double_quote(path));
        let exec_timeout = Duration::from_millis(deploy_constants::COMMAND_TIMEOUT_MS).min(cap);
        match tokio::time::timeout(cap, session.exec(&command, exec_timeout)).await {
            Ok(Ok(output)) if output.success() => {
                self.logger
                    .debug("deployed payload removed", Some(&json!({"path": path})));
            }
            Ok(Ok(output)) => self.logger.warn(
                "failed to remove deployed payload",
                Some(&json!({"path": path, "exit_code": output.exit_code})),
            ),
            Ok(Err(err)) => self.logger.warn(
                "failed to remove deployed payload",
                Some(&json!({"path": path, "error": err.message})),
            ),
            Err(_) => self.logger.warn(
                "removing deployed payload timed out, abandoning it",
                Some(&json!({"path": path})),
            ),
        }
    }
}
