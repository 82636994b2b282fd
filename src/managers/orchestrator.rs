//! Sequences one launch: connect, authenticate, probe, resolve the runtime,
//! deploy, start, bridge. The stages run on a dedicated task under the launch
//! timeout; any failure or timeout runs the launch's teardown.

use crate::errors::LaunchError;
use crate::managers::deploy::{ArtifactDeployer, DeployReport, DeploymentTarget};
use crate::managers::process::{
    AgentChannel, CloseSignal, Coordinator, ProcessHandle, ProcessLauncher, StartRequest,
};
use crate::managers::runtime::{ResolvedRuntime, RuntimeRequest, RuntimeResolver};
use crate::managers::ssh::{Connector, TransportSession};
use crate::managers::stage::{Stage, StageTracker};
use crate::managers::teardown::{Teardown, WorkerGuard};
use crate::services::credentials::CredentialResolver;
use crate::services::diagnostics::{DiagnosticSink, LoggerSink};
use crate::services::launch_config::LaunchConfig;
use crate::services::logger::Logger;
use crate::services::registry::{LaunchRegistry, LaunchState};
use crate::utils::expand::merge_env;
use bytes::Bytes;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Builds the diagnostic sink for a target's remote stderr.
pub type DiagnosticsFactory = Arc<dyn Fn(&str) -> Arc<dyn DiagnosticSink> + Send + Sync>;

type SharedTracker = Arc<Mutex<StageTracker>>;

fn current_stage(tracker: &SharedTracker) -> Stage {
    tracker
        .lock()
        .map(|tracker| tracker.current())
        .unwrap_or(Stage::Failed)
}

/// A launch that reached `Running`.
pub struct LaunchHandle {
    launch_id: String,
    target_id: String,
    stages: SharedTracker,
    runtime: ResolvedRuntime,
    deploy: DeployReport,
    process: Arc<ProcessHandle>,
    teardown: Arc<Teardown>,
}

impl LaunchHandle {
    pub fn launch_id(&self) -> &str {
        &self.launch_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.stages
            .lock()
            .map(|tracker| tracker.history().to_vec())
            .unwrap_or_default()
    }

    pub fn state(&self) -> Stage {
        current_stage(&self.stages)
    }

    pub fn runtime(&self) -> &ResolvedRuntime {
        &self.runtime
    }

    pub fn deploy_report(&self) -> &DeployReport {
        &self.deploy
    }

    pub fn process(&self) -> &Arc<ProcessHandle> {
        &self.process
    }

    pub async fn teardown(&self) {
        self.teardown.run().await;
    }

    pub fn is_closed(&self) -> bool {
        self.teardown.is_done()
    }

    /// Resolves once the launch has been torn down, whoever triggered it.
    pub async fn closed(&self) {
        self.teardown.wait().await;
    }
}

struct StagesOutcome {
    runtime: ResolvedRuntime,
    deploy: DeployReport,
    process: Arc<ProcessHandle>,
    close_rx: watch::Receiver<Option<String>>,
}

struct LaunchContext {
    logger: Logger,
    config: LaunchConfig,
    payload: Bytes,
    transport: TransportSession,
    credentials: Arc<dyn CredentialResolver>,
    coordinator: Arc<dyn Coordinator>,
    diagnostics: DiagnosticsFactory,
    tracker: SharedTracker,
    attempting: Arc<Mutex<Stage>>,
    teardown: Arc<Teardown>,
    _worker: WorkerGuard,
}

impl LaunchContext {
    /// Records the stage currently being worked on, for timeout reporting.
    fn attempt(&self, stage: Stage) {
        if let Ok(mut attempting) = self.attempting.lock() {
            *attempting = stage;
        }
    }

    fn enter(&self, stage: Stage) {
        if let Ok(mut tracker) = self.tracker.lock() {
            tracker.advance(stage);
        }
        self.logger.debug(
            "stage reached",
            Some(&json!({"target_id": self.config.target_id, "stage": stage})),
        );
    }

    async fn run(self) -> Result<StagesOutcome, LaunchError> {
        let config = &self.config;
        self.enter(Stage::Connecting);
        self.attempt(Stage::Connecting);
        let verifier = config
            .host_key
            .build(&config.endpoint, &config.target_id, &self.logger)
            .map_err(|err| err.at_stage(Stage::Connecting))?;
        let session = self
            .transport
            .connect_with_retry(
                &config.endpoint,
                &config.connect_options(),
                verifier,
                &config.retry_policy(),
            )
            .await
            .map_err(|err| err.at_stage(Stage::Connecting))?;
        self.teardown
            .track_session(session.clone())
            .map_err(|err| err.at_stage(Stage::Connecting))?;

        self.attempt(Stage::Authenticated);
        let credential = self
            .credentials
            .resolve(&config.credentials_id)
            .await
            .and_then(|found| {
                found.ok_or_else(|| {
                    LaunchError::auth(format!(
                        "No credential found for id {}",
                        config.credentials_id
                    ))
                })
            })
            .map_err(|err| err.at_stage(Stage::Authenticated))?;
        self.transport
            .authenticate(&session, credential)
            .await
            .map_err(|err| err.at_stage(Stage::Authenticated))?;
        self.enter(Stage::Authenticated);

        self.attempt(Stage::Probed);
        self.transport
            .probe_header_junk(&session)
            .await
            .map_err(|err| err.at_stage(Stage::Probed))?;
        self.enter(Stage::Probed);

        self.attempt(Stage::RuntimeResolved);
        let request = RuntimeRequest {
            remote_dir: config.remote_dir().to_string(),
            explicit_path: config.java_path.clone(),
            jvm_options: config.jvm_options.clone(),
            min_version: config.min_runtime_version,
            env: merge_env(&[&config.global_env, &config.runtime_env]),
            tool_locations: config.tool_locations.clone(),
        };
        let runtime = RuntimeResolver::new(self.logger.clone())
            .resolve(&session, &request)
            .await
            .map_err(|err| err.at_stage(Stage::RuntimeResolved))?;
        self.enter(Stage::RuntimeResolved);

        self.attempt(Stage::Deployed);
        let target = DeploymentTarget::new(
            config.remote_dir(),
            &config.payload_name,
            self.payload.clone(),
        );
        self.teardown
            .track_artifact(&target.remote_path())
            .map_err(|err| err.at_stage(Stage::Deployed))?;
        let deploy = ArtifactDeployer::new(self.logger.clone(), config.digest_check)
            .deploy(&session, &target)
            .await
            .map_err(|err| err.at_stage(Stage::Deployed))?;
        self.enter(Stage::Deployed);

        self.attempt(Stage::Started);
        let launcher = ProcessLauncher::new(self.logger.clone());
        let sink = (self.diagnostics)(&config.target_id);
        let start = StartRequest {
            java_path: runtime.path.clone(),
            remote_dir: config.remote_dir().to_string(),
            jvm_options: config.jvm_options.clone(),
            payload_name: config.payload_name.clone(),
            extra_params: config.extra_params.clone(),
            prefix: config.prefix_start_command.clone(),
            suffix: config.suffix_start_command.clone(),
        };
        let (process, stream) = launcher
            .start(&session, &start, sink.clone())
            .await
            .map_err(|err| err.at_stage(Stage::Started))?;
        self.teardown
            .track_process(process.clone())
            .map_err(|err| err.at_stage(Stage::Started))?;
        self.enter(Stage::Started);

        self.attempt(Stage::Bridged);
        let (close, close_rx) = CloseSignal::channel();
        let channel = AgentChannel {
            target_id: config.target_id.clone(),
            stream,
            diagnostics: sink,
            close,
        };
        launcher
            .bridge(self.coordinator.as_ref(), channel, &process)
            .await
            .map_err(|err| err.at_stage(Stage::Bridged))?;
        self.enter(Stage::Bridged);

        Ok(StagesOutcome {
            runtime,
            deploy,
            process,
            close_rx,
        })
    }
}

pub struct Orchestrator {
    logger: Logger,
    registry: Arc<LaunchRegistry>,
    transport: TransportSession,
    credentials: Arc<dyn CredentialResolver>,
    coordinator: Arc<dyn Coordinator>,
    diagnostics: DiagnosticsFactory,
}

impl Orchestrator {
    pub fn new(
        logger: Logger,
        registry: Arc<LaunchRegistry>,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialResolver>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        let logger = logger.child("launch");
        let sink_logger = logger.clone();
        let diagnostics: DiagnosticsFactory = Arc::new(move |target_id: &str| {
            Arc::new(LoggerSink::new(sink_logger.clone(), target_id)) as Arc<dyn DiagnosticSink>
        });
        Self {
            transport: TransportSession::new(logger.clone(), connector),
            logger,
            registry,
            credentials,
            coordinator,
            diagnostics,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsFactory) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn registry(&self) -> &Arc<LaunchRegistry> {
        &self.registry
    }

    pub async fn launch(&self, config: &LaunchConfig) -> Result<LaunchHandle, LaunchError> {
        let launch_id = uuid::Uuid::new_v4().to_string();
        let target_id = config.target_id.clone();
        self.registry.claim(&target_id, &launch_id)?;

        let teardown = Arc::new(Teardown::new(
            self.logger.clone(),
            self.registry.clone(),
            &target_id,
            &launch_id,
        ));
        self.registry
            .attach_teardown(&target_id, &launch_id, teardown.clone());
        let tracker: SharedTracker = Arc::new(Mutex::new(StageTracker::new()));

        self.logger.info(
            "launch requested",
            Some(&json!({
                "target_id": target_id,
                "launch_id": launch_id,
                "address": config.endpoint.address(),
                "timeout_seconds": config.launch_timeout_seconds,
            })),
        );

        let result = match tokio::fs::read(&config.payload_path).await {
            Ok(payload) => {
                let context = LaunchContext {
                    logger: self.logger.clone(),
                    config: config.clone(),
                    payload: Bytes::from(payload),
                    transport: self.transport.clone(),
                    credentials: self.credentials.clone(),
                    coordinator: self.coordinator.clone(),
                    diagnostics: self.diagnostics.clone(),
                    tracker: tracker.clone(),
                    attempting: Arc::new(Mutex::new(Stage::Idle)),
                    teardown: teardown.clone(),
                    _worker: teardown.worker_guard(),
                };
                self.run_with_timeout(context, config).await
            }
            Err(err) => Err(LaunchError::invalid_config(format!(
                "Payload {} is not readable: {}",
                config.payload_path.display(),
                err
            ))
            .at_stage(Stage::Idle)),
        };

        let result = result.and_then(|outcome| {
            if teardown.is_started() {
                Err(LaunchError::cancelled("Launch was torn down before it finished starting")
                    .at_stage(Stage::Bridged))
            } else {
                Ok(outcome)
            }
        });

        match result {
            Ok(outcome) => {
                if let Ok(mut stages) = tracker.lock() {
                    stages.advance(Stage::Running);
                }
                self.registry
                    .set_state(&target_id, &launch_id, LaunchState::Running);
                self.logger.info(
                    "agent running",
                    Some(&json!({
                        "target_id": target_id,
                        "launch_id": launch_id,
                        "runtime": outcome.runtime.path,
                        "deploy": outcome.deploy.method,
                    })),
                );
                self.spawn_close_listener(
                    &target_id,
                    teardown.clone(),
                    outcome.process.clone(),
                    outcome.close_rx,
                );
                Ok(LaunchHandle {
                    launch_id,
                    target_id,
                    stages: tracker,
                    runtime: outcome.runtime,
                    deploy: outcome.deploy,
                    process: outcome.process,
                    teardown,
                })
            }
            Err(err) => {
                if let Ok(mut stages) = tracker.lock() {
                    stages.fail();
                }
                let mut meta = err.log_meta();
                meta["target_id"] = json!(target_id);
                meta["launch_id"] = json!(launch_id);
                self.logger
                    .error(&format!("launch failed: {}", err.message), Some(&meta));
                teardown.run().await;
                Err(err)
            }
        }
    }

    async fn run_with_timeout(
        &self,
        context: LaunchContext,
        config: &LaunchConfig,
    ) -> Result<StagesOutcome, LaunchError> {
        let attempting = context.attempting.clone();
        let stage_in_flight = move || attempting.lock().map(|stage| *stage).unwrap_or(Stage::Idle);
        let teardown = context.teardown.clone();
        let worker = tokio::spawn(context.run());
        let abort = worker.abort_handle();
        teardown.attach_worker(worker.abort_handle());
        match tokio::time::timeout(config.launch_timeout(), worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_cancelled() => Err(LaunchError::cancelled(format!(
                "Launch of {} was torn down while in progress",
                config.target_id
            ))
            .at_stage(stage_in_flight())),
            Ok(Err(join_err)) => Err(LaunchError::internal(format!(
                "launch worker failed: {}",
                join_err
            ))
            .at_stage(stage_in_flight())),
            Err(_) => {
                abort.abort();
                Err(LaunchError::timeout(format!(
                    "Launch of {} did not complete within {}s",
                    config.target_id, config.launch_timeout_seconds
                ))
                .at_stage(stage_in_flight()))
            }
        }
    }

    /// Tears the launch down when the coordinator closes the channel or the
    /// remote process ends, whichever comes first.
    fn spawn_close_listener(
        &self,
        target_id: &str,
        teardown: Arc<Teardown>,
        process: Arc<ProcessHandle>,
        mut close_rx: watch::Receiver<Option<String>>,
    ) {
        let logger = self.logger.clone();
        let target_id = target_id.to_string();
        tokio::spawn(async move {
            let cause = tokio::select! {
                changed = close_rx.changed() => match changed {
                    Ok(()) => close_rx
                        .borrow()
                        .clone()
                        .unwrap_or_else(|| "closed".to_string()),
                    Err(_) => "channel dropped".to_string(),
                },
                exit = process.exited() => match exit {
                    Some(info) => format!(
                        "remote process ended (exit {:?}, signal {:?})",
                        info.exit_code, info.signal
                    ),
                    None => "remote process ended".to_string(),
                },
                _ = teardown.wait() => return,
            };
            logger.info(
                "agent channel closed",
                Some(&json!({"target_id": target_id, "cause": cause})),
            );
            teardown.run().await;
        });
    }
}
