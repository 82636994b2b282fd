use crate::errors::LaunchError;
use crate::managers::host_keys::HostIdentity;
use crate::managers::orchestrator::{LaunchHandle, Orchestrator};
use crate::managers::process::{AgentChannel, Coordinator};
use crate::managers::ssh::{Connector, Ssh2Connector};
use crate::services::credentials::{CredentialResolver, FileCredentialResolver};
use crate::services::launch_config::{LaunchConfig, DEFAULT_TRUST_STORE_DIR};
use crate::services::logger::Logger;
use crate::services::registry::LaunchRegistry;
use crate::services::validation::Validation;
use crate::stores::trust_store::TrustStore;
use crate::utils::expand::expand_home_path;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

const CREDENTIALS_ENV: &str = "AGENTBOOT_CREDENTIALS";
const DEFAULT_CREDENTIALS_PATH: &str = "~/.agentboot/credentials.json";

pub struct App {
    pub logger: Logger,
    pub validation: Validation,
    pub registry: Arc<LaunchRegistry>,
    pub orchestrator: Orchestrator,
}

impl App {
    /// Wires the libssh2 transport, file-backed credentials, and the given
    /// coordinator. `credentials_path` falls back to `$AGENTBOOT_CREDENTIALS`,
    /// then `~/.agentboot/credentials.json`.
    pub fn initialize(
        credentials_path: Option<PathBuf>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Result<Self, LaunchError> {
        let logger = Logger::new("agentboot");
        let credentials_path = credentials_path
            .or_else(|| std::env::var(CREDENTIALS_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| expand_home_path(DEFAULT_CREDENTIALS_PATH));
        let credentials: Arc<dyn CredentialResolver> = Arc::new(FileCredentialResolver::new(
            logger.clone(),
            credentials_path,
        ));
        let connector: Arc<dyn Connector> = Arc::new(Ssh2Connector::new(logger.clone()));
        Ok(Self::with_parts(logger, connector, credentials, coordinator))
    }

    pub fn with_parts(
        logger: Logger,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialResolver>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Self {
        let registry = Arc::new(LaunchRegistry::new(logger.clone()));
        let orchestrator = Orchestrator::new(
            logger.clone(),
            registry.clone(),
            connector,
            credentials,
            coordinator,
        );
        Self {
            logger,
            validation: Validation::new(),
            registry,
            orchestrator,
        }
    }

    pub fn load_config(&self, path: &Path) -> Result<LaunchConfig, LaunchError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            LaunchError::invalid_config(format!(
                "Failed to read launch config {}: {}",
                path.display(),
                err
            ))
        })?;
        let value: serde_json::Value = serde_json::from_str(&raw).map_err(|err| {
            LaunchError::invalid_config(format!("Launch config is not valid JSON: {}", err))
        })?;
        LaunchConfig::from_value(&value, &self.validation)
    }

    pub async fn launch_from_file(&self, path: &Path) -> Result<LaunchHandle, LaunchError> {
        let config = self.load_config(path)?;
        self.orchestrator.launch(&config).await
    }

    fn trust_store(store_dir: Option<&Path>) -> TrustStore {
        TrustStore::new(
            store_dir
                .map(expand_home_path)
                .unwrap_or_else(|| expand_home_path(DEFAULT_TRUST_STORE_DIR)),
        )
    }

    /// The host key queued by a manual-only first contact, if any.
    pub fn pending_host_key(
        &self,
        target_id: &str,
        store_dir: Option<&Path>,
    ) -> Result<Option<HostIdentity>, LaunchError> {
        Self::trust_store(store_dir).pending(target_id)
    }

    /// Promotes the queued host key of `target_id` to trusted so the next
    /// launch connects.
    pub fn approve_host_key(
        &self,
        target_id: &str,
        store_dir: Option<&Path>,
    ) -> Result<HostIdentity, LaunchError> {
        let approved = Self::trust_store(store_dir)
            .approve(target_id)?
            .ok_or_else(|| {
                LaunchError::invalid_config(format!(
                    "No host key is pending approval for {}",
                    target_id
                ))
                .with_hint("Launch the target once to queue its host key.")
            })?;
        self.logger.info(
            "host key approved",
            Some(&serde_json::json!({
                "target_id": target_id,
                "algorithm": approved.algorithm(),
                "fingerprint": approved.fingerprint_sha256(),
            })),
        );
        Ok(approved)
    }

    pub fn forget_host_key(
        &self,
        target_id: &str,
        store_dir: Option<&Path>,
    ) -> Result<(), LaunchError> {
        Self::trust_store(store_dir).forget(target_id)?;
        self.logger.info(
            "host key forgotten",
            Some(&serde_json::json!({"target_id": target_id})),
        );
        Ok(())
    }

    /// Host stop hook: tears down every open launch.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}

/// Bridges the agent channel to this process's stdin and stdout, for running
/// the bootstrapper under a coordinator that speaks over a pipe.
pub struct StdioCoordinator {
    logger: Logger,
}

impl StdioCoordinator {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("stdio"),
        }
    }
}

impl StdioCoordinator {
    /// Copies agent output to `output` and `input` to the agent. The end of
    /// `input` only half-closes the agent's stdin; the launch closes when the
    /// agent's output ends.
    pub fn relay<R, W>(&self, channel: AgentChannel, mut input: R, mut output: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let AgentChannel {
            target_id,
            stream,
            close,
            ..
        } = channel;
        let (mut from_agent, mut to_agent) = tokio::io::split(stream);

        let logger = self.logger.clone();
        let out_target = target_id.clone();
        tokio::spawn(async move {
            let cause = match tokio::io::copy(&mut from_agent, &mut output).await {
                Ok(bytes) => {
                    logger.debug(
                        "agent output ended",
                        Some(&serde_json::json!({"target_id": out_target, "bytes": bytes})),
                    );
                    "agent output ended".to_string()
                }
                Err(err) => format!("agent output failed: {}", err),
            };
            let _ = output.flush().await;
            close.close(cause);
        });

        let logger = self.logger.clone();
        tokio::spawn(async move {
            match tokio::io::copy(&mut input, &mut to_agent).await {
                Ok(bytes) => logger.debug(
                    "coordinator input ended, closing agent stdin",
                    Some(&serde_json::json!({"target_id": target_id, "bytes": bytes})),
                ),
                Err(err) => logger.warn(
                    &format!("coordinator input failed: {}", err),
                    Some(&serde_json::json!({"target_id": target_id})),
                ),
            }
            let _ = to_agent.shutdown().await;
        });
    }
}

#[async_trait]
impl Coordinator for StdioCoordinator {
    async fn attach(&self, channel: AgentChannel) -> Result<(), LaunchError> {
        self.relay(channel, tokio::io::stdin(), tokio::io::stdout());
        Ok(())
    }
}
