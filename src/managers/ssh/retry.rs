use super::{ConnectOptions, Connector, Endpoint, SessionHandle};
use crate::constants::deploy as deploy_constants;
use crate::constants::limits::JUNK_PREVIEW_BYTES;
use crate::constants::retry::RECOVERABLE_PREFIXES;
use crate::errors::LaunchError;
use crate::managers::host_keys::HostKeyVerifier;
use crate::services::credentials::Credential;
use crate::services::logger::Logger;
use crate::utils::text::truncate_utf8_prefix;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// True when `text` starts with one of the known transient network failure
/// messages.
pub fn classify_connect_failure(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    RECOVERABLE_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u64,
    pub wait: Duration,
    /// Overall budget for all attempts. Zero means unbounded.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_seconds(max_retries: u64, wait_seconds: u64, timeout_seconds: u64) -> Self {
        Self {
            max_retries,
            wait: Duration::from_secs(wait_seconds),
            timeout: Duration::from_secs(timeout_seconds),
        }
    }

    pub fn attempts(&self) -> u64 {
        self.max_retries.saturating_add(1)
    }

    fn deadline(&self, started: Instant) -> Option<Instant> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(started + self.timeout)
        }
    }
}

/// Connection establishment: retrying connect, authentication, and the
/// clean-channel check.
#[derive(Clone)]
pub struct TransportSession {
    logger: Logger,
    connector: Arc<dyn Connector>,
}

impl TransportSession {
    pub fn new(logger: Logger, connector: Arc<dyn Connector>) -> Self {
        Self {
            logger: logger.child("transport"),
            connector,
        }
    }

    /// Connects, retrying only recoverable failures, at most
    /// `policy.max_retries + 1` times.
    pub async fn connect_with_retry(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
        verifier: Arc<dyn HostKeyVerifier>,
        policy: &RetryPolicy,
    ) -> Result<SessionHandle, LaunchError> {
        let started = Instant::now();
        let deadline = policy.deadline(started);
        let attempts = policy.attempts();
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            self.logger.info(
                "connecting",
                Some(&json!({
                    "address": endpoint.address(),
                    "attempt": attempt,
                    "attempts": attempts,
                })),
            );
            let connector = self.connector.clone();
            let target = endpoint.clone();
            let opts = options.clone();
            let policy_verifier = verifier.clone();
            let result = tokio::task::spawn_blocking(move || {
                connector.connect(&target, &opts, policy_verifier.as_ref())
            })
            .await
            .map_err(|err| LaunchError::internal(format!("connect task failed: {}", err)))?;

            let err = match result {
                Ok(session) => {
                    self.logger.info(
                        "connected",
                        Some(&json!({
                            "address": endpoint.address(),
                            "attempt": attempt,
                        })),
                    );
                    return Ok(SessionHandle::new(endpoint.clone(), session));
                }
                Err(err) => err,
            };

            let remaining = attempts - attempt;
            if !err.is_recoverable() || remaining == 0 {
                self.logger.error(
                    "connect failed",
                    Some(&json!({
                        "address": endpoint.address(),
                        "attempt": attempt,
                        "error": err.message,
                        "recoverable": err.is_recoverable(),
                    })),
                );
                if err.is_recoverable() {
                    return Err(LaunchError::connect_terminal(format!(
                        "Failed to connect to {} after {} attempt(s): {}",
                        endpoint.address(),
                        attempt,
                        err.message
                    ))
                    .with_details(json!({"attempts": attempt})));
                }
                return Err(err);
            }

            if let Some(deadline) = deadline {
                if Instant::now() + policy.wait >= deadline {
                    return Err(LaunchError::timeout(format!(
                        "Gave up connecting to {} after {} attempt(s): retry budget exhausted",
                        endpoint.address(),
                        attempt
                    ))
                    .with_details(json!({"attempts": attempt, "last_error": err.message})));
                }
            }

            self.logger.warn(
                &format!(
                    "connect failed, {} retries remaining, waiting {}s",
                    remaining,
                    policy.wait.as_secs_f64()
                ),
                Some(&json!({"address": endpoint.address(), "error": err.message})),
            );
            tokio::time::sleep(policy.wait).await;
        }
    }

    pub async fn authenticate(
        &self,
        session: &SessionHandle,
        credential: Credential,
    ) -> Result<(), LaunchError> {
        let username = credential.username().to_string();
        let method = credential.method();
        session
            .with_session(move |remote| remote.authenticate(&credential))
            .await?;
        self.logger.info(
            "authenticated",
            Some(&json!({"username": username, "method": method})),
        );
        Ok(())
    }

    /// Runs a no-op command; any output means the login environment writes to
    /// the channel and would corrupt the agent protocol.
    pub async fn probe_header_junk(&self, session: &SessionHandle) -> Result<(), LaunchError> {
        let output = session
            .exec(
                "exit 0",
                Duration::from_millis(deploy_constants::COMMAND_TIMEOUT_MS),
            )
            .await?;
        if output.combined_len() == 0 {
            return Ok(());
        }
        let preview = truncate_utf8_prefix(&output.combined(), JUNK_PREVIEW_BYTES);
        Err(LaunchError::header_junk(format!(
            "Login environment writes {} byte(s) to the channel; the agent protocol needs a clean channel",
            output.combined_len()
        ))
        .with_hint("Remove output from the remote shell startup files (.bashrc, .profile, motd for non-interactive logins).")
        .with_details(json!({"preview": preview, "bytes": output.combined_len()})))
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_connect_failure, RetryPolicy};
    use std::time::Duration;

    #[test]
    fn recoverable_texts_match_by_prefix() {
        assert!(classify_connect_failure("Connection refused (os error 111)"));
        assert!(classify_connect_failure("connection timed out"));
        assert!(classify_connect_failure("premature connection close: banner"));
        assert!(!classify_connect_failure("Permission denied"));
        assert!(!classify_connect_failure("failed: connection refused"));
    }

    #[test]
    fn attempts_are_retries_plus_one() {
        let policy = RetryPolicy::from_seconds(2, 0, 0);
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.wait, Duration::ZERO);
    }
}
