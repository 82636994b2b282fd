use crate::constants::deploy::DEFAULT_PAYLOAD_NAME;
use crate::constants::network::SSH_DEFAULT_PORT;
use crate::constants::retry::{DEFAULT_MAX_RETRIES, DEFAULT_WAIT_SECONDS, LAUNCH_TIMEOUT_MARGIN_SECONDS};
use crate::constants::runtime::DEFAULT_MIN_VERSION;
use crate::errors::LaunchError;
use crate::managers::host_keys::HostKeyStrategy;
use crate::managers::ssh::{ConnectOptions, Endpoint, RetryPolicy};
use crate::services::validation::Validation;
use crate::utils::expand::expand_home_path;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TRUST_STORE_DIR: &str = "~/.agentboot/trusted_keys";

/// Everything one launch needs, validated up front.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub target_id: String,
    pub endpoint: Endpoint,
    pub credentials_id: String,
    pub jvm_options: String,
    pub java_path: Option<String>,
    pub prefix_start_command: String,
    pub suffix_start_command: String,
    pub launch_timeout_seconds: u64,
    pub max_num_retries: u64,
    pub retry_wait_time: u64,
    pub tcp_no_delay: bool,
    pub remote_fs: String,
    pub work_dir: Option<String>,
    pub payload_path: PathBuf,
    pub payload_name: String,
    pub extra_params: String,
    pub min_runtime_version: u32,
    pub runtime_env: Vec<(String, String)>,
    pub global_env: Vec<(String, String)>,
    pub tool_locations: Vec<String>,
    pub digest_check: bool,
    pub host_key: HostKeyStrategy,
}

impl LaunchConfig {
    pub fn from_value(value: &Value, validation: &Validation) -> Result<Self, LaunchError> {
        if !value.is_object() {
            return Err(LaunchError::invalid_config("launch config must be a JSON object"));
        }
        let required = |key: &str| -> Result<String, LaunchError> {
            let raw = value.get(key).ok_or_else(|| {
                LaunchError::invalid_config(format!("{} is required", key))
            })?;
            validation.ensure_string(raw, key, true)
        };

        let target_id = validation.ensure_identifier(&required("target_id")?, "target_id")?;
        let host = required("host")?;
        let port = validation.ensure_port(value.get("port"), Some(SSH_DEFAULT_PORT))?;
        let credentials_id = required("credentials_id")?;
        let remote_fs = required("remote_fs")?;
        let payload_path = expand_home_path(required("payload_path")?);

        let max_num_retries = validation.ensure_non_negative(
            value.get("max_num_retries"),
            "max_num_retries",
            DEFAULT_MAX_RETRIES,
        )?;
        let retry_wait_time = validation.ensure_non_negative(
            value.get("retry_wait_time"),
            "retry_wait_time",
            DEFAULT_WAIT_SECONDS,
        )?;
        let derived_timeout = max_num_retries
            .saturating_mul(retry_wait_time)
            .saturating_add(LAUNCH_TIMEOUT_MARGIN_SECONDS);
        let launch_timeout_seconds = match validation.ensure_non_negative(
            value.get("launch_timeout_seconds"),
            "launch_timeout_seconds",
            0,
        )? {
            0 => derived_timeout,
            explicit => explicit,
        };
        let min_runtime_version = validation.ensure_non_negative(
            value.get("min_runtime_version"),
            "min_runtime_version",
            DEFAULT_MIN_VERSION as u64,
        )?;
        let min_runtime_version = u32::try_from(min_runtime_version).map_err(|_| {
            LaunchError::invalid_config("min_runtime_version is out of range")
        })?;

        Ok(Self {
            target_id,
            endpoint: Endpoint::new(host, port),
            credentials_id,
            jvm_options: validation.ensure_text(value.get("jvm_options"), "jvm_options")?,
            java_path: validation.ensure_optional_string(value.get("java_path"), "java_path", true)?,
            prefix_start_command: validation
                .ensure_text(value.get("prefix_start_command"), "prefix_start_command")?,
            suffix_start_command: validation
                .ensure_text(value.get("suffix_start_command"), "suffix_start_command")?,
            launch_timeout_seconds,
            max_num_retries,
            retry_wait_time,
            tcp_no_delay: validation.ensure_bool(value.get("tcp_no_delay"), "tcp_no_delay", true)?,
            remote_fs,
            work_dir: validation.ensure_optional_string(value.get("work_dir"), "work_dir", true)?,
            payload_path,
            payload_name: validation
                .ensure_optional_string(value.get("payload_name"), "payload_name", true)?
                .unwrap_or_else(|| DEFAULT_PAYLOAD_NAME.to_string()),
            extra_params: validation.ensure_text(value.get("extra_params"), "extra_params")?,
            min_runtime_version,
            runtime_env: validation.ensure_string_map(value.get("runtime_env"), "runtime_env")?,
            global_env: validation.ensure_string_map(value.get("global_env"), "global_env")?,
            tool_locations: validation
                .ensure_string_list(value.get("tool_locations"), "tool_locations")?,
            digest_check: validation.ensure_bool(value.get("digest_check"), "digest_check", true)?,
            host_key: parse_host_key_strategy(value.get("host_key_verification"), validation)?,
        })
    }

    /// Directory the payload is deployed to and started from.
    pub fn remote_dir(&self) -> &str {
        self.work_dir.as_deref().unwrap_or(&self.remote_fs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_seconds(
            self.max_num_retries,
            self.retry_wait_time,
            self.launch_timeout_seconds,
        )
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            tcp_no_delay: self.tcp_no_delay,
            ..ConnectOptions::default()
        }
    }
}

fn parse_host_key_strategy(
    value: Option<&Value>,
    validation: &Validation,
) -> Result<HostKeyStrategy, LaunchError> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(HostKeyStrategy::KnownHosts {
            path: HostKeyStrategy::default_known_hosts_path(),
        });
    };
    let strategy = value
        .get("strategy")
        .map(|raw| validation.ensure_string(raw, "host_key_verification.strategy", true))
        .transpose()?
        .ok_or_else(|| {
            LaunchError::invalid_config("host_key_verification.strategy is required")
        })?;
    match strategy.as_str() {
        "blind_trust" => Ok(HostKeyStrategy::BlindTrust),
        "known_hosts" => {
            let path = validation
                .ensure_optional_string(value.get("path"), "host_key_verification.path", true)?
                .map(expand_home_path)
                .unwrap_or_else(HostKeyStrategy::default_known_hosts_path);
            Ok(HostKeyStrategy::KnownHosts { path })
        }
        "manual" => {
            let raw = value.get("key").ok_or_else(|| {
                LaunchError::invalid_config("host_key_verification.key is required for manual")
            })?;
            let key = validation.ensure_string(raw, "host_key_verification.key", true)?;
            Ok(HostKeyStrategy::Manual { key })
        }
        "trust_on_first_use" => Ok(HostKeyStrategy::TrustOnFirstUse {
            manual_only: validation.ensure_bool(
                value.get("manual_only"),
                "host_key_verification.manual_only",
                false,
            )?,
            store_dir: validation
                .ensure_optional_string(
                    value.get("store_dir"),
                    "host_key_verification.store_dir",
                    true,
                )?
                .map(expand_home_path)
                .unwrap_or_else(|| expand_home_path(DEFAULT_TRUST_STORE_DIR)),
        }),
        other => Err(LaunchError::invalid_config(format!(
            "Unknown host_key_verification.strategy: {}",
            other
        ))
        .with_hint("Use blind_trust, known_hosts, manual, or trust_on_first_use.")),
    }
}
