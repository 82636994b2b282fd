//! Interpreter discovery on the remote host.

use crate::constants::runtime as runtime_constants;
use crate::errors::LaunchError;
use crate::managers::ssh::SessionHandle;
use crate::services::logger::Logger;
use crate::utils::expand::{expand_env_refs, lookup_env};
use crate::utils::shell::remote_join;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

static VERSION_LINE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(?i)\b\w+ version "([^"]+)""#).ok());

/// Where a group of candidate paths comes from. Sources are consulted in the
/// order they are given to the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    /// A path relative to the remote working directory.
    WorkDir(String),
    /// `<value of env var>/<suffix>`, when the variable is set.
    EnvVar { name: String, suffix: String },
    /// Interpreter locations configured for the target.
    ToolLocations,
    FixedPaths(Vec<String>),
}

impl CandidateSource {
    fn candidates(&self, request: &RuntimeRequest) -> Vec<String> {
        match self {
            CandidateSource::WorkDir(relative) => {
                vec![remote_join(&request.remote_dir, relative)]
            }
            CandidateSource::EnvVar { name, suffix } => lookup_env(&request.env, name)
                .filter(|value| !value.trim().is_empty())
                .map(|value| vec![remote_join(value.trim(), suffix)])
                .unwrap_or_default(),
            CandidateSource::ToolLocations => request
                .tool_locations
                .iter()
                .map(|path| expand_env_refs(path, &request.env))
                .collect(),
            CandidateSource::FixedPaths(paths) => paths.clone(),
        }
    }
}

pub fn default_sources() -> Vec<CandidateSource> {
    vec![
        CandidateSource::WorkDir(runtime_constants::WORKDIR_RUNTIME.to_string()),
        CandidateSource::EnvVar {
            name: runtime_constants::HOME_ENV_VAR.to_string(),
            suffix: "bin/java".to_string(),
        },
        CandidateSource::ToolLocations,
        CandidateSource::FixedPaths(
            runtime_constants::WELL_KNOWN_PATHS
                .iter()
                .map(|path| path.to_string())
                .collect(),
        ),
    ]
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeRequest {
    pub remote_dir: String,
    pub explicit_path: Option<String>,
    pub jvm_options: String,
    pub min_version: u32,
    /// Merged environment, node values over global values.
    pub env: Vec<(String, String)>,
    pub tool_locations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRuntime {
    pub path: String,
    pub version: Option<String>,
    pub major: Option<u32>,
}

/// The version string from the first `<word> version "<version>"` line.
pub fn parse_version_output(output: &str) -> Option<String> {
    let re = VERSION_LINE.as_ref()?;
    output
        .lines()
        .find_map(|line| re.captures(line).map(|caps| caps[1].to_string()))
}

/// Major version of a reported version string. Legacy `1.x` numbering maps
/// to `x`.
pub fn major_version(version: &str) -> Option<u32> {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty());
    let leading: u32 = parts.next()?.parse().ok()?;
    if leading == 1 {
        if let Some(minor) = parts.next().and_then(|part| part.parse().ok()) {
            return Some(minor);
        }
    }
    Some(leading)
}

fn probe_command(candidate: &str, jvm_options: &str) -> String {
    if jvm_options.trim().is_empty() {
        format!("{} -version", candidate)
    } else {
        format!("{} {} -version", candidate, jvm_options.trim())
    }
}

pub struct RuntimeResolver {
    logger: Logger,
    sources: Vec<CandidateSource>,
    probe_timeout: Duration,
}

impl RuntimeResolver {
    pub fn new(logger: Logger) -> Self {
        Self::with_sources(logger, default_sources())
    }

    pub fn with_sources(logger: Logger, sources: Vec<CandidateSource>) -> Self {
        Self {
            logger: logger.child("runtime"),
            sources,
            probe_timeout: Duration::from_millis(runtime_constants::PROBE_TIMEOUT_MS),
        }
    }

    /// Ordered, de-duplicated candidate paths for `request`.
    pub fn candidates(&self, request: &RuntimeRequest) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for source in &self.sources {
            for candidate in source.candidates(request) {
                if !candidate.trim().is_empty() && !out.contains(&candidate) {
                    out.push(candidate);
                }
            }
        }
        out
    }

    pub async fn resolve(
        &self,
        session: &SessionHandle,
        request: &RuntimeRequest,
    ) -> Result<ResolvedRuntime, LaunchError> {
        if let Some(explicit) = request.explicit_path.as_deref() {
            return self.resolve_explicit(session, request, explicit).await;
        }

        let candidates = self.candidates(request);
        let mut tried = Vec::new();
        for candidate in &candidates {
            tried.push(candidate.clone());
            let output = match session
                .exec(&probe_command(candidate, &request.jvm_options), self.probe_timeout)
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    self.logger.debug(
                        "runtime probe failed to run",
                        Some(&json!({"candidate": candidate, "error": err.message})),
                    );
                    continue;
                }
            };
            let Some(version) = parse_version_output(&output.combined()) else {
                self.logger.debug(
                    "no version reported",
                    Some(&json!({"candidate": candidate, "exit_code": output.exit_code})),
                );
                continue;
            };
            let major = major_version(&version);
            match major {
                Some(major) if major >= request.min_version => {
                    self.logger.info(
                        "runtime resolved",
                        Some(&json!({"path": candidate, "version": version})),
                    );
                    return Ok(ResolvedRuntime {
                        path: candidate.clone(),
                        version: Some(version),
                        major: Some(major),
                    });
                }
                _ => {
                    self.logger.info(
                        "runtime too old, skipping",
                        Some(&json!({
                            "path": candidate,
                            "version": version,
                            "min_version": request.min_version,
                        })),
                    );
                }
            }
        }

        Err(LaunchError::runtime_not_found(format!(
            "No runtime of version {} or newer found on the remote host",
            request.min_version
        ))
        .with_hint("Install a suitable JDK, or set java_path / tool_locations for the target.")
        .with_details(json!({"tried_paths": tried})))
    }

    /// A configured path is only checked for its version. A path whose
    /// version cannot be read is still used.
    async fn resolve_explicit(
        &self,
        session: &SessionHandle,
        request: &RuntimeRequest,
        explicit: &str,
    ) -> Result<ResolvedRuntime, LaunchError> {
        let path = expand_env_refs(explicit.trim(), &request.env);
        let version = match session
            .exec(&probe_command(&path, &request.jvm_options), self.probe_timeout)
            .await
        {
            Ok(output) => parse_version_output(&output.combined()),
            Err(err) => {
                self.logger.warn(
                    "configured runtime could not be probed",
                    Some(&json!({"path": path, "error": err.message})),
                );
                None
            }
        };
        let major = version.as_deref().and_then(major_version);
        if let Some(found) = major {
            if found < request.min_version {
                return Err(LaunchError::runtime_not_found(format!(
                    "Configured runtime {} reports version {}, below the minimum {}",
                    path,
                    version.as_deref().unwrap_or("?"),
                    request.min_version
                ))
                .with_details(json!({"tried_paths": [path]})));
            }
        } else {
            self.logger.warn(
                "configured runtime did not report a version; using it as is",
                Some(&json!({"path": path})),
            );
        }
        Ok(ResolvedRuntime {
            path,
            version,
            major,
        })
    }
}
