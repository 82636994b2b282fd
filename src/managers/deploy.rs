use crate::constants::deploy as deploy_constants;
use crate::errors::{LaunchError, LaunchErrorKind};
use crate::managers::ssh::{FileTransfer, SessionHandle};
use crate::services::logger::Logger;
use crate::utils::shell::{double_quote, remote_join, single_quote};
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// The payload and where it goes. Computed once per launch.
#[derive(Debug, Clone)]
pub struct DeploymentTarget {
    remote_dir: String,
    payload_name: String,
    payload: Bytes,
    digest: String,
}

impl DeploymentTarget {
    pub fn new(remote_dir: &str, payload_name: &str, payload: Bytes) -> Self {
        let digest = hex::encode(Sha256::digest(&payload));
        Self {
            remote_dir: remote_dir.to_string(),
            payload_name: payload_name.to_string(),
            payload,
            digest,
        }
    }

    pub fn remote_dir(&self) -> &str {
        &self.remote_dir
    }

    pub fn payload_name(&self) -> &str {
        &self.payload_name
    }

    pub fn remote_path(&self) -> String {
        remote_join(&self.remote_dir, &self.payload_name)
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    /// Remote content already matched; nothing was written.
    None,
    Sftp,
    Scp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    pub remote_path: String,
    pub method: TransferMethod,
    pub bytes_written: u64,
}

impl DeployReport {
    pub fn already_current(&self) -> bool {
        self.method == TransferMethod::None
    }
}

/// Shell script that prints the SHA-256 of `remote_path` with whichever tool
/// the host has, or a marker when it has none.
pub fn build_remote_sha256_command(remote_path: &str) -> String {
    let quoted = single_quote(remote_path);
    [
        format!("PATH_ARG={}", quoted),
        "if command -v sha256sum >/dev/null 2>&1; then sha256sum -- \"$PATH_ARG\" 2>/dev/null | awk '{print $1}'; exit 0; fi".to_string(),
        "if command -v shasum >/dev/null 2>&1; then shasum -a 256 -- \"$PATH_ARG\" 2>/dev/null | awk '{print $1}'; exit 0; fi".to_string(),
        "if command -v openssl >/dev/null 2>&1; then openssl dgst -sha256 -- \"$PATH_ARG\" 2>/dev/null | awk '{print $NF}'; exit 0; fi".to_string(),
        format!("echo \"{}\"", deploy_constants::NO_DIGEST_MARKER),
        "exit 127".to_string(),
    ]
    .join("\n")
}

/// Accepts the remote output only when it is exactly one 64-digit hex
/// string. Anything else (tool missing, file missing, locale noise) is None.
pub fn parse_remote_digest(output: &str) -> Option<String> {
    let trimmed = output.trim();
    if trimmed.len() != deploy_constants::SHA256_HEX_LEN {
        return None;
    }
    if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// `/a/b/c` → `["/a", "/a/b", "/a/b/c"]`; relative paths keep their form.
fn ancestors(dir: &str) -> Vec<String> {
    let absolute = dir.starts_with('/');
    let mut current = String::new();
    let mut out = Vec::new();
    for part in dir.split('/').filter(|part| !part.is_empty() && *part != ".") {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        out.push(current.clone());
    }
    out
}

/// Creates `dir` and its missing parents. An existing non-directory
/// anywhere on the way is a terminal error, raised before anything is
/// created.
fn ensure_remote_dir(transfer: &mut dyn FileTransfer, dir: &str) -> Result<(), LaunchError> {
    let mut missing = Vec::new();
    for path in ancestors(dir) {
        match transfer.stat(&path)? {
            Some(stat) if stat.is_dir => {}
            Some(_) => {
                return Err(LaunchError::deploy(format!(
                    "Remote path {} exists and is not a directory",
                    path
                ))
                .with_hint("Remove the file or point remote_fs/work_dir at a directory."));
            }
            None => missing.push(path),
        }
    }
    for path in missing {
        transfer.mkdir(&path, deploy_constants::DIRECTORY_MODE)?;
    }
    Ok(())
}

fn upload_via_transfer(
    transfer: &mut dyn FileTransfer,
    target: &DeploymentTarget,
) -> Result<u64, LaunchError> {
    ensure_remote_dir(transfer, target.remote_dir())?;
    let path = target.remote_path();
    transfer.remove(&path)?;
    transfer.write(&path, &target.payload, deploy_constants::PAYLOAD_MODE)
}

pub struct ArtifactDeployer {
    logger: Logger,
    digest_check: bool,
    command_timeout: Duration,
}

impl ArtifactDeployer {
    pub fn new(logger: Logger, digest_check: bool) -> Self {
        Self {
            logger: logger.child("deploy"),
            digest_check,
            command_timeout: Duration::from_millis(deploy_constants::COMMAND_TIMEOUT_MS),
        }
    }

    pub async fn deploy(
        &self,
        session: &SessionHandle,
        target: &DeploymentTarget,
    ) -> Result<DeployReport, LaunchError> {
        let remote_path = target.remote_path();
        if self.digest_check && self.remote_matches(session, target).await {
            self.logger.info(
                "payload already current, skipping upload",
                Some(&json!({"path": remote_path, "sha256": target.digest()})),
            );
            return Ok(DeployReport {
                remote_path,
                method: TransferMethod::None,
                bytes_written: 0,
            });
        }

        let structured = target.clone();
        let uploaded = session
            .with_session(move |remote| {
                let mut transfer = match remote.file_transfer() {
                    Ok(transfer) => transfer,
                    Err(err) if err.kind == LaunchErrorKind::TransferUnavailable => {
                        return Ok(Err(err))
                    }
                    Err(err) => return Err(err),
                };
                upload_via_transfer(transfer.as_mut(), &structured).map(Ok)
            })
            .await?;

        let report = match uploaded {
            Ok(bytes_written) => DeployReport {
                remote_path,
                method: TransferMethod::Sftp,
                bytes_written,
            },
            Err(unavailable) => {
                self.logger.warn(
                    "structured transfer unavailable, falling back to streaming copy",
                    Some(&json!({"reason": unavailable.message})),
                );
                let bytes_written = self.upload_via_stream(session, target).await?;
                DeployReport {
                    remote_path,
                    method: TransferMethod::Scp,
                    bytes_written,
                }
            }
        };
        self.logger.info(
            "payload deployed",
            Some(&json!({
                "path": report.remote_path,
                "method": report.method,
                "bytes": report.bytes_written,
            })),
        );
        Ok(report)
    }

    async fn remote_matches(&self, session: &SessionHandle, target: &DeploymentTarget) -> bool {
        let command = build_remote_sha256_command(&target.remote_path());
        let output = match session.exec(&command, self.command_timeout).await {
            Ok(output) => output,
            Err(err) => {
                self.logger.debug(
                    "remote digest unavailable",
                    Some(&json!({"error": err.message})),
                );
                return false;
            }
        };
        if !output.success() {
            return false;
        }
        match parse_remote_digest(&String::from_utf8_lossy(&output.stdout)) {
            Some(remote) => remote.eq_ignore_ascii_case(target.digest()),
            None => false,
        }
    }

    async fn upload_via_stream(
        &self,
        session: &SessionHandle,
        target: &DeploymentTarget,
    ) -> Result<u64, LaunchError> {
        let dir = double_quote(target.remote_dir());
        let mkdir = format!(
            "test -d {dir} || (mkdir -p {dir} && chmod 700 {dir})",
            dir = dir
        );
        let output = session.exec(&mkdir, self.command_timeout).await?;
        if !output.success() {
            return Err(LaunchError::deploy(format!(
                "Failed to create remote directory {}",
                target.remote_dir()
            ))
            .with_details(json!({
                "exit_code": output.exit_code,
                "output": output.combined(),
            })));
        }

        let path = target.remote_path();
        let remove = format!("rm -f {}", double_quote(&path));
        match session.exec(&remove, self.command_timeout).await {
            Ok(output) if output.success() => {}
            Ok(output) => self.logger.debug(
                "removing previous payload failed",
                Some(&json!({"exit_code": output.exit_code})),
            ),
            Err(err) => self.logger.debug(
                "removing previous payload failed",
                Some(&json!({"error": err.message})),
            ),
        }

        let payload = target.payload.clone();
        session
            .with_session(move |remote| {
                remote.stream_copy(&path, deploy_constants::PAYLOAD_MODE, &payload)
            })
            .await
    }
}
