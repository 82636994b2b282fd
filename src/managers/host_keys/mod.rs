//! Host identity trust policies.
//!
//! Every strategy implements [`HostKeyVerifier`]; the transport calls
//! `verify` once per handshake and never needs to know which policy is in
//! force.

mod blind;
mod known_hosts;
mod manual;
mod tofu;

pub use blind::BlindTrust;
pub use known_hosts::{parse_known_hosts_line, KnownHostsEntry, KnownHostsFile};
pub use manual::ManualKey;
pub use tofu::TrustOnFirstUse;

use crate::errors::LaunchError;
use crate::managers::ssh::Endpoint;
use crate::services::logger::Logger;
use crate::stores::trust_store::TrustStore;
use crate::utils::expand::expand_home_path;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Host key algorithms in the order offered when a strategy has no opinion.
const DEFAULT_ALGORITHM_ORDER: &[&str] = &[
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "rsa-sha2-512",
    "rsa-sha2-256",
    "ssh-rsa",
    "ssh-dss",
];

/// The identity a server presents during the handshake. Equal only when both
/// the key type and the raw key blob match.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HostIdentity {
    algorithm: String,
    raw_key: Vec<u8>,
}

impl HostIdentity {
    pub fn new(algorithm: impl Into<String>, raw_key: impl Into<Vec<u8>>) -> Self {
        Self {
            algorithm: algorithm.into(),
            raw_key: raw_key.into(),
        }
    }

    /// Parses `"<algorithm> <base64 key> [comment]"`.
    pub fn parse(line: &str) -> Result<Self, LaunchError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            return Err(LaunchError::invalid_config("host key has invalid format")
                .with_hint("Expected: \"<type> <base64> [comment]\"."));
        }
        let algorithm = tokens[0];
        let raw_key = base64::engine::general_purpose::STANDARD
            .decode(tokens[1].as_bytes())
            .map_err(|err| {
                LaunchError::invalid_config(format!("host key is not valid base64: {}", err))
            })?;
        if raw_key.is_empty() {
            return Err(LaunchError::invalid_config("host key must not be empty"));
        }
        if let Some(embedded) = embedded_key_type(&raw_key) {
            if embedded != algorithm {
                return Err(LaunchError::invalid_config(format!(
                    "host key type mismatch: line says {}, key blob says {}",
                    algorithm, embedded
                )));
            }
        }
        Ok(Self::new(algorithm, raw_key))
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn raw_key(&self) -> &[u8] {
        &self.raw_key
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {}",
            self.algorithm,
            base64::engine::general_purpose::STANDARD.encode(&self.raw_key)
        )
    }

    pub fn fingerprint_sha256(&self) -> String {
        let hash = Sha256::digest(&self.raw_key);
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash)
        )
    }
}

impl fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, self.fingerprint_sha256())
    }
}

/// Reads the key type that SSH wire-format key blobs carry as their first
/// string. Returns None for blobs that are not in that format.
fn embedded_key_type(blob: &[u8]) -> Option<&str> {
    if blob.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
    if len == 0 || len > 64 || blob.len() < 4 + len {
        return None;
    }
    let name = std::str::from_utf8(&blob[4..4 + len]).ok()?;
    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '@' || c == '.') {
        Some(name)
    } else {
        None
    }
}

pub trait HostKeyVerifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn verify(&self, identity: &HostIdentity) -> bool;

    /// Host key algorithms to offer first during negotiation. Empty means the
    /// transport default.
    fn preferred_algorithms(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_insecure(&self) -> bool {
        false
    }
}

/// Negotiation order that tries the algorithms able to produce a key of the
/// given types first, then everything else.
pub fn algorithm_preferences(key_types: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for key_type in key_types {
        let signatures: Vec<&str> = if *key_type == "ssh-rsa" {
            vec!["rsa-sha2-512", "rsa-sha2-256", "ssh-rsa"]
        } else if DEFAULT_ALGORITHM_ORDER.contains(key_type) {
            vec![*key_type]
        } else {
            continue;
        };
        for sig in signatures {
            if !out.iter().any(|existing| existing == sig) {
                out.push(sig.to_string());
            }
        }
    }
    if out.is_empty() {
        return out;
    }
    for alg in DEFAULT_ALGORITHM_ORDER {
        if !out.iter().any(|existing| existing == alg) {
            out.push(alg.to_string());
        }
    }
    out
}

/// Operator-facing choice of trust policy, as configured per target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStrategy {
    BlindTrust,
    KnownHosts { path: PathBuf },
    Manual { key: String },
    TrustOnFirstUse { manual_only: bool, store_dir: PathBuf },
}

impl HostKeyStrategy {
    pub fn default_known_hosts_path() -> PathBuf {
        expand_home_path("~/.ssh/known_hosts")
    }

    pub fn build(
        &self,
        endpoint: &Endpoint,
        target_id: &str,
        logger: &Logger,
    ) -> Result<Arc<dyn HostKeyVerifier>, LaunchError> {
        let verifier: Arc<dyn HostKeyVerifier> = match self {
            HostKeyStrategy::BlindTrust => Arc::new(BlindTrust::new(logger.clone())),
            HostKeyStrategy::KnownHosts { path } => Arc::new(KnownHostsFile::new(
                logger.clone(),
                path.clone(),
                endpoint.clone(),
            )),
            HostKeyStrategy::Manual { key } => {
                Arc::new(ManualKey::from_line(logger.clone(), key)?)
            }
            HostKeyStrategy::TrustOnFirstUse {
                manual_only,
                store_dir,
            } => Arc::new(TrustOnFirstUse::new(
                logger.clone(),
                Arc::new(TrustStore::new(store_dir.clone())),
                target_id,
                *manual_only,
            )),
        };
        if verifier.is_insecure() {
            logger.warn(
                "host key verification is DISABLED (blind trust); the connection is open to man-in-the-middle attacks",
                Some(&serde_json::json!({"target_id": target_id, "host": endpoint.host})),
            );
        }
        Ok(verifier)
    }
}

#[cfg(test)]
mod tests {
    use super::{algorithm_preferences, HostIdentity};
    use base64::Engine;

    fn wire_blob(key_type: &str, body: &[u8]) -> Vec<u8> {
        let mut blob = (key_type.len() as u32).to_be_bytes().to_vec();
        blob.extend_from_slice(key_type.as_bytes());
        blob.extend_from_slice(body);
        blob
    }

    #[test]
    fn parse_round_trips_algorithm_and_bytes() {
        let blob = wire_blob("ssh-rsa", &[1, 2, 3, 4, 5]);
        let line = format!(
            "ssh-rsa {}",
            base64::engine::general_purpose::STANDARD.encode(&blob)
        );
        let identity = HostIdentity::parse(&line).expect("parse");
        assert_eq!(identity.algorithm(), "ssh-rsa");
        assert_eq!(identity.raw_key(), blob.as_slice());
        assert_eq!(identity.to_line(), line);
        assert_eq!(HostIdentity::parse(&identity.to_line()).unwrap(), identity);
    }

    #[test]
    fn parse_rejects_type_mismatch() {
        let blob = wire_blob("ssh-ed25519", &[9; 32]);
        let line = format!(
            "ssh-rsa {}",
            base64::engine::general_purpose::STANDARD.encode(&blob)
        );
        assert!(HostIdentity::parse(&line).is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(HostIdentity::parse("ssh-rsa").is_err());
        assert!(HostIdentity::parse("ssh-rsa !!!notbase64").is_err());
    }

    #[test]
    fn identities_differ_by_algorithm() {
        let a = HostIdentity::new("ssh-rsa", vec![1, 2, 3]);
        let b = HostIdentity::new("ssh-dss", vec![1, 2, 3]);
        assert_ne!(a, b);
    }

    #[test]
    fn rsa_preference_lists_sha2_signatures_first() {
        let prefs = algorithm_preferences(&["ssh-rsa"]);
        assert_eq!(&prefs[..3], &["rsa-sha2-512", "rsa-sha2-256", "ssh-rsa"]);
        assert!(prefs.contains(&"ssh-ed25519".to_string()));
        assert!(algorithm_preferences(&["unknown-type"]).is_empty());
    }
}
