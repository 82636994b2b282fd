use super::{algorithm_preferences, HostIdentity, HostKeyVerifier};
use crate::stores::trust_store::{TrustDecision, TrustStore};
use crate::services::logger::Logger;
use std::sync::Arc;

/// Pins whatever key a target presents first and requires it afterwards.
///
/// Targets are keyed by their stable id rather than by address so that a
/// re-addressed machine keeps its pin. In manual-only mode the first key is
/// queued for operator approval and the connection is refused.
pub struct TrustOnFirstUse {
    logger: Logger,
    store: Arc<TrustStore>,
    target_id: String,
    manual_only: bool,
}

impl TrustOnFirstUse {
    pub fn new(logger: Logger, store: Arc<TrustStore>, target_id: &str, manual_only: bool) -> Self {
        Self {
            logger: logger.child("hostkey:tofu"),
            store,
            target_id: target_id.to_string(),
            manual_only,
        }
    }

    pub fn store(&self) -> &Arc<TrustStore> {
        &self.store
    }
}

impl HostKeyVerifier for TrustOnFirstUse {
    fn name(&self) -> &'static str {
        "trust_on_first_use"
    }

    fn verify(&self, identity: &HostIdentity) -> bool {
        let meta = serde_json::json!({
            "target_id": self.target_id,
            "algorithm": identity.algorithm(),
            "fingerprint": identity.fingerprint_sha256(),
        });
        let decision = match self
            .store
            .check_or_pin(&self.target_id, identity, self.manual_only)
        {
            Ok(decision) => decision,
            Err(err) => {
                self.logger.error(
                    &format!("trust store unavailable: {}", err.message),
                    Some(&meta),
                );
                return false;
            }
        };
        match &decision {
            TrustDecision::Pinned => {
                self.logger.info("first contact, host key pinned", Some(&meta));
            }
            TrustDecision::Matched => {}
            TrustDecision::Queued => {
                self.logger.warn(
                    "first contact, host key queued for manual approval",
                    Some(&meta),
                );
            }
            TrustDecision::Mismatch { stored } => {
                self.logger.error(
                    &format!(
                        "host key changed since first contact (pinned {} {})",
                        stored.algorithm(),
                        stored.fingerprint_sha256()
                    ),
                    Some(&meta),
                );
            }
        }
        decision.is_trusted()
    }

    fn preferred_algorithms(&self) -> Vec<String> {
        match self.store.load(&self.target_id) {
            Ok(Some(stored)) => algorithm_preferences(&[stored.algorithm()]),
            _ => Vec::new(),
        }
    }
}
