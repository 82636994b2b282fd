use super::{HostIdentity, HostKeyVerifier};
use crate::services::logger::Logger;

/// Accepts any host key. Insecure; only meant for lab networks.
pub struct BlindTrust {
    logger: Logger,
}

impl BlindTrust {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("hostkey:blind"),
        }
    }
}

impl HostKeyVerifier for BlindTrust {
    fn name(&self) -> &'static str {
        "blind_trust"
    }

    fn verify(&self, identity: &HostIdentity) -> bool {
        self.logger.warn(
            "accepting host key without verification (INSECURE)",
            Some(&serde_json::json!({
                "algorithm": identity.algorithm(),
                "fingerprint": identity.fingerprint_sha256(),
            })),
        );
        true
    }

    fn is_insecure(&self) -> bool {
        true
    }
}
