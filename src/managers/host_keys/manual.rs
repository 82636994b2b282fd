use super::{algorithm_preferences, HostIdentity, HostKeyVerifier};
use crate::errors::LaunchError;
use crate::services::logger::Logger;

/// Trusts exactly one key supplied by the operator as `"<algorithm> <base64>"`.
pub struct ManualKey {
    logger: Logger,
    expected: HostIdentity,
}

impl ManualKey {
    pub fn new(logger: Logger, expected: HostIdentity) -> Self {
        Self {
            logger: logger.child("hostkey:manual"),
            expected,
        }
    }

    pub fn from_line(logger: Logger, line: &str) -> Result<Self, LaunchError> {
        let expected = HostIdentity::parse(line.trim()).map_err(|err| {
            LaunchError::invalid_config(format!("manual host key: {}", err.message))
                .with_hint("Paste the key as \"ssh-ed25519 AAAA...\" (as in a .pub file).")
        })?;
        Ok(Self::new(logger, expected))
    }

    pub fn expected(&self) -> &HostIdentity {
        &self.expected
    }

    pub fn to_line(&self) -> String {
        self.expected.to_line()
    }
}

impl HostKeyVerifier for ManualKey {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn verify(&self, identity: &HostIdentity) -> bool {
        if *identity == self.expected {
            return true;
        }
        self.logger.error(
            "presented host key does not match the configured key",
            Some(&serde_json::json!({
                "expected": self.expected.fingerprint_sha256(),
                "expected_algorithm": self.expected.algorithm(),
                "presented": identity.fingerprint_sha256(),
                "presented_algorithm": identity.algorithm(),
            })),
        );
        false
    }

    fn preferred_algorithms(&self) -> Vec<String> {
        algorithm_preferences(&[self.expected.algorithm()])
    }
}

#[cfg(test)]
mod tests {
    use super::ManualKey;
    use crate::managers::host_keys::{HostIdentity, HostKeyVerifier};
    use crate::services::logger::Logger;
    use base64::Engine;

    #[test]
    fn reserializes_configured_key_verbatim() {
        let line = format!(
            "ssh-rsa {}",
            base64::engine::general_purpose::STANDARD.encode(b"opaque-rsa-key-material")
        );
        let verifier = ManualKey::from_line(Logger::capturing("t"), &line).expect("key");
        assert_eq!(verifier.to_line(), line);
        assert_eq!(verifier.expected().algorithm(), "ssh-rsa");
        assert_eq!(verifier.expected().raw_key(), b"opaque-rsa-key-material");
    }

    #[test]
    fn verify_is_exact_equality() {
        let verifier = ManualKey::new(
            Logger::capturing("t"),
            HostIdentity::new("ssh-ed25519", vec![7; 32]),
        );
        assert!(verifier.verify(&HostIdentity::new("ssh-ed25519", vec![7; 32])));
        assert!(!verifier.verify(&HostIdentity::new("ssh-ed25519", vec![8; 32])));
        assert!(!verifier.verify(&HostIdentity::new("ssh-rsa", vec![7; 32])));
        assert_eq!(verifier.preferred_algorithms()[0], "ssh-ed25519");
    }
}
