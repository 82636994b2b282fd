use super::{algorithm_preferences, HostIdentity, HostKeyVerifier};
use crate::managers::ssh::Endpoint;
use crate::services::logger::Logger;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::path::PathBuf;

type HmacSha1 = Hmac<Sha1>;

const HASHED_PREFIX: &str = "|1|";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHostsMarker {
    Revoked,
    CertAuthority,
}

#[derive(Debug, Clone)]
pub struct KnownHostsEntry {
    pub marker: Option<KnownHostsMarker>,
    pub patterns: Vec<String>,
    pub hashed: bool,
    pub identity: HostIdentity,
}

impl KnownHostsEntry {
    /// Whether this entry names `endpoint`. Hashed entries (`|1|salt|hash`)
    /// match when HMAC-SHA1 of the host token under the salt equals the hash.
    pub fn matches(&self, endpoint: &Endpoint) -> bool {
        let token = host_token(endpoint);
        if self.hashed {
            return self
                .patterns
                .iter()
                .any(|pattern| hashed_match(pattern, &token));
        }
        let mut matched = false;
        for pattern in &self.patterns {
            if let Some(negated) = pattern.strip_prefix('!') {
                if glob_match(negated, &token) {
                    return false;
                }
                continue;
            }
            if glob_match(pattern, &token) {
                matched = true;
            }
        }
        matched
    }
}

fn host_token(endpoint: &Endpoint) -> String {
    let host = endpoint.host.to_lowercase();
    if endpoint.port == 22 {
        host
    } else {
        format!("[{}]:{}", host, endpoint.port)
    }
}

fn hashed_match(field: &str, token: &str) -> bool {
    let Some(rest) = field.strip_prefix(HASHED_PREFIX) else {
        return false;
    };
    let Some((salt, hash)) = rest.split_once('|') else {
        return false;
    };
    let engine = base64::engine::general_purpose::STANDARD;
    let (Ok(salt), Ok(hash)) = (engine.decode(salt), engine.decode(hash)) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(&salt) else {
        return false;
    };
    mac.update(token.as_bytes());
    mac.verify_slice(&hash).is_ok()
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Parses one known_hosts line. Comments, blank lines, and malformed lines
/// yield None.
pub fn parse_known_hosts_line(line: &str) -> Option<KnownHostsEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let mut tokens = trimmed.split_whitespace().peekable();
    let marker = match tokens.peek().copied() {
        Some("@revoked") => Some(KnownHostsMarker::Revoked),
        Some("@cert-authority") => Some(KnownHostsMarker::CertAuthority),
        Some(other) if other.starts_with('@') => return None,
        _ => None,
    };
    if marker.is_some() {
        tokens.next();
    }
    let hosts = tokens.next()?;
    let algorithm = tokens.next()?;
    let key = tokens.next()?;
    let identity = HostIdentity::parse(&format!("{} {}", algorithm, key)).ok()?;
    Some(KnownHostsEntry {
        marker,
        hashed: hosts.starts_with(HASHED_PREFIX),
        patterns: hosts.split(',').map(|s| s.to_string()).collect(),
        identity,
    })
}

/// Trusts keys listed for the host in an OpenSSH known_hosts file. Unknown
/// hosts are rejected; the file is never modified.
pub struct KnownHostsFile {
    logger: Logger,
    path: PathBuf,
    endpoint: Endpoint,
}

impl KnownHostsFile {
    pub fn new(logger: Logger, path: impl Into<PathBuf>, endpoint: Endpoint) -> Self {
        Self {
            logger: logger.child("hostkey:known_hosts"),
            path: path.into(),
            endpoint,
        }
    }

    fn entries_for_host(&self) -> Vec<KnownHostsEntry> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                self.logger.warn(
                    "known_hosts file is not readable",
                    Some(&serde_json::json!({
                        "path": self.path.display().to_string(),
                        "error": err.to_string(),
                    })),
                );
                return Vec::new();
            }
        };
        raw.lines()
            .filter_map(parse_known_hosts_line)
            .filter(|entry| entry.matches(&self.endpoint))
            .collect()
    }
}

impl HostKeyVerifier for KnownHostsFile {
    fn name(&self) -> &'static str {
        "known_hosts"
    }

    fn verify(&self, identity: &HostIdentity) -> bool {
        let entries = self.entries_for_host();
        let revoked = entries.iter().any(|entry| {
            entry.marker == Some(KnownHostsMarker::Revoked) && entry.identity == *identity
        });
        if revoked {
            self.logger.error(
                "presented host key is marked @revoked",
                Some(&serde_json::json!({
                    "host": self.endpoint.host,
                    "fingerprint": identity.fingerprint_sha256(),
                })),
            );
            return false;
        }
        let trusted = entries
            .iter()
            .any(|entry| entry.marker.is_none() && entry.identity == *identity);
        if trusted {
            return true;
        }
        let message = if entries.iter().any(|entry| entry.marker.is_none()) {
            "host key does not match known_hosts entry"
        } else {
            "host is not listed in known_hosts"
        };
        self.logger.error(
            message,
            Some(&serde_json::json!({
                "host": self.endpoint.host,
                "port": self.endpoint.port,
                "path": self.path.display().to_string(),
                "algorithm": identity.algorithm(),
                "fingerprint": identity.fingerprint_sha256(),
            })),
        );
        false
    }

    fn preferred_algorithms(&self) -> Vec<String> {
        let entries = self.entries_for_host();
        let types: Vec<&str> = entries
            .iter()
            .filter(|entry| entry.marker.is_none())
            .map(|entry| entry.identity.algorithm())
            .collect();
        algorithm_preferences(&types)
    }
}

#[cfg(test)]
mod tests {
    use super::{glob_match, parse_known_hosts_line, KnownHostsMarker};
    use crate::managers::ssh::Endpoint;

    const KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    #[test]
    fn parses_plain_and_marked_lines() {
        let entry = parse_known_hosts_line(&format!("build-1,10.0.0.5 ssh-ed25519 {} ops", KEY))
            .expect("entry");
        assert_eq!(entry.patterns, vec!["build-1", "10.0.0.5"]);
        assert!(entry.marker.is_none());
        assert_eq!(entry.identity.algorithm(), "ssh-ed25519");

        let revoked =
            parse_known_hosts_line(&format!("@revoked * ssh-ed25519 {}", KEY)).expect("entry");
        assert_eq!(revoked.marker, Some(KnownHostsMarker::Revoked));

        assert!(parse_known_hosts_line("# comment").is_none());
        assert!(parse_known_hosts_line("host ssh-ed25519").is_none());
    }

    #[test]
    fn non_default_port_uses_bracket_form() {
        let entry =
            parse_known_hosts_line(&format!("[build-1]:2222 ssh-ed25519 {}", KEY)).expect("entry");
        assert!(entry.matches(&Endpoint::new("build-1", 2222)));
        assert!(!entry.matches(&Endpoint::new("build-1", 22)));
    }

    #[test]
    fn negated_pattern_excludes_host() {
        let entry = parse_known_hosts_line(&format!("*.ci.example,!bad.ci.example ssh-ed25519 {}", KEY))
            .expect("entry");
        assert!(entry.matches(&Endpoint::new("good.ci.example", 22)));
        assert!(!entry.matches(&Endpoint::new("bad.ci.example", 22)));
    }

    // Produced by `ssh-keygen -H` from `build-1` and `[build-1]:2222` lines.
    const HASHED_DEFAULT_PORT: &str = "|1|/WM4Bn4L/jEWBK7GOHAOzHYmOp0=|CHc3sfZB9iw2fcfIMa9gIjIXb4w=";
    const HASHED_PORT_2222: &str = "|1|Pcf94+pqyCrLmhbSr8vCL4qu4+U=|cBP7n/IW57Ka26N2/u+NmFoukW0=";

    #[test]
    fn hashed_entries_match_their_host_only() {
        let entry = parse_known_hosts_line(&format!("{} ssh-ed25519 {}", HASHED_DEFAULT_PORT, KEY))
            .expect("entry");
        assert!(entry.hashed);
        assert!(entry.matches(&Endpoint::new("build-1", 22)));
        assert!(entry.matches(&Endpoint::new("BUILD-1", 22)));
        assert!(!entry.matches(&Endpoint::new("build-2", 22)));
        assert!(!entry.matches(&Endpoint::new("build-1", 2222)));

        let ported = parse_known_hosts_line(&format!("{} ssh-ed25519 {}", HASHED_PORT_2222, KEY))
            .expect("entry");
        assert!(ported.matches(&Endpoint::new("build-1", 2222)));
        assert!(!ported.matches(&Endpoint::new("build-1", 22)));
    }

    #[test]
    fn malformed_hashed_entries_never_match() {
        let entry = parse_known_hosts_line(&format!("|1|not-base64!|x ssh-ed25519 {}", KEY))
            .expect("entry");
        assert!(!entry.matches(&Endpoint::new("build-1", 22)));
    }

    #[test]
    fn glob_supports_star_and_question_mark() {
        assert!(glob_match("build-?", "build-7"));
        assert!(glob_match("*.example", "a.b.example"));
        assert!(!glob_match("build-?", "build-77"));
    }
}
