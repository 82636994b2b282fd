mod common;
use common::{host_identity, output, FakeRemote};

use agentboot::errors::LaunchErrorKind;
use agentboot::managers::host_keys::{
    BlindTrust, HostIdentity, HostKeyVerifier, KnownHostsFile, ManualKey, TrustOnFirstUse,
};
use agentboot::managers::ssh::{ConnectOptions, Endpoint, RetryPolicy, TransportSession};
use agentboot::services::logger::Logger;
use agentboot::stores::trust_store::TrustStore;
use std::sync::Arc;
use std::time::Duration;

fn policy(max_retries: u64, wait_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        wait: Duration::from_millis(wait_ms),
        timeout: Duration::ZERO,
    }
}

fn endpoint() -> Endpoint {
    Endpoint::new("builder.internal", 22)
}

fn blind() -> Arc<dyn HostKeyVerifier> {
    Arc::new(BlindTrust::new(Logger::capturing("test")))
}

#[tokio::test]
async fn recoverable_failures_are_retried_until_the_budget_is_spent() {
    let remote = FakeRemote::new();
    remote.fail_connects(&["Connection refused"; 5]);
    let transport = TransportSession::new(Logger::capturing("test"), remote.connector());

    let err = transport
        .connect_with_retry(&endpoint(), &ConnectOptions::default(), blind(), &policy(3, 1))
        .await
        .err()
        .expect("connect must fail");

    assert_eq!(err.kind, LaunchErrorKind::ConnectTerminal);
    assert_eq!(remote.state().attempt_times.len(), 4);
    assert_eq!(remote.state().verify_calls, 0);
}

#[tokio::test]
async fn recovers_after_transient_failures_and_waits_between_attempts() {
    let remote = FakeRemote::new();
    remote.fail_connects(&["Connection timed out", "premature connection close"]);
    let transport = TransportSession::new(Logger::capturing("test"), remote.connector());

    let session = transport
        .connect_with_retry(&endpoint(), &ConnectOptions::default(), blind(), &policy(5, 60))
        .await
        .expect("third attempt connects");
    assert!(!session.is_closed());

    let times = remote.state().attempt_times.clone();
    assert_eq!(times.len(), 3);
    assert!(times[2].duration_since(times[0]) >= Duration::from_millis(120));
    assert_eq!(remote.state().verify_calls, 1);
}

#[tokio::test]
async fn non_recoverable_failure_is_not_retried() {
    let remote = FakeRemote::new();
    remote.fail_connects(&["Name or service not known"]);
    let transport = TransportSession::new(Logger::capturing("test"), remote.connector());

    let err = transport
        .connect_with_retry(&endpoint(), &ConnectOptions::default(), blind(), &policy(10, 1))
        .await
        .err()
        .expect("connect must fail");

    assert_eq!(err.kind, LaunchErrorKind::ConnectTerminal);
    assert_eq!(remote.state().attempt_times.len(), 1);
}

#[tokio::test]
async fn rejected_host_key_is_not_retried() {
    let remote = FakeRemote::new();
    let transport = TransportSession::new(Logger::capturing("test"), remote.connector());
    let other = HostIdentity::new("ssh-ed25519", vec![9u8; 32]);
    let verifier: Arc<dyn HostKeyVerifier> =
        Arc::new(ManualKey::new(Logger::capturing("test"), other));

    let err = transport
        .connect_with_retry(&endpoint(), &ConnectOptions::default(), verifier, &policy(10, 1))
        .await
        .err()
        .expect("connect must fail");

    assert_eq!(err.kind, LaunchErrorKind::TrustRejected);
    assert_eq!(remote.state().attempt_times.len(), 1);
    assert_eq!(remote.state().verify_calls, 1);
}

#[tokio::test]
async fn retry_budget_stops_at_the_deadline() {
    let remote = FakeRemote::new();
    remote.fail_connects(&["Connection refused"; 50]);
    let transport = TransportSession::new(Logger::capturing("test"), remote.connector());
    let bounded = RetryPolicy {
        max_retries: 50,
        wait: Duration::from_millis(100),
        timeout: Duration::from_millis(250),
    };

    let err = transport
        .connect_with_retry(&endpoint(), &ConnectOptions::default(), blind(), &bounded)
        .await
        .err()
        .expect("connect must fail");

    assert_eq!(err.kind, LaunchErrorKind::Timeout);
    assert!(remote.state().attempt_times.len() < 10);
}

#[tokio::test]
async fn header_junk_is_reported_with_a_preview() {
    let remote = FakeRemote::new();
    remote.respond("exit 0", output("Welcome to builder-7!\n", "", 0));
    let transport = TransportSession::new(Logger::capturing("test"), remote.connector());

    let err = transport
        .probe_header_junk(&remote.session())
        .await
        .err()
        .expect("junk must be reported");

    assert_eq!(err.kind, LaunchErrorKind::HeaderJunk);
    let details = err.details.expect("details");
    assert_eq!(details["preview"], "Welcome to builder-7!\n");
    assert_eq!(details["bytes"], 22);
}

#[tokio::test]
async fn clean_channel_passes_the_probe() {
    let remote = FakeRemote::new();
    let transport = TransportSession::new(Logger::capturing("test"), remote.connector());
    transport
        .probe_header_junk(&remote.session())
        .await
        .expect("empty output is clean");
    assert_eq!(remote.commands(), vec!["exit 0".to_string()]);
}

#[test]
fn trust_on_first_use_pins_then_requires_the_same_key() {
    let dir = common::tmp_dir("agentboot-tofu");
    let store = Arc::new(TrustStore::new(&dir));
    let verifier = TrustOnFirstUse::new(Logger::capturing("test"), store.clone(), "node-7", false);
    let first = host_identity();
    let other = HostIdentity::new("ssh-ed25519", vec![1u8; 32]);

    assert!(verifier.verify(&first));
    assert_eq!(store.load("node-7").unwrap(), Some(first.clone()));
    assert!(verifier.verify(&first));
    assert!(!verifier.verify(&other));
    assert_eq!(store.load("node-7").unwrap(), Some(first));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn trust_on_first_use_manual_only_refuses_unknown_keys() {
    let dir = common::tmp_dir("agentboot-tofu-manual");
    let store = Arc::new(TrustStore::new(&dir));
    let verifier = TrustOnFirstUse::new(Logger::capturing("test"), store.clone(), "node-8", true);
    let key = host_identity();

    assert!(!verifier.verify(&key));
    assert_eq!(store.load("node-8").unwrap(), None);
    assert_eq!(store.pending("node-8").unwrap(), Some(key.clone()));

    store.approve("node-8").unwrap();
    assert!(verifier.verify(&key));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn manual_key_round_trips_through_its_text_form() {
    let key = HostIdentity::new("ecdsa-sha2-nistp256", vec![4u8; 65]);
    let verifier = ManualKey::new(Logger::capturing("test"), key.clone());
    let reparsed = ManualKey::from_line(Logger::capturing("test"), &verifier.to_line())
        .expect("text form parses");
    assert_eq!(reparsed.expected(), &key);
    assert!(reparsed.verify(&key));
    assert!(!reparsed.verify(&HostIdentity::new("ssh-ed25519", vec![4u8; 65])));
}

#[test]
fn known_hosts_file_trusts_listed_keys_only() {
    let dir = common::tmp_dir("agentboot-known-hosts");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("known_hosts");
    let key = host_identity();
    let revoked = HostIdentity::new("ssh-ed25519", vec![2u8; 32]);
    std::fs::write(
        &path,
        format!(
            "# fleet keys\nbuilder.internal,10.0.0.7 {}\n@revoked * {}\n[builder.internal]:2222 {}\n",
            key.to_line(),
            revoked.to_line(),
            revoked.to_line()
        ),
    )
    .unwrap();

    let default_port = KnownHostsFile::new(Logger::capturing("test"), &path, endpoint());
    assert!(default_port.verify(&key));
    assert!(!default_port.verify(&revoked));
    assert_eq!(default_port.preferred_algorithms()[0], "ssh-ed25519");

    let other_port = KnownHostsFile::new(
        Logger::capturing("test"),
        &path,
        Endpoint::new("builder.internal", 2222),
    );
    assert!(!other_port.verify(&key));
    assert!(!other_port.verify(&revoked));

    let unknown = KnownHostsFile::new(
        Logger::capturing("test"),
        &path,
        Endpoint::new("elsewhere.internal", 22),
    );
    assert!(!unknown.verify(&key));

    let _ = std::fs::remove_dir_all(&dir);
}

// `ssh-keygen -H` output for the host name `builder.internal`.
const HASHED_BUILDER: &str = "|1|gEF+5+kDDpCQSf1FP3jM3r5Qw0Q=|kJCVaPhblqMqm4Tn+XxazSG5y9w=";

#[test]
fn known_hosts_file_honors_hashed_host_names() {
    let dir = common::tmp_dir("agentboot-known-hosts-hashed");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("known_hosts");
    let key = host_identity();
    let revoked = HostIdentity::new("ssh-ed25519", vec![2u8; 32]);
    std::fs::write(
        &path,
        format!(
            "{} {}\n@revoked {} {}\n{} {}\n",
            HASHED_BUILDER,
            key.to_line(),
            HASHED_BUILDER,
            revoked.to_line(),
            HASHED_BUILDER,
            revoked.to_line()
        ),
    )
    .unwrap();

    let verifier = KnownHostsFile::new(Logger::capturing("test"), &path, endpoint());
    assert!(verifier.verify(&key));
    assert!(!verifier.verify(&revoked));

    let elsewhere = KnownHostsFile::new(
        Logger::capturing("test"),
        &path,
        Endpoint::new("elsewhere.internal", 22),
    );
    assert!(!elsewhere.verify(&key));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn blind_trust_accepts_anything() {
    let verifier = BlindTrust::new(Logger::capturing("test"));
    assert!(verifier.verify(&host_identity()));
    assert!(verifier.is_insecure());
}
