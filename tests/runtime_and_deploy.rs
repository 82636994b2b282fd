mod common;
use common::{output, version_output, FakeRemote, Reply};

use agentboot::errors::LaunchErrorKind;
use agentboot::managers::deploy::{ArtifactDeployer, DeploymentTarget, TransferMethod};
use agentboot::managers::runtime::{CandidateSource, RuntimeRequest, RuntimeResolver};
use agentboot::services::logger::Logger;
use bytes::Bytes;
use sha2::{Digest, Sha256};

fn fixed(paths: &[&str]) -> RuntimeResolver {
    RuntimeResolver::with_sources(
        Logger::capturing("test"),
        vec![CandidateSource::FixedPaths(
            paths.iter().map(|p| p.to_string()).collect(),
        )],
    )
}

fn request(min_version: u32) -> RuntimeRequest {
    RuntimeRequest {
        remote_dir: "/var/agent".to_string(),
        min_version,
        ..Default::default()
    }
}

#[tokio::test]
async fn first_candidate_meeting_the_minimum_wins() {
    let remote = FakeRemote::new();
    remote.respond("/opt/a/java -version", version_output("1.4"));
    remote.respond("/opt/b/java -version", version_output("11.0.2"));
    remote.respond("/opt/c/java -version", version_output("17.0.8"));

    let resolved = fixed(&["/opt/a/java", "/opt/b/java", "/opt/c/java"])
        .resolve(&remote.session(), &request(8))
        .await
        .expect("runtime");

    assert_eq!(resolved.path, "/opt/b/java");
    assert_eq!(resolved.version.as_deref(), Some("11.0.2"));
    assert_eq!(resolved.major, Some(11));
    assert_eq!(remote.commands_containing("/opt/c/java"), 0);
}

#[tokio::test]
async fn unreachable_candidates_are_skipped() {
    let remote = FakeRemote::new();
    remote.reply("/opt/a/java", Reply::Fail("channel open failed".to_string()));
    remote.respond("/opt/b/java", output("", "sh: /opt/b/java: not found\n", 127));
    remote.respond("/opt/c/java", version_output("21"));

    let resolved = fixed(&["/opt/a/java", "/opt/b/java", "/opt/c/java"])
        .resolve(&remote.session(), &request(11))
        .await
        .expect("runtime");
    assert_eq!(resolved.path, "/opt/c/java");
}

#[tokio::test]
async fn no_suitable_runtime_lists_every_tried_path() {
    let remote = FakeRemote::new();
    remote.respond("/opt/a/java", version_output("1.8.0_292"));
    remote.respond("/opt/b/java", output("", "command not found", 127));

    let err = fixed(&["/opt/a/java", "/opt/b/java"])
        .resolve(&remote.session(), &request(11))
        .await
        .err()
        .expect("must fail");

    assert_eq!(err.kind, LaunchErrorKind::RuntimeNotFound);
    let details = err.details.expect("details");
    assert_eq!(details["tried_paths"][0], "/opt/a/java");
    assert_eq!(details["tried_paths"][1], "/opt/b/java");
}

#[tokio::test]
async fn jvm_options_are_passed_to_the_probe() {
    let remote = FakeRemote::new();
    remote.respond("-version", version_output("17"));
    let mut req = request(11);
    req.jvm_options = " -Xmx256m ".to_string();

    fixed(&["/opt/a/java"])
        .resolve(&remote.session(), &req)
        .await
        .expect("runtime");
    assert_eq!(remote.commands(), vec!["/opt/a/java -Xmx256m -version".to_string()]);
}

#[tokio::test]
async fn explicit_path_is_expanded_and_checked_only_for_version() {
    let remote = FakeRemote::new();
    remote.respond("/srv/jdk/bin/java", output("", "", 0));
    let mut req = request(11);
    req.explicit_path = Some("${TOOLS}/jdk/bin/java".to_string());
    req.env = vec![("TOOLS".to_string(), "/srv".to_string())];

    let resolved = fixed(&["/never/java"])
        .resolve(&remote.session(), &req)
        .await
        .expect("unparseable version still accepted");
    assert_eq!(resolved.path, "/srv/jdk/bin/java");
    assert_eq!(resolved.version, None);
    assert_eq!(remote.commands_containing("/never/java"), 0);

    let remote = FakeRemote::new();
    remote.respond("/srv/jdk/bin/java", version_output("1.8.0_292"));
    let err = fixed(&[])
        .resolve(&remote.session(), &req)
        .await
        .err()
        .expect("too old");
    assert_eq!(err.kind, LaunchErrorKind::RuntimeNotFound);
}

fn target(payload: &'static [u8]) -> DeploymentTarget {
    DeploymentTarget::new("/var/agent/work", "remoting.jar", Bytes::from_static(payload))
}

#[tokio::test]
async fn matching_remote_digest_skips_every_write() {
    let remote = FakeRemote::new();
    let digest = hex::encode(Sha256::digest(b"payload-v1"));
    remote.respond("PATH_ARG=", output(&format!("{}\n", digest), "", 0));

    let report = ArtifactDeployer::new(Logger::capturing("test"), true)
        .deploy(&remote.session(), &target(b"payload-v1"))
        .await
        .expect("deploy");

    assert!(report.already_current());
    assert_eq!(report.bytes_written, 0);
    assert!(remote.ops().is_empty());
}

#[tokio::test]
async fn stale_payload_creates_missing_directories_before_writing() {
    let remote = FakeRemote::new();
    remote.state().dirs.insert("/var".to_string());
    remote.respond("PATH_ARG=", output(&"0".repeat(64), "", 0));

    let report = ArtifactDeployer::new(Logger::capturing("test"), true)
        .deploy(&remote.session(), &target(b"payload-v2"))
        .await
        .expect("deploy");

    assert_eq!(report.method, TransferMethod::Sftp);
    assert_eq!(report.bytes_written, 10);
    assert_eq!(
        remote.mutations(),
        vec![
            "mkdir /var/agent 700".to_string(),
            "mkdir /var/agent/work 700".to_string(),
            "remove /var/agent/work/remoting.jar".to_string(),
            "write /var/agent/work/remoting.jar 644".to_string(),
        ]
    );
    let stored = remote.state().files["/var/agent/work/remoting.jar"].clone();
    assert_eq!(stored, (b"payload-v2".to_vec(), 0o644));
}

#[tokio::test]
async fn digest_check_can_be_disabled() {
    let remote = FakeRemote::new();
    ArtifactDeployer::new(Logger::capturing("test"), false)
        .deploy(&remote.session(), &target(b"payload"))
        .await
        .expect("deploy");
    assert_eq!(remote.commands_containing("PATH_ARG="), 0);
    assert_eq!(remote.mutations().last().map(String::as_str), Some("write /var/agent/work/remoting.jar 644"));
}

#[tokio::test]
async fn file_in_place_of_a_directory_fails_before_any_write() {
    let remote = FakeRemote::new();
    remote.state().dirs.insert("/var".to_string());
    remote
        .state()
        .files
        .insert("/var/agent".to_string(), (b"oops".to_vec(), 0o644));

    let err = ArtifactDeployer::new(Logger::capturing("test"), true)
        .deploy(&remote.session(), &target(b"payload"))
        .await
        .err()
        .expect("must fail");

    assert_eq!(err.kind, LaunchErrorKind::Deploy);
    assert!(remote.mutations().is_empty());
}

#[tokio::test]
async fn falls_back_to_streaming_copy_without_structured_transfer() {
    let remote = FakeRemote::new();
    remote.state().sftp_available = false;

    let report = ArtifactDeployer::new(Logger::capturing("test"), true)
        .deploy(&remote.session(), &target(b"payload-v3"))
        .await
        .expect("deploy");

    assert_eq!(report.method, TransferMethod::Scp);
    assert_eq!(
        remote.mutations(),
        vec!["scp /var/agent/work/remoting.jar 644".to_string()]
    );
    let commands = remote.commands();
    assert!(commands
        .iter()
        .any(|c| c == "test -d \"/var/agent/work\" || (mkdir -p \"/var/agent/work\" && chmod 700 \"/var/agent/work\")"));
    assert!(commands
        .iter()
        .any(|c| c == "rm -f \"/var/agent/work/remoting.jar\""));
}

#[tokio::test]
async fn fallback_directory_failure_is_a_deploy_error() {
    let remote = FakeRemote::new();
    remote.state().sftp_available = false;
    remote.respond("mkdir -p", output("", "mkdir: Permission denied\n", 1));

    let err = ArtifactDeployer::new(Logger::capturing("test"), false)
        .deploy(&remote.session(), &target(b"payload"))
        .await
        .err()
        .expect("must fail");
    assert_eq!(err.kind, LaunchErrorKind::Deploy);
    assert!(remote.mutations().is_empty());
}
