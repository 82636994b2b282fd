pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const TIMEOUT_SSH_READY_MS: u64 = 10_000;
    pub const TIMEOUT_SSH_EXEC_DEFAULT_MS: u64 = 60_000;
    pub const TIMEOUT_SSH_EXEC_HARD_GRACE_MS: u64 = 2_000;
    pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;
    /// Flow-control window for the payload exec channel. The protocol default
    /// (2 MiB in libssh2) starves throughput on high-latency links.
    pub const EXEC_WINDOW_SIZE: u32 = 4 * 1024 * 1024;
    pub const EXEC_PACKET_SIZE: u32 = 32 * 1024;
    pub const POLL_INTERVAL_MS: u64 = 20;
}

pub mod limits {
    pub const MAX_PORT: u16 = 65_535;
    pub const MIN_PORT: u16 = 1;
    pub const JUNK_PREVIEW_BYTES: usize = 512;
    pub const STDERR_TAIL_BYTES: usize = 4 * 1024;
    pub const RELAY_CHUNK_BYTES: usize = 32 * 1024;
    pub const DUPLEX_BUFFER_BYTES: usize = 64 * 1024;
}

pub mod retry {
    pub const DEFAULT_MAX_RETRIES: u64 = 10;
    pub const DEFAULT_WAIT_SECONDS: u64 = 15;
    /// Added on top of retries x wait when no explicit launch timeout is set.
    pub const LAUNCH_TIMEOUT_MARGIN_SECONDS: u64 = 60;
    /// OS error texts that mark a connect failure as transient. Matched as a
    /// case-insensitive prefix of the underlying error message.
    pub const RECOVERABLE_PREFIXES: &[&str] = &[
        "connection refused",
        "connection reset",
        "connection timed out",
        "timed out",
        "no route to host",
        "network is unreachable",
        "host is down",
        "premature connection close",
        "connection closed by remote host",
        "broken pipe",
    ];
}

pub mod runtime {
    pub const DEFAULT_MIN_VERSION: u32 = 11;
    pub const WORKDIR_RUNTIME: &str = "jdk/bin/java";
    pub const HOME_ENV_VAR: &str = "JAVA_HOME";
    pub const WELL_KNOWN_PATHS: &[&str] = &[
        "java",
        "/usr/bin/java",
        "/usr/java/default/bin/java",
        "/usr/java/latest/bin/java",
        "/usr/local/bin/java",
        "/usr/local/java/bin/java",
        "/opt/java/openjdk/bin/java",
    ];
    pub const PROBE_TIMEOUT_MS: u64 = 30_000;
}

pub mod deploy {
    pub const DEFAULT_PAYLOAD_NAME: &str = "remoting.jar";
    pub const DIRECTORY_MODE: i32 = 0o700;
    pub const PAYLOAD_MODE: i32 = 0o644;
    pub const SHA256_HEX_LEN: usize = 64;
    pub const NO_DIGEST_MARKER: &str = "__AGENTBOOT_NO_SHA256__";
    pub const COMMAND_TIMEOUT_MS: u64 = 30_000;
}

pub mod teardown {
    pub const ARTIFACT_DELETE_TIMEOUT_MS: u64 = 5_000;
    pub const PROCESS_CLOSE_GRACE_MS: u64 = 2_000;
    pub const START_FAILURE_GRACE_MS: u64 = 2_000;
}

pub mod trust_store {
    pub const LOCK_WAIT_MS: u64 = 5_000;
    pub const LOCK_POLL_MS: u64 = 10;
    /// Lock files older than this are left over from a crashed process.
    pub const STALE_LOCK_MS: u64 = 30_000;
}
