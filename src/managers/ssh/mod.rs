//! Transport capability used by every bootstrap stage.
//!
//! The stages only talk to the narrow traits below; `client` implements them
//! on top of libssh2, tests implement them with scripted fakes.

pub mod client;
pub mod retry;
pub mod session;

use crate::constants::network as network_constants;
use crate::errors::LaunchError;
use crate::managers::host_keys::HostKeyVerifier;
use crate::services::credentials::Credential;
use std::io;
use std::time::Duration;

pub use client::Ssh2Connector;
pub use retry::{classify_connect_failure, RetryPolicy, TransportSession};
pub use session::SessionHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub tcp_no_delay: bool,
    pub keepalive_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(network_constants::TIMEOUT_SSH_READY_MS),
            tcp_no_delay: true,
            keepalive_interval: Duration::from_millis(network_constants::KEEPALIVE_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// stdout followed by stderr, lossily decoded.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }

    pub fn combined_len(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub is_dir: bool,
    pub is_file: bool,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

/// Opens a transport connection and completes the handshake. Implementations
/// call `verifier.verify` exactly once per call, after the remote identity is
/// known and before returning.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
        verifier: &dyn HostKeyVerifier,
    ) -> Result<Box<dyn RemoteSession>, LaunchError>;
}

/// One live, handshaken connection. All calls block the current thread.
pub trait RemoteSession: Send {
    fn authenticate(&mut self, credential: &Credential) -> Result<(), LaunchError>;

    /// Runs `command` and captures its output. A non-zero exit is not an
    /// error; failing to run the command at all is.
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, LaunchError>;

    /// Structured file transfer client. Returns a `TransferUnavailable` error
    /// when the remote side does not offer the subsystem.
    fn file_transfer(&mut self) -> Result<Box<dyn FileTransfer>, LaunchError>;

    /// Streaming copy of a single blob, used when the structured client is
    /// unavailable.
    fn stream_copy(&mut self, remote_path: &str, mode: i32, payload: &[u8])
        -> Result<u64, LaunchError>;

    fn start(&mut self, command: &str, window_size: u32)
        -> Result<Box<dyn RemoteProcess>, LaunchError>;

    fn close(&mut self);
}

pub trait FileTransfer: Send {
    fn stat(&mut self, path: &str) -> Result<Option<RemoteStat>, LaunchError>;

    fn mkdir(&mut self, path: &str, mode: i32) -> Result<(), LaunchError>;

    /// Removing a path that does not exist succeeds.
    fn remove(&mut self, path: &str) -> Result<(), LaunchError>;

    fn write(&mut self, path: &str, payload: &[u8], mode: i32) -> Result<u64, LaunchError>;
}

/// The payload process behind one exec channel.
///
/// Reads and writes never block: `Ok(0)` means nothing could be transferred
/// right now, end of stream is reported by `is_eof`.
pub trait RemoteProcess: Send {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_stdin(&mut self, data: &[u8]) -> io::Result<usize>;

    fn send_eof(&mut self);

    fn is_eof(&mut self) -> bool;

    fn close(&mut self);

    fn exit_info(&mut self) -> ExitInfo;
}
