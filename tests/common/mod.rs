#![allow(dead_code)]

use agentboot::errors::LaunchError;
use agentboot::managers::host_keys::{HostIdentity, HostKeyVerifier};
use agentboot::managers::process::{AgentChannel, Coordinator};
use agentboot::managers::ssh::{
    classify_connect_failure, ConnectOptions, Connector, Endpoint, ExecOutput, ExitInfo,
    FileTransfer, RemoteProcess, RemoteSession, RemoteStat, SessionHandle,
};
use agentboot::services::credentials::Credential;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub fn tmp_dir(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}

pub fn host_identity() -> HostIdentity {
    HostIdentity::new("ssh-ed25519", vec![7u8; 32])
}

pub fn output(stdout: &str, stderr: &str, exit_code: i32) -> ExecOutput {
    ExecOutput {
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
        exit_code: Some(exit_code),
        timed_out: false,
    }
}

pub fn version_output(version: &str) -> ExecOutput {
    output(
        "",
        &format!(
            "openjdk version \"{}\" 2023-07-18\nOpenJDK Runtime Environment (build {})\n",
            version, version
        ),
        0,
    )
}

#[derive(Clone)]
pub enum Reply {
    Output(ExecOutput),
    Fail(String),
    Slow(Duration, ExecOutput),
}

/// How the started payload behaves.
#[derive(Clone, Default)]
pub struct ProcessScript {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Writes to stdin come back on stdout.
    pub echo: bool,
    /// Ends on its own once its scripted output is read.
    pub exits: bool,
    pub exit: ExitInfo,
}

/// Everything the fake host knows and records.
pub struct RemoteState {
    pub identity: HostIdentity,
    pub connect_failures: VecDeque<String>,
    pub attempt_times: Vec<Instant>,
    pub verify_calls: usize,
    pub accept_auth: bool,
    pub authenticated_as: Vec<String>,
    pub replies: Vec<(String, Reply)>,
    pub commands: Vec<String>,
    pub sftp_available: bool,
    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, (Vec<u8>, i32)>,
    pub ops: Vec<String>,
    pub started: Vec<(String, u32)>,
    pub process: ProcessScript,
    pub stdin: Vec<u8>,
    pub stdin_eof: bool,
    pub process_closes: usize,
    pub session_closes: usize,
}

impl Default for RemoteState {
    fn default() -> Self {
        Self {
            identity: host_identity(),
            connect_failures: VecDeque::new(),
            attempt_times: Vec::new(),
            verify_calls: 0,
            accept_auth: true,
            authenticated_as: Vec::new(),
            replies: Vec::new(),
            commands: Vec::new(),
            sftp_available: true,
            dirs: BTreeSet::new(),
            files: BTreeMap::new(),
            ops: Vec::new(),
            started: Vec::new(),
            process: ProcessScript::default(),
            stdin: Vec::new(),
            stdin_eof: false,
            process_closes: 0,
            session_closes: 0,
        }
    }
}

/// Scripted remote host shared by the fake connector and everything it
/// hands out.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<StdMutex<RemoteState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// The first command containing `pattern` gets `reply`. Earlier rules win.
    pub fn reply(&self, pattern: &str, reply: Reply) {
        self.state().replies.push((pattern.to_string(), reply));
    }

    pub fn respond(&self, pattern: &str, out: ExecOutput) {
        self.reply(pattern, Reply::Output(out));
    }

    pub fn fail_connects(&self, messages: &[&str]) {
        self.state()
            .connect_failures
            .extend(messages.iter().map(|m| m.to_string()));
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn commands_containing(&self, needle: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|command| command.contains(needle))
            .count()
    }

    pub fn ops(&self) -> Vec<String> {
        self.state().ops.clone()
    }

    /// Operations that change the remote filesystem.
    pub fn mutations(&self) -> Vec<String> {
        self.state()
            .ops
            .iter()
            .filter(|op| !op.starts_with("stat "))
            .cloned()
            .collect()
    }

    pub fn connector(&self) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            remote: self.clone(),
        })
    }

    pub fn session(&self) -> SessionHandle {
        SessionHandle::new(
            Endpoint::new("fake-host", 22),
            Box::new(FakeSession {
                remote: self.clone(),
            }),
        )
    }
}

pub struct FakeConnector {
    remote: FakeRemote,
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        _endpoint: &Endpoint,
        _options: &ConnectOptions,
        verifier: &dyn HostKeyVerifier,
    ) -> Result<Box<dyn RemoteSession>, LaunchError> {
        let (failure, identity) = {
            let mut state = self.remote.state();
            state.attempt_times.push(Instant::now());
            (state.connect_failures.pop_front(), state.identity.clone())
        };
        if let Some(message) = failure {
            return Err(if classify_connect_failure(&message) {
                LaunchError::connect_recoverable(message)
            } else {
                LaunchError::connect_terminal(message)
            });
        }
        self.remote.state().verify_calls += 1;
        if !verifier.verify(&identity) {
            return Err(LaunchError::trust_rejected("host key rejected"));
        }
        Ok(Box::new(FakeSession {
            remote: self.remote.clone(),
        }))
    }
}

pub struct FakeSession {
    remote: FakeRemote,
}

impl RemoteSession for FakeSession {
    fn authenticate(&mut self, credential: &Credential) -> Result<(), LaunchError> {
        let mut state = self.remote.state();
        if !state.accept_auth {
            return Err(LaunchError::auth("authentication rejected"));
        }
        state.authenticated_as.push(credential.username().to_string());
        Ok(())
    }

    fn exec(&mut self, command: &str, _timeout: Duration) -> Result<ExecOutput, LaunchError> {
        let reply = {
            let mut state = self.remote.state();
            state.commands.push(command.to_string());
            state
                .replies
                .iter()
                .find(|(pattern, _)| command.contains(pattern.as_str()))
                .map(|(_, reply)| reply.clone())
        };
        match reply {
            None => Ok(output("", "", 0)),
            Some(Reply::Output(out)) => Ok(out),
            Some(Reply::Fail(message)) => Err(LaunchError::internal(message)),
            Some(Reply::Slow(delay, out)) => {
                std::thread::sleep(delay);
                Ok(out)
            }
        }
    }

    fn file_transfer(&mut self) -> Result<Box<dyn FileTransfer>, LaunchError> {
        if !self.remote.state().sftp_available {
            return Err(LaunchError::transfer_unavailable("subsystem request failed"));
        }
        Ok(Box::new(FakeTransfer {
            remote: self.remote.clone(),
        }))
    }

    fn stream_copy(
        &mut self,
        remote_path: &str,
        mode: i32,
        payload: &[u8],
    ) -> Result<u64, LaunchError> {
        let mut state = self.remote.state();
        state.ops.push(format!("scp {} {:o}", remote_path, mode));
        state
            .files
            .insert(remote_path.to_string(), (payload.to_vec(), mode));
        Ok(payload.len() as u64)
    }

    fn start(
        &mut self,
        command: &str,
        window_size: u32,
    ) -> Result<Box<dyn RemoteProcess>, LaunchError> {
        let mut state = self.remote.state();
        state.started.push((command.to_string(), window_size));
        let script = state.process.clone();
        Ok(Box::new(FakeProcess {
            remote: self.remote.clone(),
            stdout: script.stdout.iter().copied().collect(),
            stderr: script.stderr.iter().copied().collect(),
            script,
        }))
    }

    fn close(&mut self) {
        self.remote.state().session_closes += 1;
    }
}

pub struct FakeTransfer {
    remote: FakeRemote,
}

impl FileTransfer for FakeTransfer {
    fn stat(&mut self, path: &str) -> Result<Option<RemoteStat>, LaunchError> {
        let mut state = self.remote.state();
        state.ops.push(format!("stat {}", path));
        if state.dirs.contains(path) {
            return Ok(Some(RemoteStat {
                is_dir: true,
                is_file: false,
                size: None,
            }));
        }
        Ok(state.files.get(path).map(|(data, _)| RemoteStat {
            is_dir: false,
            is_file: true,
            size: Some(data.len() as u64),
        }))
    }

    fn mkdir(&mut self, path: &str, mode: i32) -> Result<(), LaunchError> {
        let mut state = self.remote.state();
        state.ops.push(format!("mkdir {} {:o}", path, mode));
        state.dirs.insert(path.to_string());
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), LaunchError> {
        let mut state = self.remote.state();
        state.ops.push(format!("remove {}", path));
        state.files.remove(path);
        Ok(())
    }

    fn write(&mut self, path: &str, payload: &[u8], mode: i32) -> Result<u64, LaunchError> {
        let mut state = self.remote.state();
        state.ops.push(format!("write {} {:o}", path, mode));
        state.files.insert(path.to_string(), (payload.to_vec(), mode));
        Ok(payload.len() as u64)
    }
}

pub struct FakeProcess {
    remote: FakeRemote,
    script: ProcessScript,
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
}

fn drain_into(queue: &mut VecDeque<u8>, buf: &mut [u8]) -> usize {
    let n = queue.len().min(buf.len());
    for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
        *slot = byte;
    }
    n
}

impl RemoteProcess for FakeProcess {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(drain_into(&mut self.stdout, buf))
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(drain_into(&mut self.stderr, buf))
    }

    fn write_stdin(&mut self, data: &[u8]) -> io::Result<usize> {
        self.remote.state().stdin.extend_from_slice(data);
        if self.script.echo {
            self.stdout.extend(data.iter().copied());
        }
        Ok(data.len())
    }

    fn send_eof(&mut self) {
        self.remote.state().stdin_eof = true;
    }

    fn is_eof(&mut self) -> bool {
        self.script.exits && self.stdout.is_empty() && self.stderr.is_empty()
    }

    fn close(&mut self) {
        self.remote.state().process_closes += 1;
    }

    fn exit_info(&mut self) -> ExitInfo {
        self.script.exit.clone()
    }
}

/// Accepts or refuses the agent channel; accepted channels are kept so the
/// test can drive them.
#[derive(Default)]
pub struct FakeCoordinator {
    reject: Option<String>,
    channels: StdMutex<Vec<AgentChannel>>,
}

impl FakeCoordinator {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            reject: Some(reason.to_string()),
            channels: StdMutex::new(Vec::new()),
        })
    }

    pub fn take_channel(&self) -> Option<AgentChannel> {
        self.channels
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .pop()
    }

    pub fn attached(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn attach(&self, channel: AgentChannel) -> Result<(), LaunchError> {
        if let Some(reason) = &self.reject {
            return Err(LaunchError::internal(reason.clone()));
        }
        self.channels
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(channel);
        Ok(())
    }
}
