//! Remote payload start and the stdio bridge to the coordinator.
//!
//! One blocking pump owns the exec channel and polls it without blocking.
//! Three relay tasks connect the pump to the outside: stdout into the
//! coordinator's duplex stream, the duplex stream into stdin, and stderr
//! into the diagnostic sink.

use crate::constants::limits::{DUPLEX_BUFFER_BYTES, RELAY_CHUNK_BYTES, STDERR_TAIL_BYTES};
use crate::constants::network as network_constants;
use crate::constants::teardown as teardown_constants;
use crate::errors::LaunchError;
use crate::managers::ssh::{ExitInfo, RemoteProcess, SessionHandle};
use crate::services::diagnostics::DiagnosticSink;
use crate::services::logger::Logger;
use crate::utils::shell::double_quote;
use crate::utils::text::tail_lossy;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const RELAY_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub java_path: String,
    pub remote_dir: String,
    pub jvm_options: String,
    pub payload_name: String,
    pub extra_params: String,
    pub prefix: String,
    pub suffix: String,
}

/// `cd "<dir>" && <java> <opts> -jar <payload> <params>`, wrapped in the
/// operator's prefix and suffix.
pub fn build_launch_command(request: &StartRequest) -> String {
    let mut core = format!(
        "cd {} && {}",
        double_quote(&request.remote_dir),
        request.java_path
    );
    for part in [
        request.jvm_options.trim(),
        "-jar",
        request.payload_name.trim(),
        request.extra_params.trim(),
    ] {
        if !part.is_empty() {
            core.push(' ');
            core.push_str(part);
        }
    }
    [request.prefix.trim(), core.as_str(), request.suffix.trim()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lets the coordinator report that it is done with the channel. Dropping
/// every clone counts as a close without a cause.
#[derive(Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl CloseSignal {
    pub fn channel() -> (Self, watch::Receiver<Option<String>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn close(&self, cause: impl Into<String>) {
        self.tx.send_replace(Some(cause.into()));
    }
}

/// What the coordinator receives once the payload runs.
pub struct AgentChannel {
    pub target_id: String,
    /// Reads yield remote stdout; writes go to remote stdin.
    pub stream: DuplexStream,
    pub diagnostics: Arc<dyn DiagnosticSink>,
    pub close: CloseSignal,
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Takes over the channel. An error means the agent handshake failed and
    /// the launch is aborted.
    async fn attach(&self, channel: AgentChannel) -> Result<(), LaunchError>;
}

/// Control side of a started payload process.
pub struct ProcessHandle {
    stop: Arc<AtomicBool>,
    exit: watch::Receiver<Option<ExitInfo>>,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ProcessHandle {
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.borrow().clone()
    }

    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|tail| tail_lossy(&tail, STDERR_TAIL_BYTES))
            .unwrap_or_default()
    }

    /// Resolves once the pump has finished and exit information is known.
    pub async fn exited(&self) -> Option<ExitInfo> {
        let mut rx = self.exit.clone();
        loop {
            let current = rx.borrow().clone();
            if current.is_some() {
                return current;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Exit information if the process ends within `grace`.
    pub async fn wait_exit(&self, grace: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(grace, self.exited())
            .await
            .unwrap_or(None)
    }

    /// Stops the pump and closes the exec channel. Waits at most the close
    /// grace period; later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        let pump = self.pump.lock().ok().and_then(|mut slot| slot.take());
        if let Some(pump) = pump {
            let grace = Duration::from_millis(teardown_constants::PROCESS_CLOSE_GRACE_MS);
            let _ = tokio::time::timeout(grace, pump).await;
        }
    }
}

struct PumpIo {
    stdout: mpsc::Sender<Bytes>,
    stderr: mpsc::Sender<Bytes>,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
    stdin: mpsc::Receiver<Bytes>,
    stop: Arc<AtomicBool>,
}

fn pump(mut process: Box<dyn RemoteProcess>, mut io: PumpIo) -> ExitInfo {
    let mut buf = vec![0u8; RELAY_CHUNK_BYTES];
    let mut pending_out: Option<Bytes> = None;
    let mut pending_in: Option<Bytes> = None;
    let mut stdin_open = true;
    let idle = Duration::from_millis(network_constants::POLL_INTERVAL_MS);

    while !io.stop.load(Ordering::SeqCst) {
        let mut progressed = false;

        if let Some(chunk) = pending_out.take() {
            match io.stdout.try_send(chunk) {
                Ok(()) => progressed = true,
                Err(TrySendError::Full(chunk)) => pending_out = Some(chunk),
                Err(TrySendError::Closed(_)) => break,
            }
        }
        if pending_out.is_none() {
            match process.read_stdout(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    pending_out = Some(Bytes::copy_from_slice(&buf[..n]));
                    progressed = true;
                }
                Err(_) => break,
            }
        }

        if let Ok(n) = process.read_stderr(&mut buf) {
            if n > 0 {
                if let Ok(mut tail) = io.stderr_tail.lock() {
                    tail.extend_from_slice(&buf[..n]);
                    let excess = tail.len().saturating_sub(STDERR_TAIL_BYTES);
                    tail.drain(..excess);
                }
                let _ = io.stderr.blocking_send(Bytes::copy_from_slice(&buf[..n]));
                progressed = true;
            }
        }

        if pending_in.is_none() && stdin_open {
            match io.stdin.try_recv() {
                Ok(chunk) => pending_in = Some(chunk),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    stdin_open = false;
                    process.send_eof();
                }
            }
        }
        if let Some(chunk) = pending_in.take() {
            match process.write_stdin(&chunk) {
                Ok(n) if n >= chunk.len() => progressed = true,
                Ok(n) => {
                    progressed |= n > 0;
                    pending_in = Some(chunk.slice(n..));
                }
                Err(_) => break,
            }
        }

        if !progressed && pending_out.is_none() && process.is_eof() {
            break;
        }
        if !progressed {
            std::thread::sleep(idle);
        }
    }

    if let Some(chunk) = pending_out.take() {
        let _ = io.stdout.try_send(chunk);
    }
    process.close();
    process.exit_info()
}

pub struct ProcessLauncher {
    logger: Logger,
    window_size: u32,
}

impl ProcessLauncher {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("process"),
            window_size: network_constants::EXEC_WINDOW_SIZE,
        }
    }

    pub fn with_window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    /// Starts the payload and wires its stdio. Returns the control handle and
    /// the coordinator-facing end of the duplex stream.
    pub async fn start(
        &self,
        session: &SessionHandle,
        request: &StartRequest,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> Result<(Arc<ProcessHandle>, DuplexStream), LaunchError> {
        let command = build_launch_command(request);
        self.logger.info(
            "starting remote process",
            Some(&json!({"command": command, "window_size": self.window_size})),
        );
        let window_size = self.window_size;
        let process = session
            .with_session(move |remote| remote.start(&command, window_size))
            .await?;
        Ok(self.spawn_bridge(process, diagnostics))
    }

    fn spawn_bridge(
        &self,
        process: Box<dyn RemoteProcess>,
        diagnostics: Arc<dyn DiagnosticSink>,
    ) -> (Arc<ProcessHandle>, DuplexStream) {
        let (coordinator_side, bridge_side) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);
        let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge_side);
        let (stdout_tx, mut stdout_rx) = mpsc::channel::<Bytes>(RELAY_QUEUE_DEPTH);
        let (stderr_tx, mut stderr_rx) = mpsc::channel::<Bytes>(RELAY_QUEUE_DEPTH);
        let (stdin_tx, stdin_rx) = mpsc::channel::<Bytes>(RELAY_QUEUE_DEPTH);
        let (exit_tx, exit_rx) = watch::channel(None);
        let stop = Arc::new(AtomicBool::new(false));
        let stderr_tail = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(async move {
            while let Some(chunk) = stdout_rx.recv().await {
                if bridge_write.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = bridge_write.shutdown().await;
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; RELAY_CHUNK_BYTES];
            loop {
                match bridge_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdin_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(chunk) = stderr_rx.recv().await {
                diagnostics.write(&chunk);
            }
            diagnostics.close();
        });

        let io = PumpIo {
            stdout: stdout_tx,
            stderr: stderr_tx,
            stderr_tail: stderr_tail.clone(),
            stdin: stdin_rx,
            stop: stop.clone(),
        };
        let logger = self.logger.clone();
        let pump_task = tokio::task::spawn_blocking(move || {
            let exit = pump(process, io);
            logger.info(
                "remote process ended",
                Some(&json!({"exit_code": exit.exit_code, "signal": exit.signal})),
            );
            exit_tx.send_replace(Some(exit));
        });

        let handle = Arc::new(ProcessHandle {
            stop,
            exit: exit_rx,
            stderr_tail,
            pump: Mutex::new(Some(pump_task)),
            closed: AtomicBool::new(false),
        });
        (handle, coordinator_side)
    }

    /// Hands the channel to the coordinator. When it refuses, the process
    /// has often already died, so its exit status and last stderr output are
    /// collected within a short grace period and attached to the error.
    pub async fn bridge(
        &self,
        coordinator: &dyn Coordinator,
        channel: AgentChannel,
        handle: &ProcessHandle,
    ) -> Result<(), LaunchError> {
        let err = match coordinator.attach(channel).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let grace = Duration::from_millis(teardown_constants::START_FAILURE_GRACE_MS);
        let exit = handle.wait_exit(grace).await;
        let details = json!({
            "cause": err.message,
            "exit_code": exit.as_ref().and_then(|info| info.exit_code),
            "signal": exit.as_ref().and_then(|info| info.signal.clone()),
            "stderr_tail": handle.stderr_tail(),
        });
        self.logger.error("coordinator rejected the agent channel", Some(&details));
        let message = match exit.as_ref() {
            Some(ExitInfo {
                exit_code: Some(code),
                ..
            }) => format!(
                "Agent channel setup failed; remote process exited with status {}: {}",
                code, err.message
            ),
            Some(ExitInfo {
                signal: Some(signal),
                ..
            }) => format!(
                "Agent channel setup failed; remote process killed by signal {}: {}",
                signal, err.message
            ),
            _ => format!("Agent channel setup failed: {}", err.message),
        };
        Err(LaunchError::start(message).with_details(details))
    }
}
