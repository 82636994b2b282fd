use super::{
    classify_connect_failure, ConnectOptions, Connector, Endpoint, ExecOutput, ExitInfo,
    FileTransfer, RemoteProcess, RemoteSession, RemoteStat,
};
use crate::constants::network as network_constants;
use crate::errors::LaunchError;
use crate::managers::host_keys::{HostIdentity, HostKeyVerifier};
use crate::services::credentials::Credential;
use crate::services::logger::Logger;
use ssh2::{ErrorCode, FileStat, HostKeyType, MethodType, OpenFlags, OpenType, Session};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

/// libssh2 session error codes that mean the peer went away mid-handshake.
const SESSION_DISCONNECT_CODES: &[i32] = &[
    -2,  // banner receive
    -9,  // timeout
    -13, // socket disconnect
    -43, // socket receive
];
const SFTP_NO_SUCH_FILE: i32 = 2;

pub struct Ssh2Connector {
    logger: Logger,
}

impl Ssh2Connector {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("ssh"),
        }
    }
}

fn key_type_name(key_type: HostKeyType) -> &'static str {
    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        HostKeyType::Unknown => "unknown",
    }
}

/// Canonical text for a libssh2 error, so the connect classification can
/// treat a dropped handshake like the OS-level equivalent.
fn ssh_error_text(err: &ssh2::Error) -> String {
    match err.code() {
        ErrorCode::Session(code) if SESSION_DISCONNECT_CODES.contains(&code) => {
            format!("premature connection close: {}", err.message())
        }
        _ => err.message().to_string(),
    }
}

fn connect_failure(context: &str, text: &str) -> LaunchError {
    let message = format!("{}: {}", context, text);
    if classify_connect_failure(text) {
        LaunchError::connect_recoverable(message)
    } else {
        LaunchError::connect_terminal(message)
    }
}

fn is_not_found(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE))
}

fn deploy_error(context: &str, err: ssh2::Error) -> LaunchError {
    LaunchError::deploy(format!("{}: {}", context, err.message()))
}

fn would_block_as_zero(result: io::Result<usize>) -> io::Result<usize> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
        other => other,
    }
}

/// Repeats a non-blocking libssh2 call until it stops returning EAGAIN or the
/// grace period runs out.
fn retry_would_block<T>(
    grace: Duration,
    mut call: impl FnMut() -> Result<T, ssh2::Error>,
) -> Result<T, ssh2::Error> {
    let deadline = Instant::now() + grace;
    loop {
        match call() {
            Err(err)
                if err.code() == ErrorCode::Session(-37) && Instant::now() < deadline =>
            {
                std::thread::sleep(Duration::from_millis(network_constants::POLL_INTERVAL_MS));
            }
            other => return other,
        }
    }
}

impl Connector for Ssh2Connector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectOptions,
        verifier: &dyn HostKeyVerifier,
    ) -> Result<Box<dyn RemoteSession>, LaunchError> {
        let addrs: Vec<SocketAddr> = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|err| {
                LaunchError::connect_terminal(format!(
                    "Failed to resolve {}: {}",
                    endpoint.host, err
                ))
            })?
            .collect();
        if addrs.is_empty() {
            return Err(LaunchError::connect_terminal(format!(
                "No address found for {}",
                endpoint.host
            )));
        }

        let mut last_error: Option<io::Error> = None;
        let mut tcp = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, options.connect_timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(err) => last_error = Some(err),
            }
        }
        let tcp = match tcp {
            Some(tcp) => tcp,
            None => {
                let text = last_error
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "connection failed".to_string());
                return Err(connect_failure(
                    &format!("Failed to connect to {}", endpoint.address()),
                    &text,
                ));
            }
        };
        if let Err(err) = tcp.set_nodelay(options.tcp_no_delay) {
            self.logger.debug(
                "failed to set TCP_NODELAY",
                Some(&serde_json::json!({"error": err.to_string()})),
            );
        }

        let mut session = Session::new()
            .map_err(|_| LaunchError::internal("Failed to create SSH session"))?;
        let preferred = verifier.preferred_algorithms();
        if !preferred.is_empty() {
            if let Err(err) = session.method_pref(MethodType::HostKey, &preferred.join(",")) {
                self.logger.debug(
                    "host key algorithm preference rejected",
                    Some(&serde_json::json!({"error": err.message()})),
                );
            }
        }
        session.set_tcp_stream(tcp);
        session.set_timeout(options.connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(|err| {
            connect_failure(
                &format!("SSH handshake with {} failed", endpoint.address()),
                &ssh_error_text(&err),
            )
        })?;

        let identity = {
            let (raw, key_type) = session.host_key().ok_or_else(|| {
                LaunchError::connect_terminal("Server did not present a host key")
            })?;
            HostIdentity::new(key_type_name(key_type), raw.to_vec())
        };
        if !verifier.verify(&identity) {
            return Err(LaunchError::trust_rejected(format!(
                "Host key for {} rejected by {} policy",
                endpoint.address(),
                verifier.name()
            ))
            .with_details(serde_json::json!({
                "algorithm": identity.algorithm(),
                "fingerprint": identity.fingerprint_sha256(),
                "policy": verifier.name(),
            })));
        }

        let interval = std::cmp::max(1, options.keepalive_interval.as_secs() as u32);
        session.set_keepalive(true, interval);

        Ok(Box::new(Ssh2Session {
            session,
            logger: self.logger.clone(),
        }))
    }
}

pub struct Ssh2Session {
    session: Session,
    logger: Logger,
}

impl RemoteSession for Ssh2Session {
    fn authenticate(&mut self, credential: &Credential) -> Result<(), LaunchError> {
        let result = match credential {
            Credential::PrivateKey {
                username,
                private_key,
                passphrase,
            } => self.session.userauth_pubkey_memory(
                username,
                None,
                private_key,
                passphrase.as_deref(),
            ),
            Credential::Password { username, password } => {
                self.session.userauth_password(username, password)
            }
        };
        if let Err(err) = result {
            return Err(LaunchError::auth(format!(
                "SSH authentication failed for user {} ({}): {}",
                credential.username(),
                credential.method(),
                err.message()
            )));
        }
        if !self.session.authenticated() {
            return Err(LaunchError::auth(format!(
                "SSH authentication failed for user {}",
                credential.username()
            )));
        }
        Ok(())
    }

    fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, LaunchError> {
        let mut channel = self
            .session
            .channel_session()
            .map_err(|err| LaunchError::internal(format!("Failed to open channel: {}", err.message())))?;
        channel
            .exec(command)
            .map_err(|err| LaunchError::internal(format!("Failed to exec: {}", err.message())))?;
        self.session.set_blocking(false);

        let mut output = ExecOutput::default();
        let mut stderr_stream = channel.stderr();
        let started = Instant::now();
        let mut buf = [0u8; 8192];
        let loop_result: Result<(), LaunchError> = loop {
            let mut progressed = false;
            match would_block_as_zero(channel.read(&mut buf)) {
                Ok(n) if n > 0 => {
                    output.stdout.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Ok(_) => {}
                Err(err) => {
                    break Err(LaunchError::internal(format!("SSH stdout read failed: {}", err)))
                }
            }
            match would_block_as_zero(stderr_stream.read(&mut buf)) {
                Ok(n) if n > 0 => {
                    output.stderr.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Ok(_) => {}
                Err(err) => {
                    break Err(LaunchError::internal(format!("SSH stderr read failed: {}", err)))
                }
            }
            if channel.eof() && !progressed {
                break Ok(());
            }
            if started.elapsed() > timeout {
                output.timed_out = true;
                break Ok(());
            }
            if !progressed {
                std::thread::sleep(Duration::from_millis(network_constants::POLL_INTERVAL_MS));
            }
        };
        let grace = Duration::from_millis(network_constants::TIMEOUT_SSH_EXEC_HARD_GRACE_MS);
        if output.timed_out {
            let _ = retry_would_block(grace, || channel.close());
        }
        let _ = retry_would_block(grace, || channel.wait_close());
        self.session.set_blocking(true);
        loop_result?;
        if !output.timed_out {
            output.exit_code = channel.exit_status().ok();
        }
        Ok(output)
    }

    fn file_transfer(&mut self) -> Result<Box<dyn FileTransfer>, LaunchError> {
        let sftp = self.session.sftp().map_err(|err| {
            LaunchError::transfer_unavailable(format!(
                "SFTP subsystem unavailable: {}",
                err.message()
            ))
        })?;
        Ok(Box::new(Ssh2FileTransfer { sftp }))
    }

    fn stream_copy(
        &mut self,
        remote_path: &str,
        mode: i32,
        payload: &[u8],
    ) -> Result<u64, LaunchError> {
        let mut channel = self
            .session
            .scp_send(Path::new(remote_path), mode, payload.len() as u64, None)
            .map_err(|err| deploy_error("SCP upload could not start", err))?;
        channel
            .write_all(payload)
            .map_err(|err| LaunchError::deploy(format!("SCP upload failed: {}", err)))?;
        channel
            .send_eof()
            .and_then(|_| channel.wait_eof())
            .and_then(|_| channel.close())
            .and_then(|_| channel.wait_close())
            .map_err(|err| deploy_error("SCP upload did not complete", err))?;
        Ok(payload.len() as u64)
    }

    fn start(
        &mut self,
        command: &str,
        window_size: u32,
    ) -> Result<Box<dyn RemoteProcess>, LaunchError> {
        let mut channel = self
            .session
            .channel_open(
                "session",
                window_size,
                network_constants::EXEC_PACKET_SIZE,
                None,
            )
            .map_err(|err| {
                LaunchError::start(format!("Failed to open exec channel: {}", err.message()))
            })?;
        channel.exec(command).map_err(|err| {
            LaunchError::start(format!("Failed to start remote process: {}", err.message()))
        })?;
        self.session.set_blocking(false);
        Ok(Box::new(Ssh2Process {
            session: self.session.clone(),
            channel,
            closed: false,
        }))
    }

    fn close(&mut self) {
        self.session.set_blocking(true);
        if let Err(err) = self
            .session
            .disconnect(None, "agent bootstrap teardown", None)
        {
            self.logger.debug(
                "SSH disconnect failed",
                Some(&serde_json::json!({"error": err.message()})),
            );
        }
    }
}

pub struct Ssh2FileTransfer {
    sftp: ssh2::Sftp,
}

impl FileTransfer for Ssh2FileTransfer {
    fn stat(&mut self, path: &str) -> Result<Option<RemoteStat>, LaunchError> {
        match self.sftp.stat(Path::new(path)) {
            Ok(stat) => Ok(Some(RemoteStat {
                is_dir: stat.is_dir(),
                is_file: stat.is_file(),
                size: stat.size,
            })),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(deploy_error(&format!("stat {} failed", path), err)),
        }
    }

    fn mkdir(&mut self, path: &str, mode: i32) -> Result<(), LaunchError> {
        self.sftp
            .mkdir(Path::new(path), mode)
            .map_err(|err| deploy_error(&format!("mkdir {} failed", path), err))
    }

    fn remove(&mut self, path: &str) -> Result<(), LaunchError> {
        match self.sftp.unlink(Path::new(path)) {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(deploy_error(&format!("remove {} failed", path), err)),
        }
    }

    fn write(&mut self, path: &str, payload: &[u8], mode: i32) -> Result<u64, LaunchError> {
        let mut remote_file = self
            .sftp
            .open_mode(
                Path::new(path),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode,
                OpenType::File,
            )
            .map_err(|err| deploy_error(&format!("open {} failed", path), err))?;
        remote_file
            .write_all(payload)
            .map_err(|err| LaunchError::deploy(format!("write {} failed: {}", path, err)))?;
        drop(remote_file);
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode as u32),
            atime: None,
            mtime: None,
        };
        self.sftp
            .setstat(Path::new(path), stat)
            .map_err(|err| deploy_error(&format!("chmod {} failed", path), err))?;
        Ok(payload.len() as u64)
    }
}

pub struct Ssh2Process {
    session: Session,
    channel: ssh2::Channel,
    closed: bool,
}

impl RemoteProcess for Ssh2Process {
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        would_block_as_zero(self.channel.read(buf))
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        would_block_as_zero(self.channel.stderr().read(buf))
    }

    fn write_stdin(&mut self, data: &[u8]) -> io::Result<usize> {
        let written = would_block_as_zero(self.channel.write(data))?;
        if written > 0 {
            let _ = self.channel.flush();
        }
        Ok(written)
    }

    fn send_eof(&mut self) {
        let grace = Duration::from_millis(network_constants::TIMEOUT_SSH_EXEC_HARD_GRACE_MS);
        let _ = retry_would_block(grace, || self.channel.send_eof());
    }

    fn is_eof(&mut self) -> bool {
        self.channel.eof()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let grace = Duration::from_millis(network_constants::TIMEOUT_SSH_EXEC_HARD_GRACE_MS);
        let _ = retry_would_block(grace, || self.channel.close());
        let _ = retry_would_block(grace, || self.channel.wait_close());
        self.session.set_blocking(true);
    }

    fn exit_info(&mut self) -> ExitInfo {
        if !self.channel.eof() {
            return ExitInfo::default();
        }
        ExitInfo {
            exit_code: self.channel.exit_status().ok(),
            signal: self
                .channel
                .exit_signal()
                .ok()
                .and_then(|sig| sig.exit_signal),
        }
    }
}
