use super::{Endpoint, ExecOutput, RemoteSession};
use crate::errors::LaunchError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared handle to one authenticated connection. Blocking transport calls
/// run on the blocking pool so async callers never stall the runtime.
#[derive(Clone)]
pub struct SessionHandle {
    endpoint: Endpoint,
    inner: Arc<Mutex<Box<dyn RemoteSession>>>,
    closed: Arc<AtomicBool>,
}

impl SessionHandle {
    pub fn new(endpoint: Endpoint, session: Box<dyn RemoteSession>) -> Self {
        Self {
            endpoint,
            inner: Arc::new(Mutex::new(session)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn with_session<T, F>(&self, f: F) -> Result<T, LaunchError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn RemoteSession) -> Result<T, LaunchError> + Send + 'static,
    {
        if self.is_closed() {
            return Err(LaunchError::internal(format!(
                "Session to {} is already closed",
                self.endpoint.address()
            )));
        }
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| LaunchError::internal("session lock poisoned"))?;
            f(guard.as_mut())
        })
        .await
        .map_err(|err| LaunchError::internal(format!("session task failed: {}", err)))?
    }

    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, LaunchError> {
        let command = command.to_string();
        self.with_session(move |session| session.exec(&command, timeout))
            .await
    }

    /// Disconnects once; later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = inner.lock() {
                guard.close();
            }
        })
        .await;
    }
}
