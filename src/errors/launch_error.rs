use crate::managers::stage::Stage;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchErrorKind {
    InvalidConfig,
    ConnectRecoverable,
    ConnectTerminal,
    Auth,
    TrustRejected,
    HeaderJunk,
    RuntimeNotFound,
    TransferUnavailable,
    Deploy,
    Start,
    Timeout,
    Busy,
    Internal,
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct LaunchError {
    pub kind: LaunchErrorKind,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub retryable: bool,
}

impl LaunchError {
    pub fn new(
        kind: LaunchErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            hint: None,
            details: None,
            stage: None,
            retryable: matches!(kind, LaunchErrorKind::ConnectRecoverable),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Records the stage the error surfaced in. The first stage wins so that
    /// errors re-wrapped by the orchestrator keep their origin.
    pub fn at_stage(mut self, stage: Stage) -> Self {
        if self.stage.is_none() {
            self.stage = Some(stage);
        }
        self
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(LaunchErrorKind::InvalidConfig, "INVALID_CONFIG", message)
    }

    pub fn connect_recoverable(message: impl Into<String>) -> Self {
        Self::new(
            LaunchErrorKind::ConnectRecoverable,
            "CONNECT_RECOVERABLE",
            message,
        )
    }

    pub fn connect_terminal(message: impl Into<String>) -> Self {
        Self::new(LaunchErrorKind::ConnectTerminal, "CONNECT_FAILED", message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(LaunchErrorKind::Auth, "AUTH_FAILED", message)
    }

    pub fn trust_rejected(message: impl Into<String>) -> Self {
        Self::new(LaunchErrorKind::TrustRejected, "HOST_KEY_REJECTED", message)
    }

    pub fn header_junk(message: impl Into<String>) -> Self {
        Self::new(LaunchErrorKind::HeaderJunk, "HEADER_JUNK", message)
    }

    pub fn runtime_not_found(message: impl Into<String>) -> Self {
        Self::new(
            LaunchErrorKind::RuntimeNotFound,
            "RUNTIME_NOT_FOUND",
            message,
        )
    }

    pub fn transfer_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            LaunchErrorKind::TransferUnavailable,
            "TRANSFER_UNAVAILABLE",
            message,
        )
    }

    pub fn deploy(message: impl Into<String>) -> Self {
        Self::new(LaunchErrorKind::Deploy, "DEPLOY_FAILED", message)
    }

    pub fn start(message: impl Into<String>) -> Self {
        Self::new(LaunchErrorKind::Start, "START_FAILED", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(LaunchErrorKind::Timeout, "TIMEOUT", message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(LaunchErrorKind::Busy, "BUSY", message)
    }

    /// The launch was torn down underneath a running stage.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(LaunchErrorKind::Internal, "CANCELLED", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(LaunchErrorKind::Internal, "INTERNAL", message)
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind == LaunchErrorKind::ConnectRecoverable
    }

    pub fn log_meta(&self) -> Value {
        serde_json::json!({
            "code": self.code,
            "kind": self.kind,
            "stage": self.stage,
            "details": self.details,
        })
    }
}

impl From<std::io::Error> for LaunchError {
    fn from(err: std::io::Error) -> Self {
        LaunchError::internal(err.to_string())
    }
}
