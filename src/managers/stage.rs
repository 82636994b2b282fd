use serde::Serialize;
use std::fmt;

/// Bootstrap state machine. Stages advance strictly in declaration order;
/// any failure jumps to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Connecting,
    Authenticated,
    Probed,
    RuntimeResolved,
    Deployed,
    Started,
    Bridged,
    Running,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Connecting => "connecting",
            Stage::Authenticated => "authenticated",
            Stage::Probed => "probed",
            Stage::RuntimeResolved => "runtime_resolved",
            Stage::Deployed => "deployed",
            Stage::Started => "started",
            Stage::Bridged => "bridged",
            Stage::Running => "running",
            Stage::Failed => "failed",
        }
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Idle => Some(Stage::Connecting),
            Stage::Connecting => Some(Stage::Authenticated),
            Stage::Authenticated => Some(Stage::Probed),
            Stage::Probed => Some(Stage::RuntimeResolved),
            Stage::RuntimeResolved => Some(Stage::Deployed),
            Stage::Deployed => Some(Stage::Started),
            Stage::Started => Some(Stage::Bridged),
            Stage::Bridged => Some(Stage::Running),
            Stage::Running | Stage::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Running | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered record of the stages one launch attempt walked through.
#[derive(Debug, Clone)]
pub struct StageTracker {
    current: Stage,
    history: Vec<Stage>,
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: Stage::Idle,
            history: vec![Stage::Idle],
        }
    }

    pub fn current(&self) -> Stage {
        self.current
    }

    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    /// Moves to `stage`, which must be the direct successor of the current
    /// stage. Returns false (and stays put) on an out-of-order transition.
    pub fn advance(&mut self, stage: Stage) -> bool {
        if self.current.next() != Some(stage) {
            return false;
        }
        self.current = stage;
        self.history.push(stage);
        true
    }

    pub fn fail(&mut self) {
        if self.current == Stage::Failed {
            return;
        }
        self.current = Stage::Failed;
        self.history.push(Stage::Failed);
    }
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}
