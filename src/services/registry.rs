use crate::errors::LaunchError;
use crate::managers::teardown::Teardown;
use crate::services::logger::Logger;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchState {
    Launching,
    Running,
    TearingDown,
}

struct RegistryEntry {
    launch_id: String,
    state: LaunchState,
    teardown: Option<Arc<Teardown>>,
}

/// Open launches by target id. At most one launch (including its teardown)
/// exists per target at any time.
pub struct LaunchRegistry {
    logger: Logger,
    entries: DashMap<String, RegistryEntry>,
}

impl LaunchRegistry {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("registry"),
            entries: DashMap::new(),
        }
    }

    /// Reserves `target_id` for `launch_id`. Fails with `Busy` while another
    /// launch for the target is starting, running, or tearing down.
    pub fn claim(&self, target_id: &str, launch_id: &str) -> Result<(), LaunchError> {
        match self.entries.entry(target_id.to_string()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                Err(LaunchError::busy(format!(
                    "Target {} already has an active launch",
                    target_id
                ))
                .with_details(serde_json::json!({
                    "launch_id": existing.launch_id,
                    "state": existing.state,
                })))
            }
            Entry::Vacant(slot) => {
                slot.insert(RegistryEntry {
                    launch_id: launch_id.to_string(),
                    state: LaunchState::Launching,
                    teardown: None,
                });
                self.logger.debug(
                    "claimed",
                    Some(&serde_json::json!({"target_id": target_id, "launch_id": launch_id})),
                );
                Ok(())
            }
        }
    }

    pub fn attach_teardown(&self, target_id: &str, launch_id: &str, teardown: Arc<Teardown>) {
        if let Some(mut entry) = self.entries.get_mut(target_id) {
            if entry.launch_id == launch_id {
                entry.teardown = Some(teardown);
            }
        }
    }

    pub fn set_state(&self, target_id: &str, launch_id: &str, state: LaunchState) {
        if let Some(mut entry) = self.entries.get_mut(target_id) {
            if entry.launch_id == launch_id {
                entry.state = state;
            }
        }
    }

    /// Drops the reservation, but only if it still belongs to `launch_id`.
    pub fn release(&self, target_id: &str, launch_id: &str) {
        let removed = self
            .entries
            .remove_if(target_id, |_, entry| entry.launch_id == launch_id);
        if removed.is_some() {
            self.logger.debug(
                "released",
                Some(&serde_json::json!({"target_id": target_id, "launch_id": launch_id})),
            );
        }
    }

    pub fn state(&self, target_id: &str) -> Option<LaunchState> {
        self.entries.get(target_id).map(|entry| entry.state)
    }

    pub fn active_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        targets.sort();
        targets
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tears down every registered launch concurrently. Used from the host
    /// process's stop hook.
    pub async fn shutdown_all(&self) {
        let teardowns: Vec<Arc<Teardown>> = self
            .entries
            .iter()
            .filter_map(|entry| entry.teardown.clone())
            .collect();
        if teardowns.is_empty() {
            return;
        }
        self.logger.info(
            "shutting down open launches",
            Some(&serde_json::json!({"count": teardowns.len()})),
        );
        join_all(teardowns.iter().map(|teardown| teardown.run())).await;
    }
}
