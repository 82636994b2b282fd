pub mod deploy;
pub mod host_keys;
pub mod orchestrator;
pub mod process;
pub mod runtime;
pub mod ssh;
pub mod stage;
pub mod teardown;
