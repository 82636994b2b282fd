pub mod credentials;
pub mod diagnostics;
pub mod launch_config;
pub mod logger;
pub mod registry;
pub mod validation;
