pub mod config;
pub mod logging;

pub use config::OrchestratorConfig;
pub use logging::init_logging;
