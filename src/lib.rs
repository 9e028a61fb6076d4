pub mod database;
pub mod docker;
pub mod error;
pub mod models;
pub mod shared;

pub use error::{OrchestratorError, Result};
