//! ParaBank Common Library
//!
//! Shared configuration, error and data types for the ParaBank UI automation
//! harness.

pub mod config;
pub mod error;
pub mod types;
pub mod user_factory;

// Re-export commonly used types
pub use config::{Environment, Settings};
pub use error::{Error, Result};
pub use types::*;
pub use user_factory::UserFactory;

/// Harness version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default results directory (state files, result JSON)
pub fn default_results_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("test-results")
}

/// Default configuration directory
pub fn default_config_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("config")
}
