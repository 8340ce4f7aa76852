//! KDL configuration parsing for Foreman.
//!
//! This crate handles parsing of the distributor configuration
//! (`foreman.kdl`): the workspace directory, worker nodes and projects.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{ForemanConfig, load_config, parse_config};
