//! Schema module - Workflow definitions and run configuration.

mod config;
mod parameter;
mod workflow;

pub use config::*;
pub use parameter::*;
pub use workflow::*;
