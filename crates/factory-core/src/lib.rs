mod agent;
pub mod config;
pub mod diff;
pub mod error;
pub mod event_bus;
pub mod file_changes;
pub mod git;
pub mod history;
pub mod orchestrator;
pub mod project;
pub mod review;
pub mod sandbox;
pub mod usage;

pub use config::*;
pub use diff::*;
pub use error::*;
pub use event_bus::*;
pub use file_changes::*;
pub use git::*;
pub use history::*;
pub use orchestrator::*;
pub use project::*;
pub use review::*;
pub use sandbox::*;
pub use usage::*;
