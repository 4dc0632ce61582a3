pub mod collaborator;
pub mod config;
pub mod daemon;
pub mod error;
pub mod io;
pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod paths;
pub mod report;
pub mod retry;
pub mod runner;
pub mod schedule;
pub mod step;
pub mod types;

pub use error::{RefreshError, Result};
