pub mod api;
pub mod backend;
pub mod command;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod rate_limit;
pub mod stream;
pub mod transcode;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use api::{AppState, router};
pub use config::Config;
pub use error::{ApiError, JobError};
