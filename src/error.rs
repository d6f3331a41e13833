use thiserror::Error;

use crate::agent::AgentError;
use crate::config::ConfigError;
use crate::upstream::UpstreamError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, WorkerError>;
