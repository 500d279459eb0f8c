//! Tracker error types

use skywatch_core::CoreError;
use skywatch_rules::RulesError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Rule error: {0}")]
    Rules(#[from] RulesError),

    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No resample data recorded; enable `resample` and ingest reports first")]
    NoResampleData,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Engine already started")]
    AlreadyStarted,

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type TrackerResult<T> = Result<T, TrackerError>;
