use std::io;
use std::time::Duration;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Config(String),
    #[error("feed parse failed: {0}")]
    Parse(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("feed responded with status {0}")]
    Status(u16),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("unrecognised command: {0}")]
    InvalidCommand(String),
    #[error("sync engine is no longer running")]
    EngineClosed,
}

impl AppError {
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            AppError::Parse(_) | AppError::Transport(_) | AppError::Timeout(_) | AppError::Status(_)
        )
    }
}
