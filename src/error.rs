use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("no accounts available")]
    NoAccounts,

    #[error("account index {0} out of range")]
    InvalidIndex(usize),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("project id unresolved: {0}")]
    ProjectIdUnresolved(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("account error: {0}")]
    Account(String),

    #[error("configuration error: {0}")]
    Config(String),

    // Attempt loop completed with no usable response; maps to a synthetic 500.
    #[error("all accounts exhausted")]
    Exhausted,
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type AppResult<T> = Result<T, AppError>;
