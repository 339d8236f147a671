use thiserror::Error;

/// Failure of one external call. Every kind is retried in place by the
/// supervisor; none of them is fatal on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("auth failure: {0}")]
    Auth(String),

    #[error("parse failure: {0}")]
    Parse(String),

    #[error("synthesis failure: {0}")]
    Synthesis(String),

    #[error("discovery failure: {0}")]
    Discovery(String),

    #[error("playback failure: {0}")]
    Playback(String),
}

pub type StageResult<T> = Result<T, StageError>;
