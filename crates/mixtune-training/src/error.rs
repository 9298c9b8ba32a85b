use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    /// Invalid job definition. Always raised before any process is launched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A referenced artifact is absent at launch time.
    #[error("missing dependency: {what} not found at {}", path.display())]
    MissingDependency { what: String, path: PathBuf },

    /// The external trainer exited with a non-zero code (`None` when killed by a signal).
    #[error("trainer exited with {}", describe_exit(*code))]
    ChildProcess { code: Option<i32>, stderr_tail: Vec<String> },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainingError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn missing(what: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::MissingDependency { what: what.into(), path: path.into() }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "termination by signal".to_string(),
    }
}
