use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while configuring or running a fine-tuning job.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    /// Invalid freeze or adapter targeting, detected before training starts.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(
        "numerical instability in epoch {epoch}: {non_finite_steps} non-finite steps exceed the limit of {limit}"
    )]
    NumericalInstability {
        epoch: usize,
        non_finite_steps: usize,
        limit: usize,
    },
    #[error("collective communication failed: {0}")]
    Communication(String),
    #[error("checkpoint I/O failed at {}: {message}", path.display())]
    CheckpointIo { path: PathBuf, message: String },
    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication(message.into())
    }

    pub fn checkpoint_io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CheckpointIo {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Communication(_))
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

/// Terminal outcome of a run that did not complete.
#[derive(Debug, Error)]
#[error("run failed after epoch {}: {reason}", display_epoch(.last_completed_epoch))]
pub struct RunFailure {
    pub reason: TrainingError,
    /// Last epoch whose training, validation and checkpoint decision finished.
    pub last_completed_epoch: Option<usize>,
}

fn display_epoch(epoch: &Option<usize>) -> String {
    epoch.map_or_else(|| "none".to_string(), |e| e.to_string())
}
