//! Error taxonomy for the control engine.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad or missing directories, malformed targets. The command is rejected unchanged.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Too few samples per entity or in the raw stream. Aborts Optimize before training.
    #[error("insufficient data: {0}")]
    DataInsufficiency(String),

    /// One entity's persisted model is missing or corrupt.
    #[error("failed to load model for {entity}: {reason}")]
    ModelLoad { entity: String, reason: String },

    /// NaN, infinity or out-of-range values in a measurement.
    #[error("numeric anomaly: {0}")]
    NumericAnomaly(String),

    #[error("device disconnected for {0:?}")]
    DeviceDisconnected(Duration),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while stopping or spawning a background worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker `{name}` did not stop within {timeout:?}")]
    JoinTimeout { name: String, timeout: Duration },

    #[error("worker `{0}` panicked")]
    Panicked(String),

    #[error("failed to spawn worker `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Configuration(msg.into())
    }
}
