//! Engine-level errors.
//!
//! Probe-level failures never reach callers of `measure_now`; these errors
//! only surface while building an engine.

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

/// Errors returned when constructing a [`NetworkQualityEngine`](crate::NetworkQualityEngine).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The default HTTP transport could not be created.
    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),

    /// Periodic mode needs a tokio runtime to spawn the scheduler on.
    #[error("Periodic measurement requires a tokio runtime")]
    NoRuntime,
}
