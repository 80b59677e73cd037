//! Error types for the conductor and the timeline resolver.

use thiserror::Error;

use crate::types::{DeviceId, DeviceType};

/// Errors produced while resolving a timeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Invalid expression on object {object_id}: {expression}")]
    InvalidExpression { object_id: String, expression: String },

    #[error("Duplicate timeline object id: {0}")]
    DuplicateId(String),
}

/// Errors surfaced by the conductor.
///
/// Most of these are reported as events rather than returned; only device
/// registration and lookup failures reach the caller directly.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// The resolution capability failed; the pass is aborted.
    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolveError),

    /// A device rejected a call. Isolated to that device.
    #[error("Error in device \"{device_id}\": {message}")]
    DeviceDispatch { device_id: DeviceId, message: String },

    #[error("No device factory registered for type \"{0}\"")]
    UnknownDeviceType(DeviceType),

    #[error("No device found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("Device \"{0}\" is no longer running")]
    DeviceStopped(DeviceId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ConductorResult<T> = Result<T, ConductorError>;

impl From<anyhow::Error> for ConductorError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl ConductorError {
    pub fn dispatch(device_id: &DeviceId, err: impl std::fmt::Display) -> Self {
        Self::DeviceDispatch {
            device_id: device_id.clone(),
            message: err.to_string(),
        }
    }
}
