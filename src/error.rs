//! Renderer error types

use crate::backend::sync::SyncError;
use crate::backend::BackendError;
use crate::jobs::JobError;
use crate::pipeline::FrameStage;
use crate::resources::material::MaterialError;
use crate::resources::promotion::PromotionError;
use crate::resources::shader::ShaderError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why the device has to be recreated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLossReason {
    /// The backend reported the device as removed or reset.
    Removed(String),
    /// The default adapter is no longer the one the device was created on.
    AdapterChanged { recorded: String, current: String },
    /// A bounded GPU wait expired.
    WaitTimeout {
        fence: String,
        target: u64,
        completed: u64,
        waited: Duration,
    },
    /// Presenting the back buffer failed.
    PresentFailed(String),
}

impl fmt::Display for DeviceLossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceLossReason::Removed(reason) => write!(f, "device removed: {reason}"),
            DeviceLossReason::AdapterChanged { recorded, current } => {
                write!(f, "adapter changed from {recorded} to {current}")
            }
            DeviceLossReason::WaitTimeout {
                fence,
                target,
                completed,
                waited,
            } => write!(
                f,
                "fence '{fence}' did not reach {target} within {waited:?} (completed {completed})"
            ),
            DeviceLossReason::PresentFailed(reason) => write!(f, "present failed: {reason}"),
        }
    }
}

impl From<SyncError> for DeviceLossReason {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Timeout {
                fence,
                target,
                completed,
                waited,
            } => DeviceLossReason::WaitTimeout {
                fence,
                target,
                completed,
                waited,
            },
            SyncError::NeverSubmitted {
                fence,
                target,
                submitted,
                waited,
            } => DeviceLossReason::WaitTimeout {
                fence,
                target,
                completed: submitted,
                waited,
            },
        }
    }
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("GPU device lost: {0}")]
    DeviceLost(DeviceLossReason),
    #[error(transparent)]
    Backend(BackendError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to load configuration from {path}: {message}")]
    ConfigLoad { path: String, message: String },
    #[error("Frame stage {found:?} entered while {expected:?} was expected")]
    StageOrder {
        expected: FrameStage,
        found: FrameStage,
    },
    #[error("Resource hazard: {0}")]
    Hazard(String),
    #[error(transparent)]
    Promotion(#[from] PromotionError),
    #[error(transparent)]
    Shader(#[from] ShaderError),
    #[error(transparent)]
    Material(#[from] MaterialError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("Scene load failed: {0}")]
    SceneLoad(String),
    #[error("{0} is not ready")]
    NotReady(String),
}

impl RendererError {
    /// Errors that require tearing down and recreating all GPU state.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, RendererError::DeviceLost(_))
    }
}

impl From<SyncError> for RendererError {
    fn from(err: SyncError) -> Self {
        RendererError::DeviceLost(err.into())
    }
}

impl From<BackendError> for RendererError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::DeviceLost(reason) => {
                RendererError::DeviceLost(DeviceLossReason::Removed(reason))
            }
            BackendError::Sync(sync) => sync.into(),
            BackendError::StateMismatch(message) => RendererError::Hazard(message),
            other => RendererError::Backend(other),
        }
    }
}

pub type RendererResult<T> = Result<T, RendererError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_becomes_device_loss() {
        let err: RendererError = SyncError::Timeout {
            fence: "frame".to_string(),
            target: 4,
            completed: 2,
            waited: Duration::from_millis(5),
        }
        .into();
        assert!(err.is_device_lost());
        let text = err.to_string();
        assert!(text.contains("frame"));
        assert!(text.contains('4'));
    }

    #[test]
    fn test_backend_device_lost_maps_to_device_loss() {
        let err: RendererError = BackendError::DeviceLost("reset".to_string()).into();
        assert!(matches!(
            err,
            RendererError::DeviceLost(DeviceLossReason::Removed(_))
        ));
    }

    #[test]
    fn test_state_mismatch_maps_to_hazard() {
        let err: RendererError = BackendError::StateMismatch("albedo".to_string()).into();
        assert!(matches!(err, RendererError::Hazard(_)));
    }
}
