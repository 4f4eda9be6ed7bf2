//! Controller-specific error types.
//!
//! Everything that can end the process early, each mapped to an exit code.

use kube::Error as KubeError;
use reconcile_engine::ControllerError;
use thiserror::Error;

/// Errors that can occur in the Deployment Status Controller.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kubernetes client could not be built
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// The reconcile engine stopped with an error
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),
}

impl AppError {
    /// Process exit code for this error.
    ///
    /// Startup that never reached a synced mirror exits with 2; every other
    /// failure exits with 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Controller(ControllerError::StartupTimeout(_) | ControllerError::SyncBudgetExhausted { .. }) => 2,
            Self::InvalidConfig(_) | Self::Kube(_) | Self::Controller(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile_engine::SourceError;
    use std::time::Duration;

    #[test]
    fn test_exit_codes() {
        assert_eq!(AppError::InvalidConfig("WORKERS".to_string()).exit_code(), 1);
        assert_eq!(
            AppError::from(ControllerError::StartupTimeout(Duration::from_secs(120))).exit_code(),
            2
        );
        assert_eq!(
            AppError::from(ControllerError::SyncBudgetExhausted {
                attempts: 5,
                source: SourceError::Transport("refused".to_string()),
            })
            .exit_code(),
            2
        );
        assert_eq!(
            AppError::from(ControllerError::Source(SourceError::Fatal("forbidden".to_string()))).exit_code(),
            1
        );
    }
}
