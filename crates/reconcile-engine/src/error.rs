//! Engine error types.
//!
//! Only [`ControllerError`] ever leaves [`crate::Controller::run`]. Source and
//! reconcile failures are retried locally and logged.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by a [`crate::ResourceSource`].
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Transient transport, auth or decode failure. Retried with backoff.
    #[error("transport error: {0}")]
    Transport(String),

    /// The resource version we resumed from is no longer served; relist.
    #[error("resource version expired: {0}")]
    Gone(String),

    /// Unrecoverable source failure. Stops the sync loop.
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl From<kube::Error> for SourceError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(status) if status.code == 410 => Self::Gone(err.to_string()),
            _ => Self::Transport(err.to_string()),
        }
    }
}

/// Failure outcome of a single reconcile call.
#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    /// The reconciler reported a failure.
    #[error("reconcile failed: {0}")]
    Failed(String),

    /// The reconciler panicked; caught at the worker boundary.
    #[error("reconciler panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    /// Wraps any displayable error as a [`ReconcileError::Failed`].
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

/// A resource key could not be derived from an object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// `metadata.name` is unset.
    #[error("object has no metadata.name")]
    MissingName,

    /// The key string is not `name` or `namespace/name`.
    #[error("malformed resource key: {0}")]
    Malformed(String),
}

/// Errors surfaced by the controller supervisor.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The initial listing did not complete within the configured bound.
    #[error("timed out after {0:?} waiting for the initial sync")]
    StartupTimeout(Duration),

    /// The initial listing failed more often than the configured budget allows.
    #[error("initial listing failed {attempts} consecutive times: {source}")]
    SyncBudgetExhausted {
        /// Consecutive failed list attempts.
        attempts: u32,
        /// Last error returned by the source.
        #[source]
        source: SourceError,
    },

    /// The source reported an unrecoverable error.
    #[error("resource source failed: {0}")]
    Source(#[from] SourceError),

    /// The background sync task panicked or was aborted.
    #[error("sync task failed: {0}")]
    SyncTask(String),
}
