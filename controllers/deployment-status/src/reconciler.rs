//! Status reporting for Deployments.
//!
//! Each reconcile writes a header line `[KIND] - namespace/name` followed by
//! the pretty-printed Deployment status.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use reconcile_engine::{EventKind, ReconcileError, Reconciler, ResourceKey};
use std::fmt;
use std::io::Write;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Reconciler that reports every observed Deployment change to a writer.
pub struct StatusPrinter<W> {
    out: Mutex<W>,
}

impl<W> fmt::Debug for StatusPrinter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusPrinter").finish_non_exhaustive()
    }
}

impl<W: Write + Send> StatusPrinter<W> {
    /// Creates a printer writing to `out`.
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    /// Consumes the printer and returns its writer.
    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Renders the report for one Deployment.
pub fn render(kind: EventKind, key: &ResourceKey, deployment: &Deployment) -> Result<String, serde_json::Error> {
    let status = deployment.status.clone().unwrap_or_default();
    let body = serde_json::to_string_pretty(&status)?;
    Ok(format!("[{kind}] - {key}\n{body}\n"))
}

#[async_trait]
impl<W: Write + Send> Reconciler<Deployment> for StatusPrinter<W> {
    async fn reconcile(&self, kind: EventKind, key: &ResourceKey, object: &Deployment) -> Result<(), ReconcileError> {
        debug!("Reporting status of Deployment {}", key);
        let report = render(kind, key, object).map_err(ReconcileError::failed)?;

        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(report.as_bytes())
            .and_then(|()| out.flush())
            .map_err(ReconcileError::failed)?;

        info!(
            kind = %kind,
            generation = object.metadata.generation.unwrap_or_default(),
            "Reported Deployment {}",
            key
        );
        Ok(())
    }
}
