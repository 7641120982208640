mod command;
mod kubernetes;

use std::future::Future;

use eyre::Result;

pub use crate::backend::command::{CommandBackend, CommandConfig};
pub use crate::backend::kubernetes::{KubernetesBackend, KubernetesDrainConfig, MANAGED_LABEL_KEY};
use crate::metadata::ScheduledEvent;

/// Moves workloads off this instance and back.
///
/// `drain` and `uncordon` never fail loudly: the backend logs what went wrong
/// and reports `false`, the engine retries on its next cycle.
pub trait Evacuate: Send + Sync {
    fn instance_name(&self) -> &str;

    /// Checked once at startup. An error here keeps the process from starting.
    fn test(&self) -> impl Future<Output = Result<()>> + Send;

    fn drain(&self, event: &ScheduledEvent) -> impl Future<Output = bool> + Send;

    fn uncordon(&self) -> impl Future<Output = bool> + Send;
}

/// The backend chosen by configuration. Never switches at runtime.
pub enum EvacuationBackend {
    Kubernetes(KubernetesBackend),
    Command(CommandBackend),
    Noop(NoopBackend),
}

impl Evacuate for EvacuationBackend {
    fn instance_name(&self) -> &str {
        match self {
            EvacuationBackend::Kubernetes(backend) => backend.instance_name(),
            EvacuationBackend::Command(backend) => backend.instance_name(),
            EvacuationBackend::Noop(backend) => backend.instance_name(),
        }
    }

    async fn test(&self) -> Result<()> {
        match self {
            EvacuationBackend::Kubernetes(backend) => backend.test().await,
            EvacuationBackend::Command(backend) => backend.test().await,
            EvacuationBackend::Noop(backend) => backend.test().await,
        }
    }

    async fn drain(&self, event: &ScheduledEvent) -> bool {
        match self {
            EvacuationBackend::Kubernetes(backend) => backend.drain(event).await,
            EvacuationBackend::Command(backend) => backend.drain(event).await,
            EvacuationBackend::Noop(backend) => backend.drain(event).await,
        }
    }

    async fn uncordon(&self) -> bool {
        match self {
            EvacuationBackend::Kubernetes(backend) => backend.uncordon().await,
            EvacuationBackend::Command(backend) => backend.uncordon().await,
            EvacuationBackend::Noop(backend) => backend.uncordon().await,
        }
    }
}

/// Used when drain handling is disabled. Everything succeeds without side effects.
pub struct NoopBackend {
    instance_name: String,
}

impl NoopBackend {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
        }
    }
}

impl Evacuate for NoopBackend {
    fn instance_name(&self) -> &str {
        &self.instance_name
    }

    async fn test(&self) -> Result<()> {
        Ok(())
    }

    async fn drain(&self, _event: &ScheduledEvent) -> bool {
        true
    }

    async fn uncordon(&self) -> bool {
        true
    }
}
