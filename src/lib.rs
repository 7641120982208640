mod backend;
mod config;
mod engine;
mod error_codes;
mod health;
mod metadata;
mod metrics;
mod notification;
mod server;
mod shutdown;
mod spawn_service;
mod timestamp;

pub use crate::backend::{
    CommandBackend, CommandConfig, Evacuate, EvacuationBackend, KubernetesBackend,
    KubernetesDrainConfig, NoopBackend, MANAGED_LABEL_KEY,
};
pub use crate::config::{Config, DrainMode};
pub use crate::engine::{
    CycleOutcome, DrainDecision, EngineConfig, EngineError, EngineObserver, EngineState,
    EventEngine, EventReadiness,
};
pub use crate::health::HealthStatus;
pub use crate::metadata::{
    EventDocument, Identity, MetadataClient, MetadataConfig, MetadataError, MetadataSource,
    ScheduledEvent,
};
pub use crate::metrics::Metrics;
pub use crate::notification::Notifier;
pub use crate::server::start_server;
pub use crate::shutdown::{Shutdown, ShutdownReason};
pub use crate::spawn_service::{spawn_service, ServiceExit};
pub use crate::timestamp::{parse_timestamp, resolve_not_before, Readiness, TimestampError};

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
