use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::backend::Evacuate;
use crate::metadata::{EventDocument, Identity, MetadataError, MetadataSource, ScheduledEvent};
use crate::metrics::{DrainStage, EventLabels, Metrics};
use crate::notification::Notifier;
use crate::timestamp::Readiness;

pub const DEFAULT_DRAIN_EVENT_TYPES: [&str; 4] = ["reboot", "redeploy", "preempt", "terminate"];

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    /// Drain this long before an event's `NotBefore`.
    pub not_before_lead_time: Duration,
    /// Consecutive fetch errors tolerated. 0 tolerates any number.
    pub error_threshold: u32,
    pub drain_enabled: bool,
    /// Compared case-insensitively.
    pub drain_event_types: Vec<String>,
    pub approve_events: bool,
    pub wait_before_drain: Duration,
    pub wait_after_drain: Duration,
    pub request_stats: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            not_before_lead_time: Duration::from_secs(300),
            error_threshold: 0,
            drain_enabled: false,
            drain_event_types: DEFAULT_DRAIN_EVENT_TYPES.map(String::from).to_vec(),
            approve_events: false,
            wait_before_drain: Duration::ZERO,
            wait_after_drain: Duration::ZERO,
            request_stats: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("metadata source unreachable after {consecutive_errors} consecutive errors")]
    MetadataUnreachable {
        consecutive_errors: u32,
        #[source]
        source: MetadataError,
    },
}

/// Only ever touched by the poll cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineState {
    pub consecutive_api_errors: u32,
    pub is_drained: bool,
    pub is_uncordoned: bool,
}

impl Default for EngineState {
    fn default() -> Self {
        // the node is assumed healthy at startup
        Self {
            consecutive_api_errors: 0,
            is_drained: false,
            is_uncordoned: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DrainDecision {
    pub matched_event: Option<ScheduledEvent>,
    pub should_drain: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventReadiness {
    pub event_id: String,
    pub readiness: Readiness,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    /// Fetch failed, still below the error threshold. Nothing else happened.
    FetchFailed { consecutive_errors: u32 },
    Evaluated {
        decision: DrainDecision,
        readiness: Vec<EventReadiness>,
    },
}

/// Hooks fired by the poll cycle. Every method defaults to doing nothing.
pub trait EngineObserver: Send + Sync {
    /// No active threat for this instance.
    fn on_clear(&self) {}

    /// A drain-worthy event is active and the drain succeeded.
    fn on_scheduled_event(&self) {}

    fn on_after_drain(&self) {}
}

#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn EngineObserver>>,
}

impl Observers {
    pub fn register(&mut self, observer: Arc<dyn EngineObserver>) {
        self.observers.push(observer);
    }

    fn clear(&self) {
        self.observers.iter().for_each(|observer| observer.on_clear());
    }

    fn scheduled_event(&self) {
        self.observers
            .iter()
            .for_each(|observer| observer.on_scheduled_event());
    }

    fn after_drain(&self) {
        self.observers
            .iter()
            .for_each(|observer| observer.on_after_drain());
    }
}

/// Polls scheduled events and drives the evacuation backend.
pub struct EventEngine<M, B> {
    config: EngineConfig,
    identity: Identity,
    metadata: M,
    backend: B,
    notifier: Notifier,
    metrics: Arc<Metrics>,
    observers: Observers,
    state: EngineState,
}

impl<M, B> EventEngine<M, B>
where
    M: MetadataSource,
    B: Evacuate,
{
    pub fn new(
        config: EngineConfig,
        identity: Identity,
        metadata: M,
        backend: B,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            identity,
            metadata,
            backend,
            notifier: Notifier::default(),
            metrics,
            observers: Observers::default(),
            state: EngineState::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observers.register(observer);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Poll until `stop` resolves. The interval starts after each cycle returns,
    /// so cycles never overlap.
    pub async fn run(mut self, stop: impl Future<Output = ()>) -> Result<(), EngineError> {
        tokio::pin!(stop);
        loop {
            self.poll_once().await?;

            select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {},
                _ = &mut stop => {
                    debug!("poll loop stopped");
                    return Ok(());
                }
            }
        }
    }

    pub async fn poll_once(&mut self) -> Result<CycleOutcome, EngineError> {
        let drain_time_threshold = TimeDelta::from_std(self.config.not_before_lead_time)
            .ok()
            .and_then(|lead_time| Utc::now().checked_add_signed(lead_time))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let started = Instant::now();
        let document = match self.metadata.fetch_events().await {
            Ok(document) => document,
            Err(err) => return self.on_fetch_error(err),
        };

        self.state.consecutive_api_errors = 0;
        if self.config.request_stats {
            self.metrics.observe_fetch_latency(started.elapsed());
        }

        self.metrics.reset_events();
        if document.events.is_empty() {
            self.metrics.reset_drain_and_approval();
        }

        let (decision, readiness) = self.evaluate(&document, drain_time_threshold);
        self.metrics
            .set_document_incarnation(document.document_incarnation);

        if document.events.is_empty() {
            debug!("found no scheduled events");
        } else {
            info!("found {} scheduled events", document.events.len());
        }

        // also covers a matched event that was rescheduled out of the lead time
        if !decision.should_drain {
            self.observers.clear();
        }

        let mut uncordon_attempted = false;
        if document.events.is_empty() && !self.state.is_uncordoned {
            uncordon_attempted = true;
            self.ensure_uncordon().await;
        }

        if self.config.drain_enabled {
            match &decision.matched_event {
                Some(event) if decision.should_drain => self.handle_drain(event).await,
                _ => {
                    if !self.state.is_uncordoned && !uncordon_attempted {
                        self.ensure_uncordon().await;
                    }
                }
            }
        }

        Ok(CycleOutcome::Evaluated {
            decision,
            readiness,
        })
    }

    fn on_fetch_error(&mut self, err: MetadataError) -> Result<CycleOutcome, EngineError> {
        self.state.consecutive_api_errors = self.state.consecutive_api_errors.saturating_add(1);
        self.metrics.record_fetch_error();

        let consecutive_errors = self.state.consecutive_api_errors;
        let threshold = self.config.error_threshold;
        if threshold == 0 || consecutive_errors <= threshold {
            error!(?err, consecutive_errors, "failed API call");
            return Ok(CycleOutcome::FetchFailed { consecutive_errors });
        }

        Err(EngineError::MetadataUnreachable {
            consecutive_errors,
            source: err,
        })
    }

    fn evaluate(
        &self,
        document: &EventDocument,
        drain_time_threshold: DateTime<Utc>,
    ) -> (DrainDecision, Vec<EventReadiness>) {
        let local = self.identity.local_resource_name.as_str();
        let mut matched: Option<(&ScheduledEvent, Readiness)> = None;
        let mut report = Vec::with_capacity(document.events.len());

        for event in &document.events {
            let readiness = match event.readiness() {
                Ok(readiness) => readiness,
                Err(err) => {
                    error!(event_id = %event.id, %err, "unable to parse NotBefore");
                    self.metrics.record_parse_error(&event.id);
                    Readiness::Unparseable
                }
            };
            let value = readiness.metric_value();

            if event.resources.is_empty() {
                self.metrics.set_event(&EventLabels::new(event, ""), value);
            }

            for resource in &event.resources {
                debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    resource_type = %event.resource_type,
                    %resource,
                    event_status = %event.status,
                    not_before = %event.not_before,
                    event_source = %event.source,
                    "found scheduled event"
                );
                self.metrics.set_event(&EventLabels::new(event, resource), value);

                if !local.is_empty() && resource == local {
                    info!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        event_source = %event.source,
                        due = %describe_due(&readiness),
                        "detected scheduled event for current node"
                    );
                    matched = Some((event, readiness));
                }
            }

            report.push(EventReadiness {
                event_id: event.id.clone(),
                readiness,
            });
        }

        let decision = match matched {
            Some((event, readiness)) => DrainDecision {
                matched_event: Some(event.clone()),
                should_drain: readiness.is_due_by(drain_time_threshold)
                    && self.is_drain_trigger(&event.event_type),
            },
            None => DrainDecision::default(),
        };

        (decision, report)
    }

    fn is_drain_trigger(&self, event_type: &str) -> bool {
        self.config
            .drain_event_types
            .iter()
            .any(|trigger| trigger.eq_ignore_ascii_case(event_type))
    }

    async fn handle_drain(&mut self, event: &ScheduledEvent) {
        if !self.state.is_drained {
            let instance = self.instance_description();
            info!(event_id = %event.id, "ensuring drain of instance {instance}");
            self.notifier
                .send(&format!(
                    "draining instance {instance}: upcoming scheduled event {} with {} by {}: {}",
                    event.id, event.event_type, event.source, event.description
                ))
                .await;
            self.metrics
                .set_drain_timestamp(&event.id, DrainStage::Start, Utc::now());

            if !self.config.wait_before_drain.is_zero() {
                tokio::time::sleep(self.config.wait_before_drain).await;
            }

            let drained = self.backend.drain(event).await;
            if drained {
                info!(event_id = %event.id, "drained successfully");
                self.state.is_drained = true;
                self.state.is_uncordoned = false;
                self.observers.scheduled_event();
            } else {
                warn!(event_id = %event.id, "drain failed, retrying next cycle");
                // a partial drain may have cordoned the instance already
                self.state.is_uncordoned = false;
            }

            if !self.config.wait_after_drain.is_zero() {
                tokio::time::sleep(self.config.wait_after_drain).await;
            }

            if drained {
                self.observers.after_drain();
            }
            self.metrics
                .set_drain_timestamp(&event.id, DrainStage::Finish, Utc::now());
        }

        if self.config.approve_events {
            info!(
                event_id = %event.id,
                event_type = %event.event_type,
                event_source = %event.source,
                "approving scheduled event"
            );
            match self.metadata.approve(&event.id).await {
                Ok(()) => {
                    self.metrics.set_approval_timestamp(&event.id, Utc::now());
                    info!(event_id = %event.id, "event approved");
                }
                Err(err) => warn!(event_id = %event.id, ?err, "approval failed"),
            }
        }
    }

    async fn ensure_uncordon(&mut self) {
        info!("ensuring uncordon of instance {}", self.instance_description());
        if self.backend.uncordon().await {
            info!("uncordon finished");
            self.state.is_drained = false;
            self.state.is_uncordoned = true;
        } else {
            warn!("uncordon failed, retrying next cycle");
        }
    }

    fn instance_description(&self) -> String {
        let name = self.backend.instance_name();
        if name == self.identity.local_resource_name {
            name.to_owned()
        } else {
            format!("{name} (vm: {})", self.identity.local_resource_name)
        }
    }
}

fn describe_due(readiness: &Readiness) -> String {
    match readiness {
        Readiness::Immediate => String::from("now"),
        Readiness::Unparseable => String::from("unknown"),
        Readiness::At(at) => match (*at - Utc::now()).to_std() {
            Ok(remaining) => format!(
                "in {}",
                humantime::format_duration(Duration::from_secs(remaining.as_secs()))
            ),
            Err(_) => String::from("overdue"),
        },
    }
}
