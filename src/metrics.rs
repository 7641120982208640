//! Prometheus metrics of the scheduled events engine.
//!
//! # Exported metrics
//! - `scheduledevent_event` (gauge): readiness value of every event/resource of the latest poll.
//! - `scheduledevent_document_incarnation` (gauge): incarnation of the latest document.
//! - `scheduledevent_event_drain` (gauge): unix time a drain started/finished, by event.
//! - `scheduledevent_event_approval` (gauge): unix time an event was approved.
//! - `scheduledevent_request` (histogram): metadata fetch latency in seconds.
//! - `scheduledevent_request_error_total` (counter): failed metadata fetches.
//! - `scheduledevent_event_parse_error_total` (counter): events with an unparseable `NotBefore`.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64};
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use strum_macros::AsRefStr;

use crate::metadata::ScheduledEvent;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventLabels {
    pub event_id: String,
    pub event_type: String,
    pub resource_type: String,
    pub resource: String,
    pub event_status: String,
    pub not_before: String,
    pub event_source: String,
}

impl EventLabels {
    pub fn new(event: &ScheduledEvent, resource: &str) -> Self {
        Self {
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            resource_type: event.resource_type.clone(),
            resource: resource.to_owned(),
            event_status: event.status.clone(),
            not_before: event.not_before.clone(),
            event_source: event.source.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DrainStage {
    Start,
    Finish,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DrainLabels {
    event_id: String,
    stage: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventIdLabels {
    event_id: String,
}

type FloatGauge = Gauge<f64, AtomicU64>;

pub struct Metrics {
    registry: Registry,
    events: Family<EventLabels, FloatGauge>,
    document_incarnation: Gauge<i64, AtomicI64>,
    event_drain: Family<DrainLabels, Gauge<i64, AtomicI64>>,
    event_approval: Family<EventIdLabels, Gauge<i64, AtomicI64>>,
    request: Histogram,
    request_errors: Counter<u64, AtomicU64>,
    parse_errors: Family<EventIdLabels, Counter<u64, AtomicU64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let events = Family::<EventLabels, FloatGauge>::default();
        registry.register(
            "scheduledevent_event",
            "Scheduled event readiness by resource",
            events.clone(),
        );

        let document_incarnation = Gauge::<i64, AtomicI64>::default();
        registry.register(
            "scheduledevent_document_incarnation",
            "Scheduled events document incarnation",
            document_incarnation.clone(),
        );

        let event_drain = Family::<DrainLabels, Gauge<i64, AtomicI64>>::default();
        registry.register(
            "scheduledevent_event_drain",
            "Scheduled event timestamp of drain",
            event_drain.clone(),
        );

        let event_approval = Family::<EventIdLabels, Gauge<i64, AtomicI64>>::default();
        registry.register(
            "scheduledevent_event_approval",
            "Scheduled event timestamp of approval",
            event_approval.clone(),
        );

        // 5ms .. ~20s across 12 buckets.
        let request = Histogram::new(exponential_buckets(0.005, 2.0, 12));
        registry.register(
            "scheduledevent_request",
            "Scheduled events requests",
            request.clone(),
        );

        let request_errors = Counter::<u64, AtomicU64>::default();
        registry.register(
            "scheduledevent_request_error",
            "Scheduled events failed requests",
            request_errors.clone(),
        );

        let parse_errors = Family::<EventIdLabels, Counter<u64, AtomicU64>>::default();
        registry.register(
            "scheduledevent_event_parse_error",
            "Scheduled events with an unparseable NotBefore",
            parse_errors.clone(),
        );

        Self {
            registry,
            events,
            document_incarnation,
            event_drain,
            event_approval,
            request,
            request_errors,
            parse_errors,
        }
    }

    pub fn record_fetch_error(&self) {
        self.request_errors.inc();
    }

    pub fn observe_fetch_latency(&self, latency: Duration) {
        self.request.observe(latency.as_secs_f64());
    }

    pub fn reset_events(&self) {
        self.events.clear();
    }

    pub fn reset_drain_and_approval(&self) {
        self.event_drain.clear();
        self.event_approval.clear();
    }

    pub fn set_event(&self, labels: &EventLabels, readiness: f64) {
        self.events.get_or_create(labels).set(readiness);
    }

    pub fn record_parse_error(&self, event_id: &str) {
        self.parse_errors
            .get_or_create(&EventIdLabels {
                event_id: event_id.to_owned(),
            })
            .inc();
    }

    pub fn set_document_incarnation(&self, incarnation: i64) {
        self.document_incarnation.set(incarnation);
    }

    pub fn set_drain_timestamp(&self, event_id: &str, stage: DrainStage, at: DateTime<Utc>) {
        self.event_drain
            .get_or_create(&DrainLabels {
                event_id: event_id.to_owned(),
                stage: stage.as_ref().to_owned(),
            })
            .set(at.timestamp());
    }

    pub fn set_approval_timestamp(&self, event_id: &str, at: DateTime<Utc>) {
        self.event_approval
            .get_or_create(&EventIdLabels {
                event_id: event_id.to_owned(),
            })
            .set(at.timestamp());
    }

    /// Prometheus text exposition of every metric.
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}
