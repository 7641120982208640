use serde::{Deserialize, Serialize};

use crate::timestamp::{resolve_not_before, Readiness, TimestampError};

/// The scheduled events document, as returned by the metadata endpoint.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct EventDocument {
    #[serde(rename = "DocumentIncarnation", default)]
    pub document_incarnation: i64,
    #[serde(rename = "Events", default)]
    pub events: Vec<ScheduledEvent>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ScheduledEvent {
    #[serde(rename = "EventId", default)]
    pub id: String,
    #[serde(rename = "EventType", default)]
    pub event_type: String,
    #[serde(rename = "ResourceType", default)]
    pub resource_type: String,
    #[serde(rename = "Resources", default)]
    pub resources: Vec<String>,
    #[serde(rename = "EventStatus", default)]
    pub status: String,
    #[serde(rename = "NotBefore", default)]
    pub not_before: String,
    #[serde(rename = "EventSource", default)]
    pub source: String,
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "DurationInSeconds", default)]
    pub duration_in_seconds: Option<i64>,
}

impl ScheduledEvent {
    pub fn readiness(&self) -> Result<Readiness, TimestampError> {
        resolve_not_before(&self.not_before)
    }

    pub fn targets(&self, resource_name: &str) -> bool {
        self.resources.iter().any(|resource| resource == resource_name)
    }

    /// Environment handed to command style backends.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            ("EVENT_ID", self.id.clone()),
            ("EVENT_SOURCE", self.source.clone()),
            ("EVENT_STATUS", self.status.clone()),
            ("EVENT_TYPE", self.event_type.clone()),
            ("EVENT_NOTBEFORE", self.not_before.clone()),
            ("EVENT_RESOURCES", self.resources.join(" ")),
            ("EVENT_RESOURCETYPE", self.resource_type.clone()),
        ]
    }
}

/// The name under which this host shows up in `ScheduledEvent::resources`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub local_resource_name: String,
}

impl Identity {
    pub fn new(local_resource_name: impl Into<String>) -> Self {
        Self {
            local_resource_name: local_resource_name.into(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct InstanceDocument {
    #[serde(default)]
    pub compute: InstanceCompute,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct InstanceCompute {
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct EventApproval {
    #[serde(rename = "StartRequests")]
    pub start_requests: Vec<EventApprovalEntry>,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct EventApprovalEntry {
    #[serde(rename = "EventId")]
    pub event_id: String,
}

impl EventApproval {
    pub fn for_event(event_id: &str) -> Self {
        Self {
            start_requests: vec![EventApprovalEntry {
                event_id: event_id.to_owned(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn should_deserialize_document() {
        let document: EventDocument = serde_json::from_value(json!({
            "DocumentIncarnation": 3,
            "Events": [{
                "EventId": "602d9444-d2cd-49c7-8624-8643e7171297",
                "EventStatus": "Scheduled",
                "EventType": "Freeze",
                "ResourceType": "VirtualMachine",
                "Resources": ["WestNO_0", "WestNO_1"],
                "NotBefore": "Mon, 11 Apr 2022 22:26:58 GMT",
                "Description": "Virtual machine is being paused because of a memory-preserving Live Migration operation.",
                "EventSource": "Platform",
                "DurationInSeconds": 5
            }]
        }))
        .unwrap();

        assert_eq!(document.document_incarnation, 3);
        assert_eq!(document.events.len(), 1);
        let event = &document.events[0];
        assert_eq!(event.event_type, "Freeze");
        assert_eq!(event.source, "Platform");
        assert_eq!(event.duration_in_seconds, Some(5));
        assert!(event.targets("WestNO_1"));
        assert!(!event.targets("WestNO_2"));
    }

    #[test]
    fn should_tolerate_missing_fields() {
        let document: EventDocument = serde_json::from_value(json!({
            "DocumentIncarnation": 1,
            "Events": [{ "EventId": "e1" }]
        }))
        .unwrap();

        let event = &document.events[0];
        assert!(event.resources.is_empty());
        assert_eq!(event.not_before, "");
        assert_eq!(event.readiness().unwrap(), Readiness::Immediate);
    }

    #[test]
    fn env_vars_should_join_resources() {
        let event = ScheduledEvent {
            id: "e1".to_owned(),
            event_type: "Reboot".to_owned(),
            resources: vec!["vm-a".to_owned(), "vm-b".to_owned()],
            ..ScheduledEvent::default()
        };

        let env = event.env_vars();
        assert!(env.contains(&("EVENT_RESOURCES", "vm-a vm-b".to_owned())));
        assert!(env.contains(&("EVENT_TYPE", "Reboot".to_owned())));
    }

    #[test]
    fn approval_payload_shape() {
        let payload = serde_json::to_value(EventApproval::for_event("e1")).unwrap();
        assert_eq!(payload, json!({ "StartRequests": [{ "EventId": "e1" }] }));
    }
}
